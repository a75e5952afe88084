//! Cross-worker event fan-out.
//!
//! With REDIS_URL set, every worker publishes WS events to
//! `rasil:ws:{license}` and forwards what it receives to its own local
//! connections only. Without Redis a process-local tokio broadcast channel
//! carries the same traffic, so single-worker deployments need no extra
//! infrastructure.

use futures_util::StreamExt;
use rasil_core::types::LicenseId;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{CacheError, Result};

const CHANNEL_PREFIX: &str = "rasil:ws:";
const LOCAL_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct EventBus {
    inner: BusInner,
}

#[derive(Clone)]
enum BusInner {
    Redis {
        client: redis::Client,
        publisher: redis::aio::ConnectionManager,
    },
    Local(broadcast::Sender<(LicenseId, String)>),
}

impl EventBus {
    pub fn local() -> Self {
        let (tx, _) = broadcast::channel(LOCAL_CAPACITY);
        Self {
            inner: BusInner::Local(tx),
        }
    }

    pub async fn redis(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let publisher = redis::aio::ConnectionManager::new(client.clone()).await?;
        Ok(Self {
            inner: BusInner::Redis { client, publisher },
        })
    }

    /// Whether events reach other workers (true only on the Redis backend).
    pub fn is_distributed(&self) -> bool {
        matches!(self.inner, BusInner::Redis { .. })
    }

    pub async fn publish(&self, license_id: LicenseId, payload: String) -> Result<()> {
        match &self.inner {
            BusInner::Redis { publisher, .. } => {
                let mut conn = publisher.clone();
                let channel = channel_name(license_id);
                let _: () = redis::AsyncCommands::publish(&mut conn, &channel, payload).await?;
                Ok(())
            }
            BusInner::Local(tx) => {
                // A send error only means nobody is subscribed right now.
                let _ = tx.send((license_id, payload));
                Ok(())
            }
        }
    }

    /// Subscribe to one license's event stream.
    pub async fn subscribe(&self, license_id: LicenseId) -> Result<Subscription> {
        match &self.inner {
            BusInner::Redis { client, .. } => {
                let mut pubsub = client.get_async_pubsub().await?;
                pubsub.subscribe(channel_name(license_id)).await?;
                debug!(license_id, "subscribed to redis ws channel");
                Ok(Subscription {
                    inner: SubInner::Redis(pubsub),
                })
            }
            BusInner::Local(tx) => Ok(Subscription {
                inner: SubInner::Local {
                    rx: tx.subscribe(),
                    license_id,
                },
            }),
        }
    }
}

pub struct Subscription {
    inner: SubInner,
}

enum SubInner {
    Redis(redis::aio::PubSub),
    Local {
        rx: broadcast::Receiver<(LicenseId, String)>,
        license_id: LicenseId,
    },
}

impl Subscription {
    /// Next payload for the subscribed license, or Err when the bus closes.
    pub async fn next(&mut self) -> Result<String> {
        match &mut self.inner {
            SubInner::Redis(pubsub) => {
                let msg = pubsub.on_message().next().await.ok_or(CacheError::Closed)?;
                Ok(msg.get_payload::<String>()?)
            }
            SubInner::Local { rx, license_id } => loop {
                match rx.recv().await {
                    Ok((id, payload)) if id == *license_id => return Ok(payload),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return Err(CacheError::Closed),
                }
            },
        }
    }
}

fn channel_name(license_id: LicenseId) -> String {
    format!("{}{}", CHANNEL_PREFIX, license_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_bus_routes_by_license() {
        let bus = EventBus::local();
        let mut sub = bus.subscribe(1).await.unwrap();

        bus.publish(2, "other".into()).await.unwrap();
        bus.publish(1, "mine".into()).await.unwrap();

        assert_eq!(sub.next().await.unwrap(), "mine");
    }

    #[tokio::test]
    async fn local_bus_is_not_distributed() {
        assert!(!EventBus::local().is_distributed());
    }
}
