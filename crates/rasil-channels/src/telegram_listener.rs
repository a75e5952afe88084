//! Singleton MTProto listener: one persistent connection per license,
//! emitting live message events into the ingest pipeline. A PID-file lock
//! guarantees at most one process holds listeners for the shared sessions.

use std::collections::HashMap;
use std::path::PathBuf;

use rasil_core::types::LicenseId;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::telegram_user::{connect_with_session, message_to_event};
use crate::transport::WebhookEvent;

/// What the listener pushes to the host.
#[derive(Debug)]
pub enum ListenerEvent {
    Message {
        license_id: LicenseId,
        event: WebhookEvent,
    },
    /// The session errored unrecoverably; the host should deactivate it so
    /// the operator can re-link.
    SessionInvalid { license_id: LicenseId },
}

pub struct TelegramListener {
    api_id: i32,
    api_hash: String,
    tx: mpsc::Sender<ListenerEvent>,
    clients: HashMap<LicenseId, JoinHandle<()>>,
    lock_path: PathBuf,
    lock_held: bool,
}

impl TelegramListener {
    pub fn new(
        api_id: i32,
        api_hash: String,
        lock_path: PathBuf,
    ) -> (Self, mpsc::Receiver<ListenerEvent>) {
        let (tx, rx) = mpsc::channel(256);
        (
            Self {
                api_id,
                api_hash,
                tx,
                clients: HashMap::new(),
                lock_path,
                lock_held: false,
            },
            rx,
        )
    }

    /// Take the single-process lock. Returns false when another worker
    /// already holds it — this worker must not open listeners.
    pub fn acquire_lock(&mut self) -> bool {
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
        {
            Ok(mut file) => {
                use std::io::Write;
                let _ = write!(file, "{}", std::process::id());
                self.lock_held = true;
                info!(path = %self.lock_path.display(), "telegram listener lock acquired");
                true
            }
            Err(_) => {
                info!(
                    path = %self.lock_path.display(),
                    "telegram listener lock held elsewhere, listeners disabled here"
                );
                false
            }
        }
    }

    /// Reconcile running listeners with the active session set: start new
    /// ones, stop removed ones.
    pub fn sync_sessions(&mut self, sessions: Vec<(LicenseId, String)>) {
        if !self.lock_held {
            return;
        }

        let wanted: Vec<LicenseId> = sessions.iter().map(|(id, _)| *id).collect();
        let running: Vec<LicenseId> = self.clients.keys().copied().collect();

        for license_id in running {
            if !wanted.contains(&license_id) {
                if let Some(handle) = self.clients.remove(&license_id) {
                    handle.abort();
                    info!(license_id, "telegram listener stopped (session removed)");
                }
            }
        }

        for (license_id, blob) in sessions {
            let entry_exists = self
                .clients
                .get(&license_id)
                .map(|h| !h.is_finished())
                .unwrap_or(false);
            if entry_exists {
                continue;
            }
            let handle = tokio::spawn(listen_for_license(
                license_id,
                self.api_id,
                self.api_hash.clone(),
                blob,
                self.tx.clone(),
            ));
            self.clients.insert(license_id, handle);
            info!(license_id, "telegram listener started");
        }
    }

    pub fn shutdown(&mut self) {
        for (license_id, handle) in self.clients.drain() {
            handle.abort();
            info!(license_id, "telegram listener aborted on shutdown");
        }
        if self.lock_held {
            let _ = std::fs::remove_file(&self.lock_path);
            self.lock_held = false;
        }
    }
}

impl Drop for TelegramListener {
    fn drop(&mut self) {
        if self.lock_held {
            let _ = std::fs::remove_file(&self.lock_path);
        }
    }
}

async fn listen_for_license(
    license_id: LicenseId,
    api_id: i32,
    api_hash: String,
    session_blob: String,
    tx: mpsc::Sender<ListenerEvent>,
) {
    let client = match connect_with_session(api_id, &api_hash, &session_blob).await {
        Ok(client) => client,
        Err(e) => {
            warn!(license_id, error = %e, "listener connect failed");
            if !e.retryable {
                let _ = tx
                    .send(ListenerEvent::SessionInvalid { license_id })
                    .await;
            }
            return;
        }
    };

    loop {
        match client.next_update().await {
            Ok(update) => {
                if let grammers_client::Update::NewMessage(message) = update {
                    if let Some(event) = message_to_event(&message) {
                        if tx
                            .send(ListenerEvent::Message { license_id, event })
                            .await
                            .is_err()
                        {
                            return; // host dropped the receiver
                        }
                    }
                }
            }
            Err(e) => {
                error!(license_id, error = %e, "listener update stream broke");
                let _ = tx
                    .send(ListenerEvent::SessionInvalid { license_id })
                    .await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_is_exclusive_per_path() {
        let dir = std::env::temp_dir().join(format!("rasil-listener-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("listener.pid");
        let _ = std::fs::remove_file(&path);

        let (mut first, _rx1) = TelegramListener::new(1, "h".into(), path.clone());
        let (mut second, _rx2) = TelegramListener::new(1, "h".into(), path.clone());

        assert!(first.acquire_lock());
        assert!(!second.acquire_lock(), "second process must not get the lock");

        first.shutdown();
        assert!(second.acquire_lock(), "lock is free after shutdown");
        second.shutdown();
    }
}
