//! Outbound dispatch and delivery-status reconciliation: the outbox
//! lifecycle (pending → approved → sent | failed), per-transport send logic,
//! and the monotone delivery projection fed by webhooks and receipt polling.

pub mod delivery;
pub mod dispatcher;
mod error;

pub use delivery::{poll_telegram_receipts, update_delivery_status, StatusBroadcast};
pub use dispatcher::{Dispatcher, SendOutcome, TransportProvider};
pub use error::{DispatchError, Result};
