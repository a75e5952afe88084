//! Transport adapters for the four channels: Gmail, Telegram Bot (webhook),
//! Telegram user account (MTProto), and WhatsApp Business (webhook).
//!
//! All adapters implement the one [`Transport`] trait; the poll-based ones
//! answer `fetch_new`, the push-based ones `parse_webhook`.

mod error;
pub mod gmail;
pub mod telegram_bot;
pub mod telegram_listener;
pub mod telegram_user;
mod transport;
pub mod whatsapp;

pub use error::TransportError;
pub use gmail::GmailTransport;
pub use telegram_bot::TelegramBotTransport;
pub use telegram_listener::TelegramListener;
pub use telegram_user::TelegramUserTransport;
pub use transport::{
    DeliveryStatusEvent, FetchOptions, OutboundEcho, OutboundMedia, SendReceipt, Transport,
    WebhookEvent,
};
pub use whatsapp::WhatsappTransport;
