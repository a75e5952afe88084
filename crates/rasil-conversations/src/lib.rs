//! The denormalized conversation cache: one row per (license, sender),
//! recomputed from inbox+outbox truth on every mutation that could affect it.

pub mod alias;
pub mod cursor;
pub mod engine;
pub mod page;
pub mod preview;

pub use alias::resolve_alias_set;
pub use cursor::Cursor;
pub use engine::{recompute, Conversation};
pub use page::{conversation_page, list_conversations, ChatEntry, Direction, Page};
