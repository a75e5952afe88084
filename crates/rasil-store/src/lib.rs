pub mod backend;
pub mod credentials;
pub mod customers;
mod error;
pub mod inbox;
pub mod licenses;
pub mod notifications;
pub mod outbox;
pub mod schema;
pub mod value;

pub use backend::Database;
pub use error::{Result, StoreError};
pub use value::{Row, Value};
