//! Ingestion: the polling scheduler, the shared webhook/poll pipeline
//! (dedup → filters → persistence → burst grouping → task enqueue), the
//! analyze/send task handler, and the daily background workers.

pub mod burst;
mod error;
pub mod handler;
pub mod pipeline;
pub mod poller;
pub mod workers;

pub use error::{IngestError, Result};
pub use handler::CoreTaskHandler;
pub use pipeline::{ingest_batch, EventSink, IngestServices, IngestSummary, NullSink};
pub use poller::Poller;
