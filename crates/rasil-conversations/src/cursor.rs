//! Opaque pagination cursor: base64 of `"{effective_ts_iso}_{id}"`.
//! Ordering is strict on (effective_ts, id) in both directions.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::NaiveDateTime;
use rasil_store::value::{format_timestamp, parse_timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub effective_at: NaiveDateTime,
    pub id: i64,
}

impl Cursor {
    pub fn new(effective_at: NaiveDateTime, id: i64) -> Self {
        Self { effective_at, id }
    }

    pub fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(format!("{}_{}", format_timestamp(&self.effective_at), self.id))
    }

    pub fn decode(token: &str) -> Option<Self> {
        let raw = URL_SAFE_NO_PAD.decode(token).ok()?;
        let text = String::from_utf8(raw).ok()?;
        let (ts, id) = text.rsplit_once('_')?;
        Some(Self {
            effective_at: parse_timestamp(ts)?,
            id: id.parse().ok()?,
        })
    }
}
