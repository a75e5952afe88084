//! License-key repository: opaque tenants with a hashed key, expiry, and a
//! per-day request cap.

use chrono::{NaiveDate, NaiveDateTime, Utc};
use rasil_core::types::LicenseId;
use sha2::{Digest, Sha256};

use crate::backend::Database;
use crate::error::Result;
use crate::value::Value;

#[derive(Debug, Clone)]
pub struct License {
    pub id: LicenseId,
    pub company_name: String,
    pub contact_email: Option<String>,
    pub is_active: bool,
    pub expires_at: Option<NaiveDateTime>,
    pub max_requests_per_day: i64,
    pub requests_today: i64,
    pub last_request_date: Option<String>,
}

/// Outcome of a key lookup; error messages are the Arabic strings the UI
/// shows verbatim.
#[derive(Debug, Clone)]
pub enum Validation {
    Valid {
        license_id: LicenseId,
        company_name: String,
        requests_remaining: i64,
    },
    Invalid {
        reason: String,
    },
}

pub fn hash_license_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Create a license and return the raw key (stored only as a hash).
pub async fn create_license(
    db: &Database,
    company_name: &str,
    contact_email: Option<&str>,
    days_valid: i64,
    max_requests: i64,
) -> Result<String> {
    let raw_key = format!(
        "RASIL-{:04X}-{:04X}-{:04X}",
        rand_u16(),
        rand_u16(),
        rand_u16()
    );
    let expires = Utc::now().naive_utc() + chrono::Duration::days(days_valid);
    db.execute(
        "INSERT INTO license_keys (key_hash, company_name, contact_email, expires_at, max_requests_per_day)
         VALUES (?, ?, ?, ?, ?)",
        &[
            hash_license_key(&raw_key).into(),
            company_name.into(),
            contact_email.map(str::to_string).into(),
            Value::Timestamp(expires),
            max_requests.into(),
        ],
    )
    .await?;
    Ok(raw_key)
}

// Key material only needs to be unguessable, not a CSPRNG stream; hashing
// process entropy through SHA-256 avoids pulling rand into this crate.
fn rand_u16() -> u16 {
    let mut hasher = Sha256::new();
    hasher.update(std::process::id().to_le_bytes());
    hasher.update(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos().to_le_bytes())
            .unwrap_or([0; 16]),
    );
    let digest = hasher.finalize();
    u16::from_le_bytes([digest[0], digest[1]])
}

pub async fn validate_license_key(db: &Database, key: &str) -> Result<Validation> {
    let row = db
        .fetch_one(
            "SELECT id, company_name, is_active, expires_at, max_requests_per_day,
                    requests_today, last_request_date
             FROM license_keys WHERE key_hash = ?",
            &[hash_license_key(key).into()],
        )
        .await?;

    let Some(row) = row else {
        return Ok(Validation::Invalid {
            reason: "مفتاح الاشتراك غير صالح".into(),
        });
    };

    if !row.bool("is_active")? {
        return Ok(Validation::Invalid {
            reason: "تم تعطيل هذا الاشتراك".into(),
        });
    }

    if let Some(expires_at) = row.opt_timestamp("expires_at")? {
        if Utc::now().naive_utc() > expires_at {
            return Ok(Validation::Invalid {
                reason: "انتهت صلاحية الاشتراك".into(),
            });
        }
    }

    let today = Utc::now().date_naive().format("%Y-%m-%d").to_string();
    let max = row.i64("max_requests_per_day")?;
    let used_today = if row.opt_text("last_request_date")?.as_deref() == Some(today.as_str()) {
        row.opt_i64("requests_today")?.unwrap_or(0)
    } else {
        0
    };

    if used_today >= max {
        return Ok(Validation::Invalid {
            reason: "تم تجاوز الحد اليومي للطلبات".into(),
        });
    }

    Ok(Validation::Valid {
        license_id: row.i64("id")?,
        company_name: row.text("company_name")?,
        requests_remaining: max - used_today,
    })
}

/// Bump the daily counter, resetting it on the first request of a new day.
pub async fn increment_usage(db: &Database, license_id: LicenseId) -> Result<()> {
    let today = Utc::now().date_naive().format("%Y-%m-%d").to_string();
    db.execute(
        "UPDATE license_keys
         SET requests_today = CASE WHEN last_request_date = ? THEN requests_today + 1 ELSE 1 END,
             last_request_date = ?
         WHERE id = ?",
        &[today.as_str().into(), today.as_str().into(), license_id.into()],
    )
    .await?;
    Ok(())
}

/// Every license with at least one active integration — the poll loop's
/// work list.
pub async fn active_license_ids(db: &Database) -> Result<Vec<LicenseId>> {
    let mut ids = Vec::new();
    for table in [
        "email_configs",
        "telegram_bot_configs",
        "telegram_sessions",
        "whatsapp_configs",
    ] {
        let rows = db
            .fetch_all(
                &format!(
                    "SELECT DISTINCT license_key_id FROM {table} WHERE is_active = ?"
                ),
                &[true.into()],
            )
            .await?;
        for row in &rows {
            ids.push(row.i64("license_key_id")?);
        }
    }
    ids.sort_unstable();
    ids.dedup();
    Ok(ids)
}

/// Licenses whose subscription expires exactly on the given date — the
/// reminder worker's target set.
pub async fn licenses_expiring_on(db: &Database, date: NaiveDate) -> Result<Vec<License>> {
    let day_start = date.and_hms_opt(0, 0, 0).unwrap();
    let day_end = date.and_hms_opt(23, 59, 59).unwrap();
    let rows = db
        .fetch_all(
            "SELECT id, company_name, contact_email, is_active, expires_at,
                    max_requests_per_day, requests_today, last_request_date
             FROM license_keys
             WHERE is_active = ? AND expires_at >= ? AND expires_at <= ?",
            &[
                true.into(),
                Value::Timestamp(day_start),
                Value::Timestamp(day_end),
            ],
        )
        .await?;
    rows.iter()
        .map(|row| {
            Ok(License {
                id: row.i64("id")?,
                company_name: row.text("company_name")?,
                contact_email: row.opt_text("contact_email")?,
                is_active: row.bool("is_active")?,
                expires_at: row.opt_timestamp("expires_at")?,
                max_requests_per_day: row.i64("max_requests_per_day")?,
                requests_today: row.opt_i64("requests_today")?.unwrap_or(0),
                last_request_date: row.opt_text("last_request_date")?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::init_schema;

    async fn db() -> Database {
        let db = Database::memory().unwrap();
        init_schema(&db).await.unwrap();
        db
    }

    #[tokio::test]
    async fn fresh_key_validates_and_counts_down() {
        let db = db().await;
        let key = create_license(&db, "شركة تجريبية", None, 365, 100)
            .await
            .unwrap();
        assert!(key.starts_with("RASIL-"));

        match validate_license_key(&db, &key).await.unwrap() {
            Validation::Valid {
                license_id,
                requests_remaining,
                ..
            } => {
                assert_eq!(requests_remaining, 100);
                increment_usage(&db, license_id).await.unwrap();
            }
            Validation::Invalid { reason } => panic!("unexpected invalid: {}", reason),
        }

        match validate_license_key(&db, &key).await.unwrap() {
            Validation::Valid {
                requests_remaining, ..
            } => assert_eq!(requests_remaining, 99),
            Validation::Invalid { reason } => panic!("unexpected invalid: {}", reason),
        }
    }

    #[tokio::test]
    async fn unknown_key_is_invalid() {
        let db = db().await;
        match validate_license_key(&db, "RASIL-0000-0000-0000").await.unwrap() {
            Validation::Invalid { reason } => assert!(reason.contains("غير صالح")),
            Validation::Valid { .. } => panic!("expected invalid"),
        }
    }

    #[tokio::test]
    async fn exhausted_daily_cap_rejects() {
        let db = db().await;
        let key = create_license(&db, "c", None, 30, 2).await.unwrap();
        let id = match validate_license_key(&db, &key).await.unwrap() {
            Validation::Valid { license_id, .. } => license_id,
            _ => unreachable!(),
        };
        increment_usage(&db, id).await.unwrap();
        increment_usage(&db, id).await.unwrap();
        match validate_license_key(&db, &key).await.unwrap() {
            Validation::Invalid { reason } => assert!(reason.contains("الحد اليومي")),
            Validation::Valid { .. } => panic!("expected cap rejection"),
        }
    }
}
