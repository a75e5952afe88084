//! Customer projection fed by the AI orchestrator: one record per contact,
//! a message link table, and a lead score derived from intent and sentiment.

use chrono::NaiveDateTime;
use rasil_core::types::LicenseId;

use crate::backend::Database;
use crate::error::Result;
use crate::value::Value;

#[derive(Debug, Clone)]
pub struct Customer {
    pub id: i64,
    pub license_id: LicenseId,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub lead_score: i64,
    pub segment: Option<String>,
    pub message_count: i64,
}

/// Match by phone first, then email; create when neither exists.
pub async fn get_or_create_customer(
    db: &Database,
    license_id: LicenseId,
    phone: Option<&str>,
    email: Option<&str>,
    name: Option<&str>,
) -> Result<Customer> {
    if let Some(phone) = phone {
        if let Some(found) = find_by(db, license_id, "phone", phone).await? {
            return Ok(found);
        }
    }
    if let Some(email) = email {
        if let Some(found) = find_by(db, license_id, "email", email).await? {
            return Ok(found);
        }
    }

    let id = db
        .insert_returning_id(
            "INSERT INTO customers (license_key_id, name, phone, email, last_contact_at)
             VALUES (?, ?, ?, ?, ?)",
            &[
                license_id.into(),
                name.map(str::to_string).into(),
                phone.map(str::to_string).into(),
                email.map(str::to_string).into(),
                db.now(),
            ],
        )
        .await?;
    Ok(Customer {
        id,
        license_id,
        name: name.map(str::to_string),
        phone: phone.map(str::to_string),
        email: email.map(str::to_string),
        lead_score: 0,
        segment: None,
        message_count: 0,
    })
}

async fn find_by(
    db: &Database,
    license_id: LicenseId,
    column: &str,
    value: &str,
) -> Result<Option<Customer>> {
    let row = db
        .fetch_one(
            &format!(
                "SELECT id, license_key_id, name, phone, email, lead_score, segment, message_count
                 FROM customers WHERE license_key_id = ? AND {column} = ?"
            ),
            &[license_id.into(), value.into()],
        )
        .await?;
    let Some(row) = row else { return Ok(None) };
    Ok(Some(Customer {
        id: row.i64("id")?,
        license_id: row.i64("license_key_id")?,
        name: row.opt_text("name")?,
        phone: row.opt_text("phone")?,
        email: row.opt_text("email")?,
        lead_score: row.opt_i64("lead_score")?.unwrap_or(0),
        segment: row.opt_text("segment")?,
        message_count: row.opt_i64("message_count")?.unwrap_or(0),
    }))
}

/// Link a customer to an inbox message; re-links are ignored.
pub async fn link_customer_message(
    db: &Database,
    license_id: LicenseId,
    customer_id: i64,
    inbox_message_id: i64,
) -> Result<()> {
    let result = db
        .execute(
            "INSERT INTO customer_messages (license_key_id, customer_id, inbox_message_id)
             VALUES (?, ?, ?)",
            &[license_id.into(), customer_id.into(), inbox_message_id.into()],
        )
        .await;
    match result {
        Ok(_) => Ok(()),
        Err(e) if e.is_unique_violation() => Ok(()),
        Err(e) => Err(e),
    }
}

pub async fn increment_customer_messages(db: &Database, customer_id: i64) -> Result<()> {
    db.execute(
        "UPDATE customers SET message_count = message_count + 1, last_contact_at = ?
         WHERE id = ?",
        &[db.now(), customer_id.into()],
    )
    .await?;
    Ok(())
}

/// Intent/sentiment contribution to the lead score, and the segment bands.
pub fn score_delta(intent: &str, sentiment: &str) -> i64 {
    let intent_points = match intent {
        "purchase" | "order" | "pricing" => 20,
        "inquiry" | "question" => 10,
        "complaint" => -5,
        _ => 2,
    };
    let sentiment_points = match sentiment {
        "positive" => 5,
        "negative" => -5,
        _ => 0,
    };
    intent_points + sentiment_points
}

pub fn segment_for_score(score: i64) -> &'static str {
    if score >= 60 {
        "hot"
    } else if score >= 30 {
        "warm"
    } else {
        "cold"
    }
}

pub async fn update_customer_lead_score(
    db: &Database,
    customer_id: i64,
    intent: &str,
    sentiment: &str,
) -> Result<()> {
    let delta = score_delta(intent, sentiment);
    // CASE instead of MAX: postgres only has aggregate MAX.
    db.execute(
        "UPDATE customers SET
             lead_score = CASE WHEN lead_score + ? < 0 THEN 0 ELSE lead_score + ? END,
             updated_at = ?
         WHERE id = ?",
        &[delta.into(), delta.into(), db.now(), customer_id.into()],
    )
    .await?;
    // Segment derives from the clamped score just written.
    let row = db
        .fetch_one(
            "SELECT lead_score FROM customers WHERE id = ?",
            &[customer_id.into()],
        )
        .await?;
    if let Some(row) = row {
        let segment = segment_for_score(row.i64("lead_score")?);
        db.execute(
            "UPDATE customers SET segment = ? WHERE id = ?",
            &[segment.into(), customer_id.into()],
        )
        .await?;
    }
    Ok(())
}

/// Record one purchase for a customer; returns its id.
pub async fn create_purchase(
    db: &Database,
    license_id: LicenseId,
    customer_id: i64,
    product_name: &str,
    amount: f64,
    currency: &str,
    payment_type: &str,
    notes: Option<&str>,
) -> Result<i64> {
    db.insert_returning_id(
        "INSERT INTO purchases
             (license_key_id, customer_id, product_name, amount, currency, payment_type, notes)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        &[
            license_id.into(),
            customer_id.into(),
            product_name.into(),
            amount.into(),
            currency.into(),
            payment_type.into(),
            notes.map(str::to_string).into(),
        ],
    )
    .await
}

/// Delta-sync feed: customers touched since the given instant.
pub async fn customers_updated_since(
    db: &Database,
    license_id: LicenseId,
    since: NaiveDateTime,
) -> Result<Vec<Customer>> {
    let rows = db
        .fetch_all(
            "SELECT id, license_key_id, name, phone, email, lead_score, segment, message_count
             FROM customers
             WHERE license_key_id = ? AND (updated_at > ? OR last_contact_at > ?)",
            &[
                license_id.into(),
                Value::Timestamp(since),
                Value::Timestamp(since),
            ],
        )
        .await?;
    rows.iter()
        .map(|row| {
            Ok(Customer {
                id: row.i64("id")?,
                license_id: row.i64("license_key_id")?,
                name: row.opt_text("name")?,
                phone: row.opt_text("phone")?,
                email: row.opt_text("email")?,
                lead_score: row.opt_i64("lead_score")?.unwrap_or(0),
                segment: row.opt_text("segment")?,
                message_count: row.opt_i64("message_count")?.unwrap_or(0),
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
    async fn same_phone_resolves_to_same_customer() {
        let db = db().await;
        let a = get_or_create_customer(&db, 1, Some("+963912345678"), None, Some("أحمد"))
            .await
            .unwrap();
        let b = get_or_create_customer(&db, 1, Some("+963912345678"), None, None)
            .await
            .unwrap();
        assert_eq!(a.id, b.id);
    }

    #[tokio::test]
    async fn duplicate_message_link_is_ignored() {
        let db = db().await;
        let c = get_or_create_customer(&db, 1, Some("+1"), None, None).await.unwrap();
        link_customer_message(&db, 1, c.id, 10).await.unwrap();
        link_customer_message(&db, 1, c.id, 10).await.unwrap();

        let row = db
            .fetch_one(
                "SELECT COUNT(*) AS n FROM customer_messages WHERE customer_id = ?",
                &[c.id.into()],
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.i64("n").unwrap(), 1);
    }

    #[tokio::test]
    async fn purchase_intent_raises_score_and_segment() {
        let db = db().await;
        let c = get_or_create_customer(&db, 1, Some("+2"), None, None).await.unwrap();
        for _ in 0..3 {
            update_customer_lead_score(&db, c.id, "purchase", "positive").await.unwrap();
        }
        let refreshed = find_by(&db, 1, "phone", "+2").await.unwrap().unwrap();
        assert_eq!(refreshed.lead_score, 75);
        assert_eq!(refreshed.segment.as_deref(), Some("hot"));
    }

    #[test]
    fn score_never_negative_segments() {
        assert_eq!(segment_for_score(0), "cold");
        assert_eq!(segment_for_score(30), "warm");
        assert_eq!(segment_for_score(60), "hot");
    }
}
