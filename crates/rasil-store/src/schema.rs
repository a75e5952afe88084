//! Both backends share one logical schema; only autoincrement, boolean and
//! default-now syntax differ, and those are emitted per backend here.

use rasil_core::config::DatabaseKind;

use crate::backend::Database;
use crate::error::Result;

fn id_pk(kind: DatabaseKind) -> &'static str {
    match kind {
        DatabaseKind::Sqlite => "INTEGER PRIMARY KEY AUTOINCREMENT",
        DatabaseKind::Postgres => "BIGSERIAL PRIMARY KEY",
    }
}

fn bool_col(kind: DatabaseKind, default_true: bool) -> String {
    match (kind, default_true) {
        (DatabaseKind::Sqlite, true) => "INTEGER DEFAULT 1".into(),
        (DatabaseKind::Sqlite, false) => "INTEGER DEFAULT 0".into(),
        (DatabaseKind::Postgres, true) => "BOOLEAN DEFAULT TRUE".into(),
        (DatabaseKind::Postgres, false) => "BOOLEAN DEFAULT FALSE".into(),
    }
}

fn now_default(kind: DatabaseKind) -> &'static str {
    match kind {
        DatabaseKind::Sqlite => "TIMESTAMP DEFAULT CURRENT_TIMESTAMP",
        DatabaseKind::Postgres => "TIMESTAMP DEFAULT NOW()",
    }
}

/// Create every table and index. Safe to call on each startup.
pub async fn init_schema(db: &Database) -> Result<()> {
    for stmt in schema_statements(db.kind()) {
        db.execute(&stmt, &[]).await?;
    }
    Ok(())
}

fn schema_statements(kind: DatabaseKind) -> Vec<String> {
    let pk = id_pk(kind);
    let now = now_default(kind);
    let bool_t = bool_col(kind, true);
    let bool_f = bool_col(kind, false);

    vec![
        format!(
            "CREATE TABLE IF NOT EXISTS license_keys (
                id {pk},
                key_hash TEXT UNIQUE NOT NULL,
                company_name TEXT NOT NULL,
                contact_email TEXT,
                is_active {bool_t},
                created_at {now},
                expires_at TIMESTAMP,
                max_requests_per_day INTEGER DEFAULT 100,
                requests_today INTEGER DEFAULT 0,
                last_request_date TEXT
            )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS inbox_messages (
                id {pk},
                license_key_id BIGINT NOT NULL,
                channel TEXT NOT NULL,
                channel_message_id TEXT,
                sender_id TEXT,
                sender_name TEXT,
                sender_contact TEXT,
                subject TEXT,
                body TEXT NOT NULL DEFAULT '',
                attachments TEXT,
                received_at TIMESTAMP,
                created_at {now},
                processed_at TIMESTAMP,
                status TEXT NOT NULL DEFAULT 'pending',
                is_read {bool_f},
                intent TEXT,
                urgency TEXT,
                sentiment TEXT,
                language TEXT,
                dialect TEXT,
                ai_summary TEXT,
                ai_draft_response TEXT,
                search_vector TEXT,
                reply_to_platform_id TEXT,
                reply_to_body_preview TEXT,
                reply_to_sender_name TEXT,
                reply_to_id BIGINT,
                platform_message_id TEXT,
                platform_status TEXT DEFAULT 'received',
                original_sender TEXT,
                media_skipped {bool_f},
                deleted_at TIMESTAMP
            )"
        ),
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_inbox_channel_msg
             ON inbox_messages(license_key_id, channel, channel_message_id)"
            .to_string(),
        "CREATE INDEX IF NOT EXISTS idx_inbox_license_status
             ON inbox_messages(license_key_id, status, created_at)"
            .to_string(),
        "CREATE INDEX IF NOT EXISTS idx_inbox_sender
             ON inbox_messages(license_key_id, sender_contact)"
            .to_string(),
        format!(
            "CREATE TABLE IF NOT EXISTS outbox_messages (
                id {pk},
                license_key_id BIGINT NOT NULL,
                inbox_message_id BIGINT,
                channel TEXT NOT NULL,
                recipient_id TEXT,
                recipient_email TEXT,
                subject TEXT,
                body TEXT NOT NULL,
                attachments TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                delivery_status TEXT,
                platform_message_id TEXT,
                original_body TEXT,
                edit_count INTEGER DEFAULT 0,
                edited_at TIMESTAMP,
                error_message TEXT,
                created_at {now},
                approved_at TIMESTAMP,
                sent_at TIMESTAMP,
                failed_at TIMESTAMP,
                deleted_at TIMESTAMP
            )"
        ),
        "CREATE INDEX IF NOT EXISTS idx_outbox_license_status
             ON outbox_messages(license_key_id, status, created_at)"
            .to_string(),
        "CREATE INDEX IF NOT EXISTS idx_outbox_platform_id
             ON outbox_messages(platform_message_id)"
            .to_string(),
        format!(
            "CREATE TABLE IF NOT EXISTS conversations (
                id {pk},
                license_key_id BIGINT NOT NULL,
                sender_contact TEXT NOT NULL,
                sender_name TEXT,
                channel TEXT,
                last_message_id BIGINT,
                last_message_body TEXT,
                last_message_ai_summary TEXT,
                last_message_at TIMESTAMP,
                status TEXT,
                unread_count INTEGER DEFAULT 0,
                message_count INTEGER DEFAULT 0,
                updated_at {now}
            )"
        ),
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_conversations_sender
             ON conversations(license_key_id, sender_contact)"
            .to_string(),
        "CREATE INDEX IF NOT EXISTS idx_conversations_recency
             ON conversations(license_key_id, last_message_at DESC)"
            .to_string(),
        format!(
            "CREATE TABLE IF NOT EXISTS email_configs (
                id {pk},
                license_key_id BIGINT UNIQUE NOT NULL,
                email_address TEXT,
                access_token TEXT,
                refresh_token TEXT,
                auto_reply_enabled {bool_f},
                check_interval_minutes INTEGER DEFAULT 5,
                last_checked_at TIMESTAMP,
                is_active {bool_t},
                created_at {now}
            )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS telegram_bot_configs (
                id {pk},
                license_key_id BIGINT UNIQUE NOT NULL,
                bot_token TEXT,
                bot_username TEXT,
                auto_reply_enabled {bool_f},
                is_active {bool_t},
                created_at {now}
            )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS telegram_sessions (
                id {pk},
                license_key_id BIGINT UNIQUE NOT NULL,
                session_blob TEXT,
                user_id TEXT,
                phone_number TEXT,
                auto_reply_enabled {bool_f},
                is_active {bool_t},
                created_at {now},
                last_synced_at TIMESTAMP
            )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS whatsapp_configs (
                id {pk},
                license_key_id BIGINT UNIQUE NOT NULL,
                phone_number_id TEXT,
                access_token TEXT,
                verify_token TEXT,
                webhook_secret TEXT,
                auto_reply_enabled {bool_f},
                is_active {bool_t},
                created_at {now}
            )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS telegram_entities (
                id {pk},
                license_key_id BIGINT NOT NULL,
                entity_id TEXT NOT NULL,
                access_hash TEXT,
                entity_type TEXT,
                username TEXT,
                updated_at {now}
            )"
        ),
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_telegram_entities
             ON telegram_entities(license_key_id, entity_id)"
            .to_string(),
        format!(
            "CREATE TABLE IF NOT EXISTS customers (
                id {pk},
                license_key_id BIGINT NOT NULL,
                name TEXT,
                phone TEXT,
                email TEXT,
                lead_score INTEGER DEFAULT 0,
                segment TEXT,
                message_count INTEGER DEFAULT 0,
                last_contact_at TIMESTAMP,
                created_at {now},
                updated_at TIMESTAMP
            )"
        ),
        "CREATE INDEX IF NOT EXISTS idx_customers_license
             ON customers(license_key_id, phone, email)"
            .to_string(),
        format!(
            "CREATE TABLE IF NOT EXISTS customer_messages (
                id {pk},
                license_key_id BIGINT NOT NULL,
                customer_id BIGINT NOT NULL,
                inbox_message_id BIGINT NOT NULL,
                created_at {now}
            )"
        ),
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_customer_messages
             ON customer_messages(customer_id, inbox_message_id)"
            .to_string(),
        format!(
            "CREATE TABLE IF NOT EXISTS purchases (
                id {pk},
                license_key_id BIGINT NOT NULL,
                customer_id BIGINT NOT NULL,
                product_name TEXT NOT NULL,
                amount REAL NOT NULL,
                currency TEXT DEFAULT 'SYP',
                payment_type TEXT DEFAULT 'spot',
                notes TEXT,
                created_at {now}
            )"
        ),
        "CREATE INDEX IF NOT EXISTS idx_purchases_customer
             ON purchases(license_key_id, customer_id)"
            .to_string(),
        format!(
            "CREATE TABLE IF NOT EXISTS notifications (
                id {pk},
                license_key_id BIGINT NOT NULL,
                title TEXT NOT NULL,
                body TEXT,
                priority TEXT DEFAULT 'normal',
                is_read {bool_f},
                created_at {now}
            )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS push_tokens (
                id {pk},
                license_key_id BIGINT NOT NULL,
                token TEXT UNIQUE NOT NULL,
                platform TEXT,
                last_active_at TIMESTAMP,
                created_at {now}
            )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS task_queue (
                id {pk},
                task_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER DEFAULT 0,
                max_attempts INTEGER DEFAULT 3,
                next_attempt_at TIMESTAMP,
                leased_by TEXT,
                lease_expires_at TIMESTAMP,
                created_at {now},
                completed_at TIMESTAMP,
                last_error TEXT
            )"
        ),
        "CREATE INDEX IF NOT EXISTS idx_task_queue_claim
             ON task_queue(status, next_attempt_at)"
            .to_string(),
    ]
}
