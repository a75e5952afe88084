//! Per-license, per-transport credential records. Token and secret columns
//! are stored vault-encrypted; everything else is plaintext metadata.

use chrono::NaiveDateTime;
use rasil_core::types::LicenseId;
use rasil_vault::Vault;

use crate::backend::Database;
use crate::error::Result;
use crate::value::Value;

#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub license_id: LicenseId,
    pub email_address: Option<String>,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub auto_reply_enabled: bool,
    pub check_interval_minutes: i64,
    pub last_checked_at: Option<NaiveDateTime>,
    pub created_at: Option<NaiveDateTime>,
    pub is_active: bool,
}

#[derive(Debug, Clone)]
pub struct TelegramBotConfig {
    pub license_id: LicenseId,
    pub bot_token: String,
    pub bot_username: Option<String>,
    pub auto_reply_enabled: bool,
    pub is_active: bool,
}

#[derive(Debug, Clone)]
pub struct TelegramSession {
    pub license_id: LicenseId,
    pub session_blob: String,
    pub user_id: Option<String>,
    pub phone_number: Option<String>,
    pub auto_reply_enabled: bool,
    pub is_active: bool,
    pub created_at: Option<NaiveDateTime>,
    pub last_synced_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone)]
pub struct WhatsappConfig {
    pub license_id: LicenseId,
    pub phone_number_id: String,
    pub access_token: String,
    pub verify_token: Option<String>,
    pub webhook_secret: Option<String>,
    pub auto_reply_enabled: bool,
    pub is_active: bool,
}

// ── Email ─────────────────────────────────────────────────────────────────────

pub async fn save_email_config(
    db: &Database,
    vault: &Vault,
    license_id: LicenseId,
    email_address: &str,
    access_token: &str,
    refresh_token: Option<&str>,
) -> Result<()> {
    let access = vault.encrypt(access_token)?;
    let refresh = refresh_token.map(|t| vault.encrypt(t)).transpose()?;
    // Re-linking replaces the previous tokens in place.
    let updated = db
        .execute(
            "UPDATE email_configs SET email_address = ?, access_token = ?, refresh_token = ?, is_active = ?
             WHERE license_key_id = ?",
            &[
                email_address.into(),
                access.as_str().into(),
                refresh.clone().into(),
                true.into(),
                license_id.into(),
            ],
        )
        .await?;
    if updated == 0 {
        db.execute(
            "INSERT INTO email_configs (license_key_id, email_address, access_token, refresh_token)
             VALUES (?, ?, ?, ?)",
            &[
                license_id.into(),
                email_address.into(),
                access.as_str().into(),
                refresh.into(),
            ],
        )
        .await?;
    }
    Ok(())
}

pub async fn get_email_config(
    db: &Database,
    vault: &Vault,
    license_id: LicenseId,
) -> Result<Option<EmailConfig>> {
    let row = db
        .fetch_one(
            "SELECT license_key_id, email_address, access_token, refresh_token,
                    auto_reply_enabled, check_interval_minutes, last_checked_at,
                    created_at, is_active
             FROM email_configs WHERE license_key_id = ?",
            &[license_id.into()],
        )
        .await?;
    let Some(row) = row else { return Ok(None) };
    Ok(Some(EmailConfig {
        license_id: row.i64("license_key_id")?,
        email_address: row.opt_text("email_address")?,
        access_token: vault.decrypt(&row.text("access_token")?)?,
        refresh_token: row
            .opt_text("refresh_token")?
            .map(|t| vault.decrypt(&t))
            .transpose()?,
        auto_reply_enabled: row.bool("auto_reply_enabled")?,
        check_interval_minutes: row.opt_i64("check_interval_minutes")?.unwrap_or(5),
        last_checked_at: row.opt_timestamp("last_checked_at")?,
        created_at: row.opt_timestamp("created_at")?,
        is_active: row.bool("is_active")?,
    }))
}

pub async fn update_email_last_checked(db: &Database, license_id: LicenseId) -> Result<()> {
    db.execute(
        "UPDATE email_configs SET last_checked_at = ? WHERE license_key_id = ?",
        &[db.now(), license_id.into()],
    )
    .await?;
    Ok(())
}

/// Refresh produced a new access token; persist it without touching the rest.
pub async fn update_email_access_token(
    db: &Database,
    vault: &Vault,
    license_id: LicenseId,
    access_token: &str,
) -> Result<()> {
    let access = vault.encrypt(access_token)?;
    db.execute(
        "UPDATE email_configs SET access_token = ? WHERE license_key_id = ?",
        &[access.as_str().into(), license_id.into()],
    )
    .await?;
    Ok(())
}

pub async fn deactivate_email_config(db: &Database, license_id: LicenseId) -> Result<()> {
    db.execute(
        "UPDATE email_configs SET is_active = ? WHERE license_key_id = ?",
        &[false.into(), license_id.into()],
    )
    .await?;
    Ok(())
}

// ── Telegram bot ──────────────────────────────────────────────────────────────

pub async fn save_telegram_bot_config(
    db: &Database,
    vault: &Vault,
    license_id: LicenseId,
    bot_token: &str,
    bot_username: Option<&str>,
) -> Result<()> {
    let token = vault.encrypt(bot_token)?;
    let updated = db
        .execute(
            "UPDATE telegram_bot_configs SET bot_token = ?, bot_username = ?, is_active = ?
             WHERE license_key_id = ?",
            &[
                token.as_str().into(),
                bot_username.map(str::to_string).into(),
                true.into(),
                license_id.into(),
            ],
        )
        .await?;
    if updated == 0 {
        db.execute(
            "INSERT INTO telegram_bot_configs (license_key_id, bot_token, bot_username)
             VALUES (?, ?, ?)",
            &[
                license_id.into(),
                token.as_str().into(),
                bot_username.map(str::to_string).into(),
            ],
        )
        .await?;
    }
    Ok(())
}

pub async fn get_telegram_bot_config(
    db: &Database,
    vault: &Vault,
    license_id: LicenseId,
) -> Result<Option<TelegramBotConfig>> {
    let row = db
        .fetch_one(
            "SELECT license_key_id, bot_token, bot_username, auto_reply_enabled, is_active
             FROM telegram_bot_configs WHERE license_key_id = ?",
            &[license_id.into()],
        )
        .await?;
    let Some(row) = row else { return Ok(None) };
    Ok(Some(TelegramBotConfig {
        license_id: row.i64("license_key_id")?,
        bot_token: vault.decrypt(&row.text("bot_token")?)?,
        bot_username: row.opt_text("bot_username")?,
        auto_reply_enabled: row.bool("auto_reply_enabled")?,
        is_active: row.bool("is_active")?,
    }))
}

// ── Telegram user session ─────────────────────────────────────────────────────

pub async fn save_telegram_session(
    db: &Database,
    vault: &Vault,
    license_id: LicenseId,
    session_blob: &str,
    user_id: Option<&str>,
    phone_number: Option<&str>,
) -> Result<()> {
    let blob = vault.encrypt(session_blob)?;
    let updated = db
        .execute(
            "UPDATE telegram_sessions SET session_blob = ?, user_id = ?, phone_number = ?, is_active = ?
             WHERE license_key_id = ?",
            &[
                blob.as_str().into(),
                user_id.map(str::to_string).into(),
                phone_number.map(str::to_string).into(),
                true.into(),
                license_id.into(),
            ],
        )
        .await?;
    if updated == 0 {
        db.execute(
            "INSERT INTO telegram_sessions (license_key_id, session_blob, user_id, phone_number)
             VALUES (?, ?, ?, ?)",
            &[
                license_id.into(),
                blob.as_str().into(),
                user_id.map(str::to_string).into(),
                phone_number.map(str::to_string).into(),
            ],
        )
        .await?;
    }
    Ok(())
}

pub async fn get_telegram_session(
    db: &Database,
    vault: &Vault,
    license_id: LicenseId,
) -> Result<Option<TelegramSession>> {
    let row = db
        .fetch_one(
            "SELECT license_key_id, session_blob, user_id, phone_number, auto_reply_enabled,
                    is_active, created_at, last_synced_at
             FROM telegram_sessions WHERE license_key_id = ? AND is_active = ?",
            &[license_id.into(), true.into()],
        )
        .await?;
    let Some(row) = row else { return Ok(None) };
    Ok(Some(TelegramSession {
        license_id: row.i64("license_key_id")?,
        session_blob: vault.decrypt(&row.text("session_blob")?)?,
        user_id: row.opt_text("user_id")?,
        phone_number: row.opt_text("phone_number")?,
        auto_reply_enabled: row.bool("auto_reply_enabled")?,
        is_active: row.bool("is_active")?,
        created_at: row.opt_timestamp("created_at")?,
        last_synced_at: row.opt_timestamp("last_synced_at")?,
    }))
}

pub async fn all_active_telegram_sessions(
    db: &Database,
    vault: &Vault,
) -> Result<Vec<TelegramSession>> {
    let rows = db
        .fetch_all(
            "SELECT license_key_id, session_blob, user_id, phone_number, auto_reply_enabled,
                    is_active, created_at, last_synced_at
             FROM telegram_sessions WHERE is_active = ?",
            &[true.into()],
        )
        .await?;
    let mut out = Vec::with_capacity(rows.len());
    for row in &rows {
        out.push(TelegramSession {
            license_id: row.i64("license_key_id")?,
            session_blob: vault.decrypt(&row.text("session_blob")?)?,
            user_id: row.opt_text("user_id")?,
            phone_number: row.opt_text("phone_number")?,
            auto_reply_enabled: row.bool("auto_reply_enabled")?,
            is_active: row.bool("is_active")?,
            created_at: row.opt_timestamp("created_at")?,
            last_synced_at: row.opt_timestamp("last_synced_at")?,
        });
    }
    Ok(out)
}

/// Invalid/revoked sessions are deactivated so polls stop erroring until the
/// operator re-links.
pub async fn deactivate_telegram_session(db: &Database, license_id: LicenseId) -> Result<()> {
    db.execute(
        "UPDATE telegram_sessions SET is_active = ? WHERE license_key_id = ?",
        &[false.into(), license_id.into()],
    )
    .await?;
    Ok(())
}

pub async fn update_telegram_session_sync_time(
    db: &Database,
    license_id: LicenseId,
) -> Result<()> {
    db.execute(
        "UPDATE telegram_sessions SET last_synced_at = ? WHERE license_key_id = ?",
        &[db.now(), license_id.into()],
    )
    .await?;
    Ok(())
}

// ── MTProto entity cache ──────────────────────────────────────────────────────

pub async fn save_telegram_entity(
    db: &Database,
    license_id: LicenseId,
    entity_id: &str,
    access_hash: &str,
    entity_type: &str,
    username: Option<&str>,
) -> Result<()> {
    let updated = db
        .execute(
            "UPDATE telegram_entities SET access_hash = ?, entity_type = ?, username = ?, updated_at = ?
             WHERE license_key_id = ? AND entity_id = ?",
            &[
                access_hash.into(),
                entity_type.into(),
                username.map(str::to_string).into(),
                db.now(),
                license_id.into(),
                entity_id.into(),
            ],
        )
        .await?;
    if updated == 0 {
        db.execute(
            "INSERT INTO telegram_entities (license_key_id, entity_id, access_hash, entity_type, username)
             VALUES (?, ?, ?, ?, ?)",
            &[
                license_id.into(),
                entity_id.into(),
                access_hash.into(),
                entity_type.into(),
                username.map(str::to_string).into(),
            ],
        )
        .await?;
    }
    Ok(())
}

pub async fn get_telegram_entity(
    db: &Database,
    license_id: LicenseId,
    entity_id: &str,
) -> Result<Option<(String, String)>> {
    let row = db
        .fetch_one(
            "SELECT access_hash, entity_type FROM telegram_entities
             WHERE license_key_id = ? AND entity_id = ?",
            &[license_id.into(), entity_id.into()],
        )
        .await?;
    let Some(row) = row else { return Ok(None) };
    match (row.opt_text("access_hash")?, row.opt_text("entity_type")?) {
        (Some(hash), Some(ty)) => Ok(Some((hash, ty))),
        _ => Ok(None),
    }
}

// ── WhatsApp ──────────────────────────────────────────────────────────────────

pub async fn save_whatsapp_config(
    db: &Database,
    vault: &Vault,
    license_id: LicenseId,
    phone_number_id: &str,
    access_token: &str,
    verify_token: Option<&str>,
    webhook_secret: Option<&str>,
) -> Result<()> {
    let token = vault.encrypt(access_token)?;
    let secret = webhook_secret.map(|s| vault.encrypt(s)).transpose()?;
    let updated = db
        .execute(
            "UPDATE whatsapp_configs SET phone_number_id = ?, access_token = ?, verify_token = ?,
                    webhook_secret = ?, is_active = ?
             WHERE license_key_id = ?",
            &[
                phone_number_id.into(),
                token.as_str().into(),
                verify_token.map(str::to_string).into(),
                secret.clone().into(),
                true.into(),
                license_id.into(),
            ],
        )
        .await?;
    if updated == 0 {
        db.execute(
            "INSERT INTO whatsapp_configs
                 (license_key_id, phone_number_id, access_token, verify_token, webhook_secret)
             VALUES (?, ?, ?, ?, ?)",
            &[
                license_id.into(),
                phone_number_id.into(),
                token.as_str().into(),
                verify_token.map(str::to_string).into(),
                secret.into(),
            ],
        )
        .await?;
    }
    Ok(())
}

pub async fn get_whatsapp_config(
    db: &Database,
    vault: &Vault,
    license_id: LicenseId,
) -> Result<Option<WhatsappConfig>> {
    let row = db
        .fetch_one(
            "SELECT license_key_id, phone_number_id, access_token, verify_token,
                    webhook_secret, auto_reply_enabled, is_active
             FROM whatsapp_configs WHERE license_key_id = ?",
            &[license_id.into()],
        )
        .await?;
    let Some(row) = row else { return Ok(None) };
    Ok(Some(WhatsappConfig {
        license_id: row.i64("license_key_id")?,
        phone_number_id: row.text("phone_number_id")?,
        access_token: vault.decrypt(&row.text("access_token")?)?,
        verify_token: row.opt_text("verify_token")?,
        webhook_secret: row
            .opt_text("webhook_secret")?
            .map(|s| vault.decrypt(&s))
            .transpose()?,
        auto_reply_enabled: row.bool("auto_reply_enabled")?,
        is_active: row.bool("is_active")?,
    }))
}

/// Webhook verification handshake: Meta sends the token, we find which
/// license it belongs to.
pub async fn find_whatsapp_license_by_verify_token(
    db: &Database,
    verify_token: &str,
) -> Result<Option<LicenseId>> {
    let row = db
        .fetch_one(
            "SELECT license_key_id FROM whatsapp_configs
             WHERE verify_token = ? AND is_active = ?",
            &[verify_token.into(), true.into()],
        )
        .await?;
    row.map(|r| r.i64("license_key_id")).transpose()
}

/// Status/message webhooks carry the phone_number_id in their metadata;
/// that is the routing key back to a license.
pub async fn find_whatsapp_license_by_phone_number_id(
    db: &Database,
    phone_number_id: &str,
) -> Result<Option<LicenseId>> {
    let row = db
        .fetch_one(
            "SELECT license_key_id FROM whatsapp_configs
             WHERE phone_number_id = ? AND is_active = ?",
            &[phone_number_id.into(), true.into()],
        )
        .await?;
    row.map(|r| r.i64("license_key_id")).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::init_schema;

    async fn setup() -> (Database, Vault) {
        let db = Database::memory().unwrap();
        init_schema(&db).await.unwrap();
        (db, Vault::from_secret("test-secret").unwrap())
    }

    #[tokio::test]
    async fn tokens_are_encrypted_at_rest() {
        let (db, vault) = setup().await;
        save_whatsapp_config(&db, &vault, 1, "1029384756", "EAAGtoken", Some("vt"), Some("hs"))
            .await
            .unwrap();

        let raw = db
            .fetch_one(
                "SELECT access_token FROM whatsapp_configs WHERE license_key_id = ?",
                &[1i64.into()],
            )
            .await
            .unwrap()
            .unwrap();
        assert_ne!(raw.text("access_token").unwrap(), "EAAGtoken");

        let cfg = get_whatsapp_config(&db, &vault, 1).await.unwrap().unwrap();
        assert_eq!(cfg.access_token, "EAAGtoken");
        assert_eq!(cfg.webhook_secret.as_deref(), Some("hs"));
    }

    #[tokio::test]
    async fn save_is_upsert_per_license() {
        let (db, vault) = setup().await;
        save_telegram_bot_config(&db, &vault, 1, "tok-1", Some("mybot")).await.unwrap();
        save_telegram_bot_config(&db, &vault, 1, "tok-2", Some("mybot")).await.unwrap();

        let cfg = get_telegram_bot_config(&db, &vault, 1).await.unwrap().unwrap();
        assert_eq!(cfg.bot_token, "tok-2");
    }

    #[tokio::test]
    async fn deactivated_session_is_not_returned() {
        let (db, vault) = setup().await;
        save_telegram_session(&db, &vault, 1, "blob", Some("42"), Some("+963"))
            .await
            .unwrap();
        assert!(get_telegram_session(&db, &vault, 1).await.unwrap().is_some());

        deactivate_telegram_session(&db, 1).await.unwrap();
        assert!(get_telegram_session(&db, &vault, 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn entity_hash_round_trips() {
        let (db, _) = setup().await;
        save_telegram_entity(&db, 1, "777000", "889900", "user", Some("service"))
            .await
            .unwrap();
        let (hash, ty) = get_telegram_entity(&db, 1, "777000").await.unwrap().unwrap();
        assert_eq!(hash, "889900");
        assert_eq!(ty, "user");
    }
}
