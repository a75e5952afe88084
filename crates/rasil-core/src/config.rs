use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 8780;
pub const DEFAULT_BIND: &str = "0.0.0.0";

/// Main poll loop cadence (seconds).
pub const POLL_INTERVAL_SECS: u64 = 300;
/// Per-license stagger inside one poll cycle (seconds, uniform range).
pub const STAGGER_MIN_SECS: f64 = 10.0;
pub const STAGGER_MAX_SECS: f64 = 15.0;
/// Task lease duration before the reaper returns a task to pending.
pub const LEASE_TTL_SECS: i64 = 30;
/// Outbound HTTP default timeout; the URL scrape uses its own 10 s budget.
pub const HTTP_TIMEOUT_SECS: u64 = 30;
/// Window in which a sent outbox message may still be edited (minutes).
pub const EDIT_WINDOW_MINUTES: i64 = 15;

/// Top-level config (rasil.toml + RASIL_* env overrides + the documented
/// plain env keys such as DB_TYPE / DATABASE_URL / REDIS_URL).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RasilConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub vault: VaultConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub ai: AiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Opaque key that guards admin endpoints.
    pub admin_key: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
            admin_key: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseKind {
    #[default]
    Sqlite,
    #[serde(rename = "postgresql")]
    Postgres,
}

impl std::str::FromStr for DatabaseKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sqlite" => Ok(DatabaseKind::Sqlite),
            "postgresql" | "postgres" => Ok(DatabaseKind::Postgres),
            other => Err(format!("unknown DB_TYPE: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub kind: DatabaseKind,
    /// SQLite file path.
    #[serde(default = "default_db_path")]
    pub path: String,
    /// PostgreSQL connection string; required when kind = postgresql.
    pub url: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            kind: DatabaseKind::Sqlite,
            path: default_db_path(),
            url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CacheConfig {
    /// When set, rate-limit counters and WS pub/sub go through Redis;
    /// absent, both fall back to in-process state.
    pub redis_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VaultConfig {
    /// 44-char base64 = raw 32-byte key; anything else is treated as a
    /// passphrase and run through PBKDF2.
    pub encryption_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TelegramConfig {
    pub api_id: Option<i32>,
    pub api_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_daily_cap")]
    pub max_messages_per_user_day: u32,
    #[serde(default = "default_minute_cap")]
    pub max_messages_per_user_minute: u32,
    #[serde(default = "default_backfill_days")]
    pub backfill_days: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_messages_per_user_day: default_daily_cap(),
            max_messages_per_user_minute: default_minute_cap(),
            backfill_days: default_backfill_days(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_upload_dir")]
    pub upload_dir: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            upload_dir: default_upload_dir(),
            base_url: default_base_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AiConfig {
    pub openai_api_key: Option<String>,
    pub google_api_key: Option<String>,
    pub openai_model: Option<String>,
    pub google_model: Option<String>,
}

impl RasilConfig {
    /// Load order: rasil.toml < RASIL_* env < documented plain env keys.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(|| "rasil.toml".to_string());

        let mut config: RasilConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("RASIL_").split("_"))
            .extract()
            .map_err(|e| crate::error::RasilError::Config(e.to_string()))?;

        config.apply_plain_env();
        Ok(config)
    }

    /// The original deployment documented a set of unprefixed env keys;
    /// they win over everything else.
    fn apply_plain_env(&mut self) {
        if let Ok(v) = std::env::var("DB_TYPE") {
            if let Ok(kind) = v.parse() {
                self.database.kind = kind;
            }
        }
        if let Ok(v) = std::env::var("DATABASE_PATH") {
            self.database.path = v;
        }
        if let Ok(v) = std::env::var("DATABASE_URL") {
            self.database.url = Some(v);
        }
        if let Ok(v) = std::env::var("REDIS_URL") {
            self.cache.redis_url = Some(v);
        }
        if let Ok(v) = std::env::var("ENCRYPTION_KEY") {
            self.vault.encryption_key = Some(v);
        }
        if let Ok(v) = std::env::var("ADMIN_KEY") {
            self.gateway.admin_key = Some(v);
        }
        if let Ok(v) = std::env::var("TELEGRAM_API_ID") {
            self.telegram.api_id = v.parse().ok();
        }
        if let Ok(v) = std::env::var("TELEGRAM_API_HASH") {
            self.telegram.api_hash = Some(v);
        }
        if let Ok(v) = std::env::var("MAX_MESSAGES_PER_USER_DAY") {
            if let Ok(n) = v.parse() {
                self.limits.max_messages_per_user_day = n;
            }
        }
        if let Ok(v) = std::env::var("MAX_MESSAGES_PER_USER_MINUTE") {
            if let Ok(n) = v.parse() {
                self.limits.max_messages_per_user_minute = n;
            }
        }
        if let Ok(v) = std::env::var("BACKFILL_DAYS") {
            if let Ok(n) = v.parse() {
                self.limits.backfill_days = n;
            }
        }
        if let Ok(v) = std::env::var("UPLOAD_DIR") {
            self.storage.upload_dir = v;
        }
        if let Ok(v) = std::env::var("BASE_URL") {
            self.storage.base_url = v;
        }
        if let Ok(v) = std::env::var("OPENAI_API_KEY") {
            self.ai.openai_api_key = Some(v);
        }
        if let Ok(v) = std::env::var("GOOGLE_API_KEY") {
            self.ai.google_api_key = Some(v);
        }
        if let Ok(v) = std::env::var("OPENAI_MODEL") {
            self.ai.openai_model = Some(v);
        }
        if let Ok(v) = std::env::var("GOOGLE_MODEL") {
            self.ai.google_model = Some(v);
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}

fn default_db_path() -> String {
    "rasil.db".to_string()
}

fn default_daily_cap() -> u32 {
    50
}

fn default_minute_cap() -> u32 {
    1
}

fn default_backfill_days() -> u32 {
    30
}

fn default_upload_dir() -> String {
    "uploads".to_string()
}

fn default_base_url() -> String {
    format!("http://localhost:{}", DEFAULT_PORT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = RasilConfig::default();
        assert_eq!(cfg.gateway.port, DEFAULT_PORT);
        assert_eq!(cfg.database.kind, DatabaseKind::Sqlite);
        assert_eq!(cfg.limits.max_messages_per_user_day, 50);
        assert_eq!(cfg.limits.max_messages_per_user_minute, 1);
        assert_eq!(cfg.limits.backfill_days, 30);
    }

    #[test]
    fn db_kind_parses_both_spellings() {
        assert_eq!("postgresql".parse::<DatabaseKind>().unwrap(), DatabaseKind::Postgres);
        assert_eq!("postgres".parse::<DatabaseKind>().unwrap(), DatabaseKind::Postgres);
        assert_eq!("SQLITE".parse::<DatabaseKind>().unwrap(), DatabaseKind::Sqlite);
    }
}
