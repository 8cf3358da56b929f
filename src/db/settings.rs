use once_cell::sync::Lazy;
use sqlx::Row;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use crate::db::Database;
use crate::error::Result;

/// Admin-managed system LLM credentials, stored in the settings KV space.
#[derive(Debug, Clone, Default)]
pub struct SystemLlmDefaults {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub embedding_model: String,
}

/// A user's own LLM credentials; when active and keyed, quota does not apply.
#[derive(Debug, Clone, Default)]
pub struct UserLlmConfig {
    pub user_id: String,
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub embedding_model: String,
    pub active: bool,
}

// Process-wide cache of the system LLM defaults. Read-mostly; admin writes
// go through `set_system_llm_defaults`, which bumps the version so every
// reader reloads on its next call.
static DEFAULTS_VERSION: AtomicU64 = AtomicU64::new(1);
static DEFAULTS_CACHE: Lazy<RwLock<(u64, Option<SystemLlmDefaults>)>> =
    Lazy::new(|| RwLock::new((0, None)));

pub fn bump_llm_defaults_version() {
    DEFAULTS_VERSION.fetch_add(1, Ordering::SeqCst);
}

impl Database {
    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM system_settings WHERE key = ?")
                .bind(key)
                .fetch_optional(self.pool())
                .await?;
        Ok(value)
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO system_settings (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn admin_daily_quota(&self, default: i64) -> Result<i64> {
        Ok(self
            .get_setting("admin.daily_quota")
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(default))
    }

    pub async fn system_llm_defaults(&self) -> Result<Option<SystemLlmDefaults>> {
        let version = DEFAULTS_VERSION.load(Ordering::SeqCst);
        {
            let cache = DEFAULTS_CACHE.read().expect("defaults cache poisoned");
            if cache.0 == version {
                return Ok(cache.1.clone());
            }
        }

        let loaded = self.load_system_llm_defaults().await?;
        let mut cache = DEFAULTS_CACHE.write().expect("defaults cache poisoned");
        *cache = (version, loaded.clone());
        Ok(loaded)
    }

    async fn load_system_llm_defaults(&self) -> Result<Option<SystemLlmDefaults>> {
        let api_key = self.get_setting("llm.api_key").await?.unwrap_or_default();
        if api_key.is_empty() {
            return Ok(None);
        }
        Ok(Some(SystemLlmDefaults {
            api_key,
            base_url: self.get_setting("llm.base_url").await?.unwrap_or_default(),
            model: self.get_setting("llm.model").await?.unwrap_or_default(),
            embedding_model: self
                .get_setting("llm.embedding_model")
                .await?
                .unwrap_or_default(),
        }))
    }

    pub async fn set_system_llm_defaults(&self, defaults: &SystemLlmDefaults) -> Result<()> {
        self.set_setting("llm.api_key", &defaults.api_key).await?;
        self.set_setting("llm.base_url", &defaults.base_url).await?;
        self.set_setting("llm.model", &defaults.model).await?;
        self.set_setting("llm.embedding_model", &defaults.embedding_model)
            .await?;
        bump_llm_defaults_version();
        Ok(())
    }

    pub async fn get_user_llm_config(&self, user_id: &str) -> Result<Option<UserLlmConfig>> {
        let row = sqlx::query("SELECT * FROM user_llm_configs WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(self.pool())
            .await?;

        Ok(row.map(|r| UserLlmConfig {
            user_id: r.get("user_id"),
            api_key: r.get("api_key"),
            base_url: r.get("base_url"),
            model: r.get("model"),
            embedding_model: r.get("embedding_model"),
            active: r.get::<i64, _>("active") != 0,
        }))
    }

    pub async fn upsert_user_llm_config(&self, config: &UserLlmConfig) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO user_llm_configs (user_id, api_key, base_url, model, embedding_model, active)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&config.user_id)
        .bind(&config.api_key)
        .bind(&config.base_url)
        .bind(&config.model)
        .bind(&config.embedding_model)
        .bind(config.active as i64)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn usage_today(&self, user_id: &str) -> Result<i64> {
        let day = chrono::Utc::now().format("%Y-%m-%d").to_string();
        let calls: Option<i64> =
            sqlx::query_scalar("SELECT calls FROM usage_counters WHERE user_id = ? AND day = ?")
                .bind(user_id)
                .bind(&day)
                .fetch_optional(self.pool())
                .await?;
        Ok(calls.unwrap_or(0))
    }

    pub async fn increment_usage(&self, user_id: &str, calls: i64) -> Result<()> {
        let day = chrono::Utc::now().format("%Y-%m-%d").to_string();
        sqlx::query(
            r#"
            INSERT INTO usage_counters (user_id, day, calls) VALUES (?, ?, ?)
            ON CONFLICT (user_id, day) DO UPDATE SET calls = calls + excluded.calls
            "#,
        )
        .bind(user_id)
        .bind(&day)
        .bind(calls)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}
