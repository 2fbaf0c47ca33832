//! Layered configuration for the coordinator and producer binaries.
//!
//! Settings load from, in increasing priority: defaults embedded below, an
//! optional TOML file, then `DISPATCHER__SECTION__KEY`-style environment
//! variables. This mirrors the config-crate layering used elsewhere in the
//! ecosystem for services with many small tunables.

use serde::Deserialize;
use std::time::Duration;

use crate::error::{DispatcherError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub worker_id: String,
    pub database_url: String,
    pub poll_interval_seconds: u64,
    pub visibility_timeout_seconds: u64,
    pub dispatch_stagger_seconds: u64,
    pub post_job_cooldown_seconds: u64,
    pub api_server_urls: Vec<String>,
    pub healthcheck_path: String,
    pub healthcheck_timeout_seconds: u64,
    pub healthcheck_cache_seconds: u64,
    pub verify_path: String,
    pub api_timeout_seconds: u64,
    pub api_token: String,
    pub skip_existing: bool,
    pub skip_active_processing: bool,
    pub skip_recent_success_hours: i64,
    pub rate_limit_ms: u64,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_id: "worker-carteirinhas".to_string(),
            database_url: "postgres://localhost/dispatcher".to_string(),
            poll_interval_seconds: 60,
            visibility_timeout_seconds: 900,
            dispatch_stagger_seconds: 5,
            post_job_cooldown_seconds: 0,
            api_server_urls: Vec::new(),
            healthcheck_path: "/".to_string(),
            healthcheck_timeout_seconds: 5,
            healthcheck_cache_seconds: 15,
            verify_path: "verificar_carteirinha".to_string(),
            api_timeout_seconds: 900,
            api_token: String::new(),
            skip_existing: true,
            skip_active_processing: true,
            skip_recent_success_hours: 6,
            rate_limit_ms: 0,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load from an optional TOML file plus `DISPATCHER__*` environment
    /// overrides. The file is optional; a fully environment-driven
    /// deployment works with `path = None`.
    pub fn load(path: Option<&std::path::Path>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Config::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }

        let built = builder
            .add_source(
                config::Environment::with_prefix("DISPATCHER")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(","),
            )
            .build()?;

        let config: Config = built.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.worker_id.trim().is_empty() {
            return Err(DispatcherError::Config("worker_id must not be empty".into()));
        }
        if self.database_url.trim().is_empty() {
            return Err(DispatcherError::Config(
                "database_url must not be empty".into(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_seconds)
    }

    pub fn dispatch_stagger(&self) -> Duration {
        Duration::from_secs(self.dispatch_stagger_seconds)
    }

    pub fn healthcheck_timeout(&self) -> Duration {
        Duration::from_secs(self.healthcheck_timeout_seconds)
    }

    pub fn healthcheck_cache(&self) -> Duration {
        Duration::from_secs(self.healthcheck_cache_seconds)
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_seconds)
    }
}

// `config::Config::try_from` needs `Config: Serialize` to round-trip
// defaults through the layering machinery.
impl serde::Serialize for Config {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("Config", 18)?;
        s.serialize_field("worker_id", &self.worker_id)?;
        s.serialize_field("database_url", &self.database_url)?;
        s.serialize_field("poll_interval_seconds", &self.poll_interval_seconds)?;
        s.serialize_field(
            "visibility_timeout_seconds",
            &self.visibility_timeout_seconds,
        )?;
        s.serialize_field("dispatch_stagger_seconds", &self.dispatch_stagger_seconds)?;
        s.serialize_field(
            "post_job_cooldown_seconds",
            &self.post_job_cooldown_seconds,
        )?;
        s.serialize_field("api_server_urls", &self.api_server_urls)?;
        s.serialize_field("healthcheck_path", &self.healthcheck_path)?;
        s.serialize_field(
            "healthcheck_timeout_seconds",
            &self.healthcheck_timeout_seconds,
        )?;
        s.serialize_field(
            "healthcheck_cache_seconds",
            &self.healthcheck_cache_seconds,
        )?;
        s.serialize_field("verify_path", &self.verify_path)?;
        s.serialize_field("api_timeout_seconds", &self.api_timeout_seconds)?;
        s.serialize_field("api_token", &self.api_token)?;
        s.serialize_field("skip_existing", &self.skip_existing)?;
        s.serialize_field("skip_active_processing", &self.skip_active_processing)?;
        s.serialize_field(
            "skip_recent_success_hours",
            &self.skip_recent_success_hours,
        )?;
        s.serialize_field("rate_limit_ms", &self.rate_limit_ms)?;
        s.serialize_field("log_level", &self.log_level)?;
        s.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.poll_interval(), Duration::from_secs(60));
    }

    #[test]
    fn rejects_empty_worker_id() {
        let mut cfg = Config::default();
        cfg.worker_id = "".to_string();
        assert!(cfg.validate().is_err());
    }
}
