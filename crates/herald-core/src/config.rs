use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_TICK_SECS: u64 = 60;
/// Longest accepted tick: one day.
pub const MAX_TICK_SECS: u64 = 86_400;
pub const DEFAULT_MAX_CONCURRENT_CAMPAIGNS: usize = 32;
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30;
pub const DEFAULT_MAX_SEND_ATTEMPTS: u32 = 8;
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Top-level config (herald.toml + HERALD_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeraldConfig {
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
}

/// Scan loop and per-campaign fan-out settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Period between two scans for due mail.
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    /// Fire ticks on multiples of `tick_secs` since the epoch (e.g. on the minute).
    #[serde(default = "bool_true")]
    pub align_to_wall_clock: bool,
    /// Upper bound on partition tasks doing storage/queue work at the same time.
    #[serde(default = "default_max_concurrent_campaigns")]
    pub max_concurrent_campaigns: usize,
    /// How long shutdown waits for in-flight partition tasks.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    /// Transient delivery failures tolerated before a mail log is errored out.
    #[serde(default = "default_max_send_attempts")]
    pub max_send_attempts: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            tick_secs: DEFAULT_TICK_SECS,
            align_to_wall_clock: true,
            max_concurrent_campaigns: DEFAULT_MAX_CONCURRENT_CAMPAIGNS,
            shutdown_grace_secs: DEFAULT_SHUTDOWN_GRACE_SECS,
            max_send_attempts: DEFAULT_MAX_SEND_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Batches the in-process mailer buffers before `queue` starts waiting.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Log deliveries instead of handing them to a transport.
    #[serde(default = "bool_true")]
    pub dry_run: bool,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            dry_run: true,
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_tick_secs() -> u64 {
    DEFAULT_TICK_SECS
}
fn default_max_concurrent_campaigns() -> usize {
    DEFAULT_MAX_CONCURRENT_CAMPAIGNS
}
fn default_shutdown_grace_secs() -> u64 {
    DEFAULT_SHUTDOWN_GRACE_SECS
}
fn default_max_send_attempts() -> u32 {
    DEFAULT_MAX_SEND_ATTEMPTS
}
fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.herald/herald.db", home)
}

impl HeraldConfig {
    /// Load config from a TOML file with HERALD_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. HERALD_CONFIG env var
    ///   3. ~/.herald/herald.toml
    ///
    /// Nested keys use a double underscore: `HERALD_DISPATCH__TICK_SECS=30`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .or_else(|| std::env::var("HERALD_CONFIG").ok())
            .unwrap_or_else(default_config_path);

        let config: HeraldConfig = Figment::from(Serialized::defaults(HeraldConfig::default()))
            .merge(Toml::file(&path))
            .merge(Env::prefixed("HERALD_").ignore(&["CONFIG"]).split("__"))
            .extract()
            .map_err(|e| crate::error::HeraldError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values that would stall the engine.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.dispatch.tick_secs == 0 {
            return Err(crate::error::HeraldError::Config(
                "dispatch.tick_secs must be greater than zero".into(),
            ));
        }
        if self.dispatch.tick_secs > MAX_TICK_SECS {
            return Err(crate::error::HeraldError::Config(format!(
                "dispatch.tick_secs must be at most {MAX_TICK_SECS}"
            )));
        }
        if self.dispatch.max_concurrent_campaigns == 0 {
            return Err(crate::error::HeraldError::Config(
                "dispatch.max_concurrent_campaigns must be greater than zero".into(),
            ));
        }
        if self.delivery.queue_capacity == 0 {
            return Err(crate::error::HeraldError::Config(
                "delivery.queue_capacity must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.herald/herald.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn missing_file_yields_defaults() {
        Jail::expect_with(|jail| {
            let path = jail.directory().join("absent.toml");
            let config = HeraldConfig::load(path.to_str()).expect("load failed");
            assert_eq!(config.dispatch.tick_secs, DEFAULT_TICK_SECS);
            assert_eq!(config.dispatch.max_send_attempts, DEFAULT_MAX_SEND_ATTEMPTS);
            assert!(config.delivery.dry_run);
            Ok(())
        });
    }

    #[test]
    fn file_and_env_are_merged() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "herald.toml",
                r#"
                [dispatch]
                tick_secs = 15
                max_concurrent_campaigns = 4

                [database]
                path = "/tmp/herald-test.db"
                "#,
            )?;
            jail.set_env("HERALD_DISPATCH__TICK_SECS", "5");

            let config = HeraldConfig::load(Some("herald.toml")).expect("load failed");
            assert_eq!(config.dispatch.tick_secs, 5);
            assert_eq!(config.dispatch.max_concurrent_campaigns, 4);
            assert_eq!(config.database.path, "/tmp/herald-test.db");
            assert_eq!(config.delivery.queue_capacity, DEFAULT_QUEUE_CAPACITY);
            Ok(())
        });
    }

    #[test]
    fn zero_tick_is_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file("herald.toml", "[dispatch]\ntick_secs = 0\n")?;
            let err = HeraldConfig::load(Some("herald.toml")).unwrap_err();
            assert!(err.to_string().contains("tick_secs"));
            Ok(())
        });
    }

    #[test]
    fn oversized_tick_is_rejected() {
        Jail::expect_with(|jail| {
            jail.set_env("HERALD_DISPATCH__TICK_SECS", "100000");
            let err = HeraldConfig::load(Some("absent.toml")).unwrap_err();
            assert!(err.to_string().contains("at most 86400"));

            jail.set_env("HERALD_DISPATCH__TICK_SECS", MAX_TICK_SECS.to_string());
            let config = HeraldConfig::load(Some("absent.toml")).expect("load failed");
            assert_eq!(config.dispatch.tick_secs, MAX_TICK_SECS);
            Ok(())
        });
    }
}
