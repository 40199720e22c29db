use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_CONFIG_PATH: &str = "driver.json";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct DriverConfig {
    pub world_dir: PathBuf,
    pub tick_ms: u64,
    /// Heartbeat interval for code that does not declare its own.
    pub heartbeat_interval_ms: u64,
    pub reset_interval_ms: u64,
    pub combat_round_ms: u64,
    pub flee_chance: f64,
    pub retaliate: bool,
    pub hook_budget_ms: u64,
    pub callout_budget_ms: u64,
    pub max_operations: u64,
    pub max_call_levels: usize,
    pub max_string_size: usize,
    pub max_array_size: usize,
    pub max_map_size: usize,
    pub max_callouts_per_tick: usize,
    pub fault_streak_limit: u32,
    pub max_error_log: usize,
    pub rng_seed: Option<u64>,
    pub watch_sources: bool,
    pub console_addr: String,
    pub console_token: Option<String>,
    pub console_rate_limit_per_sec: u32,
    pub extra_forbidden_symbols: Vec<String>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            world_dir: PathBuf::from("world"),
            tick_ms: 100,
            heartbeat_interval_ms: 2_000,
            reset_interval_ms: 15 * 60 * 1_000,
            combat_round_ms: 2_000,
            flee_chance: 0.5,
            retaliate: true,
            hook_budget_ms: 10,
            callout_budget_ms: 50,
            max_operations: 500_000,
            max_call_levels: 64,
            max_string_size: 64 * 1024,
            max_array_size: 10_000,
            max_map_size: 10_000,
            max_callouts_per_tick: 1_000,
            fault_streak_limit: 8,
            max_error_log: 100,
            rng_seed: None,
            watch_sources: true,
            console_addr: "127.0.0.1:4100".to_string(),
            console_token: None,
            console_rate_limit_per_sec: 20,
            extra_forbidden_symbols: Vec::new(),
        }
    }
}

impl DriverConfig {
    /// Reads `path`; a missing file yields defaults, a malformed one is an
    /// error. Environment overrides are applied on top.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = match std::fs::read_to_string(path) {
            Ok(text) => serde_json::from_str::<DriverConfig>(&text).map_err(|source| {
                ConfigError::Parse {
                    path: path.display().to_string(),
                    source,
                }
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => DriverConfig::default(),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.display().to_string(),
                    source,
                })
            }
        };
        config.apply_env(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the driver loop cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("tick_ms", self.tick_ms),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("reset_interval_ms", self.reset_interval_ms),
            ("combat_round_ms", self.combat_round_ms),
            ("hook_budget_ms", self.hook_budget_ms),
            ("callout_budget_ms", self.callout_budget_ms),
            ("max_callouts_per_tick", self.max_callouts_per_tick as u64),
            ("fault_streak_limit", u64::from(self.fault_streak_limit)),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    key,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        if !(0.0..=1.0).contains(&self.flee_chance) {
            return Err(ConfigError::Invalid {
                key: "flee_chance",
                reason: format!("{} is outside 0.0..=1.0", self.flee_chance),
            });
        }
        if self.console_addr.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "console_addr",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }

    /// Config path from `MUDRIVER_CONFIG`, else `driver.json`.
    pub fn default_path() -> PathBuf {
        std::env::var("MUDRIVER_CONFIG")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let text = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let num = |name: &str| text(name).and_then(|v| v.parse::<u64>().ok());

        if let Some(dir) = text("MUDRIVER_WORLD_DIR") {
            self.world_dir = PathBuf::from(dir);
        }
        if let Some(v) = num("MUDRIVER_TICK_MS") {
            self.tick_ms = v;
        }
        if let Some(v) = num("MUDRIVER_HOOK_BUDGET_MS") {
            self.hook_budget_ms = v;
        }
        if let Some(v) = num("MUDRIVER_CALLOUT_BUDGET_MS") {
            self.callout_budget_ms = v;
        }
        if let Some(v) = num("MUDRIVER_MAX_OPERATIONS") {
            self.max_operations = v;
        }
        if let Some(v) = num("MUDRIVER_RNG_SEED") {
            self.rng_seed = Some(v);
        }
        if let Some(addr) = text("MUDRIVER_CONSOLE_ADDR") {
            self.console_addr = addr;
        }
        if let Some(token) = text("MUDRIVER_CONSOLE_TOKEN") {
            self.console_token = Some(token);
        }
        if let Some(v) = num("MUDRIVER_CONSOLE_RATE_LIMIT_PER_SEC") {
            self.console_rate_limit_per_sec = v.clamp(1, 10_000) as u32;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = DriverConfig::load(&dir.path().join("absent.json")).expect("defaults");
        assert_eq!(config.tick_ms, DriverConfig::default().tick_ms);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("driver.json");
        std::fs::write(&path, r#"{"combat_round_ms": 500, "retaliate": false}"#).expect("write");
        let config = DriverConfig::load(&path).expect("parse");
        assert_eq!(config.combat_round_ms, 500);
        assert!(!config.retaliate);
        assert_eq!(config.hook_budget_ms, 10);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("driver.json");
        std::fs::write(&path, "{ nope").expect("write");
        assert!(matches!(
            DriverConfig::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("driver.json");
        std::fs::write(&path, r#"{"flee_chance": 1.5}"#).expect("write");
        assert!(matches!(
            DriverConfig::load(&path),
            Err(ConfigError::Invalid { key: "flee_chance", .. })
        ));

        std::fs::write(&path, r#"{"combat_round_ms": 0}"#).expect("write");
        assert!(matches!(
            DriverConfig::load(&path),
            Err(ConfigError::Invalid { key: "combat_round_ms", .. })
        ));
        assert!(DriverConfig::default().validate().is_ok());
    }

    #[test]
    fn env_overrides_apply_and_ignore_garbage() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("MUDRIVER_TICK_MS", "250"),
            ("MUDRIVER_HOOK_BUDGET_MS", "not-a-number"),
            ("MUDRIVER_CONSOLE_TOKEN", "  secret "),
            ("MUDRIVER_WORLD_DIR", "/srv/world"),
        ]);
        let mut config = DriverConfig::default();
        config.apply_env(|name| vars.get(name).map(|v| v.to_string()));
        assert_eq!(config.tick_ms, 250);
        assert_eq!(config.hook_budget_ms, 10);
        assert_eq!(config.console_token.as_deref(), Some("secret"));
        assert_eq!(config.world_dir, PathBuf::from("/srv/world"));
    }
}
