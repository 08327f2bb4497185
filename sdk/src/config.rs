//! Thing configuration, read with the `config` crate
//!
//! ```toml
//! [thing]
//! product-id = "prod"
//! thing-id = "dev-1"
//!
//! [executor]
//! workers = 4
//!
//! [call]
//! timeout-ms = 5000
//! ```
use crate::call::{CallOption, DEFAULT_CALL_TIMEOUT};
use crate::error::{OpError, OpResult};
use crate::path::ThingPath;
use crate::worker_pool::DEFAULT_WORKERS;
use config::{Config, FileFormat};

/// Settings needed to assemble one thing
#[derive(Debug, Clone, PartialEq)]
pub struct ThingConfig {
    pub path: ThingPath,
    pub workers: usize,
    pub call_option: CallOption,
}

impl ThingConfig {
    /// Read from a loaded config - the thing identity is required, the rest defaults
    pub fn from_config(config: &Config) -> OpResult<Self> {
        let thing = get_sub_config(config, "thing");
        let product_id = thing.get_string("product-id")
            .map_err(|e| OpError::Config(format!("thing.product-id: {e}")))?;
        let thing_id = thing.get_string("thing-id")
            .map_err(|e| OpError::Config(format!("thing.thing-id: {e}")))?;

        let workers = config.get_int("executor.workers")
            .ok()
            .and_then(|workers| usize::try_from(workers).ok())
            .filter(|workers| *workers > 0)
            .unwrap_or(DEFAULT_WORKERS);

        let call_option = match config.get::<u64>("call.timeout-ms") {
            Ok(timeout_ms) => CallOption::timeout_ms(timeout_ms),
            Err(_) => CallOption { timeout: DEFAULT_CALL_TIMEOUT },
        };

        Ok(Self {
            path: ThingPath::new(product_id, thing_id),
            workers,
            call_option,
        })
    }
}

/// Extract a sub-config as a new Config object
/// Defaults to an empty Config if the path does not exist.
pub fn get_sub_config(config: &Config, path: &str) -> Config {
    match config.get_table(path) {
        Ok(table) => {
            let mut builder = Config::builder();
            for (key, value) in table {
                builder = match builder.set_override(key, value) {
                    Ok(builder) => builder,
                    Err(_) => return Config::default(),
                };
            }
            builder.build().unwrap_or_default()
        }
        Err(_) => Config::default(),
    }
}

/// Parse a TOML string into a Config
pub fn config_from_toml(toml: &str) -> OpResult<Config> {
    Config::builder()
        .add_source(config::File::from_str(toml, FileFormat::Toml))
        .build()
        .map_err(|e| OpError::Config(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn reads_full_config() {
        let config = config_from_toml(
            r#"
            [thing]
            product-id = "prod"
            thing-id = "dev-1"

            [executor]
            workers = 8

            [call]
            timeout-ms = 2000
            "#,
        )
        .unwrap();

        let thing = ThingConfig::from_config(&config).unwrap();
        assert_eq!(thing.path, ThingPath::new("prod", "dev-1"));
        assert_eq!(thing.workers, 8);
        assert_eq!(thing.call_option.timeout, Duration::from_millis(2000));
    }

    #[test]
    fn defaults_apply_when_optional_sections_missing() {
        let config = config_from_toml("[thing]\nproduct-id = \"p\"\nthing-id = \"t\"").unwrap();
        let thing = ThingConfig::from_config(&config).unwrap();
        assert_eq!(thing.workers, DEFAULT_WORKERS);
        assert_eq!(thing.call_option, CallOption::default());
    }

    #[test]
    fn non_positive_workers_fall_back_to_default() {
        let config = config_from_toml(
            "[thing]\nproduct-id = \"p\"\nthing-id = \"t\"\n[executor]\nworkers = -3",
        )
        .unwrap();
        assert_eq!(ThingConfig::from_config(&config).unwrap().workers, DEFAULT_WORKERS);
    }

    #[test]
    fn missing_identity_is_an_error() {
        let config = config_from_toml("[thing]\nproduct-id = \"p\"").unwrap();
        let err = ThingConfig::from_config(&config).unwrap_err();
        assert!(err.to_string().contains("thing.thing-id"));
    }

    #[test]
    fn get_sub_config_returns_empty_for_missing_path() {
        let config = config_from_toml("[other]\nkey = \"value\"").unwrap();
        let sub = get_sub_config(&config, "nonexistent");
        assert!(sub.get_string("anything").is_err());
    }
}
