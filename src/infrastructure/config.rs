//! Configuration loading with hierarchical merging.

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;

use crate::domain::models::CoordinatorConfig;

/// Configuration loader.
///
/// Precedence (lowest to highest):
/// 1. Programmatic defaults
/// 2. `.zagara/config.yaml` (optional, project-local)
/// 3. Environment variables (`ZAGARA_` prefix, `__` separator)
pub struct ConfigLoader;

impl ConfigLoader {
    pub fn load() -> Result<CoordinatorConfig> {
        let config: CoordinatorConfig = Figment::new()
            .merge(Serialized::defaults(CoordinatorConfig::default()))
            .merge(Yaml::file(".zagara/config.yaml"))
            .merge(Env::prefixed("ZAGARA_").split("__"))
            .extract()
            .context("Failed to extract configuration from figment")?;

        config.validate()?;
        Ok(config)
    }

    /// Load from a specific file, for tests and embedding callers.
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<CoordinatorConfig> {
        let config: CoordinatorConfig = Figment::new()
            .merge(Serialized::defaults(CoordinatorConfig::default()))
            .merge(Yaml::file(path.as_ref()))
            .extract()
            .with_context(|| {
                format!("Failed to load config from {}", path.as_ref().display())
            })?;

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn yaml_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "key_prefix: brood").unwrap();
        writeln!(file, "dispatch_batch: 25").unwrap();

        let config = ConfigLoader::load_from_file(&path).unwrap();
        assert_eq!(config.key_prefix, "brood");
        assert_eq!(config.dispatch_batch, 25);
        // untouched fields keep their defaults
        assert_eq!(config.leader_ttl_secs, 30);
    }

    #[test]
    fn invalid_timing_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "heartbeat_interval_secs: 30").unwrap();
        writeln!(file, "interrupt_threshold_secs: 60").unwrap();

        assert!(ConfigLoader::load_from_file(&path).is_err());
    }
}
