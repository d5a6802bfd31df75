//! Application state shared by the control loop and the reload handler.
//!
//! The configuration sits behind a [`RwLock`]. Readers take a snapshot at
//! the start of each cycle; [`AppState::reload`] and
//! [`AppState::record_weight`] are the only writers.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::{Config, ConfigError};
use crate::exporters::{self, ExportError, Exporter};

/// Errors from building or refreshing the state.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Failed to build exporters: {0}")]
    Export(#[from] ExportError),
}

/// Exporters resolved per user slug.
#[derive(Default, Clone)]
pub struct TargetCache {
    all: Vec<Arc<dyn Exporter>>,
    per_user: HashMap<String, Vec<Arc<dyn Exporter>>>,
}

impl TargetCache {
    /// Resolve each user's allow-list against `exporters`.
    pub fn new(config: &Config, exporters: Vec<Arc<dyn Exporter>>) -> Self {
        let per_user = config
            .users
            .iter()
            .map(|user| {
                let targets = exporters
                    .iter()
                    .filter(|e| user.allows(e.name()))
                    .cloned()
                    .collect();
                (user.slug.clone(), targets)
            })
            .collect();
        Self {
            all: exporters,
            per_user,
        }
    }

    /// Targets for `slug`; an unknown slug gets nothing.
    pub fn for_user(&self, slug: &str) -> Vec<Arc<dyn Exporter>> {
        self.per_user.get(slug).cloned().unwrap_or_default()
    }

    /// Every configured exporter.
    pub fn all(&self) -> &[Arc<dyn Exporter>] {
        &self.all
    }
}

impl std::fmt::Debug for TargetCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.all.iter().map(|e| e.name()).collect();
        f.debug_struct("TargetCache")
            .field("exporters", &names)
            .field("users", &self.per_user.len())
            .finish()
    }
}

/// Shared application state.
#[derive(Debug)]
pub struct AppState {
    /// Active configuration.
    pub config: RwLock<Config>,
    targets: RwLock<TargetCache>,
    config_path: Option<PathBuf>,
}

impl AppState {
    /// Build exporters for `config` and wrap everything up.
    ///
    /// With `config_path` set, reloads re-read that file and learned
    /// weights are written back to it.
    pub fn new(config: Config, config_path: Option<PathBuf>) -> Result<Arc<Self>, StateError> {
        let targets = TargetCache::new(&config, exporters::build(&config.exporters)?);
        Ok(Self::with_targets(config, targets, config_path))
    }

    /// State with pre-built targets.
    pub fn with_targets(
        config: Config,
        targets: TargetCache,
        config_path: Option<PathBuf>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config: RwLock::new(config),
            targets: RwLock::new(targets),
            config_path,
        })
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Copy of the active configuration.
    pub async fn snapshot(&self) -> Config {
        self.config.read().await.clone()
    }

    /// Exporters for the user with `slug`.
    pub async fn targets_for(&self, slug: &str) -> Vec<Arc<dyn Exporter>> {
        self.targets.read().await.for_user(slug)
    }

    /// Probe every exporter and log the outcome.
    pub async fn healthcheck(&self) {
        let exporters = self.targets.read().await.all().to_vec();
        for exporter in exporters {
            match exporter.healthcheck().await {
                Ok(()) => info!(exporter = exporter.name(), "Exporter healthy"),
                Err(e) => warn!(exporter = exporter.name(), error = %e, "Exporter healthcheck failed"),
            }
        }
    }

    /// Re-read and validate the configuration file and swap it in.
    ///
    /// On any error the previous configuration stays active.
    pub async fn reload(&self) -> Result<(), StateError> {
        let Some(path) = &self.config_path else {
            info!("No configuration file to reload");
            return Ok(());
        };
        let config = Config::load_validated(path)?;
        let targets = TargetCache::new(&config, exporters::build(&config.exporters)?);

        let mut active = self.config.write().await;
        let mut active_targets = self.targets.write().await;
        *active = config;
        *active_targets = targets;
        info!(path = %path.display(), users = active.users.len(), "Configuration reloaded");
        Ok(())
    }

    /// Remember `weight` as the user's last known weight, persisting it
    /// when the configuration came from a file.
    pub async fn record_weight(&self, slug: &str, weight: f64) -> Result<(), StateError> {
        let mut config = self.config.write().await;
        let Some(user) = config.user_mut(slug) else {
            debug!(slug, "User no longer configured; weight not recorded");
            return Ok(());
        };
        user.last_known_weight = Some((weight * 100.0).round() / 100.0);

        if let Some(path) = &self.config_path {
            config.save(path)?;
            debug!(slug, weight, path = %path.display(), "Last known weight saved");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{UserConfig, WebhookConfig};
    use crate::exporters::tests::StubExporter;
    use blescale_types::Gender;

    fn user(slug: &str, min: f64, max: f64, exporters: Option<Vec<&str>>) -> UserConfig {
        UserConfig {
            name: slug.to_uppercase(),
            slug: slug.into(),
            height: 170.0,
            birth_date: "1990-01-01".into(),
            gender: Gender::Female,
            athlete: false,
            min_weight: min,
            max_weight: max,
            last_known_weight: None,
            exporters: exporters.map(|list| list.into_iter().map(String::from).collect()),
        }
    }

    fn config() -> Config {
        Config {
            users: vec![
                user("dad", 75.0, 95.0, None),
                user("kid", 20.0, 40.0, Some(vec!["mqtt"])),
            ],
            ..Config::default()
        }
    }

    #[test]
    fn test_target_cache_follows_allow_lists() {
        let exporters: Vec<Arc<dyn Exporter>> =
            vec![StubExporter::new("webhook", true), StubExporter::new("mqtt", true)];
        let cache = TargetCache::new(&config(), exporters);

        let names = |slug: &str| -> Vec<&'static str> { cache.for_user(slug).iter().map(|e| e.name()).collect() };
        assert_eq!(names("dad"), vec!["webhook", "mqtt"]);
        assert_eq!(names("kid"), vec!["mqtt"]);
        assert!(names("nobody").is_empty());
        assert_eq!(cache.all().len(), 2);
    }

    #[tokio::test]
    async fn test_record_weight_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        config().save(&path).unwrap();

        let state = AppState::new(Config::load(&path).unwrap(), Some(path.clone())).unwrap();
        state.record_weight("dad", 82.456).await.unwrap();
        state.record_weight("ghost", 50.0).await.unwrap();

        assert_eq!(state.snapshot().await.users[0].last_known_weight, Some(82.46));
        let saved = Config::load(&path).unwrap();
        assert_eq!(saved.user("dad").unwrap().last_known_weight, Some(82.46));
        assert_eq!(saved.user("kid").unwrap().last_known_weight, None);
    }

    #[tokio::test]
    async fn test_record_weight_in_memory_only() {
        let state = AppState::new(config(), None).unwrap();
        state.record_weight("kid", 31.0).await.unwrap();
        assert_eq!(state.snapshot().await.user("kid").unwrap().last_known_weight, Some(31.0));
        assert!(state.config_path().is_none());
    }

    #[tokio::test]
    async fn test_reload_swaps_config_and_targets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        config().save(&path).unwrap();
        let state = AppState::new(Config::load(&path).unwrap(), Some(path.clone())).unwrap();
        assert!(state.targets_for("dad").await.is_empty());

        let mut updated = config();
        updated.users.push(user("mom", 55.0, 75.0, None));
        updated.exporters.webhook = Some(WebhookConfig::new("http://localhost:9/hook"));
        updated.save(&path).unwrap();

        state.reload().await.unwrap();
        assert_eq!(state.snapshot().await.users.len(), 3);
        assert_eq!(state.targets_for("mom").await.len(), 1);
        assert!(state.targets_for("kid").await.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_reload_keeps_previous_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        config().save(&path).unwrap();
        let state = AppState::new(Config::load(&path).unwrap(), Some(path.clone())).unwrap();

        let mut broken = config();
        broken.users[0].min_weight = 100.0;
        broken.save(&path).unwrap();

        let err = state.reload().await.unwrap_err();
        assert!(matches!(err, StateError::Config(ConfigError::Validation(_))));
        assert_eq!(state.snapshot().await.users[0].min_weight, 75.0);
    }
}
