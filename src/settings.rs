/// Router settings are read from a config file (JSON). When the file changes, the settings are
/// replaced wholesale and the model inventory is refreshed against them.
///
/// Requests read the settings through a [`SharedSettings`] snapshot, so a reload never shows a
/// request a mix of old and new values.
use crate::inventory::{ModelInventory, Tier, TierBoundaries};
use crate::scorer::ScoreThresholds;
use anyhow::{anyhow, bail};
use async_trait::async_trait;
use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use url::Url;

/// How the `models` and `excluded` lists restrict automatic routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterMode {
    /// Only models named in `models` are routed to.
    Allowlist,
    /// Every model except those in `excluded` is routed to.
    #[default]
    Blocklist,
}

/// Why the filter keeps a model out of automatic routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterExclusion {
    NotAllowlisted,
    Blocklisted,
}

/// The `models` section: either a flat list of ids, or ids grouped by tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ModelsSection {
    Flat(Vec<String>),
    Grouped(TierGroups),
}

/// Models pinned to a tier by hand. Keys are matched case-insensitively.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<String, Vec<String>>")]
pub struct TierGroups {
    pub small: Vec<String>,
    pub medium: Vec<String>,
    pub large: Vec<String>,
}

impl TryFrom<BTreeMap<String, Vec<String>>> for TierGroups {
    type Error = String;

    fn try_from(raw: BTreeMap<String, Vec<String>>) -> Result<Self, Self::Error> {
        let mut groups = TierGroups::default();
        for (key, ids) in raw {
            let tier: Tier = key.parse().map_err(|e| format!("models: {e}"))?;
            match tier {
                Tier::Small => groups.small.extend(ids),
                Tier::Medium => groups.medium.extend(ids),
                Tier::Large => groups.large.extend(ids),
            }
        }
        Ok(groups)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSection {
    #[serde(alias = "litellm_base_url")]
    pub base_url: String,
    #[serde(alias = "litellm_api_key")]
    pub api_key: Option<String>,
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:4000/v1".to_string(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// The virtual model clients address the router by.
    pub model_name: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            model_name: "smart-router".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingSection {
    pub heuristic_low_threshold: f64,
    pub heuristic_high_threshold: f64,
    /// Empty selects the smallest available model.
    pub classifier_model: String,
    pub classifier_timeout_secs: u64,
    pub model_cache_ttl: u64,
    pub prefer_coder: bool,
    pub explicit_bypasses_filter: bool,
    pub tier_boundaries: TierBoundaries,
}

impl Default for RoutingSection {
    fn default() -> Self {
        let thresholds = ScoreThresholds::default();
        Self {
            heuristic_low_threshold: thresholds.low,
            heuristic_high_threshold: thresholds.high,
            classifier_model: String::new(),
            classifier_timeout_secs: 15,
            model_cache_ttl: 300,
            prefer_coder: true,
            explicit_bypasses_filter: true,
            tier_boundaries: TierBoundaries::default(),
        }
    }
}

/// The config file as written on disk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub connection: ConnectionSection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub routing: RoutingSection,
    #[serde(default)]
    pub filter_mode: FilterMode,
    #[serde(default)]
    pub models: Option<ModelsSection>,
    #[serde(default)]
    pub excluded: Vec<String>,
}

/// A model named in the `models` section, with its manual tier if it was grouped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfiguredModel {
    pub id: String,
    pub tier: Option<Tier>,
}

/// The allow/blocklist, manual tiers and configured ordering, resolved from the config file.
#[derive(Debug, Clone, Default)]
pub struct ModelFilter {
    pub mode: FilterMode,
    pub models: Vec<ConfiguredModel>,
    excluded: HashSet<String>,
    index: HashMap<String, usize>,
}

impl ModelFilter {
    pub fn new(mode: FilterMode, section: Option<ModelsSection>, excluded: Vec<String>) -> Self {
        let models: Vec<ConfiguredModel> = match section {
            None => Vec::new(),
            Some(ModelsSection::Flat(ids)) => ids
                .into_iter()
                .map(|id| ConfiguredModel { id, tier: None })
                .collect(),
            Some(ModelsSection::Grouped(groups)) => [
                (Tier::Small, groups.small),
                (Tier::Medium, groups.medium),
                (Tier::Large, groups.large),
            ]
            .into_iter()
            .flat_map(|(tier, ids)| {
                ids.into_iter().map(move |id| ConfiguredModel {
                    id,
                    tier: Some(tier),
                })
            })
            .collect(),
        };

        let mut index = HashMap::with_capacity(models.len());
        for (position, model) in models.iter().enumerate() {
            // A model listed twice keeps its first position.
            index.entry(model.id.clone()).or_insert(position);
        }

        Self {
            mode,
            models,
            excluded: excluded.into_iter().collect(),
            index,
        }
    }

    /// Whether the filter keeps `id` out of automatic routing.
    pub fn check(&self, id: &str) -> Option<FilterExclusion> {
        match self.mode {
            FilterMode::Allowlist if !self.index.contains_key(id) => {
                Some(FilterExclusion::NotAllowlisted)
            }
            FilterMode::Blocklist if self.excluded.contains(id) => {
                Some(FilterExclusion::Blocklisted)
            }
            _ => None,
        }
    }

    /// The manual tier of `id`, if it was listed under a tier group.
    pub fn tier_override(&self, id: &str) -> Option<Tier> {
        self.index.get(id).and_then(|&i| self.models[i].tier)
    }

    /// Position of `id` in the configured `models` list.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }
}

/// Validated, resolved router settings.
#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub base_url: Url,
    pub api_key: Option<String>,
    pub model_name: String,
    pub thresholds: ScoreThresholds,
    pub classifier_model: Option<String>,
    pub classifier_timeout: Duration,
    pub model_cache_ttl: Duration,
    pub prefer_coder: bool,
    pub explicit_bypasses_filter: bool,
    pub boundaries: TierBoundaries,
    pub model_filter: ModelFilter,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self::from_config(ConfigFile::default()).expect("default config is valid")
    }
}

impl RouterSettings {
    pub fn from_config(config: ConfigFile) -> Result<Self, anyhow::Error> {
        let ConfigFile {
            connection,
            server,
            routing,
            filter_mode,
            models,
            excluded,
        } = config;

        let base_url: Url = connection
            .base_url
            .parse()
            .map_err(|e| anyhow!("Invalid connection.base_url '{}': {}", connection.base_url, e))?;

        let thresholds = ScoreThresholds {
            low: routing.heuristic_low_threshold,
            high: routing.heuristic_high_threshold,
        };
        let in_range = |v: f64| (0.0..=1.0).contains(&v);
        if !in_range(thresholds.low) || !in_range(thresholds.high) {
            bail!(
                "Heuristic thresholds must be within [0, 1], got {} and {}",
                thresholds.low,
                thresholds.high
            );
        }
        if thresholds.low >= thresholds.high {
            bail!(
                "heuristic_low_threshold ({}) must be below heuristic_high_threshold ({})",
                thresholds.low,
                thresholds.high
            );
        }

        let boundaries = routing.tier_boundaries;
        if !(boundaries.small_max > 0.0 && boundaries.small_max < boundaries.medium_max) {
            bail!(
                "Tier boundaries must satisfy 0 < small_max < medium_max, got {} and {}",
                boundaries.small_max,
                boundaries.medium_max
            );
        }

        if routing.classifier_timeout_secs == 0 {
            bail!("classifier_timeout_secs must be greater than 0");
        }

        let model_name = server.model_name.trim().to_string();
        if model_name.is_empty() {
            bail!("server.model_name must not be empty");
        }

        let model_filter = ModelFilter::new(filter_mode, models, excluded);
        if model_filter.mode == FilterMode::Allowlist && model_filter.models.is_empty() {
            warn!("Allowlist mode with no models configured, no model will be routed to");
        }

        let classifier_model = Some(routing.classifier_model.trim().to_string())
            .filter(|m| !m.is_empty());

        Ok(Self {
            base_url,
            api_key: connection.api_key.filter(|k| !k.is_empty()),
            model_name,
            thresholds,
            classifier_model,
            classifier_timeout: Duration::from_secs(routing.classifier_timeout_secs),
            model_cache_ttl: Duration::from_secs(routing.model_cache_ttl),
            prefer_coder: routing.prefer_coder,
            explicit_bypasses_filter: routing.explicit_bypasses_filter,
            boundaries,
            model_filter,
        })
    }

    pub async fn from_file(config_path: &Path) -> Result<Self, anyhow::Error> {
        let contents = tokio::fs::read_to_string(config_path).await.map_err(|e| {
            anyhow!(
                "Failed to read config file {}: {}",
                config_path.display(),
                e
            )
        })?;

        let config_file: ConfigFile = serde_json::from_str(&contents).map_err(|e| {
            anyhow!(
                "Failed to parse config file {}: {}",
                config_path.display(),
                e
            )
        })?;

        let settings = Self::from_config(config_file)
            .map_err(|e| anyhow!("Invalid config file {}: {}", config_path.display(), e))?;

        info!(
            path = %config_path.display(),
            backend = %settings.base_url,
            model_name = %settings.model_name,
            filter_mode = ?settings.model_filter.mode,
            configured_models = settings.model_filter.models.len(),
            "Loaded settings"
        );
        Ok(settings)
    }
}

/// The live settings. Cheap to clone; all clones share one published snapshot.
#[derive(Debug, Clone)]
pub struct SharedSettings {
    current: Arc<watch::Sender<Arc<RouterSettings>>>,
}

impl SharedSettings {
    pub fn new(settings: RouterSettings) -> Self {
        let (current, _) = watch::channel(Arc::new(settings));
        Self {
            current: Arc::new(current),
        }
    }

    pub fn current(&self) -> Arc<RouterSettings> {
        self.current.borrow().clone()
    }

    pub fn replace(&self, settings: RouterSettings) {
        self.current.send_replace(Arc::new(settings));
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<RouterSettings>> {
        self.current.subscribe()
    }

    /// Apply settings from `stream` as they arrive, refreshing `inventory` after each one.
    /// Invalid updates are logged and the previous settings stay active.
    pub async fn receive_updates<W: SettingsStream + Send + 'static>(
        &self,
        settings_stream: W,
        inventory: ModelInventory,
    ) -> Result<(), anyhow::Error> {
        let shared = self.clone();
        let mut rx = settings_stream.receive().await?;

        tokio::spawn(async move {
            while let Some(result) = rx.recv().await {
                match result {
                    Ok(settings) => {
                        info!("Config file changed, applying new settings");
                        shared.replace(settings);
                        // Failures are logged inside; the previous inventory stays published.
                        let _ = inventory.refresh().await;
                    }
                    Err(e) => {
                        error!("Failed to reload config: {}", e);
                    }
                }
            }
            debug!("Settings stream closed");
        });

        Ok(())
    }
}

#[async_trait]
pub trait SettingsStream {
    async fn receive(
        &self,
    ) -> Result<mpsc::Receiver<Result<RouterSettings, anyhow::Error>>, anyhow::Error>;
}

pub struct WatchedFile(pub PathBuf);

#[async_trait]
impl SettingsStream for WatchedFile {
    /// Watches the config file and yields freshly parsed settings on every modification.
    async fn receive(
        &self,
    ) -> Result<mpsc::Receiver<Result<RouterSettings, anyhow::Error>>, anyhow::Error> {
        let (settings_tx, settings_rx) = mpsc::channel(100);
        let (file_tx, mut file_rx) = mpsc::channel(100);

        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = file_tx.blocking_send(res);
            },
            NotifyConfig::default(),
        )?;

        watcher.watch(&self.0, RecursiveMode::NonRecursive)?;

        let config_path = self.0.clone();
        tokio::spawn(async move {
            // Dropping the watcher stops the notifications.
            let _watcher = watcher;
            while let Some(res) = file_rx.recv().await {
                let update = match res {
                    Ok(event) if event.kind.is_modify() => {
                        info!("Config file changed, reloading settings...");
                        RouterSettings::from_file(&config_path).await
                    }
                    Ok(_) => continue,
                    Err(e) => Err(anyhow!("Watch error: {}", e)),
                };
                if settings_tx.send(update).await.is_err() {
                    break; // Receiver dropped
                }
            }
        });

        Ok(settings_rx)
    }
}
