//! The model inventory: which models exist, what tier each belongs to, and which one serves a
//! tier.
//!
//! The inventory is published as an immutable [`InventorySnapshot`]. A refresh builds a complete
//! new snapshot from the discovery source and swaps it in; requests hold on to the snapshot they
//! started with, so a refresh never shows them a half-built model list.
use crate::errors::BackendError;
use crate::params::{self, ParamCount, ParamParseError};
use crate::settings::{FilterExclusion, RouterSettings, SharedSettings};
use async_trait::async_trait;
use bon::Builder;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard, watch};
use tracing::{debug, error, info, warn};

/// A coarse capability bucket. Ordered `Small < Medium < Large`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Tier {
    Small,
    Medium,
    Large,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Small, Tier::Medium, Tier::Large];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Small => "SMALL",
            Tier::Medium => "MEDIUM",
            Tier::Large => "LARGE",
        }
    }

    /// The order in which tiers are searched when this tier is requested: the tier itself, then
    /// every larger tier going up, then every smaller tier going down.
    pub fn search_order(self) -> Vec<Tier> {
        let mut order = vec![self];
        order.extend(Tier::ALL.into_iter().filter(|t| *t > self));
        order.extend(Tier::ALL.into_iter().rev().filter(|t| *t < self));
        order
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown tier '{0}'")]
pub struct UnknownTier(pub String);

impl FromStr for Tier {
    type Err = UnknownTier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "small" => Ok(Tier::Small),
            "medium" => Ok(Tier::Medium),
            "large" => Ok(Tier::Large),
            _ => Err(UnknownTier(s.to_string())),
        }
    }
}

/// Upper bounds (inclusive, billions of parameters) of the automatically assigned tiers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierBoundaries {
    #[serde(default = "default_small_max")]
    pub small_max: f64,
    #[serde(default = "default_medium_max")]
    pub medium_max: f64,
}

fn default_small_max() -> f64 {
    8.0
}

fn default_medium_max() -> f64 {
    27.0
}

impl Default for TierBoundaries {
    fn default() -> Self {
        Self {
            small_max: default_small_max(),
            medium_max: default_medium_max(),
        }
    }
}

impl TierBoundaries {
    /// Tiers are assigned from total parameters, never from MoE active parameters.
    pub fn tier_for(&self, total_params: f64) -> Tier {
        if total_params <= self.small_max {
            Tier::Small
        } else if total_params <= self.medium_max {
            Tier::Medium
        } else {
            Tier::Large
        }
    }
}

/// A model known to the inventory, with its tier.
#[derive(Debug, Clone, PartialEq, Builder)]
pub struct ModelInfo {
    #[builder(into)]
    pub id: String,
    /// `None` for models tiered by hand whose names carry no size.
    pub params: Option<ParamCount>,
    pub tier: Tier,
    #[builder(default)]
    pub is_coder: bool,
    /// Set when the allow/blocklist keeps this model out of automatic routing.
    pub excluded: Option<FilterExclusion>,
}

impl ModelInfo {
    pub fn is_retained(&self) -> bool {
        self.excluded.is_none()
    }

    pub fn total_params(&self) -> Option<f64> {
        self.params.map(|p| p.total)
    }
}

/// Why a discovered model never made it to a tier.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Rejection {
    #[error("non-text modality ({0})")]
    NonText(&'static str),

    #[error(transparent)]
    Unparsable(#[from] ParamParseError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RejectedModel {
    pub id: String,
    pub reason: Rejection,
}

/// A model as reported by the discovery source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredModel {
    pub id: String,
    /// The name the size is parsed from. Backends that only report ids use the id.
    pub name: String,
}

impl DiscoveredModel {
    pub fn from_id(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
        }
    }
}

/// Lists the models the backend currently serves.
#[async_trait]
pub trait ModelSource: Send + Sync + fmt::Debug {
    async fn list_models(&self) -> Result<Vec<DiscoveredModel>, BackendError>;
}

/// An immutable, point-in-time view of the inventory.
#[derive(Debug, Clone, Default)]
pub struct InventorySnapshot {
    /// The refresh attempt that produced this snapshot; 0 before the first one.
    pub generation: u64,
    /// `None` until the first successful refresh.
    pub refreshed_at: Option<Instant>,
    /// Inventory order: configured-list order first, then discovery order.
    pub entries: Vec<ModelInfo>,
    pub rejected: Vec<RejectedModel>,
    /// The settings the snapshot was built with.
    pub settings: Option<Arc<RouterSettings>>,
}

impl InventorySnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a snapshot by tiering and filtering discovered models.
    pub fn build(
        discovered: &[DiscoveredModel],
        settings: &Arc<RouterSettings>,
        generation: u64,
        refreshed_at: Instant,
    ) -> Self {
        let filter = &settings.model_filter;
        let mut entries = Vec::with_capacity(discovered.len());
        let mut rejected = Vec::new();

        for model in discovered {
            if let Some(marker) = params::non_text_marker(&model.name) {
                debug!(model = %model.id, marker, "Skipping non-text model");
                rejected.push(RejectedModel {
                    id: model.id.clone(),
                    reason: Rejection::NonText(marker),
                });
                continue;
            }

            let parsed = params::parse_param_count(&model.name);
            let (tier, params) = match (filter.tier_override(&model.id), parsed) {
                (Some(tier), parsed) => (tier, parsed.ok()),
                (None, Ok(params)) => (settings.boundaries.tier_for(params.total), Some(params)),
                (None, Err(e)) => {
                    warn!(model = %model.id, error = %e, "Excluding model with unknown size");
                    rejected.push(RejectedModel {
                        id: model.id.clone(),
                        reason: e.into(),
                    });
                    continue;
                }
            };

            let info = ModelInfo {
                id: model.id.clone(),
                params,
                tier,
                is_coder: params::is_coder_name(&model.name),
                excluded: filter.check(&model.id),
            };
            debug!(
                model = %info.id,
                total_params = ?info.params.map(|p| p.total),
                moe = info.params.is_some_and(|p| p.is_moe()),
                tier = %info.tier,
                coder = info.is_coder,
                excluded = ?info.excluded,
                "Tiered model"
            );
            entries.push(info);
        }

        // Stable: unlisted models keep discovery order behind the listed ones.
        entries.sort_by_key(|m| filter.position(&m.id).unwrap_or(usize::MAX));

        Self {
            generation,
            refreshed_at: Some(refreshed_at),
            entries,
            rejected,
            settings: Some(Arc::clone(settings)),
        }
    }

    /// Models available for automatic routing, in inventory order.
    pub fn retained(&self) -> impl Iterator<Item = &ModelInfo> {
        self.entries.iter().filter(|m| m.is_retained())
    }

    pub fn len(&self) -> usize {
        self.retained().count()
    }

    pub fn is_empty(&self) -> bool {
        self.retained().next().is_none()
    }

    /// Look up any tiered model by id, including filtered ones.
    pub fn get(&self, id: &str) -> Option<&ModelInfo> {
        self.entries.iter().find(|m| m.id == id)
    }

    /// Whether `id` is a text model that was left out only because its size is unknown.
    pub fn is_unsized(&self, id: &str) -> bool {
        self.rejected
            .iter()
            .any(|r| r.id == id && matches!(r.reason, Rejection::Unparsable(_)))
    }

    pub fn by_tier(&self, tier: Tier) -> Vec<&ModelInfo> {
        self.retained().filter(|m| m.tier == tier).collect()
    }

    /// Pick the model that serves `tier`.
    ///
    /// Within the first non-empty tier of [`Tier::search_order`], the first model whose coder
    /// role matches `prefer_coder` wins; failing that, the first model of the tier. Returns
    /// `None` only when no model is retained at all.
    pub fn best_model(&self, tier: Tier, prefer_coder: bool) -> Option<&ModelInfo> {
        tier.search_order().into_iter().find_map(|t| {
            let candidates = self.by_tier(t);
            candidates
                .iter()
                .find(|m| m.is_coder == prefer_coder)
                .or(candidates.first())
                .copied()
        })
    }

    /// The retained model with the fewest total parameters. Models of unknown size are only
    /// considered when no sized model exists.
    pub fn smallest_model(&self) -> Option<&ModelInfo> {
        self.retained()
            .filter_map(|m| m.total_params().map(|total| (total, m)))
            .min_by(|(a, _), (b, _)| a.total_cmp(b))
            .map(|(_, m)| m)
            .or_else(|| self.retained().next())
    }

    pub fn is_stale(&self, ttl: Duration) -> bool {
        self.refreshed_at.is_none_or(|at| at.elapsed() >= ttl)
    }

    pub fn models_by_tier(&self) -> BTreeMap<Tier, Vec<String>> {
        Tier::ALL
            .into_iter()
            .map(|tier| {
                let ids = self.by_tier(tier).into_iter().map(|m| m.id.clone()).collect();
                (tier, ids)
            })
            .collect()
    }
}

/// The live inventory. Cheap to clone; all clones share one published snapshot.
#[derive(Debug, Clone)]
pub struct ModelInventory {
    source: Arc<dyn ModelSource>,
    settings: SharedSettings,
    current: Arc<watch::Sender<Arc<InventorySnapshot>>>,
    refresh_lock: Arc<Mutex<()>>,
    /// Refresh attempts started so far, failed ones included.
    started: Arc<AtomicU64>,
    /// The last refresh attempt that ran to completion, successful or not.
    finished: Arc<AtomicU64>,
    last_failure: Arc<std::sync::Mutex<Option<FailedRefresh>>>,
}

/// A refresh that ended in an error, kept so waiters can share its outcome.
#[derive(Debug)]
struct FailedRefresh {
    generation: u64,
    settings: Arc<RouterSettings>,
    error: BackendError,
}

impl ModelInventory {
    pub fn new(source: Arc<dyn ModelSource>, settings: SharedSettings) -> Self {
        let (current, _) = watch::channel(Arc::new(InventorySnapshot::empty()));
        Self {
            source,
            settings,
            current: Arc::new(current),
            refresh_lock: Arc::new(Mutex::new(())),
            started: Arc::new(AtomicU64::new(0)),
            finished: Arc::new(AtomicU64::new(0)),
            last_failure: Arc::new(std::sync::Mutex::new(None)),
        }
    }

    /// The currently published snapshot.
    pub fn snapshot(&self) -> Arc<InventorySnapshot> {
        self.current.borrow().clone()
    }

    /// Subscribe to snapshot publications.
    pub fn subscribe(&self) -> watch::Receiver<Arc<InventorySnapshot>> {
        self.current.subscribe()
    }

    /// The snapshot a request should route with. A never-populated inventory is refreshed
    /// inline; a stale one is refreshed in the background while the old snapshot is served.
    pub async fn snapshot_or_refresh(&self) -> Arc<InventorySnapshot> {
        let snapshot = self.snapshot();
        if snapshot.refreshed_at.is_none() {
            return match self.refresh().await {
                Ok(fresh) => fresh,
                Err(_) => self.snapshot(),
            };
        }
        if snapshot.is_stale(self.settings.current().model_cache_ttl) {
            self.trigger_refresh();
        }
        snapshot
    }

    /// Start a background refresh unless one is already running. Returns whether one started.
    pub fn trigger_refresh(&self) -> bool {
        match Arc::clone(&self.refresh_lock).try_lock_owned() {
            Ok(guard) => {
                let inventory = self.clone();
                let generation = self.next_generation();
                let settings = self.settings.current();
                tokio::spawn(async move {
                    // Failures are logged inside; the previous snapshot stays published.
                    let _ = inventory.refresh_locked(guard, generation, settings).await;
                });
                true
            }
            Err(_) => {
                debug!("Model refresh already in flight");
                false
            }
        }
    }

    /// Refresh now.
    ///
    /// A refresh already in flight when this is called is joined: once it completes, its
    /// snapshot (or its error) is returned instead of querying the backend again. It is only
    /// joined if it ran with the settings that are current at the time of this call.
    pub async fn refresh(&self) -> Result<Arc<InventorySnapshot>, BackendError> {
        let finished = self.finished.load(Ordering::SeqCst);
        let started = self.started.load(Ordering::SeqCst);
        let settings = self.settings.current();
        let joinable = if started > finished {
            started
        } else {
            started + 1
        };

        let guard = Arc::clone(&self.refresh_lock).lock_owned().await;

        let current = self.snapshot();
        let same_settings = current
            .settings
            .as_ref()
            .is_some_and(|built_with| Arc::ptr_eq(built_with, &settings));
        if current.generation >= joinable && same_settings {
            debug!(
                generation = current.generation,
                "Joined concurrent model refresh"
            );
            return Ok(current);
        }
        if let Some(error) = self.failure_since(joinable, &settings) {
            debug!(error = %error, "Joined failed model refresh");
            return Err(error);
        }

        let generation = self.next_generation();
        self.refresh_locked(guard, generation, self.settings.current())
            .await
    }

    fn failure_since(&self, generation: u64, settings: &Arc<RouterSettings>) -> Option<BackendError> {
        let last_failure = self.last_failure.lock().ok()?;
        last_failure
            .as_ref()
            .filter(|f| f.generation >= generation && Arc::ptr_eq(&f.settings, settings))
            .map(|f| f.error.clone())
    }

    /// Must be called with the refresh lock held.
    fn next_generation(&self) -> u64 {
        self.started.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn refresh_locked(
        &self,
        _guard: OwnedMutexGuard<()>,
        generation: u64,
        settings: Arc<RouterSettings>,
    ) -> Result<Arc<InventorySnapshot>, BackendError> {
        let result = self.discover(generation, Arc::clone(&settings)).await;
        if let Err(error) = &result {
            if let Ok(mut last_failure) = self.last_failure.lock() {
                *last_failure = Some(FailedRefresh {
                    generation,
                    settings,
                    error: error.clone(),
                });
            }
        }
        self.finished.fetch_max(generation, Ordering::SeqCst);
        result
    }

    async fn discover(
        &self,
        generation: u64,
        settings: Arc<RouterSettings>,
    ) -> Result<Arc<InventorySnapshot>, BackendError> {
        let discovered = match self.source.list_models().await {
            Ok(discovered) => discovered,
            Err(e) => {
                error!(error = %e, "Failed to refresh models, keeping previous inventory");
                return Err(e);
            }
        };

        let snapshot = Arc::new(InventorySnapshot::build(
            &discovered,
            &settings,
            generation,
            Instant::now(),
        ));

        let filtered = snapshot.entries.len() - snapshot.len();
        if filtered > 0 {
            info!(count = filtered, "Models filtered out by configuration");
        }
        info!(
            generation,
            total = snapshot.len(),
            small = snapshot.by_tier(Tier::Small).len(),
            medium = snapshot.by_tier(Tier::Medium).len(),
            large = snapshot.by_tier(Tier::Large).len(),
            rejected = snapshot.rejected.len(),
            "Active models"
        );

        self.current.send_replace(Arc::clone(&snapshot));
        Ok(snapshot)
    }
}
