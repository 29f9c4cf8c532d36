//! autoscaler.toml configuration parser.
//!
//! Every table is optional and falls back to defaults. Durations are
//! written as strings (`"10s"`, `"5m"`, `"500ms"`, `"3h"`).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AutoscalerError, AutoscalerResult};
use crate::types::{RESOURCE_CPU, RESOURCE_MEMORY};

const GIB: i64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoscalingOptions {
    #[serde(with = "duration_str")]
    pub scan_interval: Duration,
    /// Cluster-wide node ceiling; 0 disables it.
    pub max_nodes_total: u32,
    /// Cluster-wide cores bounds.
    pub cores_total: MinMax,
    /// Cluster-wide memory bounds in GiB.
    pub memory_total: MinMax,
    pub gpu_total: Vec<GpuLimit>,
    /// Node label that marks GPU nodes whose device plugin has not yet
    /// published capacity.
    pub gpu_label: String,
    pub expander: ExpanderKind,
    /// Used by the `priority` expander; higher wins.
    pub node_group_priorities: BTreeMap<String, i32>,
    pub scale_up: ScaleUpOptions,
    pub scale_down: ScaleDownOptions,
    /// Presence enables the webhook decision source.
    pub webhook: Option<WebhookOptions>,
}

impl Default for AutoscalingOptions {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(10),
            max_nodes_total: 0,
            cores_total: MinMax { min: 0, max: 320_000 },
            memory_total: MinMax { min: 0, max: 6_400_000 },
            gpu_total: Vec::new(),
            gpu_label: "fleetscale.io/accelerator".to_string(),
            expander: ExpanderKind::LeastWaste,
            node_group_priorities: BTreeMap::new(),
            scale_up: ScaleUpOptions::default(),
            scale_down: ScaleDownOptions::default(),
            webhook: None,
        }
    }
}

/// Inclusive bounds; a `max` of 0 means unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinMax {
    pub min: u64,
    pub max: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuLimit {
    pub resource: String,
    pub min: u64,
    pub max: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExpanderKind {
    #[default]
    LeastWaste,
    MostPods,
    Priority,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScaleUpOptions {
    pub enabled: bool,
    /// Pods younger than this are not considered.
    #[serde(with = "duration_str")]
    pub new_pod_scale_up_delay: Duration,
    /// Same, for pods requesting GPUs.
    #[serde(with = "duration_str")]
    pub gpu_pod_scale_up_delay: Duration,
    /// Upper bound on nodes added in one tick.
    pub max_bulk_scale_up_count: u32,
    pub balance_similar_node_groups: bool,
    /// Free-capacity ratio below which a scale-up is considered even with
    /// no pending pods. 0 disables it.
    pub buffer_ratio: f64,
    #[serde(with = "duration_str")]
    pub initial_backoff: Duration,
    #[serde(with = "duration_str")]
    pub max_backoff: Duration,
    #[serde(with = "duration_str")]
    pub backoff_reset_timeout: Duration,
    /// Requested nodes not registered within this window stop counting
    /// as upcoming and back the group off.
    #[serde(with = "duration_str")]
    pub max_node_provision_time: Duration,
    pub max_total_unready_percentage: f64,
    pub ok_total_unready_count: u32,
}

impl Default for ScaleUpOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            new_pod_scale_up_delay: Duration::ZERO,
            gpu_pod_scale_up_delay: Duration::ZERO,
            max_bulk_scale_up_count: 1000,
            balance_similar_node_groups: false,
            buffer_ratio: 0.0,
            initial_backoff: Duration::from_secs(5 * 60),
            max_backoff: Duration::from_secs(30 * 60),
            backoff_reset_timeout: Duration::from_secs(3 * 3600),
            max_node_provision_time: Duration::from_secs(15 * 60),
            max_total_unready_percentage: 45.0,
            ok_total_unready_count: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScaleDownOptions {
    pub enabled: bool,
    pub utilization_threshold: f64,
    pub gpu_utilization_threshold: f64,
    /// How long a ready node must stay unneeded before removal.
    #[serde(with = "duration_str")]
    pub unneeded_time: Duration,
    /// How long an unready node must stay unneeded before removal.
    #[serde(with = "duration_str")]
    pub unready_time: Duration,
    #[serde(with = "duration_str")]
    pub delay_after_add: Duration,
    #[serde(with = "duration_str")]
    pub delay_after_failure: Duration,
    #[serde(with = "duration_str")]
    pub unremovable_recheck_timeout: Duration,
    pub max_empty_bulk_delete: usize,
    pub non_empty_candidates_count: usize,
    pub candidates_pool_ratio: f64,
    pub candidates_pool_min_count: usize,
    #[serde(with = "duration_str")]
    pub max_graceful_termination: Duration,
    #[serde(with = "duration_str")]
    pub max_pod_eviction_time: Duration,
    #[serde(with = "duration_str")]
    pub eviction_retry_interval: Duration,
    /// Extra wait beyond the grace period for evicted pods to disappear.
    #[serde(with = "duration_str")]
    pub pod_eviction_headroom: Duration,
    #[serde(with = "duration_str")]
    pub drain_poll_interval: Duration,
    pub daemonset_eviction_for_empty_nodes: bool,
    #[serde(with = "duration_str")]
    pub daemonset_eviction_timeout: Duration,
    pub ignore_daemonsets_utilization: bool,
    pub skip_nodes_with_local_storage: bool,
    pub max_soft_taint_count: usize,
    /// Upper bound on waiting for delay-deletion annotations to clear.
    #[serde(with = "duration_str")]
    pub max_delay_deletion_wait: Duration,
}

impl Default for ScaleDownOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            utilization_threshold: 0.5,
            gpu_utilization_threshold: 0.5,
            unneeded_time: Duration::from_secs(10 * 60),
            unready_time: Duration::from_secs(20 * 60),
            delay_after_add: Duration::from_secs(10 * 60),
            delay_after_failure: Duration::from_secs(3 * 60),
            unremovable_recheck_timeout: Duration::from_secs(5 * 60),
            max_empty_bulk_delete: 10,
            non_empty_candidates_count: 30,
            candidates_pool_ratio: 0.1,
            candidates_pool_min_count: 50,
            max_graceful_termination: Duration::from_secs(10 * 60),
            max_pod_eviction_time: Duration::from_secs(2 * 60),
            eviction_retry_interval: Duration::from_secs(10),
            pod_eviction_headroom: Duration::from_secs(30),
            drain_poll_interval: Duration::from_secs(5),
            daemonset_eviction_for_empty_nodes: false,
            daemonset_eviction_timeout: Duration::from_secs(20),
            ignore_daemonsets_utilization: false,
            skip_nodes_with_local_storage: true,
            max_soft_taint_count: 10,
            max_delay_deletion_wait: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookMode {
    #[default]
    Http,
    Mailbox,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookOptions {
    pub mode: WebhookMode,
    pub url: Option<String>,
    pub mailbox_path: Option<PathBuf>,
    #[serde(with = "duration_str")]
    pub timeout: Duration,
    /// Cordoned nodes younger than this are still joining and are never
    /// offered for scale-down.
    #[serde(with = "duration_str")]
    pub initializing_grace: Duration,
    /// Node group id → priority; higher fills first.
    pub priorities: BTreeMap<String, i32>,
}

impl Default for WebhookOptions {
    fn default() -> Self {
        Self {
            mode: WebhookMode::Http,
            url: None,
            mailbox_path: None,
            timeout: Duration::from_secs(10),
            initializing_grace: Duration::from_secs(5 * 60),
            priorities: BTreeMap::new(),
        }
    }
}

/// Per-resource cluster-wide bounds, in the units of `ResourceList`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    min: BTreeMap<String, i64>,
    max: BTreeMap<String, i64>,
}

impl ResourceLimits {
    /// No bounds on any resource.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound `resource`; a `max` of `None` leaves it unbounded above.
    pub fn with_bounds(mut self, resource: &str, min: i64, max: Option<i64>) -> Self {
        if min > 0 {
            self.min.insert(resource.to_string(), min);
        }
        if let Some(max) = max {
            self.max.insert(resource.to_string(), max);
        }
        self
    }

    /// Lower bound of `resource`; 0 when unset.
    pub fn min(&self, resource: &str) -> i64 {
        self.min.get(resource).copied().unwrap_or(0)
    }

    /// `None` means unbounded.
    pub fn max(&self, resource: &str) -> Option<i64> {
        self.max.get(resource).copied()
    }

    /// Every resource with either bound.
    pub fn resources(&self) -> Vec<String> {
        let mut names: Vec<String> = self.min.keys().chain(self.max.keys()).cloned().collect();
        names.sort();
        names.dedup();
        names
    }
}

impl AutoscalingOptions {
    /// Load and validate an `autoscaler.toml` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let options = Self::from_toml_str(&content)?;
        Ok(options)
    }

    /// Parse and validate TOML text.
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let options: AutoscalingOptions = toml::from_str(content)?;
        options.validate()?;
        Ok(options)
    }

    /// Render the options back to TOML with defaults filled in.
    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Cluster-wide limits converted to `ResourceList` units.
    pub fn resource_limits(&self) -> ResourceLimits {
        let unbounded = |max: u64| (max > 0).then_some(max as i64);
        let mut limits = ResourceLimits::new()
            .with_bounds(
                RESOURCE_CPU,
                self.cores_total.min as i64 * 1000,
                unbounded(self.cores_total.max).map(|m| m * 1000),
            )
            .with_bounds(
                RESOURCE_MEMORY,
                self.memory_total.min as i64 * GIB,
                unbounded(self.memory_total.max).map(|m| m.saturating_mul(GIB)),
            );
        for gpu in &self.gpu_total {
            limits = limits.with_bounds(&gpu.resource, gpu.min as i64, unbounded(gpu.max));
        }
        limits
    }

    /// Reject inconsistent values with a configuration error.
    pub fn validate(&self) -> AutoscalerResult<()> {
        let err = |msg: String| Err(AutoscalerError::Configuration(msg));

        for (name, value) in [
            ("scale_down.utilization_threshold", self.scale_down.utilization_threshold),
            ("scale_down.gpu_utilization_threshold", self.scale_down.gpu_utilization_threshold),
            ("scale_down.candidates_pool_ratio", self.scale_down.candidates_pool_ratio),
            ("scale_up.buffer_ratio", self.scale_up.buffer_ratio),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return err(format!("{name} must be within [0, 1], got {value}"));
            }
        }

        let bounds = [("cores_total", self.cores_total), ("memory_total", self.memory_total)];
        for (name, b) in bounds {
            if b.max > 0 && b.min > b.max {
                return err(format!("{name}: min {} exceeds max {}", b.min, b.max));
            }
        }
        for gpu in &self.gpu_total {
            if gpu.max > 0 && gpu.min > gpu.max {
                return err(format!("gpu_total {}: min {} exceeds max {}", gpu.resource, gpu.min, gpu.max));
            }
        }

        if self.scale_up.gpu_pod_scale_up_delay < self.scale_up.new_pod_scale_up_delay {
            return err("scale_up.gpu_pod_scale_up_delay must not be shorter than new_pod_scale_up_delay".into());
        }

        if let Some(webhook) = &self.webhook {
            match webhook.mode {
                WebhookMode::Http if webhook.url.is_none() => {
                    return err("webhook.url is required in http mode".into());
                }
                WebhookMode::Mailbox if webhook.mailbox_path.is_none() => {
                    return err("webhook.mailbox_path is required in mailbox mode".into());
                }
                _ => {}
            }
        }

        Ok(())
    }
}

/// Parse a duration string like "5s", "500ms", "2m", "3h".
///
/// A bare number is read as seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else if let Some(hours) = s.strip_suffix('h') {
        hours.parse::<u64>().ok().map(|h| Duration::from_secs(h * 3600))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

/// Inverse of [`parse_duration`], choosing the largest exact unit.
pub fn format_duration(d: Duration) -> String {
    let millis = d.as_millis();
    if millis % 1000 != 0 {
        return format!("{millis}ms");
    }
    let secs = d.as_secs();
    if secs != 0 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs != 0 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_duration(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid duration: {raw:?}")))
    }
}
