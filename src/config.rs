//! Unified configuration, read from `siteflow.toml`.
//!
//! Every tunable has a default, so a missing file or a partial file both
//! work. Sections:
//!
//! ```toml
//! [mediation]
//! confidence_threshold = 0.6
//! extraction_floor = 0.5
//! context_lot_limit = 30
//! classify_cmd = "claude"
//! classify_timeout_secs = 120
//!
//! [notify]
//! batch_size = 100
//! channel_capacity = 64
//!
//! [timeline]
//! backlog_limit = 50
//! channel_capacity = 256
//!
//! [sync]
//! max_attempts = 5
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

fn default_confidence_threshold() -> f64 {
    0.6
}
fn default_extraction_floor() -> f64 {
    0.5
}
fn default_context_lot_limit() -> usize {
    30
}
fn default_classify_cmd() -> String {
    "claude".to_string()
}
fn default_classify_timeout_secs() -> u64 {
    120
}
fn default_batch_size() -> usize {
    100
}
fn default_notify_capacity() -> usize {
    64
}
fn default_backlog_limit() -> usize {
    50
}
fn default_timeline_capacity() -> usize {
    256
}
fn default_max_attempts() -> u32 {
    5
}

/// Mediation pipeline tunables. The confidence threshold gates
/// notifications; the extraction floor gates structured side-effects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediationSettings {
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    #[serde(default = "default_extraction_floor")]
    pub extraction_floor: f64,
    #[serde(default = "default_context_lot_limit")]
    pub context_lot_limit: usize,
    #[serde(default = "default_classify_cmd")]
    pub classify_cmd: String,
    #[serde(default = "default_classify_timeout_secs")]
    pub classify_timeout_secs: u64,
}

impl Default for MediationSettings {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
            extraction_floor: default_extraction_floor(),
            context_lot_limit: default_context_lot_limit(),
            classify_cmd: default_classify_cmd(),
            classify_timeout_secs: default_classify_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifySettings {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_notify_capacity")]
    pub channel_capacity: usize,
}

impl Default for NotifySettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            channel_capacity: default_notify_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineSettings {
    #[serde(default = "default_backlog_limit")]
    pub backlog_limit: usize,
    #[serde(default = "default_timeline_capacity")]
    pub channel_capacity: usize,
}

impl Default for TimelineSettings {
    fn default() -> Self {
        Self {
            backlog_limit: default_backlog_limit(),
            channel_capacity: default_timeline_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Total apply attempts before a queue item is quarantined.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SiteflowConfig {
    #[serde(default)]
    pub mediation: MediationSettings,
    #[serde(default)]
    pub notify: NotifySettings,
    #[serde(default)]
    pub timeline: TimelineSettings,
    #[serde(default)]
    pub sync: SyncSettings,
}

impl SiteflowConfig {
    /// Load from a TOML file, or fall back to defaults when the path is
    /// absent or the file does not exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config at {}", path.display()))?;
        let config = Self::from_toml(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("Failed to parse config TOML")
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.mediation.confidence_threshold) {
            anyhow::bail!("mediation.confidence_threshold must be in [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.mediation.extraction_floor) {
            anyhow::bail!("mediation.extraction_floor must be in [0, 1]");
        }
        if self.notify.batch_size == 0 {
            anyhow::bail!("notify.batch_size must be positive");
        }
        if self.sync.max_attempts == 0 {
            anyhow::bail!("sync.max_attempts must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = SiteflowConfig::default();
        assert_eq!(config.mediation.confidence_threshold, 0.6);
        assert_eq!(config.mediation.context_lot_limit, 30);
        assert_eq!(config.notify.batch_size, 100);
        assert_eq!(config.timeline.backlog_limit, 50);
        assert_eq!(config.sync.max_attempts, 5);
        config.validate().unwrap();
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let config = SiteflowConfig::from_toml(
            "[mediation]\nconfidence_threshold = 0.75\n\n[sync]\nmax_attempts = 3\n",
        )
        .unwrap();
        assert_eq!(config.mediation.confidence_threshold, 0.75);
        assert_eq!(config.mediation.context_lot_limit, 30);
        assert_eq!(config.sync.max_attempts, 3);
        assert_eq!(config.notify.batch_size, 100);
    }

    #[test]
    fn out_of_range_threshold_fails_validation() {
        let config = SiteflowConfig::from_toml("[mediation]\nconfidence_threshold = 1.5\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = SiteflowConfig::load(Some(Path::new("/nonexistent/siteflow.toml"))).unwrap();
        assert_eq!(config.notify.batch_size, 100);
    }

    #[test]
    fn garbage_toml_is_an_error() {
        assert!(SiteflowConfig::from_toml("not = [valid").is_err());
    }
}
