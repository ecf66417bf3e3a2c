#![forbid(unsafe_code)]

//! Feed weight presets.
//!
//! Builtin presets are fixed. Operators may add more through a TOML file, but
//! a file entry cannot redefine a builtin name.

use std::{collections::BTreeMap, path::Path};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const DEFAULT_PRESET: &str = "default";
pub const DEFAULT_HALF_LIFE_HOURS: f64 = 72.0;

fn default_half_life() -> f64 {
    DEFAULT_HALF_LIFE_HOURS
}

/// Weights applied by the scoring engine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FeedConfig {
    #[serde(alias = "recency_weight")]
    pub recency_weight: f64,
    #[serde(alias = "engagement_weight")]
    pub engagement_weight: f64,
    #[serde(alias = "region_match_weight")]
    pub region_match_weight: f64,
    #[serde(alias = "diversity_penalty")]
    pub diversity_penalty: f64,
    #[serde(alias = "max_results")]
    pub max_results: usize,
    #[serde(default = "default_half_life", alias = "recency_half_life_hours")]
    pub recency_half_life_hours: f64,
}

impl FeedConfig {
    /// No diversity penalty: with no engagement signal the default feed is
    /// strictly newest first, whoever posted it. `trending` and `regional`
    /// opt into spreading owners out.
    pub const DEFAULT: FeedConfig = FeedConfig {
        recency_weight: 0.5,
        engagement_weight: 0.3,
        region_match_weight: 0.2,
        diversity_penalty: 0.0,
        max_results: 50,
        recency_half_life_hours: DEFAULT_HALF_LIFE_HOURS,
    };

    pub const TRENDING: FeedConfig = FeedConfig {
        recency_weight: 0.25,
        engagement_weight: 0.6,
        region_match_weight: 0.15,
        diversity_penalty: 0.05,
        max_results: 50,
        recency_half_life_hours: 48.0,
    };

    pub const LATEST: FeedConfig = FeedConfig {
        recency_weight: 0.85,
        engagement_weight: 0.1,
        region_match_weight: 0.05,
        diversity_penalty: 0.0,
        max_results: 50,
        recency_half_life_hours: 24.0,
    };

    pub const REGIONAL: FeedConfig = FeedConfig {
        recency_weight: 0.35,
        engagement_weight: 0.25,
        region_match_weight: 0.4,
        diversity_penalty: 0.05,
        max_results: 50,
        recency_half_life_hours: DEFAULT_HALF_LIFE_HOURS,
    };

    /// Rejects weights the scoring engine cannot use meaningfully.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("recencyWeight", self.recency_weight),
            ("engagementWeight", self.engagement_weight),
            ("regionMatchWeight", self.region_match_weight),
            ("diversityPenalty", self.diversity_penalty),
        ] {
            if !value.is_finite() || value < 0.0 {
                bail!("{name} must be a finite, non-negative number");
            }
        }
        if !self.recency_half_life_hours.is_finite() || self.recency_half_life_hours <= 0.0 {
            bail!("recencyHalfLifeHours must be positive");
        }
        if self.max_results == 0 {
            bail!("maxResults must be at least 1");
        }
        Ok(())
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// How a request picks its weights: inline config beats a named preset,
/// which beats the default preset.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum FeedSelection {
    Custom(FeedConfig),
    Preset(String),
    #[default]
    Default,
}

impl FeedSelection {
    pub fn from_parts(custom: Option<FeedConfig>, preset: Option<&str>) -> Self {
        match (custom, preset.map(str::trim).filter(|name| !name.is_empty())) {
            (Some(config), _) => Self::Custom(config),
            (None, Some(name)) => Self::Preset(name.to_string()),
            (None, None) => Self::Default,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeedPresets {
    presets: BTreeMap<String, FeedConfig>,
}

#[derive(Debug, Deserialize)]
struct PresetFile {
    #[serde(default)]
    presets: BTreeMap<String, FeedConfig>,
}

const BUILTIN_PRESETS: [(&str, FeedConfig); 4] = [
    (DEFAULT_PRESET, FeedConfig::DEFAULT),
    ("trending", FeedConfig::TRENDING),
    ("latest", FeedConfig::LATEST),
    ("regional", FeedConfig::REGIONAL),
];

impl FeedPresets {
    pub fn builtin() -> Self {
        Self {
            presets: BUILTIN_PRESETS
                .iter()
                .map(|(name, config)| (name.to_string(), *config))
                .collect(),
        }
    }

    /// Builtins plus whatever `path` adds. A missing file is not an error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::builtin());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading presets {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("parsing presets {}", path.display()))
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let file: PresetFile = toml::from_str(raw)?;
        let mut presets = Self::builtin();
        for (name, config) in file.presets {
            if presets.presets.contains_key(&name) {
                warn!(preset = %name, "ignoring attempt to redefine a builtin preset");
                continue;
            }
            config
                .validate()
                .with_context(|| format!("preset `{name}`"))?;
            presets.presets.insert(name, config);
        }
        Ok(presets)
    }

    pub fn get(&self, name: &str) -> Option<&FeedConfig> {
        self.presets.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FeedConfig)> {
        self.presets
            .iter()
            .map(|(name, config)| (name.as_str(), config))
    }

    pub fn resolve(&self, selection: &FeedSelection) -> FeedConfig {
        match selection {
            FeedSelection::Custom(config) => *config,
            FeedSelection::Preset(name) => match self.presets.get(name) {
                Some(config) => *config,
                None => {
                    warn!(preset = %name, "unknown feed preset, using default");
                    self.default_config()
                }
            },
            FeedSelection::Default => self.default_config(),
        }
    }

    fn default_config(&self) -> FeedConfig {
        self.presets
            .get(DEFAULT_PRESET)
            .copied()
            .unwrap_or(FeedConfig::DEFAULT)
    }
}

impl Default for FeedPresets {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builtins_are_valid() {
        let presets = FeedPresets::builtin();
        for (name, config) in presets.iter() {
            assert!(config.validate().is_ok(), "{name} should validate");
        }
        assert_eq!(presets.iter().count(), 4);
    }

    #[test]
    fn resolution_precedence() {
        let presets = FeedPresets::builtin();
        let custom = FeedConfig {
            max_results: 3,
            ..FeedConfig::LATEST
        };
        assert_eq!(presets.resolve(&FeedSelection::Custom(custom)), custom);
        assert_eq!(
            presets.resolve(&FeedSelection::Preset("trending".into())),
            FeedConfig::TRENDING
        );
        assert_eq!(
            presets.resolve(&FeedSelection::Preset("nope".into())),
            FeedConfig::DEFAULT
        );
        assert_eq!(presets.resolve(&FeedSelection::Default), FeedConfig::DEFAULT);
    }

    #[test]
    fn selection_from_parts() {
        assert_eq!(
            FeedSelection::from_parts(Some(FeedConfig::LATEST), Some("trending")),
            FeedSelection::Custom(FeedConfig::LATEST)
        );
        assert_eq!(
            FeedSelection::from_parts(None, Some(" trending ")),
            FeedSelection::Preset("trending".into())
        );
        assert_eq!(FeedSelection::from_parts(None, Some("  ")), FeedSelection::Default);
    }

    #[test]
    fn toml_adds_presets_but_cannot_redefine_builtins() {
        let presets = FeedPresets::from_toml_str(
            r#"
            [presets.shorts]
            recency_weight = 0.7
            engagement_weight = 0.3
            region_match_weight = 0.0
            diversity_penalty = 0.1
            max_results = 20
            recency_half_life_hours = 12.0

            [presets.default]
            recency_weight = 1.0
            engagement_weight = 0.0
            region_match_weight = 0.0
            diversity_penalty = 0.0
            max_results = 1
            "#,
        )
        .unwrap();
        let shorts = presets.get("shorts").unwrap();
        assert_eq!(shorts.max_results, 20);
        assert_eq!(shorts.recency_half_life_hours, 12.0);
        assert_eq!(presets.get(DEFAULT_PRESET), Some(&FeedConfig::DEFAULT));
    }

    #[test]
    fn toml_rejects_invalid_weights() {
        let err = FeedPresets::from_toml_str(
            r#"
            [presets.broken]
            recency_weight = -1.0
            engagement_weight = 0.3
            region_match_weight = 0.0
            diversity_penalty = 0.1
            max_results = 20
            "#,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("recencyWeight"));
    }

    #[test]
    fn missing_presets_file_yields_builtins() {
        let dir = tempfile::tempdir().unwrap();
        let presets = FeedPresets::load(&dir.path().join("presets.toml")).unwrap();
        assert_eq!(presets, FeedPresets::builtin());
    }

    #[test]
    fn json_config_defaults_half_life() {
        let config: FeedConfig = serde_json::from_value(json!({
            "recencyWeight": 1.0,
            "engagementWeight": 0.0,
            "regionMatchWeight": 0.0,
            "diversityPenalty": 0.0,
            "maxResults": 5
        }))
        .unwrap();
        assert_eq!(config.recency_half_life_hours, DEFAULT_HALF_LIFE_HOURS);
    }
}
