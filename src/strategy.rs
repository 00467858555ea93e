// strategy.rs
//
// Strategy Registry: resolves the benchmark strategy file into typed
// `Strategy` values, in file order. The order of the file is the canonical
// strategy ordering used when persisting metric tables.

use crate::error::{BenchError, Result};
use log::{debug, info};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;

/// Registry key that only exists in strategy files as a "run everything" entry.
const PLACEHOLDER_KEY: &str = "process all strategies.";

pub const DEFAULT_SCRUB_SEGMENT: usize = 5;
pub const DEFAULT_FD_THRESHOLD: f64 = 0.2;
pub const DEFAULT_STD_DVARS_THRESHOLD: f64 = 3.0;

/// Raw parameter object of one strategy, as written in the strategy file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StrategyParameters {
    #[serde(default)]
    pub denoise_strategy: Option<String>,
    #[serde(default)]
    pub motion: Option<String>,
    #[serde(default)]
    pub wm_csf: Option<String>,
    #[serde(default)]
    pub global_signal: Option<String>,
    #[serde(default)]
    pub compcor: Option<String>,
    #[serde(default)]
    pub n_compcor: Option<serde_json::Value>,
    /// `Some(None)` is an explicit `null` in the file, which disables the criterion.
    #[serde(default, deserialize_with = "present_or_null")]
    pub fd_threshold: Option<Option<f64>>,
    #[serde(default, deserialize_with = "present_or_null")]
    pub std_dvars_threshold: Option<Option<f64>>,
    #[serde(default)]
    pub scrub: Option<usize>,
    /// Literal column list overriding the method-derived selection.
    #[serde(default)]
    pub strategy: Option<Vec<String>>,
}

fn present_or_null<'de, D>(deserializer: D) -> std::result::Result<Option<Option<f64>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<f64>::deserialize(deserializer).map(Some)
}

/// Expansion level of a confound family (motion parameters, global signal).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfoundLevel {
    Basic,
    Derivatives,
    Power2,
    Full,
}

impl ConfoundLevel {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "basic" => Some(Self::Basic),
            "derivatives" => Some(Self::Derivatives),
            "power2" => Some(Self::Power2),
            "full" => Some(Self::Full),
            _ => None,
        }
    }

    /// Column-name suffixes included at this level, base column first.
    pub fn suffixes(self) -> &'static [&'static str] {
        match self {
            Self::Basic => &[""],
            Self::Derivatives => &["", "_derivative1"],
            Self::Power2 => &["", "_power2"],
            Self::Full => &["", "_derivative1", "_power2", "_derivative1_power2"],
        }
    }
}

/// Denoising recipe of a strategy. Each variant carries exactly the modifiers
/// that influence its regressor selection.
#[derive(Debug, Clone, PartialEq)]
pub enum DenoiseMethod {
    Simple { wm_csf: bool, global_signal: bool },
    Scrubbing { wm_csf: bool, global_signal: bool },
    Compcor,
    IcaAroma { global_signal: bool },
    Baseline,
    Explicit { columns: Vec<String> },
}

/// Parameters handed to the image-based scrub resolver.
#[derive(Debug, Clone, PartialEq)]
pub struct ScrubSettings {
    pub motion: Option<ConfoundLevel>,
    pub global_signal: Option<ConfoundLevel>,
    pub scrub: usize,
    pub fd_threshold: Option<f64>,
    pub std_dvars_threshold: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Strategy {
    pub name: String,
    pub method: DenoiseMethod,
    /// Present when the strategy censors volumes; drives the image-based
    /// loader path and the DoF "total" rule.
    pub scrubbing: Option<ScrubSettings>,
    pub parameters: StrategyParameters,
}

impl Strategy {
    pub fn from_parameters(name: &str, parameters: StrategyParameters) -> Result<Self> {
        let malformed = |reason: String| BenchError::MalformedStrategy {
            strategy: name.to_string(),
            reason,
        };

        let wm_csf = parameters.wm_csf.as_deref() == Some("basic");
        let global_signal = parameters.global_signal.is_some();

        let method = if let Some(columns) = &parameters.strategy {
            DenoiseMethod::Explicit {
                columns: columns.clone(),
            }
        } else {
            match parameters.denoise_strategy.as_deref() {
                Some("simple") => DenoiseMethod::Simple { wm_csf, global_signal },
                Some("scrubbing") => DenoiseMethod::Scrubbing { wm_csf, global_signal },
                Some("compcor") => DenoiseMethod::Compcor,
                Some("ica_aroma") => DenoiseMethod::IcaAroma { global_signal },
                Some("baseline") | None => DenoiseMethod::Baseline,
                Some("explicit") => {
                    return Err(malformed(
                        "denoise_strategy 'explicit' requires a 'strategy' column list".to_string(),
                    ))
                }
                Some(other) => return Err(malformed(format!("unknown denoise_strategy '{}'", other))),
            }
        };

        let censors = matches!(method, DenoiseMethod::Scrubbing { .. })
            || name.to_lowercase().contains("scrub");
        let scrubbing = if censors {
            let motion = match parameters.motion.as_deref() {
                Some(level) => Some(
                    ConfoundLevel::parse(level)
                        .ok_or_else(|| malformed(format!("unknown motion level '{}'", level)))?,
                ),
                None if parameters.denoise_strategy.as_deref() == Some("scrubbing") => {
                    Some(ConfoundLevel::Full)
                }
                None => None,
            };
            let global_signal = match parameters.global_signal.as_deref() {
                Some(level) => Some(
                    ConfoundLevel::parse(level)
                        .ok_or_else(|| malformed(format!("unknown global_signal level '{}'", level)))?,
                ),
                None => None,
            };
            Some(ScrubSettings {
                motion,
                global_signal,
                scrub: parameters.scrub.unwrap_or(DEFAULT_SCRUB_SEGMENT),
                fd_threshold: parameters.fd_threshold.unwrap_or(Some(DEFAULT_FD_THRESHOLD)),
                std_dvars_threshold: parameters
                    .std_dvars_threshold
                    .unwrap_or(Some(DEFAULT_STD_DVARS_THRESHOLD)),
            })
        } else {
            None
        };

        Ok(Self {
            name: name.to_string(),
            method,
            scrubbing,
            parameters,
        })
    }

    pub fn is_scrubbing(&self) -> bool {
        self.scrubbing.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct StrategyRegistry {
    strategies: Vec<Strategy>,
}

impl StrategyRegistry {
    pub fn from_path(path: &Path) -> Result<Self> {
        info!("Loading denoising strategies from {}", path.display());
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let raw: serde_json::Map<String, serde_json::Value> = serde_json::from_str(text)?;
        let mut strategies = Vec::with_capacity(raw.len());
        for (name, value) in raw {
            if name.to_lowercase() == PLACEHOLDER_KEY {
                debug!("Skipping placeholder strategy entry '{}'", name);
                continue;
            }
            let parameters: StrategyParameters =
                serde_json::from_value(value).map_err(|e| BenchError::MalformedStrategy {
                    strategy: name.clone(),
                    reason: e.to_string(),
                })?;
            strategies.push(Strategy::from_parameters(&name, parameters)?);
        }
        debug!(
            "Registry holds {} strategies: {:?}",
            strategies.len(),
            strategies.iter().map(|s| s.name.as_str()).collect::<Vec<_>>()
        );
        Ok(Self { strategies })
    }

    pub fn lookup_all(&self) -> &[Strategy] {
        &self.strategies
    }

    pub fn lookup(&self, name: &str) -> Result<&Strategy> {
        self.strategies
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| BenchError::UnknownStrategy {
                requested: name.to_string(),
                available: self.names(),
            })
    }

    pub fn by_index(&self, index: usize) -> Result<&Strategy> {
        self.strategies
            .get(index)
            .ok_or(BenchError::StrategyIndexOutOfRange {
                index,
                max: self.strategies.len().saturating_sub(1),
            })
    }

    /// Canonical strategy ordering.
    pub fn names(&self) -> Vec<String> {
        self.strategies.iter().map(|s| s.name.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STRATEGIES: &str = r#"{
        "Process all strategies.": {},
        "baseline": {"denoise_strategy": "simple", "motion": "basic"},
        "simple": {"denoise_strategy": "simple", "motion": "full", "wm_csf": "basic"},
        "simple+gsr": {"denoise_strategy": "simple", "motion": "full", "wm_csf": "basic", "global_signal": "basic"},
        "scrubbing.5": {"denoise_strategy": "scrubbing", "motion": "full", "wm_csf": "full", "fd_threshold": 0.5, "std_dvars_threshold": null, "scrub": 5},
        "compcor": {"denoise_strategy": "compcor", "compcor": "anat_combined", "n_compcor": "all"},
        "aroma": {"denoise_strategy": "ica_aroma", "global_signal": "basic"},
        "custom": {"denoise_strategy": "simple", "strategy": ["trans_x", "high_pass", "csf"]}
    }"#;

    #[test]
    fn registry_preserves_file_order_and_skips_placeholder() {
        let registry = StrategyRegistry::from_json_str(STRATEGIES).unwrap();
        assert_eq!(
            registry.names(),
            vec!["baseline", "simple", "simple+gsr", "scrubbing.5", "compcor", "aroma", "custom"]
        );
        assert_eq!(registry.by_index(2).unwrap().name, "simple+gsr");
        assert!(matches!(
            registry.by_index(7),
            Err(BenchError::StrategyIndexOutOfRange { index: 7, max: 6 })
        ));
    }

    #[test]
    fn unknown_strategy_is_an_error() {
        let registry = StrategyRegistry::from_json_str(STRATEGIES).unwrap();
        match registry.lookup("nope") {
            Err(BenchError::UnknownStrategy { requested, available }) => {
                assert_eq!(requested, "nope");
                assert_eq!(available.len(), 7);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn methods_resolve_to_typed_variants() {
        let registry = StrategyRegistry::from_json_str(STRATEGIES).unwrap();
        assert_eq!(
            registry.lookup("simple+gsr").unwrap().method,
            DenoiseMethod::Simple { wm_csf: true, global_signal: true }
        );
        // wm_csf "full" is not the basic two-signal modifier.
        assert_eq!(
            registry.lookup("scrubbing.5").unwrap().method,
            DenoiseMethod::Scrubbing { wm_csf: false, global_signal: false }
        );
        assert_eq!(registry.lookup("compcor").unwrap().method, DenoiseMethod::Compcor);
        assert_eq!(
            registry.lookup("aroma").unwrap().method,
            DenoiseMethod::IcaAroma { global_signal: true }
        );
        assert_eq!(
            registry.lookup("custom").unwrap().method,
            DenoiseMethod::Explicit {
                columns: vec!["trans_x".into(), "high_pass".into(), "csf".into()]
            }
        );
    }

    #[test]
    fn scrub_settings_keep_explicit_null_thresholds() {
        let registry = StrategyRegistry::from_json_str(STRATEGIES).unwrap();
        let scrubbing = registry.lookup("scrubbing.5").unwrap();
        let settings = scrubbing.scrubbing.as_ref().unwrap();
        assert_eq!(settings.motion, Some(ConfoundLevel::Full));
        assert_eq!(settings.global_signal, None);
        assert_eq!(settings.fd_threshold, Some(0.5));
        assert_eq!(settings.std_dvars_threshold, None);
        assert_eq!(settings.scrub, 5);
        assert!(!registry.lookup("simple").unwrap().is_scrubbing());
    }

    #[test]
    fn unknown_method_is_malformed() {
        let err = StrategyRegistry::from_json_str(r#"{"x": {"denoise_strategy": "magic"}}"#).unwrap_err();
        assert!(matches!(err, BenchError::MalformedStrategy { .. }));
    }
}
