//! Matching policy knobs and their load-time validation.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound on frames buffered per track before a decision.
pub const MAX_WINDOW_SIZE: usize = 10;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{name} must be within [-1, 1], got {value}")]
    ThresholdOutOfRange { name: &'static str, value: f32 },
    #[error("dedup_threshold ({dedup}) must be looser than match_threshold ({matching})")]
    DedupNotLooser { dedup: f32, matching: f32 },
    #[error(
        "high_confidence_threshold ({high}) must be stricter than match_threshold ({matching})"
    )]
    HighConfidenceNotStricter { high: f32, matching: f32 },
    #[error("window_size must be within 1..={max}, got {0}", max = MAX_WINDOW_SIZE)]
    WindowSize(usize),
    #[error("adaptive_alpha must be within (0, 1], got {0}")]
    AdaptiveAlpha(f32),
    #[error("{0} must be at least 1")]
    Zero(&'static str),
}

/// Every tunable of the decision core.
///
/// All scores are cosine similarities, so a higher threshold is stricter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    /// Minimum similarity for a positive match.
    pub match_threshold: f32,
    /// Minimum similarity for a match to count toward a template refresh.
    pub high_confidence_threshold: f32,
    /// Minimum similarity for an unmatched detection to merge into an existing record.
    pub dedup_threshold: f32,
    /// Frames averaged per decision.
    pub window_size: usize,
    /// Candidate count at which lookups move to the approximate index.
    pub ann_switchover: usize,
    /// Inverted lists scanned per approximate query.
    pub ann_probes: usize,
    /// k-means refinement passes when building the approximate index.
    pub ann_iterations: usize,
    /// Seed for centroid selection, so rebuilds are reproducible.
    pub ann_seed: u64,
    pub adaptive_enabled: bool,
    /// Step toward the observed embedding on a template refresh.
    pub adaptive_alpha: f32,
    /// Refresh on every Nth high-confidence match of an identity.
    pub adaptive_every: u32,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            match_threshold: 0.40,
            high_confidence_threshold: 0.60,
            dedup_threshold: 0.30,
            window_size: 3,
            ann_switchover: 50,
            ann_probes: 4,
            ann_iterations: 10,
            ann_seed: 0x5741_5244,
            adaptive_enabled: true,
            adaptive_alpha: 0.1,
            adaptive_every: 10,
        }
    }
}

impl MatchConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("match_threshold", self.match_threshold),
            ("high_confidence_threshold", self.high_confidence_threshold),
            ("dedup_threshold", self.dedup_threshold),
        ] {
            if !(-1.0..=1.0).contains(&value) {
                return Err(ConfigError::ThresholdOutOfRange { name, value });
            }
        }

        if self.dedup_threshold >= self.match_threshold {
            return Err(ConfigError::DedupNotLooser {
                dedup: self.dedup_threshold,
                matching: self.match_threshold,
            });
        }
        if self.high_confidence_threshold <= self.match_threshold {
            return Err(ConfigError::HighConfidenceNotStricter {
                high: self.high_confidence_threshold,
                matching: self.match_threshold,
            });
        }
        if !(1..=MAX_WINDOW_SIZE).contains(&self.window_size) {
            return Err(ConfigError::WindowSize(self.window_size));
        }
        if !(self.adaptive_alpha > 0.0 && self.adaptive_alpha <= 1.0) {
            return Err(ConfigError::AdaptiveAlpha(self.adaptive_alpha));
        }
        if self.adaptive_every == 0 {
            return Err(ConfigError::Zero("adaptive_every"));
        }
        if self.ann_probes == 0 {
            return Err(ConfigError::Zero("ann_probes"));
        }
        if self.ann_iterations == 0 {
            return Err(ConfigError::Zero("ann_iterations"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert_eq!(MatchConfig::default().validate(), Ok(()));
    }

    #[test]
    fn test_dedup_must_be_looser() {
        let config = MatchConfig {
            dedup_threshold: 0.45,
            ..MatchConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DedupNotLooser { .. })
        ));

        let equal = MatchConfig {
            dedup_threshold: 0.40,
            ..MatchConfig::default()
        };
        assert!(equal.validate().is_err());
    }

    #[test]
    fn test_high_confidence_must_be_stricter() {
        let config = MatchConfig {
            high_confidence_threshold: 0.35,
            ..MatchConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::HighConfidenceNotStricter { .. })
        ));
    }

    #[test]
    fn test_window_size_bounds() {
        for bad in [0, MAX_WINDOW_SIZE + 1] {
            let config = MatchConfig {
                window_size: bad,
                ..MatchConfig::default()
            };
            assert_eq!(config.validate(), Err(ConfigError::WindowSize(bad)));
        }
    }

    #[test]
    fn test_threshold_range() {
        let config = MatchConfig {
            match_threshold: 1.5,
            high_confidence_threshold: 2.0,
            ..MatchConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ThresholdOutOfRange { name: "match_threshold", .. })
        ));
    }

    #[test]
    fn test_alpha_and_counters() {
        let alpha = MatchConfig {
            adaptive_alpha: 0.0,
            ..MatchConfig::default()
        };
        assert_eq!(alpha.validate(), Err(ConfigError::AdaptiveAlpha(0.0)));

        let every = MatchConfig {
            adaptive_every: 0,
            ..MatchConfig::default()
        };
        assert_eq!(every.validate(), Err(ConfigError::Zero("adaptive_every")));
    }

    #[test]
    fn test_partial_deserialize_uses_defaults() {
        let config: MatchConfig =
            serde_json::from_str(r#"{"match_threshold": 0.5, "window_size": 5}"#).unwrap();
        assert_eq!(config.match_threshold, 0.5);
        assert_eq!(config.window_size, 5);
        assert_eq!(config.dedup_threshold, MatchConfig::default().dedup_threshold);
    }
}
