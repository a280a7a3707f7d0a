//! Transition options.

use crate::error::{Result, TransitionError};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

fn default_duration() -> f64 {
    1.0
}

/// Options controlling a transition. Immutable once validated.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransitionConfig {
    /// Transition length in seconds.
    #[serde(default = "default_duration")]
    duration: f64,
    /// Delay before the transition starts, in seconds.
    #[serde(default)]
    offset: f64,
    /// Path to a gl-transitions style snippet. `None` selects the cross-fade.
    #[serde(default)]
    source: Option<PathBuf>,
    /// Keep pairing with the last secondary frame after the secondary stream ends.
    #[serde(default)]
    repeat_last: bool,
    /// Stop producing output once the secondary stream is exhausted.
    #[serde(default)]
    shortest: bool,
}

impl Default for TransitionConfig {
    fn default() -> Self {
        Self {
            duration: default_duration(),
            offset: 0.0,
            source: None,
            repeat_last: false,
            shortest: false,
        }
    }
}

impl TransitionConfig {
    /// Creates a validated configuration.
    pub fn new(duration: f64, offset: f64, source: Option<PathBuf>) -> Result<Self> {
        let config = Self {
            duration,
            offset,
            source,
            repeat_last: false,
            shortest: false,
        };
        config.validate()?;
        Ok(config)
    }

    /// Loads options from a YAML file. Missing keys take their defaults.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading transition config from {:?}", path);
        let content = fs::read_to_string(path).map_err(|e| TransitionError::InvalidConfig {
            option: "config",
            reason: format!("cannot read {:?}: {}", path, e),
        })?;
        Self::from_yaml_str(&content)
    }

    /// Parses options from YAML text.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: Self =
            serde_yaml::from_str(content).map_err(|e| TransitionError::InvalidConfig {
                option: "config",
                reason: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !self.duration.is_finite() || self.duration <= 0.0 {
            return Err(TransitionError::InvalidConfig {
                option: "duration",
                reason: format!("must be a positive number of seconds, got {}", self.duration),
            });
        }
        if !self.offset.is_finite() || self.offset < 0.0 {
            return Err(TransitionError::InvalidConfig {
                option: "offset",
                reason: format!("must be zero or more seconds, got {}", self.offset),
            });
        }
        Ok(())
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }

    pub fn offset(&self) -> f64 {
        self.offset
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn repeat_last(&self) -> bool {
        self.repeat_last
    }

    pub fn shortest(&self) -> bool {
        self.shortest
    }

    /// Sets what happens to primary frames once the secondary stream is exhausted.
    pub fn with_end_behavior(mut self, repeat_last: bool, shortest: bool) -> Self {
        self.repeat_last = repeat_last;
        self.shortest = shortest;
        self
    }

    /// Returns a copy with overrides applied, revalidated.
    pub fn with_overrides(
        &self,
        duration: Option<f64>,
        offset: Option<f64>,
        source: Option<PathBuf>,
    ) -> Result<Self> {
        Ok(Self::new(
            duration.unwrap_or(self.duration),
            offset.unwrap_or(self.offset),
            source.or_else(|| self.source.clone()),
        )?
        .with_end_behavior(self.repeat_last, self.shortest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let config = TransitionConfig::default();
        assert_eq!(config.duration(), 1.0);
        assert_eq!(config.offset(), 0.0);
        assert!(config.source().is_none());
    }

    #[test]
    fn rejects_non_positive_duration() {
        assert!(TransitionConfig::new(0.0, 0.0, None).is_err());
        assert!(TransitionConfig::new(-1.0, 0.0, None).is_err());
        assert!(TransitionConfig::new(f64::NAN, 0.0, None).is_err());
    }

    #[test]
    fn rejects_negative_offset() {
        let err = TransitionConfig::new(1.0, -0.5, None).unwrap_err();
        assert!(err.to_string().contains("offset"));
    }

    #[test]
    fn yaml_fills_missing_keys() {
        let config = TransitionConfig::from_yaml_str("offset: 0.5\n").unwrap();
        assert_eq!(config.duration(), 1.0);
        assert_eq!(config.offset(), 0.5);
    }

    #[test]
    fn yaml_rejects_unknown_keys() {
        assert!(TransitionConfig::from_yaml_str("durtion: 2.0\n").is_err());
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "duration: 2.0\noffset: 0.25\nsource: wipe.glsl").unwrap();
        let config = TransitionConfig::from_yaml_file(file.path()).unwrap();
        assert_eq!(config.duration(), 2.0);
        assert_eq!(config.offset(), 0.25);
        assert_eq!(config.source(), Some(Path::new("wipe.glsl")));
    }

    #[test]
    fn end_behavior_defaults_off_and_loads_from_yaml() {
        let config = TransitionConfig::default();
        assert!(!config.repeat_last());
        assert!(!config.shortest());
        let config = TransitionConfig::from_yaml_str("repeat_last: true\nshortest: true\n").unwrap();
        assert!(config.repeat_last());
        assert!(config.shortest());
        let overridden = config.with_overrides(Some(2.0), None, None).unwrap();
        assert!(overridden.repeat_last() && overridden.shortest());
    }

    #[test]
    fn overrides_are_validated() {
        let base = TransitionConfig::default();
        let config = base.with_overrides(Some(3.0), None, None).unwrap();
        assert_eq!(config.duration(), 3.0);
        assert!(base.with_overrides(None, Some(-1.0), None).is_err());
    }
}
