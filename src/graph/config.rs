use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::overflow::DEFAULT_EVICTION_BATCH;
use crate::types::{GraphError, Result};

/// Configuration supplied when opening a [`super::Graph`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Whether bodies may be evicted under memory pressure. When false the
    /// reference manager and pressure monitor are inert.
    pub overflow_enabled: bool,
    /// Memory usage percentage (0..=100) above which eviction starts.
    pub heap_percentage_threshold: u8,
    /// Store file. The graph reloads from it on open and persists to it on
    /// close. Unset means a temporary file deleted on close.
    pub storage_location: Option<PathBuf>,
    /// Whether the codec records timing counters.
    pub serialization_stats_enabled: bool,
    /// Handles evicted per pressure signal.
    pub eviction_batch_size: usize,
    /// Sampling period of the pressure monitor in milliseconds; 0 disables
    /// the background sampler.
    pub pressure_sample_interval_ms: u64,
    /// Process resident-memory budget. When unset, system memory is used.
    pub memory_limit_bytes: Option<u64>,
    /// Compact the store on close when more than half its bytes are garbage.
    pub compact_on_close: bool,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            overflow_enabled: true,
            heap_percentage_threshold: 80,
            storage_location: None,
            serialization_stats_enabled: false,
            eviction_batch_size: DEFAULT_EVICTION_BATCH,
            pressure_sample_interval_ms: 250,
            memory_limit_bytes: None,
            compact_on_close: true,
        }
    }
}

impl GraphConfig {
    /// Default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a TOML document; missing keys take their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|err| GraphError::InvalidArgument(format!("invalid graph config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// Renders the configuration as TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self)
            .map_err(|err| GraphError::InvalidArgument(format!("cannot render graph config: {err}")))
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.heap_percentage_threshold > 100 {
            return Err(GraphError::InvalidArgument(format!(
                "heap_percentage_threshold must be within 0..=100, got {}",
                self.heap_percentage_threshold
            )));
        }
        if self.eviction_batch_size == 0 {
            return Err(GraphError::InvalidArgument(
                "eviction_batch_size must be positive".into(),
            ));
        }
        if self.memory_limit_bytes == Some(0) {
            return Err(GraphError::InvalidArgument(
                "memory_limit_bytes must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Sampling period, `None` when the sampler is disabled.
    pub fn sample_interval(&self) -> Option<Duration> {
        (self.pressure_sample_interval_ms > 0)
            .then(|| Duration::from_millis(self.pressure_sample_interval_ms))
    }

    /// Enables or disables overflow.
    pub fn overflow_enabled(mut self, enabled: bool) -> Self {
        self.overflow_enabled = enabled;
        self
    }

    /// Sets the pressure threshold in percent.
    pub fn heap_percentage_threshold(mut self, percent: u8) -> Self {
        self.heap_percentage_threshold = percent;
        self
    }

    /// Persists the graph at `path`.
    pub fn storage_location(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage_location = Some(path.into());
        self
    }

    /// Enables or disables codec timing counters.
    pub fn serialization_stats_enabled(mut self, enabled: bool) -> Self {
        self.serialization_stats_enabled = enabled;
        self
    }

    /// Sets the eviction batch size.
    pub fn eviction_batch_size(mut self, size: usize) -> Self {
        self.eviction_batch_size = size;
        self
    }

    /// Sets the sampler period; 0 disables it.
    pub fn pressure_sample_interval_ms(mut self, ms: u64) -> Self {
        self.pressure_sample_interval_ms = ms;
        self
    }

    /// Measures pressure as process resident memory over `bytes`.
    pub fn memory_limit_bytes(mut self, bytes: u64) -> Self {
        self.memory_limit_bytes = Some(bytes);
        self
    }

    /// Enables or disables compaction on close.
    pub fn compact_on_close(mut self, enabled: bool) -> Self {
        self.compact_on_close = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = GraphConfig::default();
        assert!(config.overflow_enabled);
        assert_eq!(config.heap_percentage_threshold, 80);
        assert_eq!(config.eviction_batch_size, 100_000);
        assert!(config.storage_location.is_none());
        assert!(!config.serialization_stats_enabled);
        config.validate().unwrap();
    }

    #[test]
    fn toml_overrides_and_defaults_mix() {
        let config = GraphConfig::from_toml_str(
            r#"
            overflow_enabled = false
            heap_percentage_threshold = 65
            storage_location = "/var/lib/graph/nodes.ovgs"
            "#,
        )
        .unwrap();
        assert!(!config.overflow_enabled);
        assert_eq!(config.heap_percentage_threshold, 65);
        assert_eq!(
            config.storage_location.as_deref(),
            Some(Path::new("/var/lib/graph/nodes.ovgs"))
        );
        assert_eq!(config.pressure_sample_interval_ms, 250);

        let rendered = config.to_toml_string().unwrap();
        assert_eq!(GraphConfig::from_toml_str(&rendered).unwrap(), config);
    }

    #[test]
    fn out_of_range_threshold_is_rejected() {
        let err = GraphConfig::from_toml_str("heap_percentage_threshold = 101").unwrap_err();
        assert!(matches!(err, GraphError::InvalidArgument(_)));
        assert!(GraphConfig::new().eviction_batch_size(0).validate().is_err());
        assert!(GraphConfig::new().heap_percentage_threshold(100).validate().is_ok());
        assert!(GraphConfig::new().heap_percentage_threshold(0).validate().is_ok());
    }

    #[test]
    fn zero_interval_disables_sampler() {
        let config = GraphConfig::new().pressure_sample_interval_ms(0);
        assert_eq!(config.sample_interval(), None);
    }
}
