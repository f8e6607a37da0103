//! Stencil configuration
//!
//! Carries every knob of the generated accelerator: iteration count, border
//! policy, tiling and the parallelism factors that shape reuse buffers.

use serde::{Deserialize, Serialize};

use crate::error::{SemanticWarning, StencilError, StencilResult};

/// What happens to values on the border of a tile
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BorderPolicy {
    #[default]
    Ignore,
    Preserve,
}

/// Module clustering of the generated dataflow
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterMode {
    #[default]
    None,
    Fine,
    Coarse,
}

/// Configuration for one stencil pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StencilConfig {
    /// Kernel name used by the emitters
    #[serde(default = "default_app_name")]
    pub app_name: String,
    /// How many times the kernel is composed with itself
    #[serde(default = "default_one")]
    pub iterate: i64,
    #[serde(default)]
    pub border: BorderPolicy,
    #[serde(default)]
    pub cluster: ClusterMode,
    /// Per-dimension tile extents; the last one is unbounded
    pub tile_size: Vec<i64>,
    pub dim: usize,
    #[serde(default = "default_one_usize")]
    pub unroll_factor: usize,
    #[serde(default = "default_one_usize")]
    pub replication_factor: usize,
    #[serde(default = "default_one_usize")]
    pub dram_bank: usize,
    #[serde(default)]
    pub dram_separate: bool,
    #[serde(default = "default_burst_width")]
    pub burst_width: u32,
    /// Scalar parameters read by expressions but never windowed
    #[serde(default)]
    pub extra_params: Vec<String>,
}

fn default_app_name() -> String {
    "kernel".to_string()
}

fn default_one() -> i64 {
    1
}

fn default_one_usize() -> usize {
    1
}

fn default_burst_width() -> u32 {
    512
}

impl StencilConfig {
    pub fn new(tile_size: Vec<i64>, unroll_factor: usize) -> Self {
        Self {
            app_name: default_app_name(),
            iterate: 1,
            border: BorderPolicy::Ignore,
            cluster: ClusterMode::None,
            dim: tile_size.len(),
            tile_size,
            unroll_factor,
            replication_factor: 1,
            dram_bank: 1,
            dram_separate: false,
            burst_width: default_burst_width(),
            extra_params: Vec::new(),
        }
    }

    pub fn with_app_name(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = app_name.into();
        self
    }

    pub fn with_iterate(mut self, iterate: i64) -> Self {
        self.iterate = iterate;
        self
    }

    pub fn with_border(mut self, border: BorderPolicy) -> Self {
        self.border = border;
        self
    }

    pub fn with_cluster(mut self, cluster: ClusterMode) -> Self {
        self.cluster = cluster;
        self
    }

    pub fn with_replication_factor(mut self, replication_factor: usize) -> Self {
        self.replication_factor = replication_factor;
        self
    }

    pub fn with_dram(mut self, dram_bank: usize, dram_separate: bool) -> Self {
        self.dram_bank = dram_bank;
        self.dram_separate = dram_separate;
        self
    }

    pub fn with_burst_width(mut self, burst_width: u32) -> Self {
        self.burst_width = burst_width;
        self
    }

    pub fn with_extra_params(mut self, params: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.extra_params = params.into_iter().map(Into::into).collect();
        self
    }

    pub fn preserve_border(&self) -> bool {
        self.border == BorderPolicy::Preserve
    }

    pub fn is_extra_param(&self, name: &str) -> bool {
        self.extra_params.iter().any(|p| p == name)
    }

    /// DRAM banks available to each direction
    pub fn effective_dram_bank(&self) -> usize {
        if self.dram_separate {
            self.dram_bank / 2
        } else {
            self.dram_bank
        }
    }

    /// Check everything that does not depend on the definitions
    pub fn validate(&self) -> StencilResult<()> {
        if self.iterate < 1 {
            return Err(StencilError::semantic(format!(
                "cannot iterate {} times",
                self.iterate
            )));
        }
        if self.dim == 0 {
            return Err(StencilError::semantic("stencil must have at least one dimension"));
        }
        if self.tile_size.len() != self.dim {
            return Err(StencilError::semantic(format!(
                "tile size has {} dimension(s) but the stencil has {}",
                self.tile_size.len(),
                self.dim
            )));
        }
        if let Some(d) = self.tile_size[..self.dim - 1].iter().position(|&extent| extent < 1) {
            return Err(StencilError::semantic(format!(
                "tile size of dimension {} must be positive, got {}",
                d, self.tile_size[d]
            )));
        }
        if self.unroll_factor < 1 {
            return Err(StencilError::semantic("unroll factor must be at least 1"));
        }
        if self.replication_factor < 1 {
            return Err(StencilError::semantic("replication factor must be at least 1"));
        }
        if self.dram_separate && self.dram_bank % 2 != 0 {
            return Err(StencilError::semantic(format!(
                "number of DRAM banks has to be even when separated, got {}",
                self.dram_bank
            )));
        }
        Ok(())
    }

    /// Advisory checks that never fail construction
    pub fn warnings(&self) -> Vec<SemanticWarning> {
        let mut warnings = Vec::new();
        if let Some(&last) = self.tile_size.last() {
            if self.dim > 1 && last != 0 {
                warnings.push(SemanticWarning::new(format!(
                    "tile size {} of the last dimension is ignored",
                    last
                )));
            }
        }
        if self.replication_factor > 1 && self.cluster == ClusterMode::None {
            warnings.push(SemanticWarning::new(format!(
                "replication factor {} has no effect without clustering",
                self.replication_factor
            )));
        }
        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StencilConfig::new(vec![233, 0], 1);
        assert_eq!(config.dim, 2);
        assert_eq!(config.iterate, 1);
        assert_eq!(config.burst_width, 512);
        assert!(config.validate().is_ok());
        assert!(config.warnings().is_empty());
    }

    #[test]
    fn test_iterate_must_be_positive() {
        let err = StencilConfig::new(vec![233, 0], 1)
            .with_iterate(0)
            .validate()
            .unwrap_err();
        assert_eq!(err.message(), "cannot iterate 0 times");
    }

    #[test]
    fn test_tile_extents_must_be_positive() {
        let err = StencilConfig::new(vec![0, 0, 0], 1).validate().unwrap_err();
        assert_eq!(err.message(), "tile size of dimension 0 must be positive, got 0");

        let err = StencilConfig::new(vec![16, -4, 0], 1).validate().unwrap_err();
        assert_eq!(err.message(), "tile size of dimension 1 must be positive, got -4");

        // the last extent never enters the serialized offset
        assert!(StencilConfig::new(vec![16, 8, 0], 1).validate().is_ok());
        assert!(StencilConfig::new(vec![0], 1).validate().is_ok());
    }

    #[test]
    fn test_separated_dram_banks() {
        let config = StencilConfig::new(vec![64, 0], 2).with_dram(3, true);
        assert!(config.validate().is_err());

        let config = StencilConfig::new(vec![64, 0], 2).with_dram(4, true);
        assert!(config.validate().is_ok());
        assert_eq!(config.effective_dram_bank(), 2);
    }

    #[test]
    fn test_tile_size_dimension_mismatch() {
        let mut config = StencilConfig::new(vec![64, 0], 1);
        config.dim = 3;
        assert!(config.validate().unwrap_err().is_semantic());
    }

    #[test]
    fn test_warnings() {
        let config = StencilConfig::new(vec![64, 32], 1).with_replication_factor(2);
        assert_eq!(config.warnings().len(), 2);
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: StencilConfig =
            serde_json::from_str(r#"{"tile_size": [2000, 0], "dim": 2, "border": "preserve"}"#)
                .unwrap();
        assert!(config.preserve_border());
        assert_eq!(config.unroll_factor, 1);
        assert_eq!(config.cluster, ClusterMode::None);
    }
}
