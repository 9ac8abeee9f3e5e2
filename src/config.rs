//! Mount and format options, loadable from JSON.

use alloc::string::String;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::{
    common::{LfsError, LfsResult},
    layout::Geometry,
};

/// When reads refresh the access time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AtimePolicy {
    Strict,
    /// Only when atime is not newer than mtime, or is over an hour old
    Relative,
    Off,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LfsConfig {
    pub block_size: u32,
    pub blocks_per_segment: u32,
    pub segment_count: u32,
    pub max_inodes: u32,

    pub cache_bytes: usize,
    pub blocks_per_cacheline: usize,

    /// Fewest segments a normal collection cleans
    pub gc_min_segments: usize,
    /// Segments below this share of live blocks are always cleaned
    pub gc_utilization_threshold: f64,
    /// Share of used segments that starts a normal collection
    pub gc_normal_trigger: f64,
    /// Share of used segments that starts a thorough collection
    pub gc_thorough_trigger: f64,
    pub auto_gc: bool,

    pub check_permissions: bool,
    pub atime: AtimePolicy,
    pub root_mode: u32,
}

impl Default for LfsConfig {
    fn default() -> Self {
        let geo = Geometry::default();
        Self {
            block_size: geo.block_size,
            blocks_per_segment: geo.blocks_per_segment,
            segment_count: geo.segment_count,
            max_inodes: geo.max_inodes,
            cache_bytes: 4 * 1024 * 1024,
            blocks_per_cacheline: 8,
            gc_min_segments: 4,
            gc_utilization_threshold: 0.5,
            gc_normal_trigger: 0.8,
            gc_thorough_trigger: 0.96,
            auto_gc: true,
            check_permissions: true,
            atime: AtimePolicy::Strict,
            root_mode: 0o755,
        }
    }
}

impl LfsConfig {
    pub fn from_json(text: &str) -> LfsResult<Self> {
        let config: Self = serde_json::from_str(text).map_err(|e| {
            warn!("bad lfs config: {}", e);
            LfsError::InvalidArgument
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> LfsResult<String> {
        serde_json::to_string(self).map_err(|_| LfsError::InvalidArgument)
    }

    pub fn geometry(&self) -> Geometry {
        Geometry {
            block_size: self.block_size,
            blocks_per_segment: self.blocks_per_segment,
            segment_count: self.segment_count,
            max_inodes: self.max_inodes,
        }
    }

    pub fn with_geometry(mut self, geo: Geometry) -> Self {
        self.block_size = geo.block_size;
        self.blocks_per_segment = geo.blocks_per_segment;
        self.segment_count = geo.segment_count;
        self.max_inodes = geo.max_inodes;
        self
    }

    pub fn validate(&self) -> LfsResult<()> {
        let geo = self.geometry();
        geo.validate()?;
        let line = self.blocks_per_cacheline;
        if line == 0 || geo.blocks_per_segment as usize % line != 0 {
            return Err(LfsError::InvalidArgument);
        }
        if self.cache_bytes < geo.segment_size() {
            return Err(LfsError::InvalidArgument);
        }
        let ratios = [
            self.gc_utilization_threshold,
            self.gc_normal_trigger,
            self.gc_thorough_trigger,
        ];
        if ratios.iter().any(|r| !(0.0..=1.0).contains(r)) || self.gc_min_segments == 0 {
            return Err(LfsError::InvalidArgument);
        }
        Ok(())
    }
}
