//! Predefined pool declarations.

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::validation;

/// Buffer layout family of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PoolKind {
    /// Unsegmented raw data buffers.
    #[default]
    Buffer,
    /// Segmented packet buffers with headroom and tailroom.
    Packet,
    /// Timer events; data area is optional.
    Timeout,
}

/// One pool created together with the runtime context.
#[derive(Debug, Serialize, Deserialize, Validate, Clone)]
pub struct PoolConfig {
    /// Unique pool name.
    #[validate(custom(function = validation::validate_name))]
    pub name: String,

    #[serde(default)]
    pub kind: PoolKind,

    /// Number of buffer slots in the arena.
    #[validate(range(min = 1, max = 16777216))]
    pub capacity: usize,

    /// Data bytes per slot (per segment for packet pools).
    #[serde(default = "default_seg_size")]
    #[validate(range(max = 65536))]
    pub seg_size: usize,

    /// Reserved bytes in front of packet data.
    #[serde(default = "default_headroom")]
    #[validate(range(max = 1024))]
    pub headroom: usize,

    /// Reserved bytes behind packet data.
    #[serde(default = "default_tailroom")]
    #[validate(range(max = 1024))]
    pub tailroom: usize,

    /// Clear buffer data when it is freed.
    #[serde(default)]
    pub zeroize: bool,

    /// Per-buffer user metadata area (bytes).
    #[serde(default)]
    #[validate(range(max = 4096))]
    pub uarea_size: usize,
}

fn default_seg_size() -> usize {
    1856
}

fn default_headroom() -> usize {
    64
}

fn default_tailroom() -> usize {
    8
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "packets".into(),
            kind: PoolKind::Packet,
            capacity: 1024,
            seg_size: default_seg_size(),
            headroom: default_headroom(),
            tailroom: default_tailroom(),
            zeroize: false,
            uarea_size: 0,
        }
    }
}
