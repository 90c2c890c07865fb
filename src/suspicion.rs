//! Suspicion heuristics layered on top of header validation.
//!
//! Heuristics only run on payloads that were accepted into a frame, so they
//! never mask a hard header error. Each one can be switched off on its own,
//! and the master `enabled` switch turns the whole layer into
//! [`FrameSuspicious::Unchecked`].
//!
//! Configure via environment variable `UVC_INSPECT_FILTER`:
//! - `off`: no heuristics, frames report `unchecked`
//! - `on` (default): master filter on, individual heuristics off
//! - `all`: every heuristic on

use serde::{Deserialize, Serialize};

use crate::error::FrameSuspicious;
use crate::header::PayloadHeader;

/// Differences of at least this much are treated as 32-bit wraparound.
pub const WRAP_GUARD: u32 = 0x8000_0000;

/// Heuristic toggles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Master switch
    pub enabled: bool,
    /// Frame size/payload count irregularity checks at frame close
    pub irregular: bool,
    /// PTS monotonicity
    pub pts_decrease: bool,
    /// SCR source clock monotonicity
    pub stc_decrease: bool,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            irregular: false,
            pts_decrease: false,
            stc_decrease: false,
        }
    }
}

impl FilterConfig {
    /// Every heuristic enabled.
    pub fn all() -> Self {
        Self {
            enabled: true,
            irregular: true,
            pts_decrease: true,
            stc_decrease: true,
        }
    }

    /// Heuristics disabled entirely.
    pub fn off() -> Self {
        Self {
            enabled: false,
            irregular: false,
            pts_decrease: false,
            stc_decrease: false,
        }
    }

    /// Parse from an environment variable string.
    ///
    /// Accepts "off", "on", "all" (case-insensitive).
    /// Unknown values fall back to the default with a warning.
    pub fn from_env_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "off" | "none" | "0" => Self::off(),
            "on" | "default" | "1" => Self::default(),
            "all" | "strict" => Self::all(),
            _ => {
                log::warn!("Unknown filter setting '{}', using default", s);
                Self::default()
            }
        }
    }

    /// Read `UVC_INSPECT_FILTER`, falling back to the default.
    pub fn from_env() -> Self {
        std::env::var("UVC_INSPECT_FILTER")
            .map(|v| Self::from_env_str(&v))
            .unwrap_or_default()
    }
}

/// `cur` is a real decrease from `prev`, not a 32-bit wraparound.
///
/// Zero on either side means the value was absent.
pub fn is_decrease(prev: u32, cur: u32) -> bool {
    prev != 0 && cur != 0 && cur < prev && prev - cur < WRAP_GUARD
}

/// Run the per-payload heuristics for an accepted payload.
pub fn check_payload(
    cur: &PayloadHeader,
    prev: &PayloadHeader,
    filter: &FilterConfig,
) -> FrameSuspicious {
    if !filter.enabled {
        return FrameSuspicious::Unchecked;
    }

    if filter.pts_decrease && is_decrease(prev.pts, cur.pts) {
        log::debug!("PTS decreased: 0x{:08x} -> 0x{:08x}", prev.pts, cur.pts);
        return FrameSuspicious::PtsDecrease;
    }

    if filter.stc_decrease && is_decrease(prev.stc(), cur.stc()) {
        log::debug!("STC decreased: 0x{:08x} -> 0x{:08x}", prev.stc(), cur.stc());
        return FrameSuspicious::StcDecrease;
    }

    FrameSuspicious::None
}
