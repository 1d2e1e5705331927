use crate::pressure::PressureLevel;
use serde::{Deserialize, Serialize};

/// Policy for producers that fill pools in the background (prefetchers,
/// texture streamers, mesh decoders).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackgroundWorkMode {
    Full,
    /// Smaller batches, fewer in-flight loads.
    Reduced,
    /// Only on-demand work.
    Paused,
}

/// Feature throttles subscribers should apply at a given pressure level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DegradedSettings {
    /// Optional rendering features (extra effects, high-detail variants).
    pub optional_features_enabled: bool,
    pub background_work: BackgroundWorkMode,
}

impl DegradedSettings {
    pub fn for_level(level: PressureLevel) -> Self {
        match level {
            PressureLevel::Normal => Self {
                optional_features_enabled: true,
                background_work: BackgroundWorkMode::Full,
            },
            PressureLevel::Warning => Self {
                optional_features_enabled: true,
                background_work: BackgroundWorkMode::Reduced,
            },
            PressureLevel::Critical => Self {
                optional_features_enabled: false,
                background_work: BackgroundWorkMode::Reduced,
            },
            PressureLevel::Emergency => Self {
                optional_features_enabled: false,
                background_work: BackgroundWorkMode::Paused,
            },
        }
    }
}
