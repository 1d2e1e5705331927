use crate::error::MemoryError;
use crate::sampler::UsageReading;
use serde::{Deserialize, Serialize};

/// Coarse-grained memory pressure levels, totally ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PressureLevel {
    Normal,
    Warning,
    Critical,
    Emergency,
}

impl PressureLevel {
    pub const ALL: [PressureLevel; 4] = [
        PressureLevel::Normal,
        PressureLevel::Warning,
        PressureLevel::Critical,
        PressureLevel::Emergency,
    ];

    pub fn is_elevated(self) -> bool {
        self > PressureLevel::Normal
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PressureLevel::Normal => "normal",
            PressureLevel::Warning => "warning",
            PressureLevel::Critical => "critical",
            PressureLevel::Emergency => "emergency",
        }
    }
}

impl std::fmt::Display for PressureLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How activation thresholds were expressed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "scheme")]
pub enum ThresholdScheme {
    PercentageOfBudget { max_budget_bytes: u64 },
    AbsoluteBytes,
}

/// Activation point for one pressure level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LevelThreshold {
    pub level: PressureLevel,
    /// Enter `level` when `resident_bytes >= bytes`.
    pub bytes: u64,
    /// Fraction of the budget this threshold was derived from, if any.
    pub fraction: Option<f64>,
}

/// Ordered activation thresholds for every level above `Normal`.
///
/// Thresholds are resolved to bytes at construction and are strictly
/// increasing with level. `Normal` has no threshold (it is the floor) and a
/// `Critical` threshold is always present.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PressureThresholds {
    scheme: ThresholdScheme,
    levels: Vec<LevelThreshold>,
}

impl PressureThresholds {
    /// Thresholds expressed as fractions of `max_budget_bytes`.
    pub fn percentage(
        max_budget_bytes: u64,
        fractions: &[(PressureLevel, f64)],
    ) -> Result<Self, MemoryError> {
        if max_budget_bytes == 0 {
            return Err(MemoryError::InvalidThresholds(
                "max budget must be greater than zero".into(),
            ));
        }

        let mut levels = Vec::with_capacity(fractions.len());
        for &(level, fraction) in fractions {
            if !fraction.is_finite() || fraction <= 0.0 {
                return Err(MemoryError::InvalidThresholds(format!(
                    "{level} fraction must be a positive number, got {fraction}"
                )));
            }
            levels.push(LevelThreshold {
                level,
                bytes: (fraction * max_budget_bytes as f64).round() as u64,
                fraction: Some(fraction),
            });
        }

        Self::validated(
            ThresholdScheme::PercentageOfBudget { max_budget_bytes },
            levels,
        )
    }

    /// Thresholds expressed as absolute resident byte counts.
    pub fn absolute(bytes: &[(PressureLevel, u64)]) -> Result<Self, MemoryError> {
        let levels = bytes
            .iter()
            .map(|&(level, bytes)| LevelThreshold {
                level,
                bytes,
                fraction: None,
            })
            .collect();
        Self::validated(ThresholdScheme::AbsoluteBytes, levels)
    }

    fn validated(
        scheme: ThresholdScheme,
        mut levels: Vec<LevelThreshold>,
    ) -> Result<Self, MemoryError> {
        levels.sort_by_key(|threshold| threshold.level);

        if levels.iter().any(|t| t.level == PressureLevel::Normal) {
            return Err(MemoryError::InvalidThresholds(
                "normal is the baseline level and takes no threshold".into(),
            ));
        }
        if !levels.iter().any(|t| t.level == PressureLevel::Critical) {
            return Err(MemoryError::InvalidThresholds(
                "a critical threshold is required".into(),
            ));
        }
        for pair in levels.windows(2) {
            let (lower, upper) = (pair[0], pair[1]);
            if lower.level == upper.level {
                return Err(MemoryError::InvalidThresholds(format!(
                    "duplicate threshold for {}",
                    lower.level
                )));
            }
            if lower.bytes >= upper.bytes {
                return Err(MemoryError::InvalidThresholds(format!(
                    "{} threshold ({} bytes) must be below {} threshold ({} bytes)",
                    lower.level, lower.bytes, upper.level, upper.bytes
                )));
            }
        }

        Ok(Self { scheme, levels })
    }

    pub fn scheme(&self) -> ThresholdScheme {
        self.scheme
    }

    /// Thresholds in ascending level order.
    pub fn levels(&self) -> &[LevelThreshold] {
        &self.levels
    }

    pub fn threshold_bytes(&self, level: PressureLevel) -> Option<u64> {
        self.levels
            .iter()
            .find(|threshold| threshold.level == level)
            .map(|threshold| threshold.bytes)
    }

    /// The top configured level and its activation point.
    pub fn highest(&self) -> LevelThreshold {
        // Non-empty: `validated` requires a critical threshold.
        self.levels[self.levels.len() - 1]
    }

    pub fn level_for_bytes(&self, resident_bytes: u64) -> PressureLevel {
        self.levels
            .iter()
            .rev()
            .find(|threshold| resident_bytes >= threshold.bytes)
            .map(|threshold| threshold.level)
            .unwrap_or(PressureLevel::Normal)
    }

    pub fn classify(&self, reading: &UsageReading) -> PressureLevel {
        self.level_for_bytes(reading.resident_bytes)
    }
}

impl Default for PressureThresholds {
    fn default() -> Self {
        Self {
            scheme: ThresholdScheme::PercentageOfBudget {
                max_budget_bytes: crate::GB,
            },
            levels: [
                (PressureLevel::Warning, 0.70),
                (PressureLevel::Critical, 0.85),
                (PressureLevel::Emergency, 0.95),
            ]
            .into_iter()
            .map(|(level, fraction)| LevelThreshold {
                level,
                bytes: (fraction * crate::GB as f64).round() as u64,
                fraction: Some(fraction),
            })
            .collect(),
        }
    }
}

/// Maps readings to levels. Stateless: the last-seen level belongs to the
/// orchestrator.
#[derive(Debug, Clone)]
pub struct PressureClassifier {
    thresholds: PressureThresholds,
}

impl PressureClassifier {
    pub fn new(thresholds: PressureThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &PressureThresholds {
        &self.thresholds
    }

    pub fn classify(&self, reading: &UsageReading) -> PressureLevel {
        classify(reading, &self.thresholds)
    }
}

/// Highest level whose activation threshold `reading` meets.
pub fn classify(reading: &UsageReading, thresholds: &PressureThresholds) -> PressureLevel {
    thresholds.classify(reading)
}

/// `Some((previous, current))` iff the level changed.
pub fn detect_transition(
    previous: PressureLevel,
    current: PressureLevel,
) -> Option<(PressureLevel, PressureLevel)> {
    (previous != current).then_some((previous, current))
}
