use std::f64::consts::FRAC_PI_2;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::LoopbackError;

/// Shape applied to loop progress before interpolating between the original
/// and final denoising strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DenoiseCurve {
    /// Moves toward the final strength early, then flattens.
    Aggressive,
    #[default]
    Linear,
    /// Stays near the original strength, then accelerates late.
    Lazy,
}

impl DenoiseCurve {
    pub const ALL: [DenoiseCurve; 3] = [Self::Aggressive, Self::Linear, Self::Lazy];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Aggressive => "Aggressive",
            Self::Linear => "Linear",
            Self::Lazy => "Lazy",
        }
    }

    /// `f(p)` for progress `p` in `[0, 1]`. `f(0) == 0` and `f(1) == 1` for every curve.
    pub fn factor(&self, progress: f64) -> f64 {
        match self {
            Self::Aggressive => (progress * FRAC_PI_2).sin(),
            Self::Linear => progress,
            Self::Lazy => 1.0 - (progress * FRAC_PI_2).cos(),
        }
    }

    /// Denoising strength for the zero-based `iteration` of a run of `total_loops`.
    pub fn strength(
        &self,
        iteration: u32,
        total_loops: u32,
        original_strength: f64,
        final_strength: f64,
    ) -> f64 {
        let progress = progress(iteration, total_loops);
        if progress >= 1.0 {
            return final_strength;
        }
        original_strength + (final_strength - original_strength) * self.factor(progress)
    }
}

/// `iteration / max(total_loops - 1, 1)`; a single-loop run stays at 0.
pub fn progress(iteration: u32, total_loops: u32) -> f64 {
    let span = total_loops.saturating_sub(1).max(1);
    iteration as f64 / span as f64
}

impl fmt::Display for DenoiseCurve {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DenoiseCurve {
    type Err = LoopbackError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|curve| curve.name().to_ascii_lowercase() == normalized)
            .ok_or_else(|| LoopbackError::UnknownCurve(raw.to_string()))
    }
}

impl TryFrom<String> for DenoiseCurve {
    type Error = LoopbackError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DenoiseCurve> for String {
    fn from(value: DenoiseCurve) -> Self {
        value.name().to_string()
    }
}
