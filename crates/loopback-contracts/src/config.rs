use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::curve::DenoiseCurve;
use crate::error::LoopbackError;

pub const MIN_LOOPS: u32 = 1;
pub const MAX_LOOPS: u32 = 4000;

/// Options recognized by the loopback run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    pub loops: u32,
    pub final_denoising_strength: f64,
    pub denoise_curve: DenoiseCurve,
    pub append_mode: AppendMode,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            loops: 1200,
            final_denoising_strength: 0.5,
            denoise_curve: DenoiseCurve::Linear,
            append_mode: AppendMode::None,
        }
    }
}

impl LoopConfig {
    /// Reads a JSON config file; missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self, LoopbackError> {
        let raw = std::fs::read_to_string(path)?;
        let config: LoopConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), LoopbackError> {
        if !(MIN_LOOPS..=MAX_LOOPS).contains(&self.loops) {
            return Err(LoopbackError::InvalidConfig(format!(
                "loops must be within {MIN_LOOPS}..={MAX_LOOPS}, got {}",
                self.loops
            )));
        }
        if !(0.0..=1.0).contains(&self.final_denoising_strength) {
            return Err(LoopbackError::InvalidConfig(format!(
                "final_denoising_strength must be within 0..=1, got {}",
                self.final_denoising_strength
            )));
        }
        Ok(())
    }
}

/// Which tagger, if any, appends descriptive tags of the previous image to the prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AppendMode {
    #[default]
    None,
    /// General visual-description interrogator.
    Clip,
    /// Anime/illustration tagger.
    DeepBooru,
}

impl AppendMode {
    pub const ALL: [AppendMode; 3] = [Self::None, Self::Clip, Self::DeepBooru];

    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Clip => "CLIP",
            Self::DeepBooru => "DeepBooru",
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, Self::None)
    }
}

impl fmt::Display for AppendMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AppendMode {
    type Err = LoopbackError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|mode| mode.name().to_ascii_lowercase() == normalized)
            .ok_or_else(|| LoopbackError::UnknownAppendMode(raw.to_string()))
    }
}

impl TryFrom<String> for AppendMode {
    type Error = LoopbackError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AppendMode> for String {
    fn from(value: AppendMode) -> Self {
        value.name().to_string()
    }
}

/// Grid settings normally held as global options by the host application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridOptions {
    /// Persist the composite grid through the image sink.
    pub save: bool,
    /// Prepend the composite grid to the returned images.
    pub return_grid: bool,
    pub format: String,
    pub rows: u32,
}

impl Default for GridOptions {
    fn default() -> Self {
        Self {
            save: true,
            return_grid: true,
            format: "png".to_string(),
            rows: 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SharedOptions {
    /// Compute one color-correction reference from the first input image and
    /// attach it to every iteration.
    pub color_correction: bool,
    pub grid: GridOptions,
}
