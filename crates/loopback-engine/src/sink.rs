use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use image::DynamicImage;
use loopback_contracts::runs::receipts::{write_receipt, ImageReceipt};

/// Everything a sink needs to persist one image.
#[derive(Debug, Clone)]
pub struct SaveRequest<'a> {
    pub destination: &'a Path,
    pub label: &'a str,
    pub seed: Option<i64>,
    pub prompt: &'a str,
    pub format: &'a str,
    pub info: Option<&'a str>,
    pub is_grid: bool,
}

/// Persistence collaborator for produced images.
pub trait ImageSink {
    fn save(&self, image: &DynamicImage, request: &SaveRequest<'_>) -> Result<PathBuf>;
}

/// Writes `NNNNN-<seed>-<label>.<ext>` plus a JSON receipt next to it.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectorySink;

impl ImageSink for DirectorySink {
    fn save(&self, image: &DynamicImage, request: &SaveRequest<'_>) -> Result<PathBuf> {
        fs::create_dir_all(request.destination)
            .with_context(|| format!("failed creating {}", request.destination.display()))?;
        let ext = normalize_extension(request.format);
        let index = next_image_index(request.destination, ext)?;
        let seed = request
            .seed
            .map(|seed| seed.to_string())
            .unwrap_or_else(|| "noseed".to_string());
        let stem = format!("{index:05}-{seed}-{}", request.label);
        let image_path = request.destination.join(format!("{stem}.{ext}"));
        image
            .save(&image_path)
            .with_context(|| format!("failed to save {}", image_path.display()))?;

        let receipt = ImageReceipt::new(
            request.label,
            request.prompt,
            request.seed,
            ext,
            request.is_grid,
            &image_path,
            request.info,
        );
        write_receipt(&request.destination.join(format!("{stem}.json")), &receipt)?;
        log::debug!("saved {}", image_path.display());
        Ok(image_path)
    }
}

fn normalize_extension(format: &str) -> &'static str {
    match format.trim().to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" => "jpg",
        "webp" => "webp",
        "bmp" => "bmp",
        _ => "png",
    }
}

fn next_image_index(dir: &Path, ext: &str) -> Result<usize> {
    let count = fs::read_dir(dir)
        .with_context(|| format!("failed listing {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .path()
                .extension()
                .and_then(|value| value.to_str())
                .map(|value| value == ext)
                .unwrap_or(false)
        })
        .count();
    Ok(count)
}
