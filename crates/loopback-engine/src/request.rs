use image::{DynamicImage, GenericImageView, Rgb, RgbImage};
use indexmap::IndexMap;
use serde_json::Value;

/// Seed sent with a synthesis call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Seed {
    Fixed(i64),
    /// Let the backend draw a fresh seed (`-1` on the wire).
    Randomize,
}

impl Seed {
    pub fn as_wire(&self) -> i64 {
        match self {
            Self::Fixed(seed) => *seed,
            Self::Randomize => -1,
        }
    }
}

/// How masked regions are initialised before img2img.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InpaintingFill {
    #[default]
    Fill,
    /// Keep the original content under the mask.
    Original,
    LatentNoise,
    LatentNothing,
}

impl InpaintingFill {
    pub fn as_wire(&self) -> u8 {
        match self {
            Self::Fill => 0,
            Self::Original => 1,
            Self::LatentNoise => 2,
            Self::LatentNothing => 3,
        }
    }
}

/// Color statistics of a reference image, used to pull later iterations back
/// toward the palette of the starting image.
#[derive(Debug, Clone, PartialEq)]
pub struct ColorCorrection {
    pub mean: [f64; 3],
    pub std_dev: [f64; 3],
}

impl ColorCorrection {
    pub fn from_image(image: &DynamicImage) -> Self {
        let rgb = image.to_rgb8();
        let count = (rgb.width() as f64 * rgb.height() as f64).max(1.0);
        let mut sum = [0f64; 3];
        let mut sum_sq = [0f64; 3];
        for pixel in rgb.pixels() {
            for channel in 0..3 {
                let value = pixel[channel] as f64;
                sum[channel] += value;
                sum_sq[channel] += value * value;
            }
        }
        let mut mean = [0f64; 3];
        let mut std_dev = [0f64; 3];
        for channel in 0..3 {
            mean[channel] = sum[channel] / count;
            std_dev[channel] = (sum_sq[channel] / count - mean[channel].powi(2))
                .max(0.0)
                .sqrt();
        }
        Self { mean, std_dev }
    }

    /// Shifts each channel of `image` so its mean and spread match this reference.
    pub fn apply(&self, image: &mut RgbImage) {
        let current = Self::from_image(&DynamicImage::ImageRgb8(image.clone()));
        for pixel in image.pixels_mut() {
            let corrected: [u8; 3] = std::array::from_fn(|channel| {
                let value = pixel[channel] as f64 - current.mean[channel];
                let scaled = if current.std_dev[channel] > f64::EPSILON {
                    value / current.std_dev[channel] * self.std_dev[channel]
                } else {
                    value
                };
                (scaled + self.mean[channel]).round().clamp(0.0, 255.0) as u8
            });
            *pixel = Rgb(corrected);
        }
    }
}

/// Mutable img2img request threaded through every loop iteration.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,
    pub denoising_strength: f64,
    pub seed: Seed,
    pub init_images: Vec<DynamicImage>,
    pub batch_size: u32,
    pub n_iter: u32,
    pub color_corrections: Vec<ColorCorrection>,
    pub inpainting_fill: InpaintingFill,
    pub extra_generation_params: IndexMap<String, Value>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, init_image: DynamicImage, denoising_strength: f64) -> Self {
        Self {
            prompt: prompt.into(),
            denoising_strength,
            seed: Seed::Randomize,
            init_images: vec![init_image],
            batch_size: 1,
            n_iter: 1,
            color_corrections: Vec::new(),
            inpainting_fill: InpaintingFill::default(),
            extra_generation_params: IndexMap::new(),
        }
    }

    pub fn with_seed(mut self, seed: Seed) -> Self {
        self.seed = seed;
        self
    }

    /// Freezes a randomize seed to a concrete value so the first iteration is reproducible.
    pub fn fix_seed(&mut self) -> i64 {
        if let Seed::Fixed(seed) = self.seed {
            return seed;
        }
        let seed = i64::from(rand::random::<u32>());
        self.seed = Seed::Fixed(seed);
        seed
    }

    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.init_images.first().map(|image| image.dimensions())
    }
}

#[cfg(test)]
mod tests {
    use image::{DynamicImage, Rgb, RgbImage};

    use super::{ColorCorrection, GenerationRequest, Seed};

    #[test]
    fn fix_seed_freezes_randomize_once() {
        let mut request = GenerationRequest::new("a cat", DynamicImage::new_rgb8(4, 4), 0.5);
        let seed = request.fix_seed();
        assert_eq!(request.seed, Seed::Fixed(seed));
        assert_eq!(request.fix_seed(), seed);
    }

    #[test]
    fn fix_seed_keeps_explicit_seed() {
        let mut request = GenerationRequest::new("a cat", DynamicImage::new_rgb8(4, 4), 0.5)
            .with_seed(Seed::Fixed(42));
        assert_eq!(request.fix_seed(), 42);
        assert_eq!(Seed::Randomize.as_wire(), -1);
    }

    #[test]
    fn color_correction_measures_channels() {
        let mut image = RgbImage::new(2, 1);
        image.put_pixel(0, 0, Rgb([0, 100, 200]));
        image.put_pixel(1, 0, Rgb([100, 100, 200]));
        let stats = ColorCorrection::from_image(&DynamicImage::ImageRgb8(image));
        assert_eq!(stats.mean, [50.0, 100.0, 200.0]);
        assert_eq!(stats.std_dev, [50.0, 0.0, 0.0]);
    }

    #[test]
    fn color_correction_pulls_image_toward_reference() {
        let mut reference = RgbImage::new(2, 1);
        reference.put_pixel(0, 0, Rgb([100, 0, 40]));
        reference.put_pixel(1, 0, Rgb([200, 0, 40]));
        let stats = ColorCorrection::from_image(&DynamicImage::ImageRgb8(reference));

        let mut drifted = RgbImage::new(2, 1);
        drifted.put_pixel(0, 0, Rgb([10, 90, 200]));
        drifted.put_pixel(1, 0, Rgb([30, 90, 200]));
        stats.apply(&mut drifted);
        assert_eq!(drifted.get_pixel(0, 0).0, [100, 0, 40]);
        assert_eq!(drifted.get_pixel(1, 0).0, [200, 0, 40]);
    }
}
