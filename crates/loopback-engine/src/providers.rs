use std::collections::BTreeMap;
use std::env;
use std::io::Cursor;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::request::{GenerationRequest, Seed};

pub const DEFAULT_WEBUI_BASE: &str = "http://127.0.0.1:7860";
const DRYRUN_DEFAULT_SIZE: (u32, u32) = (512, 512);

/// What one synthesis call returns.
#[derive(Debug, Clone)]
pub struct SynthesisOutcome {
    pub images: Vec<DynamicImage>,
    pub seed: i64,
    /// Opaque generation metadata, usually JSON text.
    pub info: String,
}

/// The image synthesis backend. Calls are blocking and may take a long time.
pub trait SynthesisProvider: Send + Sync {
    fn name(&self) -> &str;
    fn process(&self, request: &GenerationRequest) -> Result<SynthesisOutcome>;
}

#[derive(Default)]
pub struct SynthesisProviderRegistry {
    providers: BTreeMap<String, Box<dyn SynthesisProvider>>,
}

impl SynthesisProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: SynthesisProvider + 'static>(&mut self, provider: P) {
        self.providers
            .insert(provider.name().to_string(), Box::new(provider));
    }

    pub fn get(&self, name: &str) -> Option<&dyn SynthesisProvider> {
        self.providers.get(name).map(|provider| provider.as_ref())
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}

pub fn default_provider_registry() -> SynthesisProviderRegistry {
    let mut providers = SynthesisProviderRegistry::new();
    providers.register(DryrunProvider);
    providers.register(WebUiProvider::new());
    providers
}

/// Offline backend: blends the input toward a color derived from prompt and
/// seed, proportionally to the denoising strength.
pub struct DryrunProvider;

impl SynthesisProvider for DryrunProvider {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn process(&self, request: &GenerationRequest) -> Result<SynthesisOutcome> {
        let seed = match request.seed {
            Seed::Fixed(seed) => seed,
            Seed::Randomize => i64::from(rand::random::<u32>()),
        };
        let (width, height) = request.dimensions().unwrap_or(DRYRUN_DEFAULT_SIZE);
        let target = color_from_prompt(&request.prompt, seed);
        let strength = request.denoising_strength.clamp(0.0, 1.0);
        let base = request
            .init_images
            .first()
            .map(DynamicImage::to_rgb8)
            .unwrap_or_else(|| RgbImage::new(width, height));

        let mut images = Vec::new();
        for _ in 0..request.batch_size.max(1) {
            let mut out = base.clone();
            for pixel in out.pixels_mut() {
                let blended: [u8; 3] = std::array::from_fn(|channel| {
                    let from = pixel[channel] as f64;
                    let to = target[channel] as f64;
                    (from + (to - from) * strength).round().clamp(0.0, 255.0) as u8
                });
                *pixel = Rgb(blended);
            }
            if let Some(reference) = request.color_corrections.first() {
                reference.apply(&mut out);
            }
            images.push(DynamicImage::ImageRgb8(out));
        }

        let info = json!({
            "prompt": request.prompt,
            "seed": seed,
            "denoising_strength": request.denoising_strength,
            "inpainting_fill": request.inpainting_fill.as_wire(),
            "color_correction": !request.color_corrections.is_empty(),
            "prompt_hash": short_hash(&request.prompt),
            "extra_generation_params": request.extra_generation_params,
        });
        Ok(SynthesisOutcome {
            images,
            seed,
            info: info.to_string(),
        })
    }
}

/// img2img client for a WebUI-compatible HTTP API.
pub struct WebUiProvider {
    api_base: String,
    http: HttpClient,
}

impl WebUiProvider {
    pub fn new() -> Self {
        Self::with_base(webui_base())
    }

    pub fn with_base(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into().trim().trim_end_matches('/').to_string(),
            http: webui_http_client(),
        }
    }

    fn payload(request: &GenerationRequest) -> Result<Value> {
        let init_images = request
            .init_images
            .iter()
            .map(encode_png_base64)
            .collect::<Result<Vec<String>>>()?;
        Ok(json!({
            "prompt": request.prompt,
            "init_images": init_images,
            "denoising_strength": request.denoising_strength,
            "seed": request.seed.as_wire(),
            "batch_size": request.batch_size,
            "n_iter": request.n_iter,
            "inpainting_fill": request.inpainting_fill.as_wire(),
            "override_settings": {
                "img2img_color_correction": !request.color_corrections.is_empty(),
            },
            "override_settings_restore_afterwards": true,
        }))
    }
}

impl Default for WebUiProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl SynthesisProvider for WebUiProvider {
    fn name(&self) -> &str {
        "webui"
    }

    fn process(&self, request: &GenerationRequest) -> Result<SynthesisOutcome> {
        let endpoint = format!("{}/sdapi/v1/img2img", self.api_base);
        let payload = Self::payload(request)?;
        let response = self
            .http
            .post(&endpoint)
            .json(&payload)
            .send()
            .with_context(|| format!("webui img2img request to {endpoint} failed"))?;
        let body = response_json_or_error("webui", response)?;

        let images = body
            .get("images")
            .and_then(Value::as_array)
            .ok_or_else(|| anyhow!("webui img2img response missing images"))?
            .iter()
            .filter_map(Value::as_str)
            .map(decode_image_base64)
            .collect::<Result<Vec<DynamicImage>>>()?;
        let info = body
            .get("info")
            .and_then(Value::as_str)
            .unwrap_or("{}")
            .to_string();
        let seed = serde_json::from_str::<Value>(&info)
            .ok()
            .and_then(|parsed| parsed.get("seed").and_then(Value::as_i64))
            .unwrap_or_else(|| request.seed.as_wire());

        Ok(SynthesisOutcome { images, seed, info })
    }
}

pub(crate) fn webui_base() -> String {
    env::var("LOOPBACK_WEBUI_BASE")
        .ok()
        .map(|value| value.trim().trim_end_matches('/').to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_WEBUI_BASE.to_string())
}

pub(crate) fn webui_http_client() -> HttpClient {
    HttpClient::builder()
        .timeout(Duration::from_secs(600))
        .build()
        .unwrap_or_else(|_| HttpClient::new())
}

pub(crate) fn encode_png_base64(image: &DynamicImage) -> Result<String> {
    let mut bytes = Cursor::new(Vec::new());
    image
        .write_to(&mut bytes, ImageFormat::Png)
        .context("png encode failed")?;
    Ok(BASE64.encode(bytes.into_inner()))
}

pub(crate) fn decode_image_base64(raw: &str) -> Result<DynamicImage> {
    let data = raw
        .split_once("base64,")
        .map(|(_, data)| data)
        .unwrap_or(raw)
        .trim();
    let bytes = BASE64
        .decode(data.as_bytes())
        .context("image base64 decode failed")?;
    image::load_from_memory(&bytes).context("image decode failed")
}

pub(crate) fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{provider} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{provider} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{provider} returned invalid JSON payload"))?;
    Ok(parsed)
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn color_from_prompt(prompt: &str, seed: i64) -> [u8; 3] {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update(seed.to_be_bytes());
    let digest = hasher.finalize();
    [digest[0], digest[1], digest[2]]
}

fn short_hash(prompt: &str) -> String {
    let digest = Sha256::digest(prompt.as_bytes());
    hex::encode(&digest[..4])
}

#[cfg(test)]
mod tests {
    use image::{DynamicImage, GenericImageView, Rgb, RgbImage};
    use serde_json::Value;

    use super::{
        color_from_prompt, decode_image_base64, default_provider_registry, encode_png_base64,
        DryrunProvider, SynthesisProvider, WebUiProvider,
    };
    use crate::request::{ColorCorrection, GenerationRequest, InpaintingFill, Seed};

    fn solid(width: u32, height: u32, rgb: [u8; 3]) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb(rgb)))
    }

    #[test]
    fn registry_lists_builtin_providers() {
        let registry = default_provider_registry();
        assert_eq!(registry.names(), vec!["dryrun", "webui"]);
        assert!(registry.get("dryrun").is_some());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn dryrun_is_deterministic_for_fixed_seed() -> anyhow::Result<()> {
        let request = GenerationRequest::new("boat", solid(8, 6, [10, 20, 30]), 1.0)
            .with_seed(Seed::Fixed(9));
        let first = DryrunProvider.process(&request)?;
        let second = DryrunProvider.process(&request)?;
        assert_eq!(first.seed, 9);
        assert_eq!(first.images.len(), 1);
        assert_eq!(first.images[0].dimensions(), (8, 6));
        assert_eq!(first.images[0].to_rgb8(), second.images[0].to_rgb8());

        let target = color_from_prompt("boat", 9);
        assert_eq!(first.images[0].to_rgb8().get_pixel(0, 0).0, target);
        Ok(())
    }

    #[test]
    fn dryrun_zero_strength_keeps_input() -> anyhow::Result<()> {
        let request = GenerationRequest::new("boat", solid(4, 4, [10, 20, 30]), 0.0)
            .with_seed(Seed::Fixed(1));
        let outcome = DryrunProvider.process(&request)?;
        assert_eq!(outcome.images[0].to_rgb8().get_pixel(3, 3).0, [10, 20, 30]);
        Ok(())
    }

    #[test]
    fn dryrun_info_reports_request_fields() -> anyhow::Result<()> {
        let mut request = GenerationRequest::new("boat", solid(4, 4, [0, 0, 0]), 0.3)
            .with_seed(Seed::Randomize);
        request.inpainting_fill = InpaintingFill::Original;
        let outcome = DryrunProvider.process(&request)?;
        let info: Value = serde_json::from_str(&outcome.info)?;
        assert_eq!(info["seed"].as_i64(), Some(outcome.seed));
        assert!(outcome.seed >= 0);
        assert_eq!(info["inpainting_fill"], Value::from(1));
        assert_eq!(info["prompt"], Value::from("boat"));
        Ok(())
    }

    #[test]
    fn dryrun_applies_color_reference() -> anyhow::Result<()> {
        let plain_request = GenerationRequest::new("boat", solid(4, 4, [10, 20, 30]), 0.5)
            .with_seed(Seed::Fixed(3));
        let mut corrected_request = plain_request.clone();
        corrected_request.color_corrections = vec![ColorCorrection {
            mean: [250.0, 0.0, 0.0],
            std_dev: [0.0, 0.0, 0.0],
        }];

        let plain = DryrunProvider.process(&plain_request)?;
        let corrected = DryrunProvider.process(&corrected_request)?;
        assert_ne!(plain.images[0].to_rgb8(), corrected.images[0].to_rgb8());
        assert_eq!(corrected.images[0].to_rgb8().get_pixel(2, 2).0, [250, 0, 0]);
        Ok(())
    }

    #[test]
    fn png_base64_survives_encode_decode() -> anyhow::Result<()> {
        let image = solid(3, 2, [200, 100, 50]);
        let encoded = encode_png_base64(&image)?;
        let decoded = decode_image_base64(&format!("data:image/png;base64,{encoded}"))?;
        assert_eq!(decoded.to_rgb8(), image.to_rgb8());
        Ok(())
    }

    #[test]
    fn webui_payload_carries_loop_state() -> anyhow::Result<()> {
        let mut request = GenerationRequest::new("boat", solid(2, 2, [1, 2, 3]), 0.45);
        request.inpainting_fill = InpaintingFill::Original;
        let payload = WebUiProvider::payload(&request)?;
        assert_eq!(payload["seed"], Value::from(-1));
        assert_eq!(payload["denoising_strength"], Value::from(0.45));
        assert_eq!(payload["inpainting_fill"], Value::from(1));
        assert_eq!(payload["init_images"].as_array().map(Vec::len), Some(1));
        assert_eq!(
            payload["override_settings"]["img2img_color_correction"],
            Value::from(false)
        );
        Ok(())
    }
}
