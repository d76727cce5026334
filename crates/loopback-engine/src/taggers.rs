use anyhow::{Context, Result};
use image::DynamicImage;
use loopback_contracts::AppendMode;
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Value};

use crate::providers::{encode_png_base64, response_json_or_error, webui_base, webui_http_client};

/// Derives descriptive text tags from an image.
pub trait Tagger: Send + Sync {
    fn name(&self) -> &str;
    fn tag(&self, image: &DynamicImage) -> Result<String>;
}

/// The two tagger variants an append mode can select.
#[derive(Default)]
pub struct TaggerSet {
    general: Option<Box<dyn Tagger>>,
    specialized: Option<Box<dyn Tagger>>,
}

impl TaggerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interrogators served by the WebUI API.
    pub fn webui() -> Self {
        Self::new()
            .with_general(WebUiTagger::new(InterrogateModel::Clip))
            .with_specialized(WebUiTagger::new(InterrogateModel::DeepDanbooru))
    }

    pub fn with_general<T: Tagger + 'static>(mut self, tagger: T) -> Self {
        self.general = Some(Box::new(tagger));
        self
    }

    pub fn with_specialized<T: Tagger + 'static>(mut self, tagger: T) -> Self {
        self.specialized = Some(Box::new(tagger));
        self
    }

    pub fn select(&self, mode: AppendMode) -> Option<&dyn Tagger> {
        match mode {
            AppendMode::None => None,
            AppendMode::Clip => self.general.as_deref(),
            AppendMode::DeepBooru => self.specialized.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterrogateModel {
    Clip,
    DeepDanbooru,
}

impl InterrogateModel {
    fn wire_name(&self) -> &'static str {
        match self {
            Self::Clip => "clip",
            Self::DeepDanbooru => "deepdanbooru",
        }
    }
}

pub struct WebUiTagger {
    api_base: String,
    model: InterrogateModel,
    http: HttpClient,
}

impl WebUiTagger {
    pub fn new(model: InterrogateModel) -> Self {
        Self::with_base(webui_base(), model)
    }

    pub fn with_base(api_base: impl Into<String>, model: InterrogateModel) -> Self {
        Self {
            api_base: api_base.into().trim().trim_end_matches('/').to_string(),
            model,
            http: webui_http_client(),
        }
    }
}

impl Tagger for WebUiTagger {
    fn name(&self) -> &str {
        self.model.wire_name()
    }

    fn tag(&self, image: &DynamicImage) -> Result<String> {
        let endpoint = format!("{}/sdapi/v1/interrogate", self.api_base);
        let payload = json!({
            "image": format!("data:image/png;base64,{}", encode_png_base64(image)?),
            "model": self.model.wire_name(),
        });
        let response = self
            .http
            .post(&endpoint)
            .json(&payload)
            .send()
            .with_context(|| format!("webui interrogate request to {endpoint} failed"))?;
        let body = response_json_or_error("webui", response)?;
        Ok(body
            .get("caption")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default()
            .to_string())
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use image::DynamicImage;
    use loopback_contracts::AppendMode;

    use super::{Tagger, TaggerSet};

    struct Fixed(&'static str);

    impl Tagger for Fixed {
        fn name(&self) -> &str {
            self.0
        }

        fn tag(&self, _image: &DynamicImage) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    #[test]
    fn append_mode_selects_variant() -> Result<()> {
        let taggers = TaggerSet::new()
            .with_general(Fixed("a photo of a cat"))
            .with_specialized(Fixed("1girl, solo"));
        let image = DynamicImage::new_rgb8(1, 1);

        assert!(taggers.select(AppendMode::None).is_none());
        let general = taggers.select(AppendMode::Clip).map(|tagger| tagger.tag(&image));
        assert_eq!(general.transpose()?.as_deref(), Some("a photo of a cat"));
        let special = taggers
            .select(AppendMode::DeepBooru)
            .map(|tagger| tagger.tag(&image));
        assert_eq!(special.transpose()?.as_deref(), Some("1girl, solo"));
        Ok(())
    }

    #[test]
    fn missing_variant_selects_nothing() {
        let taggers = TaggerSet::new().with_general(Fixed("x"));
        assert!(taggers.select(AppendMode::DeepBooru).is_none());
    }
}
