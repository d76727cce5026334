use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::events::now_utc_iso;

pub const RECEIPT_SCHEMA_VERSION: u64 = 1;

/// Sidecar metadata written next to every persisted image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageReceipt {
    pub schema_version: u64,
    pub label: String,
    pub prompt: String,
    pub seed: Option<i64>,
    pub format: String,
    pub is_grid: bool,
    pub image_path: String,
    pub created_at: String,
    /// Generation info blob returned by the synthesis backend.
    pub info: Value,
}

impl ImageReceipt {
    pub fn new(
        label: &str,
        prompt: &str,
        seed: Option<i64>,
        format: &str,
        is_grid: bool,
        image_path: &Path,
        info: Option<&str>,
    ) -> Self {
        Self {
            schema_version: RECEIPT_SCHEMA_VERSION,
            label: label.to_string(),
            prompt: prompt.to_string(),
            seed,
            format: format.to_string(),
            is_grid,
            image_path: image_path.to_string_lossy().to_string(),
            created_at: now_utc_iso(),
            info: info.map(parse_info).unwrap_or(Value::Null),
        }
    }
}

/// Info blobs are usually JSON text; anything else is kept verbatim.
fn parse_info(raw: &str) -> Value {
    serde_json::from_str::<Value>(raw)
        .ok()
        .filter(Value::is_object)
        .map(|value| sanitize_payload(&value))
        .unwrap_or_else(|| Value::String(raw.to_string()))
}

pub fn write_receipt(path: &Path, receipt: &ImageReceipt) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(receipt)?)?;
    Ok(())
}

fn sanitize_payload(value: &Value) -> Value {
    match value {
        Value::Array(rows) => Value::Array(rows.iter().map(sanitize_payload).collect()),
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, row) in map {
                let lowered = key.to_ascii_lowercase();
                if matches!(lowered.as_str(), "images" | "init_images" | "image") {
                    out.insert(key.clone(), Value::String("<omitted>".to_string()));
                    continue;
                }
                out.insert(key.clone(), sanitize_payload(row));
            }
            Value::Object(out)
        }
        _ => value.clone(),
    }
}
