use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::events::now_utc_iso;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: String,
    pub finished_at: String,
    /// `completed` or `interrupted`.
    pub terminal_state: String,
    pub loops: u32,
    pub iterations_completed: u64,
    pub images_returned: u64,
    pub grid_created: bool,
    pub seed: Option<i64>,
    pub extra_generation_params: IndexMap<String, Value>,
}

pub fn write_summary(
    path: &Path,
    summary: &RunSummary,
    extra: Option<&Map<String, Value>>,
) -> anyhow::Result<()> {
    let mut payload = match serde_json::to_value(summary)? {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    payload.insert("ts".to_string(), Value::String(now_utc_iso()));
    if let Some(extra) = extra {
        for (key, value) in extra {
            payload.insert(key.clone(), value.clone());
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&Value::Object(payload))?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;
    use serde_json::{json, Map, Value};

    use super::{write_summary, RunSummary};

    #[test]
    fn write_summary_generates_expected_payload() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("summary.json");

        let mut params = IndexMap::new();
        params.insert("Final Denoising".to_string(), json!(0.5));
        params.insert("Denoise Curve".to_string(), json!("Lazy"));
        let summary = RunSummary {
            run_id: "run-123".to_string(),
            started_at: "2026-02-19T00:00:00+00:00".to_string(),
            finished_at: "2026-02-19T00:10:00+00:00".to_string(),
            terminal_state: "interrupted".to_string(),
            loops: 5,
            iterations_completed: 2,
            images_returned: 3,
            grid_created: true,
            seed: Some(1234),
            extra_generation_params: params,
        };
        let mut extra = Map::new();
        extra.insert("provider".to_string(), Value::String("dryrun".to_string()));
        write_summary(&path, &summary, Some(&extra))?;

        let parsed: Value = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        assert_eq!(parsed["run_id"], json!("run-123"));
        assert_eq!(parsed["terminal_state"], json!("interrupted"));
        assert_eq!(parsed["iterations_completed"], json!(2));
        assert_eq!(parsed["extra_generation_params"]["Denoise Curve"], json!("Lazy"));
        assert_eq!(parsed["provider"], json!("dryrun"));
        assert!(parsed.get("ts").and_then(Value::as_str).is_some());
        Ok(())
    }
}
