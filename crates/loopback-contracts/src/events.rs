use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

/// Event types a loopback run writes, in the order they can occur.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopEvent {
    LoopStarted,
    PromptScheduleParsed,
    PromptScheduleMalformed,
    IterationStarted,
    TagFailed,
    IterationFinished,
    IterationFailed,
    LoopInterrupted,
    GridCreated,
    LoopFinished,
}

impl LoopEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::LoopStarted => "loop_started",
            Self::PromptScheduleParsed => "prompt_schedule_parsed",
            Self::PromptScheduleMalformed => "prompt_schedule_malformed",
            Self::IterationStarted => "iteration_started",
            Self::TagFailed => "tag_failed",
            Self::IterationFinished => "iteration_finished",
            Self::IterationFailed => "iteration_failed",
            Self::LoopInterrupted => "loop_interrupted",
            Self::GridCreated => "grid_created",
            Self::LoopFinished => "loop_finished",
        }
    }
}

/// Append-only writer for `events.jsonl`.
///
/// Every line is one compact JSON object carrying `type`, `run_id` and `ts`;
/// the caller payload is merged last and may override them.
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<EventWriterInner>,
}

#[derive(Debug)]
struct EventWriterInner {
    path: PathBuf,
    run_id: String,
    lock: Mutex<()>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, run_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventWriterInner {
                path: path.into(),
                run_id: run_id.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    pub fn emit(&self, event: LoopEvent, payload: EventPayload) -> anyhow::Result<Value> {
        let mut record = Map::new();
        record.insert("type".to_string(), Value::String(event.name().to_string()));
        record.insert(
            "run_id".to_string(),
            Value::String(self.inner.run_id.clone()),
        );
        record.insert("ts".to_string(), Value::String(now_utc_iso()));
        for (key, value) in payload {
            record.insert(key, value);
        }

        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let line = serde_json::to_string(&record)?;
        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event writer lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(record))
    }
}

pub fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::DateTime;

    use super::*;

    #[test]
    fn emit_writes_compact_jsonl_line() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let writer = EventWriter::new(&path, "run-123");

        let mut payload = EventPayload::new();
        payload.insert("loops".to_string(), Value::from(12));
        let emitted = writer.emit(LoopEvent::LoopStarted, payload)?;

        let content = fs::read_to_string(&path)?;
        let line = content.lines().next().unwrap_or("");
        assert!(!line.contains('\n'));
        let parsed: Value = serde_json::from_str(line)?;

        assert_eq!(parsed, emitted);
        assert_eq!(parsed["type"], Value::String("loop_started".to_string()));
        assert_eq!(parsed["run_id"], Value::String("run-123".to_string()));
        assert_eq!(parsed["loops"], Value::from(12));

        let ts = parsed["ts"].as_str().unwrap_or("");
        DateTime::parse_from_rfc3339(ts)?;
        Ok(())
    }

    #[test]
    fn payload_can_override_default_keys() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let writer = EventWriter::new(temp.path().join("events.jsonl"), "run-123");

        let mut payload = EventPayload::new();
        payload.insert(
            "run_id".to_string(),
            Value::String("override-run".to_string()),
        );
        let emitted = writer.emit(LoopEvent::IterationStarted, payload)?;

        assert_eq!(emitted["type"], Value::String("iteration_started".to_string()));
        assert_eq!(emitted["run_id"], Value::String("override-run".to_string()));
        Ok(())
    }

    #[test]
    fn emit_appends_lines_and_creates_parent() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("nested").join("events.jsonl");
        let writer = EventWriter::new(&path, "run-123");

        writer.emit(LoopEvent::IterationFinished, EventPayload::new())?;
        writer.emit(LoopEvent::LoopFinished, EventPayload::new())?;

        let content = fs::read_to_string(&path)?;
        let types: Vec<String> = content
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter_map(|row| row.get("type").and_then(Value::as_str).map(str::to_string))
            .collect();
        assert_eq!(types, vec!["iteration_finished", "loop_finished"]);
        Ok(())
    }
}
