use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::Value;

use crate::error::LoopbackError;

/// How a raw prompt was interpreted when building a schedule.
#[derive(Debug)]
pub enum ScheduleSource {
    /// Plain text; used unchanged for every iteration.
    NotStructured,
    /// A `{"<iteration>": "<prompt>"}` object.
    Structured,
    /// Looked structured but failed to parse; degraded to plain text.
    Malformed(LoopbackError),
}

/// Threshold-indexed prompt table. Threshold `t` applies from iteration `t`
/// (1-based, inclusive) until the next larger threshold.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PromptSchedule {
    entries: IndexMap<String, Value>,
    thresholds: Vec<u32>,
    fallback: String,
}

impl PromptSchedule {
    pub fn parse(raw_prompt: &str) -> (Self, ScheduleSource) {
        if !raw_prompt.trim_start().starts_with('{') {
            return (Self::unscheduled(raw_prompt), ScheduleSource::NotStructured);
        }
        match Self::parse_entries(raw_prompt) {
            Ok((entries, thresholds)) => {
                let schedule = Self {
                    entries,
                    thresholds,
                    fallback: raw_prompt.to_string(),
                };
                (schedule, ScheduleSource::Structured)
            }
            Err(err) => {
                log::warn!("prompt schedule parse failed, using prompt as plain text: {err}");
                (
                    Self::unscheduled(raw_prompt),
                    ScheduleSource::Malformed(LoopbackError::PromptSpec(err)),
                )
            }
        }
    }

    /// Only iteration-number keys must carry string prompts; other keys are
    /// kept verbatim and never scheduled.
    fn parse_entries(
        raw_prompt: &str,
    ) -> Result<(IndexMap<String, Value>, Vec<u32>), serde_json::Error> {
        let entries: IndexMap<String, Value> = serde_json::from_str(raw_prompt)?;
        let mut thresholds = Vec::new();
        for (key, value) in &entries {
            if let Some(threshold) = parse_threshold(key) {
                String::deserialize(value)?;
                thresholds.push(threshold);
            }
        }
        thresholds.sort_unstable();
        thresholds.dedup();
        Ok((entries, thresholds))
    }

    pub fn unscheduled(prompt: &str) -> Self {
        Self {
            entries: IndexMap::new(),
            thresholds: Vec::new(),
            fallback: prompt.to_string(),
        }
    }

    /// Prompt active at the 1-based `iteration`.
    pub fn resolve(&self, iteration: u32) -> &str {
        let idx = self.thresholds.partition_point(|threshold| *threshold <= iteration);
        if idx == 0 {
            return &self.fallback;
        }
        let key = self.thresholds[idx - 1].to_string();
        self.entries
            .get(&key)
            .and_then(Value::as_str)
            .unwrap_or(&self.fallback)
    }

    pub fn is_scheduled(&self) -> bool {
        !self.thresholds.is_empty()
    }

    pub fn thresholds(&self) -> &[u32] {
        &self.thresholds
    }

    /// Every parsed entry, including keys that are not iteration numbers.
    pub fn entries(&self) -> &IndexMap<String, Value> {
        &self.entries
    }

    pub fn fallback(&self) -> &str {
        &self.fallback
    }
}

fn parse_threshold(key: &str) -> Option<u32> {
    if key.is_empty() || !key.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    key.parse().ok()
}

/// Appends interrogator tags to a scheduled prompt.
pub fn append_tags(prompt: &str, tags: &str) -> String {
    if tags.is_empty() {
        return prompt.to_string();
    }
    if prompt.is_empty() {
        return tags.to_string();
    }
    format!("{prompt}, {tags}")
}
