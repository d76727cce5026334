use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use image::DynamicImage;
use indexmap::IndexMap;
use loopback_contracts::events::{EventPayload, EventWriter, LoopEvent};
use loopback_contracts::schedule::append_tags;
use loopback_contracts::{LoopConfig, PromptSchedule, ScheduleSource, SharedOptions};
use serde_json::{json, Map, Value};

pub mod assembler;
pub mod grid;
pub mod providers;
pub mod request;
pub mod sink;
pub mod state;
pub mod taggers;

pub use assembler::{AssembledImages, ResultAssembler};
pub use grid::{GridBuilder, ImageGrid};
pub use providers::{
    default_provider_registry, DryrunProvider, SynthesisOutcome, SynthesisProvider,
    SynthesisProviderRegistry, WebUiProvider,
};
pub use request::{ColorCorrection, GenerationRequest, InpaintingFill, Seed};
pub use sink::{DirectorySink, ImageSink, SaveRequest};
pub use state::RunState;
pub use taggers::{InterrogateModel, Tagger, TaggerSet, WebUiTagger};

pub const FINAL_DENOISING_PARAM: &str = "Final Denoising";
pub const DENOISE_CURVE_PARAM: &str = "Denoise Curve";

/// External services the loop delegates to.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub synthesis: &'a dyn SynthesisProvider,
    pub taggers: &'a TaggerSet,
    pub grid: &'a dyn GridBuilder,
    pub sink: &'a dyn ImageSink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopPhase {
    Idle,
    Running,
    Completed,
    Interrupted,
}

impl LoopPhase {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Interrupted => "interrupted",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IterationRecord {
    /// 1-based.
    pub iteration: u32,
    pub prompt: String,
    pub denoising_strength: f64,
    pub seed: i64,
    pub tagged: bool,
    pub produced_image: bool,
}

#[derive(Debug, Clone)]
pub struct LoopResult {
    pub images: Vec<DynamicImage>,
    /// Seed and info of the first synthesis call of the run.
    pub seed: Option<i64>,
    pub info: Option<String>,
    pub phase: LoopPhase,
    pub iterations: Vec<IterationRecord>,
    pub extra_generation_params: IndexMap<String, Value>,
    pub grid_built: bool,
    /// `images[0]` is the grid.
    pub grid_returned: bool,
    pub grid_path: Option<PathBuf>,
}

impl LoopResult {
    pub fn iterations_completed(&self) -> usize {
        self.iterations.len()
    }
}

/// Drives the loopback: every iteration feeds the previous output image back
/// in as the next input while the prompt follows its schedule and the
/// denoising strength follows the configured curve.
pub struct LoopController<'a> {
    config: LoopConfig,
    options: SharedOptions,
    collaborators: Collaborators<'a>,
    state: RunState,
    events: Option<EventWriter>,
    output_dir: PathBuf,
    phase: LoopPhase,
}

impl<'a> LoopController<'a> {
    pub fn new(
        config: LoopConfig,
        options: SharedOptions,
        collaborators: Collaborators<'a>,
        output_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        config.validate()?;
        if config.append_mode.is_enabled()
            && collaborators.taggers.select(config.append_mode).is_none()
        {
            bail!("no tagger registered for append mode {}", config.append_mode);
        }
        Ok(Self {
            config,
            options,
            collaborators,
            state: RunState::new(),
            events: None,
            output_dir: output_dir.into(),
            phase: LoopPhase::Idle,
        })
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_state(mut self, state: RunState) -> Self {
        self.state = state;
        self
    }

    /// Handle for interrupting the run from elsewhere.
    pub fn state(&self) -> RunState {
        self.state.clone()
    }

    pub fn phase(&self) -> LoopPhase {
        self.phase
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn run(&mut self, request: &mut GenerationRequest) -> Result<LoopResult> {
        let frozen_seed = request.fix_seed();
        let original_prompt = request.prompt.clone();
        let original_strength = request.denoising_strength;
        let original_batch = request.batch_size;
        let original_fill = request.inpainting_fill;
        let loops = self.config.loops;
        let curve = self.config.denoise_curve;
        let final_strength = self.config.final_denoising_strength;

        let (schedule, source) = PromptSchedule::parse(&original_prompt);
        match source {
            ScheduleSource::Structured => self.emit(
                LoopEvent::PromptScheduleParsed,
                json!({ "thresholds": schedule.thresholds() }),
            )?,
            ScheduleSource::Malformed(err) => self.emit(
                LoopEvent::PromptScheduleMalformed,
                json!({ "error": err.to_string() }),
            )?,
            ScheduleSource::NotStructured => {}
        }

        request.extra_generation_params.insert(
            FINAL_DENOISING_PARAM.to_string(),
            json!(final_strength),
        );
        request
            .extra_generation_params
            .insert(DENOISE_CURVE_PARAM.to_string(), json!(curve.name()));
        request.batch_size = 1;
        request.n_iter = 1;
        self.state
            .set_job_count(u64::from(loops) * u64::from(request.n_iter));

        let color_correction = if self.options.color_correction {
            request.init_images.first().map(ColorCorrection::from_image)
        } else {
            None
        };
        let tagger = self.collaborators.taggers.select(self.config.append_mode);

        self.phase = LoopPhase::Running;
        self.emit(
            LoopEvent::LoopStarted,
            json!({
                "loops": loops,
                "seed": frozen_seed,
                "denoising_strength": original_strength,
                "final_denoising_strength": final_strength,
                "denoise_curve": curve.name(),
                "append_mode": self.config.append_mode.name(),
                "batch_size": original_batch,
                "color_correction": color_correction.is_some(),
            }),
        )?;
        log::info!(
            "loopback started: {loops} loops, strength {original_strength} -> {final_strength} ({curve})"
        );

        let mut history: Vec<DynamicImage> = Vec::new();
        let mut records: Vec<IterationRecord> = Vec::new();
        let mut current_image: Option<DynamicImage> = None;
        let mut initial_seed: Option<i64> = None;
        let mut initial_info: Option<String> = None;
        let mut interrupted = false;

        for index in 0..loops {
            let iteration = index + 1;
            if self.state.should_stop() {
                interrupted = true;
                log::info!("loopback interrupted before loop {iteration}/{loops}");
                self.emit(
                    LoopEvent::LoopInterrupted,
                    json!({ "iterations_completed": index }),
                )?;
                break;
            }

            let mut prompt = schedule.resolve(iteration).to_string();
            let mut tagged = false;
            if let (Some(tagger), Some(image)) = (tagger, current_image.as_ref()) {
                match tagger.tag(image) {
                    Ok(tags) => {
                        if !tags.is_empty() {
                            prompt = append_tags(&prompt, &tags);
                            tagged = true;
                        }
                    }
                    Err(err) => {
                        log::warn!(
                            "{} tagger failed at loop {iteration}, keeping scheduled prompt: {err:#}",
                            tagger.name()
                        );
                        self.emit(
                            LoopEvent::TagFailed,
                            json!({
                                "iteration": iteration,
                                "tagger": tagger.name(),
                                "error": format!("{err:#}"),
                            }),
                        )?;
                    }
                }
            }

            request.prompt = prompt;
            request.denoising_strength =
                curve.strength(index, loops, original_strength, final_strength);
            if let Some(correction) = &color_correction {
                request.color_corrections = vec![correction.clone()];
            }

            let job = format!("Batch 1/{}, Loop {iteration}/{loops}", request.n_iter);
            log::debug!("{job}: strength {:.4}", request.denoising_strength);
            self.state.begin_job(job);
            self.emit(
                LoopEvent::IterationStarted,
                json!({
                    "iteration": iteration,
                    "prompt": request.prompt,
                    "denoising_strength": request.denoising_strength,
                    "seed": request.seed.as_wire(),
                }),
            )?;

            let outcome = match self.collaborators.synthesis.process(request) {
                Ok(outcome) => outcome,
                Err(err) => {
                    self.phase = LoopPhase::Idle;
                    if let Err(emit_err) = self.emit(
                        LoopEvent::IterationFailed,
                        json!({
                            "iteration": iteration,
                            "provider": self.collaborators.synthesis.name(),
                            "error": format!("{err:#}"),
                        }),
                    ) {
                        log::warn!("failed recording iteration_failed event: {emit_err:#}");
                    }
                    return Err(err).with_context(|| {
                        format!("synthesis failed at loop {iteration}/{loops}")
                    });
                }
            };

            if initial_seed.is_none() {
                initial_seed = Some(outcome.seed);
                initial_info = Some(outcome.info.clone());
            }

            let produced_image = match outcome.images.into_iter().next() {
                Some(image) => {
                    request.init_images = vec![image.clone()];
                    request.inpainting_fill = InpaintingFill::Original;
                    history.push(image.clone());
                    current_image = Some(image);
                    true
                }
                None => false,
            };

            self.emit(
                LoopEvent::IterationFinished,
                json!({
                    "iteration": iteration,
                    "seed": outcome.seed,
                    "produced_image": produced_image,
                }),
            )?;
            records.push(IterationRecord {
                iteration,
                prompt: request.prompt.clone(),
                denoising_strength: request.denoising_strength,
                seed: outcome.seed,
                tagged,
                produced_image,
            });

            request.seed = Seed::Randomize;
        }

        let assembler = ResultAssembler::new(
            self.collaborators.grid,
            self.collaborators.sink,
            &self.options.grid,
            &self.output_dir,
        );
        let assembled = assembler.assemble(
            history,
            initial_seed,
            initial_info.as_deref(),
            &request.prompt,
        )?;
        if assembled.grid_built {
            self.emit(
                LoopEvent::GridCreated,
                json!({
                    "grid_path": assembled
                        .grid_path
                        .as_ref()
                        .map(|path| path.to_string_lossy().to_string()),
                    "returned": assembled.grid_returned,
                }),
            )?;
        }

        // Only prompt and inpainting fill are restored; strength and batch size
        // keep their loop-final values.
        request.prompt = original_prompt;
        request.inpainting_fill = original_fill;

        self.phase = if interrupted {
            LoopPhase::Interrupted
        } else {
            LoopPhase::Completed
        };
        self.emit(
            LoopEvent::LoopFinished,
            json!({
                "terminal_state": self.phase.name(),
                "iterations_completed": records.len(),
                "images_returned": assembled.images.len(),
                "seed": initial_seed,
            }),
        )?;
        log::info!(
            "loopback {} after {} of {loops} loops",
            self.phase.name(),
            records.len()
        );

        Ok(LoopResult {
            images: assembled.images,
            seed: initial_seed,
            info: initial_info,
            phase: self.phase,
            iterations: records,
            extra_generation_params: request.extra_generation_params.clone(),
            grid_built: assembled.grid_built,
            grid_returned: assembled.grid_returned,
            grid_path: assembled.grid_path,
        })
    }

    fn emit(&self, event: LoopEvent, payload: Value) -> Result<()> {
        if let Some(events) = &self.events {
            events.emit(event, map_object(payload))?;
        }
        Ok(())
    }
}

fn map_object(value: Value) -> EventPayload {
    value.as_object().cloned().unwrap_or_else(Map::new)
}
