use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use loopback_contracts::events::{now_utc_iso, EventWriter};
use loopback_contracts::runs::summary::{write_summary, RunSummary};
use loopback_contracts::{
    AppendMode, DenoiseCurve, GridOptions, LoopConfig, PromptSchedule, SharedOptions,
};
use loopback_engine::{
    default_provider_registry, Collaborators, DirectorySink, GenerationRequest, ImageGrid,
    ImageSink, LoopController, LoopResult, SaveRequest, Seed, TaggerSet,
};
use serde_json::{json, Map, Value};

#[derive(Debug, Parser)]
#[command(
    name = "loopback-rs",
    version,
    about = "Iterative img2img loopback with scheduled prompts and denoising curves"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the loopback against a synthesis backend.
    Run(RunArgs),
    /// Print the per-loop prompt and denoising strength without generating.
    Plan(PlanArgs),
}

#[derive(Debug, Parser)]
struct LoopArgs {
    /// Prompt text, or a JSON object mapping loop numbers to prompts.
    #[arg(long, conflicts_with = "prompt_file")]
    prompt: Option<String>,
    #[arg(long)]
    prompt_file: Option<PathBuf>,
    /// JSON file with loops, final_denoising_strength, denoise_curve, append_mode.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    loops: Option<u32>,
    #[arg(long)]
    final_denoising: Option<f64>,
    #[arg(long, default_value_t = 0.75)]
    denoising_strength: f64,
    /// Aggressive, Linear or Lazy.
    #[arg(long)]
    curve: Option<DenoiseCurve>,
    /// None, CLIP or DeepBooru.
    #[arg(long)]
    append: Option<AppendMode>,
}

#[derive(Debug, Parser)]
struct RunArgs {
    #[command(flatten)]
    loop_args: LoopArgs,
    #[arg(long)]
    init_image: PathBuf,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    seed: Option<i64>,
    #[arg(long, default_value = "dryrun")]
    provider: String,
    #[arg(long)]
    color_correction: bool,
    #[arg(long)]
    no_save_grid: bool,
    #[arg(long)]
    no_return_grid: bool,
    #[arg(long, default_value = "png")]
    grid_format: String,
}

#[derive(Debug, Parser)]
struct PlanArgs {
    #[command(flatten)]
    loop_args: LoopArgs,
    /// Print every Nth loop (first and last are always printed).
    #[arg(long, default_value_t = 1)]
    every: u32,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("loopback-rs error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run_loop(args),
        Command::Plan(args) => run_plan(args),
    }
}

impl LoopArgs {
    fn prompt(&self) -> Result<String> {
        match (&self.prompt, &self.prompt_file) {
            (Some(prompt), _) => Ok(prompt.clone()),
            (None, Some(path)) => std::fs::read_to_string(path)
                .map(|raw| raw.trim_end_matches(['\n', '\r']).to_string())
                .with_context(|| format!("failed reading {}", path.display())),
            (None, None) => bail!("one of --prompt or --prompt-file is required"),
        }
    }

    fn loop_config(&self) -> Result<LoopConfig> {
        let mut config = match &self.config {
            Some(path) => LoopConfig::load(path)
                .with_context(|| format!("failed loading config {}", path.display()))?,
            None => LoopConfig::default(),
        };
        if let Some(loops) = self.loops {
            config.loops = loops;
        }
        if let Some(strength) = self.final_denoising {
            config.final_denoising_strength = strength;
        }
        if let Some(curve) = self.curve {
            config.denoise_curve = curve;
        }
        if let Some(mode) = self.append {
            config.append_mode = mode;
        }
        config.validate()?;
        if !(0.0..=1.0).contains(&self.denoising_strength) {
            bail!(
                "--denoising-strength must be within 0..=1, got {}",
                self.denoising_strength
            );
        }
        Ok(config)
    }
}

fn run_loop(args: RunArgs) -> Result<i32> {
    let prompt = args.loop_args.prompt()?;
    let config = args.loop_args.loop_config()?;
    let init_image = image::open(&args.init_image)
        .with_context(|| format!("failed opening {}", args.init_image.display()))?;

    std::fs::create_dir_all(&args.out)?;
    let run_id = run_id_for(&args.out);
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| args.out.join("events.jsonl"));
    let events = EventWriter::new(&events_path, run_id.clone());

    let providers = default_provider_registry();
    let Some(provider) = providers.get(&args.provider) else {
        bail!(
            "provider '{}' not registered (available: [{}])",
            args.provider,
            providers.names().join(", ")
        );
    };
    let taggers = if config.append_mode.is_enabled() {
        TaggerSet::webui()
    } else {
        TaggerSet::new()
    };
    let grid = ImageGrid::default();
    let sink = DirectorySink;
    let options = SharedOptions {
        color_correction: args.color_correction,
        grid: GridOptions {
            save: !args.no_save_grid,
            return_grid: !args.no_return_grid,
            format: args.grid_format.clone(),
            ..GridOptions::default()
        },
    };
    log::info!(
        "run {run_id}: provider {}, events {}",
        provider.name(),
        events_path.display()
    );
    let collaborators = Collaborators {
        synthesis: provider,
        taggers: &taggers,
        grid: &grid,
        sink: &sink,
    };

    let loops = config.loops;
    let mut controller =
        LoopController::new(config, options, collaborators, args.out.join("grids"))?
            .with_events(events);
    let seed = args.seed.map(Seed::Fixed).unwrap_or(Seed::Randomize);
    let mut request =
        GenerationRequest::new(prompt, init_image, args.loop_args.denoising_strength)
            .with_seed(seed);

    let started_at = now_utc_iso();
    let result = controller.run(&mut request)?;
    let saved = save_history(&result, &args.out.join("images"), &sink)?;

    let summary = RunSummary {
        run_id,
        started_at,
        finished_at: now_utc_iso(),
        terminal_state: result.phase.name().to_string(),
        loops,
        iterations_completed: result.iterations_completed() as u64,
        images_returned: result.images.len() as u64,
        grid_created: result.grid_built,
        seed: result.seed,
        extra_generation_params: result.extra_generation_params.clone(),
    };
    let mut extra = Map::new();
    extra.insert("provider".to_string(), Value::String(args.provider.clone()));
    extra.insert(
        "images".to_string(),
        json!(saved
            .iter()
            .map(|path| path.to_string_lossy().to_string())
            .collect::<Vec<String>>()),
    );
    let summary_path = args.out.join("summary.json");
    write_summary(&summary_path, &summary, Some(&extra))?;

    println!(
        "Loopback {}: {} of {} loops, {} images saved to {}",
        result.phase.name(),
        result.iterations_completed(),
        loops,
        saved.len(),
        args.out.join("images").display()
    );
    if let Some(grid_path) = &result.grid_path {
        println!("Grid: {}", grid_path.display());
    }
    if let Some(seed) = result.seed {
        println!("Seed: {seed}");
    }
    println!("Summary: {}", summary_path.display());
    Ok(0)
}

/// Saves the loop images (not the grid) with the seed and prompt of the loop that made them.
fn save_history(result: &LoopResult, dir: &Path, sink: &dyn ImageSink) -> Result<Vec<PathBuf>> {
    let skip = usize::from(result.grid_returned);
    let producing = result.iterations.iter().filter(|record| record.produced_image);
    let mut saved = Vec::new();
    for (image, record) in result.images.iter().skip(skip).zip(producing) {
        let label = format!("loop{:04}", record.iteration);
        let request = SaveRequest {
            destination: dir,
            label: &label,
            seed: Some(record.seed),
            prompt: &record.prompt,
            format: "png",
            info: None,
            is_grid: false,
        };
        saved.push(sink.save(image, &request)?);
    }
    Ok(saved)
}

fn run_plan(args: PlanArgs) -> Result<i32> {
    let prompt = args.loop_args.prompt()?;
    let config = args.loop_args.loop_config()?;
    let (schedule, _) = PromptSchedule::parse(&prompt);
    let every = args.every.max(1);
    let original = args.loop_args.denoising_strength;

    println!(
        "{} loops, {} curve, strength {original} -> {}, append {}",
        config.loops,
        config.denoise_curve,
        config.final_denoising_strength,
        config.append_mode
    );
    if schedule.is_scheduled() {
        println!("Prompt thresholds: {:?}", schedule.thresholds());
    }
    for index in 0..config.loops {
        let iteration = index + 1;
        let last = iteration == config.loops;
        if index % every != 0 && !last {
            continue;
        }
        let strength = config.denoise_curve.strength(
            index,
            config.loops,
            original,
            config.final_denoising_strength,
        );
        println!("{iteration:>5}  {strength:.4}  {}", schedule.resolve(iteration));
    }
    Ok(0)
}

fn run_id_for(out: &Path) -> String {
    out.file_name()
        .and_then(|value| value.to_str())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("loopback-{}", uuid::Uuid::new_v4()))
}
