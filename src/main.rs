//! textscope - on-device OCR over a picked image
//!
//! Pick an image, run PaddleOCR models over it (CPU or GPU), and get the
//! recognized text, colored word tags and an annotated copy of the image.

mod app;
mod config;
mod session;
mod shared;
mod storage;
mod vision;
mod worker;

use anyhow::{Context, Result};
use base64::Engine as _;
use clap::Parser;
use serde::Serialize;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use uuid::Uuid;

use crate::app::OcrApp;
use crate::config::AppConfig;
use crate::session::AccelerationMode;
use crate::shared::{EngineStatus, RunStatus, ViewState};
use crate::vision::{ModelManager, OnnxEngineFactory, TextDetection};

/// Engine builds may include first-time model downloads
const ENGINE_TIMEOUT: Duration = Duration::from_secs(600);
const RUN_TIMEOUT: Duration = Duration::from_secs(600);

/// textscope - on-device OCR
#[derive(Parser, Debug)]
#[command(name = "textscope")]
#[command(about = "Run on-device OCR over an image and show the recognized text")]
struct Args {
    /// Image to recognize (one-shot mode)
    #[arg(short, long)]
    image: Option<PathBuf>,

    /// Use GPU acceleration
    #[arg(long)]
    gpu: bool,

    /// Save the annotated result image here
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Print the result as JSON
    #[arg(long)]
    json: bool,

    /// Start an interactive session
    #[arg(long)]
    interactive: bool,

    /// Show which model files are present and exit
    #[arg(long)]
    model_status: bool,

    /// Download missing model files and exit
    #[arg(long)]
    download_models: bool,

    /// Write the effective configuration to the config file and exit
    #[arg(long)]
    init_config: bool,

    /// Configuration file (defaults to <config dir>/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = config::load_or_default(args.config.as_deref())?;

    // Logs go to stderr; stdout carries results
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.general.log_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if args.init_config {
        let path = config::config_path(args.config.as_deref())?;
        config::save_config(&config, &path)?;
        println!("Wrote configuration to {:?}", path);
        return Ok(());
    }

    if args.model_status || args.download_models {
        return run_model_commands(&args, &config);
    }

    let use_gpu = args.gpu || config.general.use_gpu;
    let factory = OnnxEngineFactory::from_config(&config)?;
    let mut app = OcrApp::new(Arc::new(factory), use_gpu)?;

    if args.interactive {
        run_interactive(&mut app)
    } else if let Some(image) = &args.image {
        run_once(&mut app, image, &args)
    } else {
        anyhow::bail!("Nothing to do: pass --image <PATH> or --interactive (see --help)")
    }
}

fn model_manager(config: &AppConfig) -> Result<ModelManager> {
    let manager = match &config.models.models_dir {
        Some(dir) => ModelManager::with_dir(dir.clone())?,
        None => ModelManager::new()?,
    };
    Ok(manager.offline(config.models.offline))
}

/// --model-status / --download-models
fn run_model_commands(args: &Args, config: &AppConfig) -> Result<()> {
    let manager = model_manager(config)?;

    if args.download_models {
        manager.ensure_all_models()?;
        println!("All models available in {:?}", manager.models_dir());
    }

    if args.model_status {
        println!("Models directory: {:?}", manager.models_dir());
        for status in manager.get_model_status() {
            println!(
                "  {:<22} {:<10} {}",
                status.model_type.display_name(),
                if status.available { "ok" } else { "missing" },
                status
                    .size_bytes
                    .map(|b| format!("{} bytes", b))
                    .unwrap_or_default()
            );
        }
        if manager.are_models_ready() {
            println!("Models ready");
        } else {
            println!("Models incomplete; run with --download-models");
        }
    }

    Ok(())
}

/// Pick, run, print
fn run_once(app: &mut OcrApp, image: &Path, args: &Args) -> Result<()> {
    app.on_pick_image(image)?;
    app.wait_for_engine(ENGINE_TIMEOUT)?;

    let Some(engine) = app.engine_info() else {
        let reason = match &app.state().read().engine {
            EngineStatus::Failed(message) => message.clone(),
            _ => "engine not built".to_string(),
        };
        anyhow::bail!("OCR engine unavailable: {}", reason);
    };
    info!("Using {} OCR engine (generation {})", engine.mode, engine.generation);

    let id = app.on_run().context("Run was not queued")?;
    app.wait_for_run(id, RUN_TIMEOUT)?;

    let state = app.state();
    let state = state.read();

    if let Some(output) = &args.output {
        save_result_image(&state, output)?;
    }

    if args.json {
        let report = JsonReport::from_state(&state)?;
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_summary(&state);
    }
    Ok(())
}

fn save_result_image(state: &ViewState, path: &Path) -> Result<()> {
    let image = state
        .result_image
        .as_ref()
        .context("No result image to save; run OCR first")?;
    image
        .save(path)
        .with_context(|| format!("Failed to save result image to {:?}", path))?;
    info!("Saved result image to {:?}", path);
    Ok(())
}

fn print_summary(state: &ViewState) {
    println!("{}", state.log_text);
    println!();
    println!("{}:", state.labels_found);
    for chip in &state.chips {
        println!("  [{}] {}", chip.color, chip.text);
    }
    if !state.result_text.is_empty() {
        println!();
        println!("{}", state.result_text);
    }
}

fn engine_line(engine: &EngineStatus) -> String {
    match engine {
        EngineStatus::Absent => "not built".to_string(),
        EngineStatus::Building(mode) => format!("building ({})", mode),
        EngineStatus::Ready(info) => {
            format!("ready ({}, generation {})", info.mode, info.generation)
        }
        EngineStatus::Failed(message) => format!("failed: {}", message),
    }
}

fn print_status(state: &ViewState, worker_running: bool) {
    let preview = state
        .preview
        .as_ref()
        .map(|p| {
            let (w, h) = p.image.dimensions();
            match &p.source {
                Some(source) => format!("{:?} ({}x{})", source, w, h),
                None => format!("{}x{}", w, h),
            }
        })
        .unwrap_or_else(|| "none".to_string());

    println!("acceleration: {}", state.acceleration_mode());
    println!("engine:       {}", engine_line(&state.engine));
    println!("image:        {}", preview);
    println!("run enabled:  {}", state.controls_enabled);
    println!("worker:       {}", if worker_running { "running" } else { "stopped" });
}

/// Why `on_run` queued nothing
fn run_not_queued_reason(state: &ViewState) -> &'static str {
    if !state.controls_enabled {
        "A run is already pending; use 'wait' or 'cancel'"
    } else if state.preview.is_none() {
        "Nothing to run: open an image first"
    } else {
        "Run not queued: inference worker stopped"
    }
}

/// Prints worker answers that arrived since the last prompt
#[derive(Default)]
struct Reporter {
    last_run: Option<Uuid>,
    engine: EngineStatus,
}

impl Reporter {
    fn report(&mut self, state: &ViewState) {
        if state.engine != self.engine {
            if matches!(state.engine, EngineStatus::Ready(_) | EngineStatus::Failed(_)) {
                println!("engine {}", engine_line(&state.engine));
            }
            self.engine = state.engine.clone();
        }

        let Some((id, status)) = state.last_run else {
            return;
        };
        if self.last_run == Some(id) {
            return;
        }
        self.last_run = Some(id);

        match status {
            RunStatus::Completed => print_summary(state),
            RunStatus::Skipped => println!("Run skipped: OCR engine not initialized"),
            RunStatus::Cancelled => println!("Run cancelled"),
            RunStatus::Failed => println!("Run failed: {}", state.log_text),
        }
    }
}

const INTERACTIVE_HELP: &str = "\
commands:
  open <path>    pick an image
  gpu on|off     switch acceleration (rebuilds the engine)
  run            queue OCR on the picked image
  cancel         cancel a queued run
  wait           wait for the pending rebuild and run
  save <path>    save the annotated result image
  status         show engine and image status
  help           show this help
  quit           exit";

/// Line-oriented single-screen session. Rebuilds and runs are queued on the
/// worker; their answers are printed at the next prompt or on `wait`.
fn run_interactive(app: &mut OcrApp) -> Result<()> {
    println!("{}", INTERACTIVE_HELP);
    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();
    let mut reporter = Reporter::default();

    loop {
        app.pump();
        reporter.report(&app.state().read());

        print!("> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next() else {
            break;
        };
        let line = line?;
        app.pump();
        reporter.report(&app.state().read());

        let (command, rest) = match line.trim().split_once(char::is_whitespace) {
            Some((command, rest)) => (command, rest.trim()),
            None => (line.trim(), ""),
        };

        match command {
            "" => {}
            "open" if !rest.is_empty() => {
                if let Err(e) = app.on_pick_image(Path::new(rest)) {
                    println!("{:#}", e);
                }
            }
            "gpu" if rest == "on" || rest == "off" => {
                let use_gpu = rest == "on";
                app.on_toggle_acceleration(use_gpu);
                println!("Rebuilding OCR engine for {}", AccelerationMode::from(use_gpu));
            }
            "run" => match app.on_run() {
                Some(id) => println!("Queued run {}", id),
                None => println!("{}", run_not_queued_reason(&app.state().read())),
            },
            "cancel" => {
                if app.cancel_run() {
                    println!("Cancel requested");
                } else {
                    println!("No run pending");
                }
            }
            "wait" => {
                if let Err(e) = app.wait_idle(RUN_TIMEOUT) {
                    println!("{:#}", e);
                }
            }
            "save" if !rest.is_empty() => {
                if let Err(e) = save_result_image(&app.state().read(), Path::new(rest)) {
                    println!("{:#}", e);
                }
            }
            "status" => print_status(&app.state().read(), app.is_worker_running()),
            "help" => println!("{}", INTERACTIVE_HELP),
            "quit" | "exit" => break,
            _ => println!("Unknown command; type 'help'"),
        }
    }

    Ok(())
}

#[derive(Serialize)]
struct JsonItem<'a> {
    text: &'a str,
    color: String,
}

#[derive(Serialize)]
struct JsonReport<'a> {
    recognized_text: &'a str,
    items: Vec<JsonItem<'a>>,
    execution_log: &'a str,
    detections: &'a [TextDetection],
    /// Mode the result was produced under
    mode: Option<AccelerationMode>,
    /// Annotated image, PNG, base64
    output_image_png: Option<String>,
}

impl<'a> JsonReport<'a> {
    fn from_state(state: &'a ViewState) -> Result<Self> {
        let output_image_png = match &state.result_image {
            Some(image) => {
                let mut png = std::io::Cursor::new(Vec::new());
                image.write_to(&mut png, image::ImageFormat::Png)?;
                Some(base64::engine::general_purpose::STANDARD.encode(png.into_inner()))
            }
            None => None,
        };

        Ok(Self {
            recognized_text: &state.result_text,
            items: state
                .chips
                .iter()
                .map(|chip| JsonItem {
                    text: &chip.text,
                    color: chip.color.to_string(),
                })
                .collect(),
            execution_log: &state.log_text,
            detections: &state.detections,
            mode: state.result_mode,
            output_image_png,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::state::Chip;
    use crate::shared::Preview;
    use crate::vision::{ChipColor, ExecutionResult};

    #[test]
    fn test_args_parse() {
        let args = Args::parse_from(["textscope", "--image", "a.png", "--gpu", "--json"]);
        assert_eq!(args.image, Some(PathBuf::from("a.png")));
        assert!(args.gpu);
        assert!(args.json);
        assert!(!args.interactive);
        assert!(!args.init_config);
    }

    #[test]
    fn test_json_report_from_state() {
        let mut state = ViewState::new(false);
        state.result_text = "open sesame".to_string();
        state.chips = vec![Chip {
            text: "open".to_string(),
            color: ChipColor([0, 0, 255]),
        }];
        state.result_image = Some(image::RgbImage::new(2, 2));
        state.result_mode = Some(AccelerationMode::Gpu);

        let report = JsonReport::from_state(&state).unwrap();
        let json = serde_json::to_value(&report).unwrap();

        assert_eq!(json["recognized_text"], "open sesame");
        assert_eq!(json["items"][0]["color"], "#0000ff");
        assert_eq!(json["mode"], "gpu");
        assert!(json["output_image_png"].as_str().unwrap().len() > 10);
    }

    #[test]
    fn test_json_mode_follows_result_not_toggle() {
        let mut state = ViewState::new(false);
        let result = ExecutionResult::new(
            image::RgbImage::new(2, 2),
            Vec::new(),
            String::new(),
            AccelerationMode::Gpu,
        );
        state.apply_result(&result);
        // Toggle flipped after the run finished
        state.use_gpu = false;

        let json = serde_json::to_value(JsonReport::from_state(&state).unwrap()).unwrap();
        assert_eq!(json["mode"], "gpu");

        let empty = ViewState::new(true);
        let json = serde_json::to_value(JsonReport::from_state(&empty).unwrap()).unwrap();
        assert!(json["mode"].is_null());
    }

    #[test]
    fn test_run_not_queued_reason() {
        let mut state = ViewState::default();
        assert!(run_not_queued_reason(&state).contains("open an image"));

        state.preview = Some(Preview {
            image: Arc::new(image::RgbImage::new(1, 1)),
            source: None,
        });
        state.controls_enabled = false;
        assert!(run_not_queued_reason(&state).contains("already pending"));
    }
}
