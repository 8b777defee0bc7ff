// ============================================================================
// PhotoBridge CLI: headless access to every bridge method
// ============================================================================
//
// Usage examples:
//   photobridge remove-background -i portrait.jpg
//   photobridge upscale -i "shots/*.png" --scale 4 --output-dir big/
//   photobridge filter -i a.jpg b.jpg --name sepia
//   photobridge adjust -i photo.jpg --brightness 10 --contrast 15 --sharpen 20
//   photobridge inpaint -i photo.png --mask holes.png
//   photobridge download modnet
//   photobridge status

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::mpsc::Receiver;
use std::time::Instant;

use clap::{Args, Parser, Subcommand};
use serde_json::{Value, json};

use crate::channel::{Bridge, MethodCall};
use crate::inference::onnx::probe_onnx_runtime;
use crate::logger;
use crate::models::ProgressEvent;
use crate::settings::{BridgeSettings, absolute_path};

/// PhotoBridge headless image processor.
#[derive(Parser, Debug)]
#[command(
    name = "photobridge",
    version,
    about = "Model-backed photo transforms (background removal, upscaling, enhancement) from the command line"
)]
pub struct CliArgs {
    /// Settings file to use instead of the platform default.
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Override the model store directory.
    #[arg(long, global = true, value_name = "DIR")]
    pub models_dir: Option<PathBuf>,

    /// Override where results are written.
    #[arg(long, global = true, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Absolute path to the ONNX Runtime shared library.
    #[arg(long, global = true, value_name = "FILE")]
    pub onnx_runtime: Option<PathBuf>,

    /// Force CPU execution.
    #[arg(long, global = true)]
    pub cpu: bool,

    /// Mirror the session log to stderr and print per-file timing.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Input file(s). Glob patterns accepted (e.g. "*.png", "shots/*.jpg").
#[derive(Args, Debug, Clone)]
pub struct Inputs {
    #[arg(short, long, required = true, num_args = 1..)]
    pub input: Vec<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Cut the subject out onto a transparent background.
    #[command(alias = "removeBackground")]
    RemoveBackground(Inputs),
    /// Blur the background around a centred subject.
    #[command(alias = "portraitMode")]
    Portrait(Inputs),
    /// Sharpen and clean up without changing size.
    #[command(alias = "autoEnhance")]
    Enhance(Inputs),
    /// Reduce noise without changing size.
    #[command(alias = "reduceNoise")]
    Denoise(Inputs),
    /// Enlarge by 2, 3 or 4.
    Upscale {
        #[command(flatten)]
        inputs: Inputs,
        #[arg(short, long, default_value_t = 2)]
        scale: i64,
    },
    /// Apply a named filter (grayscale, sepia, invert, vintage, warm, cool, vivid, blur, sharpen).
    #[command(alias = "applyFilter")]
    Filter {
        #[command(flatten)]
        inputs: Inputs,
        #[arg(short, long)]
        name: String,
    },
    /// Colour and detail sliders.
    #[command(alias = "applyAdjustments")]
    Adjust {
        #[command(flatten)]
        inputs: Inputs,
        #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
        brightness: f32,
        #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
        contrast: f32,
        #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
        saturation: f32,
        #[arg(long, default_value_t = 0.0)]
        blur: f32,
        #[arg(long, default_value_t = 0.0)]
        sharpen: f32,
    },
    /// Fill the white areas of a mask image.
    Inpaint {
        #[command(flatten)]
        inputs: Inputs,
        #[arg(short, long, value_name = "FILE")]
        mask: PathBuf,
    },
    /// Report which models are installed and loaded.
    #[command(alias = "getModelStatus")]
    Status,
    /// Fetch and install a model without running it.
    #[command(alias = "downloadModel")]
    Download { model: String },
}

// ============================================================================
// Public entry point
// ============================================================================

/// Run one CLI invocation. `0` = every input succeeded.
pub fn run(args: CliArgs) -> ExitCode {
    let mut settings = match &args.config {
        Some(path) => BridgeSettings::load_from(path),
        None => BridgeSettings::load(),
    };
    if let Some(dir) = &args.models_dir {
        settings.models_dir = absolute_path(dir);
    }
    if let Some(dir) = &args.output_dir {
        settings.output_dir = absolute_path(dir);
    }
    if let Some(lib) = &args.onnx_runtime {
        settings.onnx_runtime_path = Some(absolute_path(lib));
    }
    if args.cpu {
        settings.prefer_gpu = false;
    }

    logger::init(&settings.log_level, args.verbose);

    let bridge = match Bridge::from_settings(&settings) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let progress = bridge.subscribe_progress();
    std::thread::spawn(move || print_progress(progress));

    match args.command {
        Command::Status => status(&bridge, settings.onnx_runtime_path.as_deref()),
        Command::Download { model } => {
            match bridge.invoke(MethodCall::new("downloadModel", json!({ "modelName": model }))) {
                Ok(path) => {
                    println!("{}", value_text(&path));
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("error: {}", e);
                    ExitCode::FAILURE
                }
            }
        }
        command => match transform_call(command) {
            Some((inputs, method, extra)) => run_batch(&bridge, &inputs, method, extra, args.verbose),
            None => ExitCode::FAILURE,
        },
    }
}

/// Method name + extra arguments for a transform subcommand.
fn transform_call(command: Command) -> Option<(Inputs, &'static str, Value)> {
    let call = match command {
        Command::RemoveBackground(i) => (i, "removeBackground", json!({})),
        Command::Portrait(i) => (i, "portraitMode", json!({})),
        Command::Enhance(i) => (i, "autoEnhance", json!({})),
        Command::Denoise(i) => (i, "reduceNoise", json!({})),
        Command::Upscale { inputs, scale } => (inputs, "upscale", json!({ "scale": scale })),
        Command::Filter { inputs, name } => (inputs, "applyFilter", json!({ "filterName": name })),
        Command::Adjust {
            inputs,
            brightness,
            contrast,
            saturation,
            blur,
            sharpen,
        } => (
            inputs,
            "applyAdjustments",
            json!({ "adjustments": {
                "brightness": brightness,
                "contrast": contrast,
                "saturation": saturation,
                "blur": blur,
                "sharpen": sharpen,
            }}),
        ),
        Command::Inpaint { inputs, mask } => (
            inputs,
            "inpaint",
            json!({ "maskPath": mask.display().to_string() }),
        ),
        Command::Status | Command::Download { .. } => return None,
    };
    Some(call)
}

fn run_batch(bridge: &Bridge, inputs: &Inputs, method: &str, extra: Value, verbose: bool) -> ExitCode {
    let paths = resolve_inputs(&inputs.input);
    if paths.is_empty() {
        eprintln!("error: no input files matched the given pattern(s).");
        return ExitCode::FAILURE;
    }

    let total = paths.len();
    let multi = total > 1;
    let mut any_failure = false;

    for (idx, path) in paths.iter().enumerate() {
        if multi || verbose {
            println!("[{}/{}] {}", idx + 1, total, path.display());
        }
        let started = Instant::now();

        let mut arguments = extra.clone();
        if let Value::Object(map) = &mut arguments {
            map.insert("imagePath".to_string(), Value::String(path.display().to_string()));
        }
        match bridge.invoke(MethodCall::new(method, arguments)) {
            Ok(out) => {
                if verbose {
                    println!(
                        "  → {} ({:.0}ms)",
                        value_text(&out),
                        started.elapsed().as_secs_f64() * 1000.0
                    );
                } else {
                    println!("{}", value_text(&out));
                }
            }
            Err(e) => {
                eprintln!("  error [{}]: {}", e.code, e.message);
                if let Some(details) = &e.details {
                    eprintln!("    caused by: {}", details);
                }
                any_failure = true;
            }
        }
    }

    if any_failure { ExitCode::FAILURE } else { ExitCode::SUCCESS }
}

fn status(bridge: &Bridge, onnx_runtime: Option<&Path>) -> ExitCode {
    let sessions = bridge.sessions();
    match onnx_runtime {
        Some(lib) => match probe_onnx_runtime(lib) {
            Ok(version) => println!("runtime: {} {} ({})", sessions.runtime_name(), version, lib.display()),
            Err(e) => println!("runtime: {} unusable: {}", sessions.runtime_name(), e),
        },
        None => println!("runtime: {} (no library configured)", sessions.runtime_name()),
    }
    println!("models dir: {}", sessions.cache().models_dir().display());
    if let Some(log) = logger::log_path() {
        println!("log: {}", log.display());
    }
    for name in bridge.registry().names() {
        let Some(descriptor) = bridge.registry().get(name) else { continue };
        let state = sessions.cache().entry(descriptor);
        let loaded = if sessions.is_loaded(name) { " (loaded)" } else { "" };
        println!("  {:<16} {:?}{}", name, state, loaded);
    }
    ExitCode::SUCCESS
}

fn value_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn print_progress(rx: Receiver<ProgressEvent>) {
    while let Ok(ev) = rx.recv() {
        eprintln!("  [{}] {:>3.0}% {}", ev.model_name, ev.progress * 100.0, ev.status);
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Expand glob patterns and literal paths into a deduplicated, ordered list.
fn resolve_inputs(patterns: &[String]) -> Vec<PathBuf> {
    let mut result: Vec<PathBuf> = Vec::new();

    for pattern in patterns {
        let as_path = Path::new(pattern);

        if as_path.exists() {
            if !result.iter().any(|p| p.as_path() == as_path) {
                result.push(as_path.to_path_buf());
            }
            continue;
        }

        match glob::glob(pattern) {
            Ok(entries) => {
                let mut matched = false;
                for entry in entries.flatten() {
                    if !result.contains(&entry) {
                        result.push(entry);
                    }
                    matched = true;
                }
                if !matched {
                    eprintln!("warning: pattern '{}' matched no files.", pattern);
                }
            }
            Err(e) => {
                eprintln!("warning: invalid glob '{}': {}", pattern, e);
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn globs_expand_and_dedup() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.png", "b.png", "c.jpg"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        let literal = dir.path().join("a.png").display().to_string();
        let pattern = dir.path().join("*.png").display().to_string();
        let found = resolve_inputs(&[literal, pattern]);
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|p| p.extension().unwrap() == "png"));
    }

    #[test]
    fn subcommands_parse() {
        let args = CliArgs::try_parse_from([
            "photobridge",
            "upscale",
            "-i",
            "a.png",
            "--scale",
            "4",
            "--cpu",
        ])
        .unwrap();
        assert!(args.cpu);
        let (inputs, method, extra) = transform_call(args.command).unwrap();
        assert_eq!(method, "upscale");
        assert_eq!(inputs.input, vec!["a.png".to_string()]);
        assert_eq!(extra["scale"], 4);

        let args = CliArgs::try_parse_from(["photobridge", "adjust", "-i", "a.png", "--brightness", "-20"]).unwrap();
        let (_, method, extra) = transform_call(args.command).unwrap();
        assert_eq!(method, "applyAdjustments");
        assert_eq!(extra["adjustments"]["brightness"], -20.0);

        let args = CliArgs::try_parse_from(["photobridge", "status"]).unwrap();
        assert!(transform_call(args.command).is_none());
    }
}
