use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use formula_reactive::{Engine, EngineOptions, RawConfig, SystemClock};

#[derive(Clone, Debug, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Parser)]
#[command(about = "Evaluate a reactive field configuration and print the resulting snapshot.")]
struct Args {
    /// JSON field configuration (`{ "name": { "value": .., "eqn": .. }, .. }`).
    config: PathBuf,

    /// Assign an input field before printing (repeatable).
    ///
    /// Format: `<name>=<value>`. Writes are applied in order and coalesced into one pass.
    #[arg(long = "set", value_name = "NAME=VALUE")]
    sets: Vec<String>,

    /// Output format.
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Exit with a non-zero status if any field failed to evaluate.
    #[arg(long)]
    strict: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = Args::parse();
    let json = std::fs::read_to_string(&args.config)
        .with_context(|| format!("read {}", args.config.display()))?;
    let raw = RawConfig::from_json_str(&json)
        .with_context(|| format!("parse {}", args.config.display()))?;

    let options = EngineOptions {
        // Writes are applied back to back and flushed explicitly.
        debounce: Duration::ZERO,
        ..EngineOptions::default()
    };
    let mut engine = Engine::initialize_with(raw, options, SystemClock)
        .with_context(|| format!("initialize engine from {}", args.config.display()))?;

    for assignment in &args.sets {
        let (name, value) = parse_assignment(assignment)?;
        engine
            .set(name, value)
            .with_context(|| format!("--set {assignment}"))?;
    }
    engine.flush()?;

    let snapshot = engine.snapshot();
    match args.format {
        OutputFormat::Text => {
            println!("{}", snapshot.format_report());
            for warning in engine.warnings() {
                eprintln!("warning: {warning}");
            }
            for err in snapshot.errors() {
                eprintln!("error: {err}");
            }
        }
        OutputFormat::Json => {
            let stdout = std::io::stdout();
            let mut handle = stdout.lock();
            serde_json::to_writer_pretty(&mut handle, &snapshot)?;
            handle.write_all(b"\n")?;
        }
    }

    if args.strict && !snapshot.errors().is_empty() {
        std::process::exit(1);
    }
    Ok(())
}

fn parse_assignment(input: &str) -> Result<(&str, f64)> {
    let Some((name, value)) = input.split_once('=') else {
        anyhow::bail!("invalid --set '{input}' (expected format: <name>=<value>)");
    };
    let name = name.trim();
    if name.is_empty() {
        anyhow::bail!("invalid --set '{input}' (empty field name)");
    }
    let value: f64 = value
        .trim()
        .parse()
        .with_context(|| format!("invalid --set '{input}' (value is not a number)"))?;
    Ok((name, value))
}
