//! profile-extract - run extraction profiles from the command line

mod output;

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;

use profile_extraction::{
    Engine, EngineConfig, ExtractionProfile, StageParams, StageType, orchestrator::StageOutput,
};

#[derive(Parser, Debug)]
#[command(name = "profile-extract")]
#[command(author, version, about = "Profile-driven extraction of tables from data files")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Engine configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every stage of a profile over a source directory, locking each
    Run {
        /// Profile file (YAML or JSON)
        #[arg(short, long)]
        profile: PathBuf,

        /// Directory to scan for input files
        #[arg(short, long)]
        source: PathBuf,

        /// Glob overriding the profile's include filters
        #[arg(long)]
        pattern: Option<String>,

        /// Artifact root directory
        #[arg(short, long)]
        artifacts: Option<PathBuf>,

        /// Context override, `key=value`; the value is parsed as JSON when possible
        #[arg(long = "set", value_parser = parse_override)]
        overrides: Vec<(String, Value)>,
    },

    /// Check that a profile parses and is consistent
    Validate {
        /// Profile file (YAML or JSON)
        #[arg(short, long)]
        profile: PathBuf,
    },
}

fn parse_override(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    if key.trim().is_empty() {
        return Err(format!("empty key in '{raw}'"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.trim().to_string(), value))
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => EngineConfig::default(),
    };

    match cli.command {
        Command::Validate { profile } => {
            let loaded = ExtractionProfile::from_path(&profile)
                .with_context(|| format!("reading profile {}", profile.display()))?;
            if let Err(err) = loaded.validate() {
                bail!("{}\n{}", err, err.user_message());
            }
            println!(
                "Profile {} is valid ({} table(s))",
                loaded.key(),
                loaded.tables.len()
            );
        }
        Command::Run {
            profile,
            source,
            pattern,
            artifacts,
            overrides,
        } => {
            if let Some(artifacts) = artifacts {
                config = config.with_artifact_root(artifacts);
            }
            let engine = Engine::new(config)?;
            let key = engine
                .load_profile(&profile)
                .with_context(|| format!("loading profile {}", profile.display()))?;
            let run = engine.create_run(&key)?;
            info!(run_id = %run.run_id, profile = %key, "Starting run");

            let mut params = StageParams::new().with_source(source);
            if let Some(pattern) = pattern {
                params = params.with_pattern(pattern);
            }
            for (key, value) in overrides {
                params = params.with_override(key, value);
            }

            for stage_type in StageType::all() {
                let stage = match engine.advance_stage(&run.run_id, stage_type, &params) {
                    Ok(stage) => stage,
                    Err(err) => {
                        let diagnostics = engine.diagnostics(&run.run_id)?;
                        eprint!("{}", output::format_diagnostics(&diagnostics));
                        bail!("{} failed: {}\n{}", stage_type, err, err.user_message());
                    }
                };
                engine.lock_stage(&run.run_id, &stage.stage_id)?;
                println!("{}", output::format_stage(&stage));
            }

            let export = engine
                .current_stage(&run.run_id, StageType::Export)?
                .context("export stage did not run")?;
            if let StageOutput::Export(tables) =
                engine.stage_output(&run.run_id, &export.stage_id)?
            {
                print!("{}", output::format_outputs(engine.store().root(), &tables));
            }
            print!("{}", output::format_diagnostics(&engine.diagnostics(&run.run_id)?));
            engine.close_run(&run.run_id)?;
            println!("Run {} complete: {}", run.run_id, run.run_dir.display());
        }
    }
    Ok(())
}
