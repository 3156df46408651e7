// float_cmp: only in tests where assert_eq! on f64 is intentional.
#![cfg_attr(test, allow(clippy::float_cmp))]

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

use premia::config::BacktestConfig;
use premia::engine::core::BacktestEngine;
use premia::engine::output::ValidationExporter;

#[derive(Parser)]
#[command(name = "premia", about = "Options premium-selling backtest engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a backtest from a YAML configuration file.
    Run {
        /// Path to the backtest configuration.
        #[arg(default_value = "backtest.yaml")]
        config: PathBuf,

        /// Write the external-validation pack to this directory.
        #[arg(long)]
        export: Option<PathBuf>,

        /// Print a machine-readable summary to stdout.
        #[arg(long)]
        summary: bool,
    },
}

fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match run(Cli::parse()) {
        Ok(valid) => {
            if valid {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<bool> {
    match cli.command {
        Command::Run {
            config,
            export,
            summary,
        } => {
            let config = BacktestConfig::load(&config)
                .with_context(|| format!("loading config from {}", config.display()))?;

            let bar = ProgressBar::new(100).with_style(
                ProgressStyle::with_template("{bar:40} {pos:>3}% {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar()),
            );
            let progress_bar = bar.clone();

            let engine = BacktestEngine::new(config.clone()).with_progress(Box::new(
                move |message, percent| {
                    progress_bar.set_position(percent as u64);
                    progress_bar.set_message(message.to_string());
                    true
                },
            ));

            let result = engine.run().context("backtest run failed")?;
            bar.finish_and_clear();

            if let Some(export_dir) = export {
                ValidationExporter::new(config)
                    .export(&result, &export_dir)
                    .context("validation export failed")?;
            }

            if summary {
                println!("{}", serde_json::to_string_pretty(&result.summary())?);
            }

            for message in &result.validation_messages {
                eprintln!("{message}");
            }

            Ok(result.is_valid)
        }
    }
}
