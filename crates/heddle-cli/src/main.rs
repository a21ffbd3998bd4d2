mod cli;
mod demo;
mod logging;

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use heddle_core::config::StoreKind;
use heddle_core::domain::{CancelMode, CancelTarget, PresetParams};
use heddle_core::{Coordinator, CoordinatorBuilder, HeddleConfig};
use serde::Serialize;

use crate::cli::{CliArgs, Command};

#[tokio::main]
async fn main() {
    if let Err(err) = run_main().await {
        eprintln!("heddle error: {err:?}");
        std::process::exit(1);
    }
}

async fn run_main() -> Result<()> {
    let args = cli::parse();
    logging::init_logging(args.log_level)?;
    run(args).await
}

fn load_config(args: &CliArgs) -> Result<HeddleConfig> {
    let mut config = match &args.config {
        Some(path) => HeddleConfig::load_and_validate(path)?,
        None => HeddleConfig::default(),
    };
    if let Some(db) = &args.db {
        config.store.kind = StoreKind::Sqlite;
        config.store.path = db.clone();
    }
    Ok(config)
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn open(config: HeddleConfig) -> Result<Coordinator> {
    if config.store.kind == StoreKind::Memory {
        tracing::warn!("using the in-memory store; nothing outlives this command (pass --db)");
    }
    Ok(CoordinatorBuilder::new().config(config).open().await?)
}

async fn run(args: CliArgs) -> Result<()> {
    let config = load_config(&args)?;

    match args.command {
        Command::Demo {
            preset,
            agents,
            fail_rate,
            width,
        } => {
            let report = demo::run(config, preset, agents, fail_rate, width).await?;
            print_json(&report)?;
        }
        Command::Create {
            preset,
            width,
            skip,
            max_attempts,
            context,
        } => {
            let context = match context {
                Some(raw) => serde_json::from_str(&raw).context("--context is not valid JSON")?,
                None => serde_json::Value::Null,
            };
            let params = PresetParams {
                width,
                skip: skip.into_iter().collect::<BTreeSet<_>>(),
                max_attempts,
                context,
                ..PresetParams::default()
            };
            let run_id = open(config).await?.create_pipeline_run(preset, params).await?;
            println!("{run_id}");
        }
        Command::Status { run } => {
            print_json(&open(config).await?.get_run_status(run).await?)?;
        }
        Command::Cancel {
            task,
            run,
            stage,
            immediate,
        } => {
            let target = match (task, run, stage) {
                (Some(task_id), _, _) => CancelTarget::Task { task_id },
                (None, Some(run_id), Some(stage)) => CancelTarget::Stage { run_id, stage },
                (None, Some(run_id), None) => CancelTarget::Run { run_id },
                (None, None, _) => anyhow::bail!("cancel needs --task or --run"),
            };
            let mode = if immediate {
                CancelMode::Immediate
            } else {
                CancelMode::Graceful
            };
            print_json(&open(config).await?.cancel(&target, mode).await?)?;
        }
        Command::Sweep => {
            print_json(&open(config).await?.sweep_leases().await?)?;
        }
    }
    Ok(())
}
