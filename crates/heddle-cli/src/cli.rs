//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use heddle_core::domain::{Preset, RunId, TaskId};

/// Command-line arguments for `heddle`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "heddle",
    version,
    about = "Coordinate pipeline runs shared by many agents.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML). Defaults apply when omitted.
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Use the SQLite store at this path, overriding `[store]`.
    #[arg(long, global = true, value_name = "PATH")]
    pub db: Option<PathBuf>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `HEDDLE_LOG` or `info` is used.
    #[arg(long, global = true, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Create a pipeline run from a preset and print its id.
    Create {
        preset: Preset,

        /// Fan-out width for every fan-out stage.
        #[arg(long)]
        width: Option<u32>,

        /// Leave a stage out (repeatable).
        #[arg(long = "skip", value_name = "STAGE")]
        skip: Vec<String>,

        /// Retry budget per task.
        #[arg(long)]
        max_attempts: Option<u32>,

        /// JSON copied into every task payload.
        #[arg(long, value_name = "JSON")]
        context: Option<String>,
    },

    /// Print a run's status and tasks as JSON.
    Status { run: RunId },

    /// Cancel a task, a stage of a run, or a whole run.
    Cancel {
        #[arg(long, conflicts_with_all = ["run", "stage"])]
        task: Option<TaskId>,

        #[arg(long, required_unless_present = "task")]
        run: Option<RunId>,

        #[arg(long, requires = "run")]
        stage: Option<String>,

        /// Also cancel claimed/running tasks and notify their owners.
        #[arg(long)]
        immediate: bool,
    },

    /// Reclaim expired leases once.
    Sweep,

    /// Run a preset end to end with simulated agents.
    Demo {
        #[arg(default_value = "review")]
        preset: Preset,

        #[arg(long, default_value_t = 3)]
        agents: usize,

        /// Probability that an attempt fails.
        #[arg(long, default_value_t = 0.2)]
        fail_rate: f64,

        #[arg(long)]
        width: Option<u32>,
    },
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

pub fn parse() -> CliArgs {
    CliArgs::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_accepts_stage_of_run() {
        let run: RunId = "run-01HZX3K8Q9V2M4N6P8R0S2T4V6".parse().unwrap();
        let args = CliArgs::try_parse_from([
            "heddle",
            "cancel",
            "--run",
            &run.to_string(),
            "--stage",
            "review",
            "--immediate",
        ])
        .unwrap();
        match args.command {
            Command::Cancel {
                run: Some(r),
                stage: Some(stage),
                immediate: true,
                task: None,
            } => {
                assert_eq!(r, run);
                assert_eq!(stage, "review");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn cancel_needs_a_target() {
        assert!(CliArgs::try_parse_from(["heddle", "cancel"]).is_err());
        assert!(CliArgs::try_parse_from(["heddle", "cancel", "--stage", "x"]).is_err());
    }

    #[test]
    fn create_parses_preset_and_skips() {
        let args = CliArgs::try_parse_from([
            "heddle", "--db", "h.db", "create", "review", "--skip", "report", "--width", "3",
        ])
        .unwrap();
        assert_eq!(args.db, Some(PathBuf::from("h.db")));
        assert!(matches!(
            args.command,
            Command::Create { preset: Preset::Review, width: Some(3), ref skip, .. } if skip == &["report"]
        ));
        assert!(CliArgs::try_parse_from(["heddle", "create", "nope"]).is_err());
    }
}
