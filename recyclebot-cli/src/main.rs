//! Recycle Bot CLI: hyperparameter search, training, export and prediction
//! for the waste image classifier.

mod commands;
mod progress;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Recycle Bot: transfer-learning waste classifier
#[derive(Parser, Debug)]
#[command(name = "recyclebot", version, about, long_about = None)]
pub(crate) struct Cli {
    /// Workspace directory
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
pub(crate) enum Commands {
    /// Search the fine-tuning hyperparameters, then export the best model
    Search(SearchArgs),
    /// Run one two-phase training with fixed hyperparameters
    Train(TrainArgs),
    /// Show the best trials of an existing search project
    Best {
        /// Number of trials to show
        #[arg(short, default_value = "3")]
        n: usize,
    },
    /// Export the best model of an existing search project
    Export {
        /// Replace an existing export of the same version
        #[arg(long)]
        force: bool,
    },
    /// Classify images with an exported model
    Predict(PredictArgs),
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Args, Debug)]
pub(crate) struct SearchArgs {
    /// Trial budget for the project
    #[arg(long)]
    pub max_trials: Option<usize>,
    /// Discard an existing project (and export) instead of resuming it
    #[arg(long)]
    pub overwrite: bool,
    /// Dataset root with one sub-directory per class
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
}

#[derive(clap::Args, Debug)]
pub(crate) struct TrainArgs {
    /// Hyperparameter assignment, e.g. `--hp learning_rate=0.001`
    #[arg(long = "hp", value_name = "NAME=VALUE")]
    pub assignments: Vec<String>,
    /// Dataset root with one sub-directory per class
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
    /// Export the trained model
    #[arg(long)]
    pub export: bool,
    /// Replace an existing export of the same version
    #[arg(long, requires = "export")]
    pub force: bool,
}

#[derive(clap::Args, Debug)]
pub(crate) struct PredictArgs {
    /// Export directory (`<dir>/<model_name>/<version>`)
    pub model_dir: PathBuf,
    /// Images to classify
    #[arg(required = true)]
    pub images: Vec<PathBuf>,
    /// Number of classes to report per image
    #[arg(long, default_value = "3")]
    pub top_k: usize,
    /// Print predictions as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(clap::Subcommand, Debug)]
pub(crate) enum ConfigAction {
    /// Create a default configuration file in the workspace
    Init,
    /// Show the effective configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Resolve workspace
    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    // Logging settings come from the config when it loads; a broken config
    // is reported by the command itself.
    let logging = recyclebot_core::load_config(Some(&workspace), cli.config.as_deref(), None)
        .map(|c| c.logging)
        .unwrap_or_default();
    let _guard = init_tracing(cli.verbose, cli.quiet, &logging);

    commands::handle_command(cli.command, &workspace, cli.config.as_deref(), cli.quiet).await
}

fn filter_directive(verbose: u8, quiet: bool, level: &str) -> String {
    match verbose {
        0 if quiet => "error".to_string(),
        0 => level.to_string(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    }
}

/// Human-readable stderr logging plus an optional JSON log file.
///
/// `RECYCLEBOT_LOG` (then `RUST_LOG`) replaces the verbosity flags when set.
fn init_tracing(
    verbose: u8,
    quiet: bool,
    logging: &recyclebot_core::LoggingConfig,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = filter_directive(verbose, quiet, &logging.level);
    let env_filter = EnvFilter::try_from_env("RECYCLEBOT_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(&filter));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(env_filter);

    if !logging.json_file {
        tracing_subscriber::registry().with(stderr_layer).init();
        return None;
    }

    let log_dir = directories::ProjectDirs::from("dev", "recyclebot", "recyclebot")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "recyclebot.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();
    Some(guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("recyclebot").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_search_flags() {
        let cli = parse(&["-vv", "search", "--max-trials", "5", "--overwrite", "--data-dir", "d"]);
        assert_eq!(cli.verbose, 2);
        let Commands::Search(args) = cli.command else {
            panic!("expected search");
        };
        assert_eq!(args.max_trials, Some(5));
        assert!(args.overwrite);
        assert_eq!(args.data_dir, Some(PathBuf::from("d")));
    }

    #[test]
    fn test_train_collects_assignments() {
        let cli = parse(&[
            "train",
            "--hp",
            "learning_rate=0.001",
            "--hp",
            "dropout=0.2",
            "--export",
            "--force",
        ]);
        let Commands::Train(args) = cli.command else {
            panic!("expected train");
        };
        assert_eq!(args.assignments, vec!["learning_rate=0.001", "dropout=0.2"]);
        assert!(args.export && args.force);
    }

    #[test]
    fn test_force_requires_export() {
        let result = Cli::try_parse_from(["recyclebot", "train", "--force"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_predict_needs_images() {
        assert!(Cli::try_parse_from(["recyclebot", "predict", "model/1"]).is_err());
        let cli = parse(&["predict", "model/1", "a.jpg", "b.jpg", "--top-k", "2"]);
        let Commands::Predict(args) = cli.command else {
            panic!("expected predict");
        };
        assert_eq!(args.images.len(), 2);
        assert_eq!(args.top_k, 2);
        assert!(!args.json);
    }

    #[test]
    fn test_best_and_config() {
        let cli = parse(&["-w", "/tmp/ws", "best", "-n", "5"]);
        assert_eq!(cli.workspace, PathBuf::from("/tmp/ws"));
        assert!(matches!(cli.command, Commands::Best { n: 5 }));
        let cli = parse(&["config", "init"]);
        assert!(matches!(
            cli.command,
            Commands::Config {
                action: ConfigAction::Init
            }
        ));
    }

    #[test]
    fn test_filter_directive() {
        assert_eq!(filter_directive(0, true, "info"), "error");
        assert_eq!(filter_directive(0, false, "warn"), "warn");
        assert_eq!(filter_directive(1, false, "info"), "debug");
        assert_eq!(filter_directive(3, true, "info"), "trace");
    }
}
