//! CLI subcommand handlers.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use figment::value::{Dict, Value};
use recyclebot_core::config::workspace_config_path;
use recyclebot_core::{OracleKind, RecycleConfig, SearchConfig};
use recyclebot_ml::data::scan_directory;
use recyclebot_ml::export::ExportMetadata;
use recyclebot_ml::search::{OracleState, Trial, results_summary};
use recyclebot_ml::training::EnvironmentSnapshot;
use recyclebot_ml::{
    Classifier, Dataset, DeviceSelection, FineTuner, HyperParameters, RecycleHyperModel, Trainer,
    export_model, load_exported, open_oracle, predict_file, select_device,
};

use crate::progress::ProgressObserver;
use crate::{Commands, ConfigAction, PredictArgs, SearchArgs, TrainArgs};

/// Number of best trials printed after a search.
const SUMMARY_TRIALS: usize = 3;

/// Handle a CLI subcommand.
pub async fn handle_command(
    command: Commands,
    workspace: &Path,
    config_path: Option<&Path>,
    quiet: bool,
) -> anyhow::Result<()> {
    match command {
        Commands::Search(args) => handle_search(args, workspace, config_path, quiet).await,
        Commands::Train(args) => handle_train(args, workspace, config_path, quiet).await,
        Commands::Best { n } => handle_best(n, workspace, config_path),
        Commands::Export { force } => handle_export(force, workspace, config_path).await,
        Commands::Predict(args) => handle_predict(args, workspace, config_path).await,
        Commands::Config { action } => handle_config(action, workspace, config_path),
    }
}

fn load(
    workspace: &Path,
    config_path: Option<&Path>,
    overrides: Option<&Dict>,
) -> anyhow::Result<RecycleConfig> {
    recyclebot_core::load_config(Some(workspace), config_path, overrides)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))
}

/// Figment overrides for the flags `search` and `train` accept.
///
/// `--data-dir` is relative to the current directory, not the workspace.
fn overrides(max_trials: Option<usize>, overwrite: bool, data_dir: Option<&Path>) -> Dict {
    let mut search = Dict::new();
    if let Some(n) = max_trials {
        search.insert("max_trials".into(), Value::from(n as u64));
    }
    if overwrite {
        search.insert("overwrite".into(), Value::from(true));
    }
    let mut data = Dict::new();
    if let Some(dir) = data_dir {
        let dir = std::path::absolute(dir).unwrap_or_else(|_| dir.to_path_buf());
        data.insert(
            "data_dir".into(),
            Value::from(dir.to_string_lossy().into_owned()),
        );
    }

    let mut dict = Dict::new();
    if !search.is_empty() {
        dict.insert("search".into(), Value::from(search));
    }
    if !data.is_empty() {
        dict.insert("data".into(), Value::from(data));
    }
    dict
}

/// Flag flipped by Ctrl-C; training stops at the next batch.
fn cancel_on_ctrl_c() -> Arc<AtomicBool> {
    let flag = Arc::new(AtomicBool::new(false));
    let handle = flag.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, stopping the current trial");
            handle.store(true, Ordering::Relaxed);
        }
    });
    flag
}

async fn load_dataset(config: &RecycleConfig) -> anyhow::Result<Dataset> {
    let data = config.data.clone();
    let dataset = tokio::task::spawn_blocking(move || Dataset::load(&data))
        .await?
        .with_context(|| format!("Failed to load dataset from {}", config.data.data_dir.display()))?;
    check_num_classes(config, dataset.num_classes())?;
    Ok(dataset)
}

fn check_num_classes(config: &RecycleConfig, found: usize) -> anyhow::Result<()> {
    match config.model.num_classes {
        Some(expected) if expected != found => anyhow::bail!(
            "model.num_classes is {expected} but {} has {found} class directories",
            config.data.data_dir.display()
        ),
        _ => Ok(()),
    }
}

fn trainer(config: &RecycleConfig) -> Trainer {
    Trainer::new(
        config.data.batch_size,
        config.model.label_smoothing,
        config.data.augment.clone(),
        config.data.seed,
    )
}

fn build_tuner(
    config: &RecycleConfig,
    search: &SearchConfig,
    num_classes: usize,
    selection: DeviceSelection,
) -> anyhow::Result<FineTuner<RecycleHyperModel>> {
    let hypermodel = RecycleHyperModel::new(num_classes, &config.data, &config.model, selection);
    let oracle = open_oracle(search)?;
    Ok(FineTuner::new(
        hypermodel,
        oracle,
        trainer(config),
        config.training.clone(),
        search.max_consecutive_failed_trials,
    ))
}

fn export_trial(
    config: &RecycleConfig,
    trial: &Trial,
    model: &Classifier,
    class_names: Vec<String>,
    selection: &DeviceSelection,
    force: bool,
) -> anyhow::Result<PathBuf> {
    let metadata = ExportMetadata {
        class_names,
        hyperparameters: trial.hyperparameters.clone(),
        val_accuracy: trial.metrics.get("val_accuracy").copied(),
        environment: Some(EnvironmentSnapshot::capture(selection)),
    };
    Ok(export_model(model, metadata, &config.export, force)?)
}

async fn handle_search(
    args: SearchArgs,
    workspace: &Path,
    config_path: Option<&Path>,
    quiet: bool,
) -> anyhow::Result<()> {
    let overrides = overrides(args.max_trials, args.overwrite, args.data_dir.as_deref());
    let config = load(workspace, config_path, Some(&overrides))?;
    let selection = select_device(&config.device);
    println!("Device: {}", selection.describe());

    let dataset = load_dataset(&config).await?;
    println!(
        "Dataset: {} training and {} validation images in {} classes",
        dataset.train.len(),
        dataset.valid.len(),
        dataset.num_classes()
    );

    let cancel = cancel_on_ctrl_c();
    let force = args.overwrite;
    let exported = tokio::task::spawn_blocking(move || -> anyhow::Result<Option<PathBuf>> {
        let mut tuner = build_tuner(&config, &config.search, dataset.num_classes(), selection.clone())?
            .with_observer(Box::new(ProgressObserver::new(quiet)))
            .with_cancel_flag(cancel);
        tuner.search(&dataset.train, &dataset.valid)?;

        println!("{}", tuner.results_summary(SUMMARY_TRIALS));
        let Some(best) = tuner.get_best_hyperparameters(1).into_iter().next() else {
            tracing::warn!("No trial completed, nothing to export");
            return Ok(None);
        };
        println!("Best hyperparameters: {best}");

        let (trial, model) = tuner
            .get_best_models(1)?
            .into_iter()
            .next()
            .context("best trial has no checkpoint")?;
        let dir = export_trial(
            &config,
            &trial,
            &model,
            dataset.class_names.clone(),
            &selection,
            force,
        )?;
        Ok(Some(dir))
    })
    .await??;

    if let Some(dir) = exported {
        println!("Exported best model to {}", dir.display());
    }
    Ok(())
}

/// Project used by `train`, next to the search project.
fn train_project(search: &SearchConfig) -> SearchConfig {
    SearchConfig {
        oracle: OracleKind::Random,
        max_trials: 1,
        overwrite: true,
        project_name: format!("{}_train", search.project_name),
        ..search.clone()
    }
}

async fn handle_train(
    args: TrainArgs,
    workspace: &Path,
    config_path: Option<&Path>,
    quiet: bool,
) -> anyhow::Result<()> {
    let overrides = overrides(None, false, args.data_dir.as_deref());
    let config = load(workspace, config_path, Some(&overrides))?;

    let space = HyperParameters::from_specs(config.search.space.clone())?;
    let mut values = space.defaults();
    space.apply_assignments(&mut values, &args.assignments)?;
    println!("Hyperparameters: {values}");

    let selection = select_device(&config.device);
    println!("Device: {}", selection.describe());
    let dataset = load_dataset(&config).await?;

    let cancel = cancel_on_ctrl_c();
    let project = train_project(&config.search);
    let exported = tokio::task::spawn_blocking(move || -> anyhow::Result<Option<PathBuf>> {
        let mut tuner = build_tuner(&config, &project, dataset.num_classes(), selection.clone())?
            .with_observer(Box::new(ProgressObserver::new(quiet)))
            .with_cancel_flag(cancel);
        let (trial, model) = tuner.run_fixed(values, &dataset.train, &dataset.valid)?;
        for (name, value) in &trial.metrics {
            println!("{name}: {value:.4}");
        }
        if !args.export {
            return Ok(None);
        }
        let dir = export_trial(
            &config,
            &trial,
            &model,
            dataset.class_names.clone(),
            &selection,
            args.force,
        )?;
        Ok(Some(dir))
    })
    .await??;

    if let Some(dir) = exported {
        println!("Exported model to {}", dir.display());
    }
    Ok(())
}

fn handle_best(n: usize, workspace: &Path, config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = load(workspace, config_path, None)?;
    let search = existing_project(&config)?;
    let oracle = open_oracle(&search)?;
    print!("{}", results_summary(oracle.as_ref(), n));
    Ok(())
}

/// The configured search project, which must already exist on disk.
fn existing_project(config: &RecycleConfig) -> anyhow::Result<SearchConfig> {
    let search = SearchConfig {
        overwrite: false,
        ..config.search.clone()
    };
    let dir = search.project_dir();
    if !OracleState::exists(&dir) {
        anyhow::bail!("No search project at {}, run `recyclebot search` first", dir.display());
    }
    Ok(search)
}

async fn handle_export(
    force: bool,
    workspace: &Path,
    config_path: Option<&Path>,
) -> anyhow::Result<()> {
    let config = load(workspace, config_path, None)?;
    let search = existing_project(&config)?;
    let listing = scan_directory(&config.data.data_dir, &config.data.extensions)?;
    check_num_classes(&config, listing.num_classes())?;
    let selection = select_device(&config.device);

    let dir = tokio::task::spawn_blocking(move || -> anyhow::Result<PathBuf> {
        let tuner = build_tuner(&config, &search, listing.num_classes(), selection.clone())?;
        let (trial, model) = tuner
            .get_best_models(1)?
            .into_iter()
            .next()
            .context("the project has no completed trial")?;
        tracing::info!(trial_id = %trial.trial_id, score = ?trial.score, "Exporting best trial");
        export_trial(
            &config,
            &trial,
            &model,
            listing.class_names,
            &selection,
            force,
        )
    })
    .await??;

    println!("Exported best model to {}", dir.display());
    Ok(())
}

async fn handle_predict(
    args: PredictArgs,
    workspace: &Path,
    config_path: Option<&Path>,
) -> anyhow::Result<()> {
    let config = load(workspace, config_path, None)?;
    let selection = select_device(&config.device);

    let results = tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<_>> {
        let (model, card) = load_exported(&args.model_dir, &selection)
            .with_context(|| format!("Failed to load model from {}", args.model_dir.display()))?;
        tracing::debug!(name = %card.name, version = card.version, "Loaded exported model");
        args.images
            .iter()
            .map(|path| {
                let predictions = predict_file(&model, &card, path, args.top_k)
                    .with_context(|| format!("Failed to classify {}", path.display()))?;
                Ok((path.clone(), predictions))
            })
            .collect()
    })
    .await??;

    if args.json {
        let json: Vec<_> = results
            .iter()
            .map(|(path, predictions)| {
                serde_json::json!({
                    "image": path.display().to_string(),
                    "predictions": predictions,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&json)?);
        return Ok(());
    }
    for (path, predictions) in results {
        println!("{}", path.display());
        for p in predictions {
            println!("  {:<12} {:>6.2}%", p.label, p.probability * 100.0);
        }
    }
    Ok(())
}

fn handle_config(
    action: ConfigAction,
    workspace: &Path,
    config_path: Option<&Path>,
) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_path = workspace_config_path(workspace);
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }
            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&config_path, RecycleConfig::default().to_toml()?)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let config = load(workspace, config_path, None)?;
            println!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_overrides_reach_the_config() {
        let dir = TempDir::new().unwrap();
        let data = dir.path().join("images");
        let dict = overrides(Some(7), true, Some(&data));
        let config = load(dir.path(), None, Some(&dict)).unwrap();
        assert_eq!(config.search.max_trials, 7);
        assert!(config.search.overwrite);
        assert_eq!(config.data.data_dir, data);
    }

    #[test]
    fn test_config_paths_resolve_against_workspace() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".recyclebot")).unwrap();
        std::fs::write(
            workspace_config_path(dir.path()),
            "[data]\ndata_dir = \"trash\"\n\n[search]\ndirectory = \"runs\"\n",
        )
        .unwrap();

        let config = load(dir.path(), None, None).unwrap();
        assert_eq!(config.data.data_dir, dir.path().join("trash"));
        assert_eq!(config.search.directory, dir.path().join("runs"));
        assert!(config.export.dir.starts_with(dir.path()));

        let dict = overrides(None, false, Some(Path::new("flag_images")));
        let config = load(dir.path(), None, Some(&dict)).unwrap();
        assert_eq!(
            config.data.data_dir,
            std::env::current_dir().unwrap().join("flag_images")
        );
    }

    #[test]
    fn test_empty_overrides_keep_defaults() {
        let dir = TempDir::new().unwrap();
        let dict = overrides(None, false, None);
        assert!(dict.is_empty());
        let config = load(dir.path(), None, Some(&dict)).unwrap();
        assert_eq!(config.search.max_trials, SearchConfig::default().max_trials);
    }

    #[test]
    fn test_train_project_is_separate() {
        let search = SearchConfig::default();
        let project = train_project(&search);
        assert_eq!(project.max_trials, 1);
        assert!(project.overwrite);
        assert_ne!(project.project_dir(), search.project_dir());
        assert_eq!(project.directory, search.directory);
    }

    #[test]
    fn test_num_classes_mismatch() {
        let mut config = RecycleConfig::default();
        assert!(check_num_classes(&config, 6).is_ok());
        config.model.num_classes = Some(6);
        assert!(check_num_classes(&config, 6).is_ok());
        assert!(check_num_classes(&config, 5).is_err());
    }

    #[test]
    fn test_config_init_writes_loadable_file() {
        let dir = TempDir::new().unwrap();
        handle_config(ConfigAction::Init, dir.path(), None).unwrap();
        let path = workspace_config_path(dir.path());
        assert!(path.exists());
        let config = load(dir.path(), None, None).unwrap();
        assert_eq!(config.search.space.len(), SearchConfig::default().space.len());
        handle_config(ConfigAction::Init, dir.path(), None).unwrap();
    }

    #[test]
    fn test_best_requires_a_project() {
        let dir = TempDir::new().unwrap();
        let mut config = RecycleConfig::default();
        config.search.directory = dir.path().join("runs");
        assert!(existing_project(&config).is_err());
    }
}
