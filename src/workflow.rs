//! 設定・データセット・学習・推論をつなぐワークフロー。

use crate::assembly::ResidualAssembler;
use crate::checkpoint::{CheckpointStore, RunRecord, Workspace};
use crate::config::{ModelKind, WorkflowConfig, restarted_run_id};
use crate::dataset::FieldDataset;
use crate::error::{PdeError, Result};
use crate::inference::{InferenceAggregator, ReactionForces};
use crate::model::{BayesianNet, DeterministicNet, FieldSurrogate};
use crate::plot::{plot_loss_history, plot_sigma2_history};
use crate::schedule::PhaseSchedule;
use crate::training::{TrainingPlan, resolve_restart, train};
use burn::backend::{Autodiff, NdArray};
use burn::module::AutodiffModule;
use burn::prelude::Backend;
use std::path::PathBuf;
use tracing::{info, warn};

/// 学習用バックエンド
pub type TrainBackend = Autodiff<NdArray<f32>>;
/// 推論用バックエンド
pub type InferBackend = NdArray<f32>;

/// 学習・推論に使うデータ。
#[derive(Debug, Clone)]
pub enum DataSource {
    Npy { features: PathBuf, labels: PathBuf },
    SyntheticPlate { samples: usize, size: usize },
}

impl DataSource {
    /// 設定の `DataPath` に `features.npy` と `labels.npy` があればそれを使います。
    pub fn from_config_or(config: &WorkflowConfig, fallback: DataSource) -> DataSource {
        if config.nn.data_path.is_empty() {
            return fallback;
        }
        let dir = PathBuf::from(&config.nn.data_path);
        DataSource::Npy {
            features: dir.join("features.npy"),
            labels: dir.join("labels.npy"),
        }
    }

    fn load(&self, config: &WorkflowConfig) -> Result<FieldDataset> {
        let layout = config.layout()?;
        match self {
            DataSource::Npy { features, labels } => FieldDataset::from_npy(layout, features, labels),
            DataSource::SyntheticPlate { samples, size } => {
                FieldDataset::synthetic_plate(layout, *samples, *size, config.nn.seed)
            }
        }
    }
}

/// 反力の出力指定。
#[derive(Debug, Clone)]
pub struct ReactionOutput {
    pub test_folder: String,
}

#[derive(Debug, Clone)]
pub struct TrainRequest {
    /// 新規実行の設定ファイル (再開時は無視されます)
    pub config: Option<PathBuf>,
    /// 再開元の実行記録
    pub restart_from: Option<PathBuf>,
    pub restart_at: Option<usize>,
    /// ウォームスタート元 (決定論モデルの実行記録)
    pub init_from: Option<PathBuf>,
    pub continue_run: Option<usize>,
    pub data: DataSource,
    pub workspace: PathBuf,
    pub reaction: Option<ReactionOutput>,
}

#[derive(Debug, Clone)]
pub struct InferRequest {
    pub record: PathBuf,
    pub restart_at: Option<usize>,
    pub data: DataSource,
    pub workspace: PathBuf,
    pub reaction: Option<ReactionOutput>,
}

fn timestamp() -> String {
    chrono::Local::now().format("%Y%m%d%H%M%S").to_string()
}

/// 設定と学習計画を決めます。再開時は保存済みの設定をそのまま使います。
fn plan(request: &TrainRequest) -> Result<(WorkflowConfig, TrainingPlan)> {
    if let Some(record_path) = &request.restart_from {
        let previous = RunRecord::load(record_path)?;
        info!("保存済みの設定を使用します (指定された設定ファイルは無視されます)");
        let continue_run = request.continue_run.unwrap_or(previous.config.nn.epochs);
        let store = CheckpointStore::new(&previous.checkpoint_dir);
        let loaded = resolve_restart(&store, request.restart_at)?;
        let plan = TrainingPlan {
            run_id: restarted_run_id(&previous.run_id, continue_run, loaded),
            schedule: PhaseSchedule::resumed(continue_run),
            restore: loaded.map(|epoch| (store, epoch)),
            warm_start: None,
            restarted_from: Some(previous.run_id.clone()),
        };
        return Ok((previous.config, plan));
    }

    let path = request
        .config
        .as_ref()
        .ok_or(PdeError::MissingConfig)?;
    let config = WorkflowConfig::load(path)?;
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("config");
    let mut plan = TrainingPlan::fresh(&config, config.run_id(stem, &timestamp()));
    plan.warm_start = warm_start_source(request, &config);
    if plan.warm_start.is_some() {
        plan.schedule.initial_epoch = 0;
    }
    Ok((config, plan))
}

/// `--init-from` を優先し、なければベイズモデルに限り設定の `SaveCNNModel` を使います。
fn warm_start_source(request: &TrainRequest, config: &WorkflowConfig) -> Option<PathBuf> {
    if let Some(source) = &request.init_from {
        return Some(source.clone());
    }
    let source = config.warm_start_source()?;
    if !config.is_bayesian() {
        warn!("決定論モデルのため SaveCNNModel ({}) を無視します", source.display());
        return None;
    }
    Some(source.to_path_buf())
}

/// `train` サブコマンド: 学習し、テストデータで推論結果を書き出します。
pub fn run_train(request: &TrainRequest) -> Result<RunRecord> {
    let (config, plan) = plan(request)?;
    let workspace = Workspace::new(&request.workspace);
    let dataset = DataSource::from_config_or(&config, request.data.clone()).load(&config)?;
    match config.nn.architecture {
        ModelKind::Deterministic => {
            fit::<DeterministicNet<TrainBackend>>(&config, plan, &dataset, &workspace, request.reaction.as_ref())
        }
        ModelKind::Bayesian => {
            fit::<BayesianNet<TrainBackend>>(&config, plan, &dataset, &workspace, request.reaction.as_ref())
        }
    }
}

fn fit<M>(
    config: &WorkflowConfig,
    plan: TrainingPlan,
    dataset: &FieldDataset,
    workspace: &Workspace,
    reaction: Option<&ReactionOutput>,
) -> Result<RunRecord>
where
    M: AutodiffModule<TrainBackend> + FieldSurrogate<TrainBackend>,
    M::InnerModule: FieldSurrogate<InferBackend>,
{
    let device = Default::default();
    let (train_set, val_set, test_set) = dataset.split(config.nn.seed);
    info!(
        "データセット: train={}, val={}, test={}, grid={:?}",
        train_set.len(),
        val_set.len(),
        test_set.len(),
        dataset.grid()
    );
    let outcome = train::<TrainBackend, M>(config, plan, &train_set, &val_set, workspace, &device)?;
    let record = outcome.record;

    let loss_png = workspace.results_dir().join(format!("{}-loss.png", record.run_id));
    match plot_loss_history(&record.losses, &loss_png) {
        Ok(()) => info!("損失グラフを '{}' に保存しました", loss_png.display()),
        Err(e) => warn!("{e}"),
    }
    if config.is_bayesian() {
        let sigma_png = workspace.results_dir().join(format!("{}-sigma2.png", record.run_id));
        if let Err(e) = plot_sigma2_history(&record.var_sigma2, &sigma_png) {
            warn!("{e}");
        }
    }

    if test_set.is_empty() {
        warn!("テストデータがないため推論を省略します");
    } else {
        predict(config, &outcome.model.valid(), &test_set, workspace, &record.run_id, reaction)?;
    }
    Ok(record)
}

fn predict<M: FieldSurrogate<InferBackend>>(
    config: &WorkflowConfig,
    model: &M,
    data: &FieldDataset,
    workspace: &Workspace,
    run_id: &str,
    reaction: Option<&ReactionOutput>,
) -> Result<()> {
    let device = <InferBackend as Backend>::Device::default();
    let assembler = ResidualAssembler::builder(config.layout()?, data.grid_spacing())
        .physics(config.physics()?.build::<InferBackend>())
        .build()?;
    let aggregator = InferenceAggregator::new(assembler, config.monte_carlo_draws());
    let features = data.all_features::<InferBackend>(&device);

    let outcome = aggregator.run(model, features, reaction.is_some())?;
    for path in outcome.stats.write_npy(workspace.results_dir(), run_id)? {
        info!("=> {} を保存しました", path.display());
    }
    if let (Some(output), Some(forces)) = (reaction, outcome.reaction) {
        let path = workspace
            .results_dir()
            .join(ReactionForces::file_name(run_id, &output.test_folder));
        forces.write_npy(&path)?;
        info!("=> 反力を {} に保存しました", path.display());
    }
    Ok(())
}

/// `infer` サブコマンド: 保存済みチェックポイントで推論します。
pub fn run_infer(request: &InferRequest) -> Result<()> {
    let record = RunRecord::load(&request.record)?;
    let config = record.config.clone();
    let workspace = Workspace::new(&request.workspace);
    let dataset = request.data.load(&config)?;
    let store = CheckpointStore::new(&record.checkpoint_dir);
    let epoch = store.resolve(request.restart_at)?;
    info!("{} のエポック {} で推論します", record.run_id, epoch);
    match config.nn.architecture {
        ModelKind::Deterministic => infer_with::<DeterministicNet<InferBackend>>(
            &config, &store, epoch, &dataset, &workspace, &record.run_id, request,
        ),
        ModelKind::Bayesian => infer_with::<BayesianNet<InferBackend>>(
            &config, &store, epoch, &dataset, &workspace, &record.run_id, request,
        ),
    }
}

fn infer_with<M: FieldSurrogate<InferBackend>>(
    config: &WorkflowConfig,
    store: &CheckpointStore,
    epoch: usize,
    dataset: &FieldDataset,
    workspace: &Workspace,
    run_id: &str,
    request: &InferRequest,
) -> Result<()> {
    let device = Default::default();
    let model = store.load(M::from_config(&config.network()?, &device), epoch, &device)?;
    predict(config, &model, dataset, workspace, run_id, request.reaction.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::SAMPLE;

    fn request(dir: &std::path::Path, text: &str) -> TrainRequest {
        let config = dir.join("plate.toml");
        std::fs::write(&config, text).unwrap();
        TrainRequest {
            config: Some(config),
            restart_from: None,
            restart_at: None,
            init_from: None,
            continue_run: None,
            data: DataSource::SyntheticPlate { samples: 4, size: 5 },
            workspace: dir.to_path_buf(),
            reaction: None,
        }
    }

    fn with_saved_model(text: &str) -> String {
        text.replacen("[nn]\n", "[nn]\nSaveCNNModel = \"results/plate-NN.json\"\n", 1)
    }

    #[test]
    fn save_cnn_model_is_used_when_init_from_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let (config, plan) = plan(&request(dir.path(), &with_saved_model(SAMPLE))).unwrap();
        assert!(config.is_bayesian());
        assert_eq!(plan.warm_start, Some(PathBuf::from("results/plate-NN.json")));
        assert_eq!(plan.schedule.initial_epoch, 0);
    }

    #[test]
    fn init_from_overrides_save_cnn_model() {
        let dir = tempfile::tempdir().unwrap();
        let mut request = request(dir.path(), &with_saved_model(SAMPLE));
        request.init_from = Some(PathBuf::from("other.json"));
        let (_, plan) = plan(&request).unwrap();
        assert_eq!(plan.warm_start, Some(PathBuf::from("other.json")));
    }

    #[test]
    fn deterministic_run_ignores_save_cnn_model() {
        let dir = tempfile::tempdir().unwrap();
        let text = with_saved_model(SAMPLE).replace("\"BNN\"", "\"NN\"");
        let (_, plan) = plan(&request(dir.path(), &text)).unwrap();
        assert_eq!(plan.warm_start, None);
        assert_eq!(plan.schedule.initial_epoch, 5);
    }

    #[test]
    fn fresh_run_without_config_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut request = request(dir.path(), SAMPLE);
        request.config = None;
        assert!(matches!(plan(&request), Err(PdeError::MissingConfig)));
    }
}
