use crate::assembly::ResidualAssembler;
use crate::checkpoint::{CheckpointStore, EpochLosses, RunRecord, Workspace};
use crate::config::{OptimizerKind, WorkflowConfig};
use crate::dataset::FieldDataset;
use crate::error::{PdeError, Result};
use crate::loss::{LossTerms, PdeLoss};
use crate::model::{DeterministicNet, FieldSurrogate};
use crate::schedule::{Phase, PhaseSchedule, TrainingContext};
use burn::module::AutodiffModule;
use burn::optim::momentum::MomentumConfig;
use burn::optim::{
    AdaGradConfig, AdamConfig, AdamWConfig, GradientsParams, Optimizer, RmsPropConfig, SgdConfig,
};
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::{ElementConversion, Tensor};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};

/// ウォームスタート時に未変換スケールへ掛ける係数。
pub const WARM_START_SCALE_MULTIPLIER: f64 = 2.0;

/// 1回の学習実行の計画。
#[derive(Debug, Clone)]
pub struct TrainingPlan {
    pub run_id: String,
    pub schedule: PhaseSchedule,
    /// 読み込むチェックポイント (ストアとエポック)
    pub restore: Option<(CheckpointStore, usize)>,
    /// 決定論モデルの実行記録 (ウォームスタート元)
    pub warm_start: Option<PathBuf>,
    pub restarted_from: Option<String>,
}

impl TrainingPlan {
    pub fn fresh(config: &WorkflowConfig, run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            schedule: PhaseSchedule::new(config.nn.initial_epoch, config.nn.epochs),
            restore: None,
            warm_start: None,
            restarted_from: None,
        }
    }
}

/// 再開に使うチェックポイントを選びます。見つからない場合は警告のみで `None` を返します。
pub fn resolve_restart(store: &CheckpointStore, restart_at: Option<usize>) -> Result<Option<usize>> {
    match store.resolve(restart_at) {
        Ok(epoch) => Ok(Some(epoch)),
        Err(PdeError::CheckpointNotFound(path)) => {
            warn!("チェックポイントが見つからないため、最初から学習します: {}", path.display());
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// 損失関数を構築します。
pub fn build_loss<B: burn::prelude::Backend>(config: &WorkflowConfig, dh: f64) -> Result<PdeLoss<B>> {
    let assembler = ResidualAssembler::builder(config.layout()?, dh)
        .physics(config.physics()?.build::<B>())
        .build()?;
    Ok(PdeLoss::new(assembler, config.loss_kind(), config.nn.synthetic_target))
}

/// 学習済みモデルと実行記録。
pub struct TrainingOutcome<M> {
    pub model: M,
    pub record: RunRecord,
}

/// 段階的学習を実行します。
///
/// 損失重みは各エポックの最初に `TrainingContext::begin_epoch` で切り替え、そのエポックの
/// 順伝播はすべて切り替え後の重みを読みます。
pub fn train<B, M>(
    config: &WorkflowConfig,
    plan: TrainingPlan,
    train_set: &FieldDataset,
    val_set: &FieldDataset,
    workspace: &Workspace,
    device: &B::Device,
) -> Result<TrainingOutcome<M>>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + FieldSurrogate<B>,
{
    let optimizer = config.optimizer()?;
    let loss = build_loss::<B>(config, train_set.grid_spacing())?;
    train_set.layout().check_features(&train_set.features::<B>(0..train_set.len().min(1), device))?;

    let mut model = M::from_config(&config.network()?, device);
    let store = workspace.checkpoints(&plan.run_id);
    let mut record = RunRecord::new(plan.run_id.clone(), config.clone(), store.dir());
    record.restarted_from = plan.restarted_from.clone();

    if let Some((previous, epoch)) = &plan.restore {
        info!("チェックポイント {} から再開します", previous.path_for(*epoch).display());
        model = previous.load(model, *epoch, device)?;
    }
    if let Some(source) = &plan.warm_start {
        model = warm_start(model, source, device)?;
    }

    info!(
        "学習を開始します: run={}, physics={}, optimizer={}, epochs={}, initial_epoch={}",
        plan.run_id,
        loss.assembler().physics_name(),
        optimizer,
        plan.schedule.epochs,
        plan.schedule.initial_epoch
    );
    let training_start = Instant::now();
    let run = EpochRunner {
        config,
        plan: &plan,
        loss: &loss,
        train_set,
        val_set,
        store: &store,
        workspace,
        device,
    };
    let model = match optimizer {
        OptimizerKind::Adam => run.run(model, AdamConfig::new().init(), &mut record)?,
        OptimizerKind::AdamW => run.run(model, AdamWConfig::new().init(), &mut record)?,
        OptimizerKind::Sgd => run.run(
            model,
            SgdConfig::new()
                .with_momentum(Some(MomentumConfig::new().with_momentum(0.9)))
                .init(),
            &mut record,
        )?,
        OptimizerKind::RmsProp => run.run(model, RmsPropConfig::new().init(), &mut record)?,
        OptimizerKind::AdaGrad => run.run(model, AdaGradConfig::new().init(), &mut record)?,
    };
    record.save(workspace.record_path(&plan.run_id))?;
    info!("学習が完了しました。学習時間: {:.2?}", training_start.elapsed());

    Ok(TrainingOutcome { model, record })
}

/// 決定論モデルの最新チェックポイントで事後分布の位置パラメータを初期化します。
fn warm_start<B, M>(model: M, source_record: &Path, device: &B::Device) -> Result<M>
where
    B: AutodiffBackend,
    M: FieldSurrogate<B>,
{
    let source = RunRecord::load(source_record)?;
    let store = CheckpointStore::new(&source.checkpoint_dir);
    let epoch = store.latest()?;
    let deterministic = DeterministicNet::<B>::from_config(&source.config.network()?, device);
    let deterministic = store.load(deterministic, epoch, device)?;
    info!(
        "ウォームスタート: {} のエポック {} から位置パラメータを読み込みます",
        source.run_id, epoch
    );
    model.warm_start(&deterministic.point_estimates(), WARM_START_SCALE_MULTIPLIER)
}

struct EpochRunner<'a, B: AutodiffBackend> {
    config: &'a WorkflowConfig,
    plan: &'a TrainingPlan,
    loss: &'a PdeLoss<B>,
    train_set: &'a FieldDataset,
    val_set: &'a FieldDataset,
    store: &'a CheckpointStore,
    workspace: &'a Workspace,
    device: &'a B::Device,
}

#[derive(Default)]
struct Running {
    loss: f64,
    mse: f64,
    res_body: f64,
    res_neu: f64,
    batches: usize,
}

impl Running {
    fn add<B: AutodiffBackend>(&mut self, total: &Tensor<B, 1>, terms: &LossTerms<B>) {
        self.loss += scalar(total.clone());
        self.mse += scalar(terms.data.clone());
        self.res_body += scalar(terms.body.clone());
        self.res_neu += scalar(terms.neumann.clone());
        self.batches += 1;
    }

    fn mean(&self, epoch: usize, phase: Phase, val_loss: f64) -> EpochLosses {
        let n = self.batches.max(1) as f64;
        EpochLosses {
            epoch,
            phase,
            loss: self.loss / n,
            val_loss,
            mse: self.mse / n,
            res_body: self.res_body / n,
            res_neu: self.res_neu / n,
        }
    }
}

fn scalar<B: burn::prelude::Backend>(t: Tensor<B, 1>) -> f64 {
    t.into_scalar().elem::<f64>()
}

impl<B: AutodiffBackend> EpochRunner<'_, B> {
    fn run<M, O>(&self, mut model: M, mut optim: O, record: &mut RunRecord) -> Result<M>
    where
        M: AutodiffModule<B> + FieldSurrogate<B>,
        O: Optimizer<M, B>,
    {
        let schedule = &self.plan.schedule;
        let batches = self.train_set.batches(self.config.nn.batch_size);
        let kl_weight = 1.0 / batches.len().max(1) as f64;
        let every = self.config.nn.checkpoint_every.max(1);
        let mut ctx = TrainingContext::new();

        for epoch in 0..schedule.epochs {
            let weights = ctx.begin_epoch(schedule, epoch);
            if epoch == schedule.initial_epoch && ctx.phase() == Phase::Physics {
                info!("[Epoch {}] 物理残差フェーズに入ります (mse={}, pde={})", epoch, weights.mse, weights.pde);
            }

            let mut running = Running::default();
            for range in &batches {
                let features = self.train_set.features::<B>(range.clone(), self.device);
                let output = model.forward(features);
                let terms = self.loss.forward(&ctx, output, model.uncertainty_scale())?;
                let mut total = terms.total.clone();
                if let Some(kl) = model.kl_divergence() {
                    total = total + kl.mul_scalar(kl_weight);
                }
                running.add(&total, &terms);

                let grads = total.backward();
                let grads = GradientsParams::from_grads(grads, &model);
                model = optim.step(self.config.nn.learning_rate, model, grads);
            }

            let val_loss = self.validate(&model, &ctx)?;
            let losses = running.mean(epoch, ctx.phase(), val_loss);
            let var_sigma2 = model
                .uncertainty_scale()
                .map(|s| scalar(s).powi(2))
                .unwrap_or(0.0);
            info!(
                "[Epoch {}] Loss: {:.6}, Val Loss: {:.6}, MSE: {:.6}, Body: {:.6}, Neumann: {:.6}, Sigma2^2: {:.3e}",
                epoch, losses.loss, losses.val_loss, losses.mse, losses.res_body, losses.res_neu, var_sigma2
            );
            record.losses.push(losses);
            record.var_sigma2.push(var_sigma2);

            let completed = epoch + 1;
            let is_last = completed == schedule.epochs;
            if completed % every == 0 || is_last {
                self.store.save(&model, completed)?;
            }
            if epoch == 0 || completed % every == 0 {
                record.save(self.workspace.record_path(&record.run_id))?;
            }
        }
        Ok(model)
    }

    /// 検証データの平均損失 (KL 項を含まない)。逆伝播は行いません。
    fn validate<M>(&self, model: &M, ctx: &TrainingContext) -> Result<f64>
    where
        M: AutodiffModule<B> + FieldSurrogate<B>,
    {
        let batches = self.val_set.batches(self.config.nn.batch_size);
        if batches.is_empty() {
            return Ok(0.0);
        }
        let mut total = 0.0;
        for range in &batches {
            let output = model.forward(self.val_set.features::<B>(range.clone(), self.device));
            let terms = self.loss.forward(ctx, output, model.uncertainty_scale())?;
            total += scalar(terms.total);
        }
        Ok(total / batches.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelKind;
    use crate::config::tests::SAMPLE;
    use crate::model::BayesianNet;
    use burn::backend::{Autodiff, NdArray};

    type TestBackend = Autodiff<NdArray<f32>>;

    fn tiny_config(kind: ModelKind) -> WorkflowConfig {
        let mut config = WorkflowConfig::from_toml(SAMPLE).unwrap();
        config.nn.architecture = kind;
        config.nn.epochs = 3;
        config.nn.initial_epoch = 1;
        config.nn.batch_size = 2;
        config.nn.hidden_channels = vec![2];
        config.nn.checkpoint_every = 2;
        config
    }

    fn data(config: &WorkflowConfig) -> (FieldDataset, FieldDataset) {
        let dataset = FieldDataset::synthetic_plate(config.layout().unwrap(), 10, 5, 0).unwrap();
        let (train, val, _) = dataset.split(0);
        (train, val)
    }

    #[test]
    fn deterministic_run_writes_checkpoints_and_record() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::new(dir.path());
        let config = tiny_config(ModelKind::Deterministic);
        let (train_set, val_set) = data(&config);
        let plan = TrainingPlan::fresh(&config, "tiny");

        let outcome = train::<TestBackend, DeterministicNet<TestBackend>>(
            &config,
            plan,
            &train_set,
            &val_set,
            &workspace,
            &Default::default(),
        )
        .unwrap();

        assert_eq!(outcome.record.losses.len(), 3);
        assert!(outcome.record.var_sigma2.iter().all(|&v| v == 0.0));
        assert_eq!(workspace.checkpoints("tiny").epochs().unwrap(), vec![2, 3]);
        let saved = RunRecord::load(workspace.record_path("tiny")).unwrap();
        assert_eq!(saved, outcome.record);
    }

    #[test]
    fn final_epoch_is_always_checkpointed() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::new(dir.path());
        let mut config = tiny_config(ModelKind::Deterministic);
        config.nn.epochs = 2;
        config.nn.checkpoint_every = 100;
        config.nn.save_cnn_model = None;
        let (train_set, val_set) = data(&config);
        train::<TestBackend, DeterministicNet<TestBackend>>(
            &config,
            TrainingPlan::fresh(&config, "short"),
            &train_set,
            &val_set,
            &workspace,
            &Default::default(),
        )
        .unwrap();
        assert_eq!(workspace.checkpoints("short").epochs().unwrap(), vec![2]);
    }

    #[test]
    fn unknown_optimizer_fails_before_training() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::new(dir.path());
        let mut config = tiny_config(ModelKind::Deterministic);
        config.nn.optimizer = "lbfgs".to_string();
        let (train_set, val_set) = data(&config);
        let result = train::<TestBackend, DeterministicNet<TestBackend>>(
            &config,
            TrainingPlan::fresh(&config, "bad"),
            &train_set,
            &val_set,
            &workspace,
            &Default::default(),
        );
        assert!(matches!(result, Err(PdeError::UnknownOptimizer(_))));
        assert!(!workspace.record_path("bad").exists());
    }

    #[test]
    fn bayesian_run_warm_started_from_deterministic_run() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::new(dir.path());
        let source_config = tiny_config(ModelKind::Deterministic);
        let (train_set, val_set) = data(&source_config);
        train::<TestBackend, DeterministicNet<TestBackend>>(
            &source_config,
            TrainingPlan::fresh(&source_config, "source"),
            &train_set,
            &val_set,
            &workspace,
            &Default::default(),
        )
        .unwrap();

        let config = tiny_config(ModelKind::Bayesian);
        let mut plan = TrainingPlan::fresh(&config, "warm");
        plan.schedule = PhaseSchedule::new(0, 2);
        plan.warm_start = Some(workspace.record_path("source"));
        let outcome = train::<TestBackend, BayesianNet<TestBackend>>(
            &config,
            plan,
            &train_set,
            &val_set,
            &workspace,
            &Default::default(),
        )
        .unwrap();
        assert_eq!(outcome.record.losses.len(), 2);
        assert!(outcome.record.var_sigma2.iter().all(|&v| v.is_finite() && v > 0.0));
        assert!(outcome.record.losses.iter().all(|l| l.loss.is_finite()));
    }

    #[test]
    fn missing_checkpoint_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("nothing"));
        assert_eq!(resolve_restart(&store, None).unwrap(), None);
        assert_eq!(resolve_restart(&store, Some(100)).unwrap(), None);
    }
}
