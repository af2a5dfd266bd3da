use std::fs;
use weak_pde::checkpoint::{CheckpointStore, RunRecord, Workspace};
use weak_pde::dataset::FieldDataset;
use weak_pde::model::{DeterministicNet, FieldSurrogate, PointEstimates};
use weak_pde::schedule::{Phase, PhaseSchedule};
use weak_pde::training::{TrainingPlan, train};
use weak_pde::workflow::{
    DataSource, InferRequest, ReactionOutput, TrainBackend, TrainRequest, run_infer, run_train,
};

const CONFIG: &str = r#"
[nn]
NNArchitecture = "NN"
Epochs = 4
InitialEpoch = 2
BatchSize = 4
Optimizer = "adam"
LearningRate = 1e-3
HiddenChannels = [4]
CheckpointEvery = 2

[physics]
kind = "linear_elasticity"
youngs_modulus = 100.0
poisson_ratio = 0.3
"#;

fn synthetic() -> DataSource {
    DataSource::SyntheticPlate { samples: 10, size: 5 }
}

fn fresh_request(dir: &std::path::Path) -> TrainRequest {
    let config = dir.join("plate.toml");
    fs::write(&config, CONFIG).unwrap();
    TrainRequest {
        config: Some(config),
        restart_from: None,
        restart_at: None,
        init_from: None,
        continue_run: None,
        data: synthetic(),
        workspace: dir.to_path_buf(),
        reaction: Some(ReactionOutput {
            test_folder: "test".to_string(),
        }),
    }
}

#[test]
fn fresh_run_follows_two_phase_schedule() {
    let dir = tempfile::tempdir().unwrap();
    let record = run_train(&fresh_request(dir.path())).unwrap();

    let phases = record.losses.iter().map(|l| l.phase).collect::<Vec<_>>();
    assert_eq!(phases, vec![Phase::Init, Phase::Init, Phase::Physics, Phase::Physics]);
    assert!(record.run_id.starts_with("plate-NN-B4-E4-I2-mc1-"));

    let results = dir.path().join("results");
    assert!(results.join(format!("{}.json", record.run_id)).is_file());
    assert!(results.join(format!("{}-mean.npy", record.run_id)).is_file());
    assert!(results.join(format!("{}-test-F.npy", record.run_id)).is_file());
}

#[test]
fn restart_runs_requested_epochs_in_physics_phase() {
    let dir = tempfile::tempdir().unwrap();
    let first = run_train(&fresh_request(dir.path())).unwrap();
    let record_path = dir.path().join("results").join(format!("{}.json", first.run_id));

    let mut request = fresh_request(dir.path());
    request.config = None;
    request.restart_from = Some(record_path.clone());
    request.continue_run = Some(3);
    let resumed = run_train(&request).unwrap();

    assert_eq!(resumed.losses.len(), 3);
    assert!(resumed.losses.iter().all(|l| l.phase == Phase::Physics));
    assert_eq!(resumed.config, first.config);
    assert_eq!(resumed.restarted_from.as_deref(), Some(first.run_id.as_str()));
    assert_eq!(resumed.run_id, format!("{}-e3-ra-ckpt0004", first.run_id));

    let saved = RunRecord::load(&record_path).unwrap();
    assert_eq!(saved.config, first.config);
}

fn max_difference(a: PointEstimates<TrainBackend>, b: PointEstimates<TrainBackend>) -> f32 {
    let kernels = a
        .kernels
        .into_iter()
        .zip(b.kernels)
        .map(|((_, x), (_, y))| (x - y).abs().max().into_scalar());
    let biases = a
        .biases
        .into_iter()
        .zip(b.biases)
        .map(|((_, x), (_, y))| (x - y).abs().max().into_scalar());
    kernels.chain(biases).fold(0.0, f32::max)
}

#[test]
fn restore_loads_saved_parameters_before_first_step() {
    let dir = tempfile::tempdir().unwrap();
    let first = run_train(&fresh_request(dir.path())).unwrap();
    let config = first.config.clone();
    let network = config.network().unwrap();
    let store = CheckpointStore::new(&first.checkpoint_dir);
    let epoch = store.latest().unwrap();
    let device = Default::default();
    let saved = store
        .load(DeterministicNet::<TrainBackend>::from_config(&network, &device), epoch, &device)
        .unwrap();
    let untrained = DeterministicNet::<TrainBackend>::from_config(&network, &device);
    assert!(max_difference(untrained.point_estimates(), saved.point_estimates()) > 0.0);

    // 0 エポックの再開: 読み込んだ直後のパラメータがそのまま返る
    let plan = TrainingPlan {
        run_id: "restored".to_string(),
        schedule: PhaseSchedule::resumed(0),
        restore: Some((store, epoch)),
        warm_start: None,
        restarted_from: Some(first.run_id.clone()),
    };
    let dataset = FieldDataset::synthetic_plate(config.layout().unwrap(), 10, 5, config.nn.seed).unwrap();
    let outcome = train::<TrainBackend, DeterministicNet<TrainBackend>>(
        &config,
        plan,
        &dataset,
        &dataset,
        &Workspace::new(dir.path()),
        &device,
    )
    .unwrap();
    assert!(outcome.record.losses.is_empty());
    assert_eq!(max_difference(outcome.model.point_estimates(), saved.point_estimates()), 0.0);
}

#[test]
fn restart_without_checkpoint_starts_from_scratch() {
    let dir = tempfile::tempdir().unwrap();
    let first = run_train(&fresh_request(dir.path())).unwrap();
    fs::remove_dir_all(&first.checkpoint_dir).unwrap();

    let mut request = fresh_request(dir.path());
    request.restart_from = Some(dir.path().join("results").join(format!("{}.json", first.run_id)));
    request.continue_run = Some(1);
    let resumed = run_train(&request).unwrap();
    assert_eq!(resumed.run_id, format!("{}-e1", first.run_id));
    assert_eq!(resumed.losses.len(), 1);
}

#[test]
fn infer_reads_latest_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let first = run_train(&fresh_request(dir.path())).unwrap();
    let request = InferRequest {
        record: dir.path().join("results").join(format!("{}.json", first.run_id)),
        restart_at: Some(2),
        data: synthetic(),
        workspace: dir.path().join("inference"),
        reaction: None,
    };
    run_infer(&request).unwrap();
    assert!(
        dir.path()
            .join("inference/results")
            .join(format!("{}-std.npy", first.run_id))
            .is_file()
    );
}
