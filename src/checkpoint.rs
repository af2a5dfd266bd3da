//! チェックポイントと実行記録の永続化。
//!
//! - モデルパラメータ: `restart/<run-id>/ckptNNNN.mpk`
//! - 実行記録: `results/<run-id>.json`

use crate::config::WorkflowConfig;
use crate::error::{PdeError, Result};
use crate::schedule::Phase;
use burn::module::Module;
use burn::prelude::Backend;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

const STAGING_DIR: &str = ".staging";

/// 出力先のルートディレクトリ。
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn results_dir(&self) -> PathBuf {
        self.root.join("results")
    }

    pub fn record_path(&self, run_id: &str) -> PathBuf {
        self.results_dir().join(format!("{run_id}.json"))
    }

    pub fn checkpoints(&self, run_id: &str) -> CheckpointStore {
        CheckpointStore::new(self.root.join("restart").join(run_id))
    }
}

/// 1回の実行のチェックポイントディレクトリ。
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn stem(epoch: usize) -> String {
        format!("ckpt{epoch:04}")
    }

    pub fn path_for(&self, epoch: usize) -> PathBuf {
        self.dir.join(format!("{}.mpk", Self::stem(epoch)))
    }

    /// モデルを保存します。一時ディレクトリに書き切ってから移動するため、
    /// 途中で失敗しても不完全なファイルは残りません。
    pub fn save<B: Backend, M: Module<B>>(&self, model: &M, epoch: usize) -> Result<PathBuf> {
        let staging = self.dir.join(STAGING_DIR);
        fs::create_dir_all(&staging)?;
        let staged = staging.join(Self::stem(epoch));
        model
            .clone()
            .save_file(&staged, &NamedMpkFileRecorder::<FullPrecisionSettings>::new())?;
        let target = self.path_for(epoch);
        fs::rename(staged.with_extension("mpk"), &target)?;
        debug!("チェックポイントを保存しました: {}", target.display());
        Ok(target)
    }

    /// 保存済みのエポック番号 (昇順)。
    pub fn epochs(&self) -> Result<Vec<usize>> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut epochs = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(epoch) = name
                .strip_prefix("ckpt")
                .and_then(|rest| rest.strip_suffix(".mpk"))
                .and_then(|digits| digits.parse::<usize>().ok())
            {
                epochs.push(epoch);
            }
        }
        epochs.sort_unstable();
        Ok(epochs)
    }

    pub fn latest(&self) -> Result<usize> {
        self.epochs()?
            .last()
            .copied()
            .ok_or_else(|| PdeError::CheckpointNotFound(self.dir.clone()))
    }

    /// 指定エポック、または指定がなければ最新のチェックポイントを選びます。
    pub fn resolve(&self, restart_at: Option<usize>) -> Result<usize> {
        match restart_at {
            Some(epoch) if self.path_for(epoch).is_file() => Ok(epoch),
            Some(epoch) => Err(PdeError::CheckpointNotFound(self.path_for(epoch))),
            None => self.latest(),
        }
    }

    pub fn load<B: Backend, M: Module<B>>(&self, model: M, epoch: usize, device: &B::Device) -> Result<M> {
        let path = self.path_for(epoch);
        if !path.is_file() {
            return Err(PdeError::CheckpointNotFound(path));
        }
        Ok(model.load_file(path, &NamedMpkFileRecorder::<FullPrecisionSettings>::new(), device)?)
    }
}

/// 1エポック分の損失。
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochLosses {
    pub epoch: usize,
    pub phase: Phase,
    pub loss: f64,
    pub val_loss: f64,
    pub mse: f64,
    pub res_body: f64,
    pub res_neu: f64,
}

/// 実行記録。再開時は `config` をそのまま引き継ぎます。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    #[serde(rename = "configdata")]
    pub config: WorkflowConfig,
    #[serde(rename = "restartedfrom")]
    pub restarted_from: Option<String>,
    #[serde(rename = "savedckpdir")]
    pub checkpoint_dir: PathBuf,
    pub losses: Vec<EpochLosses>,
    pub var_sigma2: Vec<f64>,
}

impl RunRecord {
    pub fn new(run_id: impl Into<String>, config: WorkflowConfig, checkpoint_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_id: run_id.into(),
            config,
            restarted_from: None,
            checkpoint_dir: checkpoint_dir.into(),
            losses: Vec::new(),
            var_sigma2: Vec::new(),
        }
    }

    /// 一時ファイルに書き出してから置き換えます。
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        fs::rename(&tmp, path)?;
        debug!("実行記録を保存しました: {}", path.display());
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(PdeError::CheckpointNotFound(path.to_path_buf()));
        }
        Ok(serde_json::from_slice(&fs::read(path)?)?)
    }
}
