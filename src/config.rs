//! ワークフロー設定 (TOML)。
//!
//! `[nn]` セクションのキーは PascalCase (`Epochs`, `InitialEpoch`, `NNArchitecture` など) です。

use crate::error::{PdeError, Result};
use crate::field::{FieldLayout, NeumannLayout};
use crate::loss::{LossKind, SyntheticTarget};
use crate::model::NetworkConfig;
use crate::physics::{BulkResidual, LinearElementResidual};
use burn::prelude::Backend;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub nn: NnConfig,
    /// 省略時は物理残差が未定義として扱われます
    #[serde(default)]
    pub physics: Option<PhysicsConfig>,
}

/// 代理モデルの種類。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelKind {
    #[serde(rename = "NN")]
    Deterministic,
    #[serde(rename = "BNN")]
    Bayesian,
}

impl ModelKind {
    pub fn tag(self) -> &'static str {
        match self {
            ModelKind::Deterministic => "NN",
            ModelKind::Bayesian => "BNN",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NnConfig {
    #[serde(rename = "NNArchitecture")]
    pub architecture: ModelKind,
    pub epochs: usize,
    pub initial_epoch: usize,
    pub batch_size: usize,
    pub optimizer: String,
    pub learning_rate: f64,
    #[serde(default = "default_monte_carlo_num")]
    pub monte_carlo_num: usize,
    #[serde(default)]
    pub sigma1: f64,
    #[serde(default)]
    pub sigma2: f64,
    #[serde(default)]
    pub use_two_neumann_channel: bool,
    /// ウォームスタート元となる決定論モデルの実行記録 (`--init-from` 未指定時に使用)
    #[serde(rename = "SaveCNNModel", default)]
    pub save_cnn_model: Option<PathBuf>,
    #[serde(default)]
    pub data_path: String,
    #[serde(default = "default_hidden_channels")]
    pub hidden_channels: Vec<usize>,
    #[serde(default = "default_kernel_size")]
    pub kernel_size: usize,
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every: usize,
    #[serde(default)]
    pub synthetic_target: SyntheticTarget,
    #[serde(default)]
    pub seed: u64,
}

fn default_monte_carlo_num() -> usize {
    1
}

fn default_hidden_channels() -> Vec<usize> {
    vec![16, 16]
}

fn default_kernel_size() -> usize {
    3
}

fn default_checkpoint_every() -> usize {
    100
}

/// バルク残差の選択。
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PhysicsConfig {
    LinearElasticity { youngs_modulus: f64, poisson_ratio: f64 },
    Diffusion { conductivity: f64 },
}

impl PhysicsConfig {
    pub fn dof(&self) -> usize {
        match self {
            PhysicsConfig::LinearElasticity { .. } => 2,
            PhysicsConfig::Diffusion { .. } => 1,
        }
    }

    /// 任意のバックエンド向けに残差関数を生成します。
    pub fn build<B: Backend>(&self) -> Box<dyn BulkResidual<B>> {
        match *self {
            PhysicsConfig::LinearElasticity {
                youngs_modulus,
                poisson_ratio,
            } => Box::new(LinearElementResidual::linear_elasticity(youngs_modulus, poisson_ratio)),
            PhysicsConfig::Diffusion { conductivity } => Box::new(LinearElementResidual::diffusion(conductivity)),
        }
    }
}

/// 対応しているオプティマイザ。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerKind {
    Adam,
    AdamW,
    Sgd,
    RmsProp,
    AdaGrad,
}

impl FromStr for OptimizerKind {
    type Err = PdeError;

    fn from_str(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "adam" => Ok(OptimizerKind::Adam),
            "adamw" => Ok(OptimizerKind::AdamW),
            "sgd" => Ok(OptimizerKind::Sgd),
            "rmsprop" => Ok(OptimizerKind::RmsProp),
            "adagrad" => Ok(OptimizerKind::AdaGrad),
            _ => Err(PdeError::UnknownOptimizer(name.to_string())),
        }
    }
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OptimizerKind::Adam => "adam",
            OptimizerKind::AdamW => "adamw",
            OptimizerKind::Sgd => "sgd",
            OptimizerKind::RmsProp => "rmsprop",
            OptimizerKind::AdaGrad => "adagrad",
        };
        f.write_str(name)
    }
}

impl WorkflowConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn physics(&self) -> Result<&PhysicsConfig> {
        self.physics
            .as_ref()
            .ok_or_else(|| PdeError::PhysicsNotImplemented("設定に [physics] セクションがありません".to_string()))
    }

    pub fn layout(&self) -> Result<FieldLayout> {
        Ok(FieldLayout::new(
            self.physics()?.dof(),
            NeumannLayout::from_flag(self.nn.use_two_neumann_channel),
        ))
    }

    pub fn optimizer(&self) -> Result<OptimizerKind> {
        self.nn.optimizer.parse()
    }

    pub fn is_bayesian(&self) -> bool {
        self.nn.architecture == ModelKind::Bayesian
    }

    /// 設定の `SaveCNNModel`。空文字列は未指定として扱います。
    pub fn warm_start_source(&self) -> Option<&Path> {
        self.nn
            .save_cnn_model
            .as_deref()
            .filter(|path| !path.as_os_str().is_empty())
    }

    /// 決定論モデルでは設定値にかかわらず 1。
    pub fn monte_carlo_draws(&self) -> usize {
        if self.is_bayesian() {
            self.nn.monte_carlo_num.max(1)
        } else {
            1
        }
    }

    /// 決定論モデルでは `Sigma1`, `Sigma2` を 0 とみなします。
    pub fn sigmas(&self) -> (f64, f64) {
        if self.is_bayesian() {
            (self.nn.sigma1, self.nn.sigma2)
        } else {
            (0.0, 0.0)
        }
    }

    pub fn loss_kind(&self) -> LossKind {
        let (sigma1, sigma2) = self.sigmas();
        if self.is_bayesian() {
            LossKind::Probabilistic { sigma1, sigma2 }
        } else {
            LossKind::Deterministic
        }
    }

    pub fn network(&self) -> Result<NetworkConfig> {
        let layout = self.layout()?;
        Ok(NetworkConfig::new(layout.feature_channels(), layout.dof)
            .with_hidden_channels(self.nn.hidden_channels.clone())
            .with_kernel_size(self.nn.kernel_size)
            .with_sigma2(if self.nn.sigma2 > 0.0 { self.nn.sigma2 } else { 1.0e-2 }))
    }

    /// 設定から実行IDを組み立てます。
    pub fn run_id(&self, stem: &str, timestamp: &str) -> String {
        let (sigma1, sigma2) = self.sigmas();
        format!(
            "{stem}-{}-B{}-E{}-I{}-mc{}-1S{:.1e}-2S{:.1e}-{}-{:.1e}-{timestamp}",
            self.nn.architecture.tag(),
            self.nn.batch_size,
            self.nn.epochs,
            self.nn.initial_epoch,
            self.monte_carlo_draws(),
            sigma1,
            sigma2,
            self.nn.optimizer,
            self.nn.learning_rate,
        )
    }
}

/// 再開した実行の ID。
pub fn restarted_run_id(previous: &str, continue_run: usize, loaded_epoch: Option<usize>) -> String {
    match loaded_epoch {
        Some(epoch) => format!("{previous}-e{continue_run}-ra-ckpt{epoch:04}"),
        None => format!("{previous}-e{continue_run}"),
    }
}
