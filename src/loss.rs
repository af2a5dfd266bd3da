//! 弱形式 PDE 拘束付きの損失関数。

use crate::assembly::{AssembledResidual, ResidualAssembler, validity_mask};
use crate::error::Result;
use crate::schedule::TrainingContext;
use burn::prelude::Backend;
use burn::tensor::{Distribution, Tensor};
use serde::{Deserialize, Serialize};

/// データ整合項の目標値。ディリクレ固定値 (スケール後 0.5) と整合させます。
pub const SYNTHETIC_TARGET: f64 = 0.5;

/// 負の対数尤度の尺度の下限
const SIGMA_FLOOR: f64 = 1.0e-8;

/// データ整合項で予測に合わせる合成目標。
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyntheticTarget {
    /// 有効節点すべてで `SYNTHETIC_TARGET`
    #[default]
    Constant,
    /// 呼び出しごとに `N(SYNTHETIC_TARGET, std)` を引き直す
    Jittered { std: f64 },
}

impl SyntheticTarget {
    fn sample<B: Backend>(&self, dims: [usize; 4], device: &B::Device) -> Tensor<B, 4> {
        match *self {
            SyntheticTarget::Constant => Tensor::full(dims, SYNTHETIC_TARGET, device),
            SyntheticTarget::Jittered { std } => {
                Tensor::random(dims, Distribution::Normal(SYNTHETIC_TARGET, std), device)
            }
        }
    }
}

/// 構築時に選ぶ損失の種類。
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LossKind {
    /// データ項 + 残差二乗和
    Deterministic,
    /// 予測に `N(0, sigma1)` の雑音を加え、残差の負の対数尤度を用いる
    Probabilistic {
        sigma1: f64,
        /// モデルが `Sigma2` を持たない場合の尺度
        sigma2: f64,
    },
}

/// 損失とその内訳。
#[derive(Debug, Clone)]
pub struct LossTerms<B: Backend> {
    pub total: Tensor<B, 1>,
    /// 重みを掛ける前のデータ整合項
    pub data: Tensor<B, 1>,
    /// 重みを掛ける前の物理項 (二乗和または負の対数尤度)
    pub physics: Tensor<B, 1>,
    /// 内部節点の残差二乗和 (バッチ平均)
    pub body: Tensor<B, 1>,
    /// ノイマン残差の二乗和 (バッチ平均)
    pub neumann: Tensor<B, 1>,
}

/// モデル出力 `[prediction | features]` からスカラー損失を計算します。
pub struct PdeLoss<B: Backend> {
    assembler: ResidualAssembler<B>,
    kind: LossKind,
    target: SyntheticTarget,
}

impl<B: Backend> PdeLoss<B> {
    pub fn new(assembler: ResidualAssembler<B>, kind: LossKind, target: SyntheticTarget) -> Self {
        Self {
            assembler,
            kind,
            target,
        }
    }

    pub fn assembler(&self) -> &ResidualAssembler<B> {
        &self.assembler
    }

    pub fn kind(&self) -> LossKind {
        self.kind
    }

    /// 損失を計算します。重みは `ctx` から読み取るだけで、書き換えません。
    ///
    /// 重みが 0 の項は評価しないため、残差が発散していても寄与は厳密に 0 です。
    pub fn forward(
        &self,
        ctx: &TrainingContext,
        output: Tensor<B, 4>,
        sigma2: Option<Tensor<B, 1>>,
    ) -> Result<LossTerms<B>> {
        let layout = self.assembler.layout();
        layout.check_prediction(&output)?;
        let (prediction, features) = layout.split_output(output);
        let weights = ctx.weights();

        let (residual, physics) = match self.kind {
            LossKind::Deterministic => {
                let residual = self.assembler.assemble(&features, prediction)?;
                let physics = batch_sum_of_squares(residual.reduced.clone());
                (residual, physics)
            }
            LossKind::Probabilistic { sigma1, sigma2: fallback } => {
                let noise = Tensor::random(prediction.shape(), Distribution::Normal(0.0, sigma1), &prediction.device());
                let residual = self.assembler.assemble(&features, prediction + noise)?;
                let scale = sigma2.unwrap_or_else(|| Tensor::from_floats([fallback as f32], &residual.reduced.device()));
                let physics = gaussian_nll(residual.reduced.clone(), scale);
                (residual, physics)
            }
        };
        let data = self.data_term(&residual);

        let device = data.device();
        let mut total = Tensor::<B, 1>::zeros([1], &device);
        if weights.mse != 0.0 {
            total = total + data.clone().mul_scalar(weights.mse);
        }
        if weights.pde != 0.0 {
            total = total + physics.clone().mul_scalar(weights.pde);
        }

        Ok(LossTerms {
            total,
            data,
            physics,
            body: batch_sum_of_squares(residual.body.clone()),
            neumann: batch_sum_of_squares(residual.neumann_discrepancy),
        })
    }

    /// 有効節点で合成目標と境界補正済み予測の二乗誤差を平均します。
    fn data_term(&self, residual: &AssembledResidual<B>) -> Tensor<B, 1> {
        let valid = validity_mask(residual.dummy.clone());
        let target = self.target.sample::<B>(valid.dims(), &valid.device()) * valid.clone();
        let prediction = residual.corrected.clone() * valid;
        (target - prediction).powi_scalar(2).mean()
    }
}

/// `mean_batch(sum_{h,w,c}(r²))`
fn batch_sum_of_squares<B: Backend>(residual: Tensor<B, 4>) -> Tensor<B, 1> {
    let [b, h, w, c] = residual.dims();
    residual
        .powi_scalar(2)
        .reshape([b, h * w * c])
        .sum_dim(1)
        .mean()
}

/// `sum_{h,w,c}(mean_batch(-log N(r; 0, σ)))`
fn gaussian_nll<B: Backend>(residual: Tensor<B, 4>, sigma: Tensor<B, 1>) -> Tensor<B, 1> {
    let sigma = sigma.clamp_min(SIGMA_FLOOR).reshape([1, 1, 1, 1]);
    let half_log_two_pi = 0.5 * (2.0 * std::f64::consts::PI).ln();
    let nll = residual.div(sigma.clone()).powi_scalar(2).mul_scalar(0.5) + sigma.log().add_scalar(half_log_two_pi);
    nll.mean_dim(0).sum()
}
