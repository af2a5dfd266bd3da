use crate::assembly::ResidualAssembler;
use crate::error::{PdeError, Result};
use crate::field::{FieldLayout, to_physical};
use crate::model::FieldSurrogate;
use burn::prelude::Backend;
use burn::tensor::Tensor;
use ndarray::{Array2, Array4};
use ndarray_npy::write_npy;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::info;

/// モンテカルロ推論の統計量 `[batch, h, w, dof]`。
#[derive(Debug, Clone)]
pub struct PredictionStats<B: Backend> {
    pub mean: Tensor<B, 4>,
    pub var: Tensor<B, 4>,
    pub std: Tensor<B, 4>,
}

impl<B: Backend> PredictionStats<B> {
    /// `<prefix>-mean.npy`, `<prefix>-var.npy`, `<prefix>-std.npy` を書き出します。
    pub fn write_npy(&self, dir: impl AsRef<Path>, prefix: &str) -> Result<Vec<PathBuf>> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let mut written = Vec::with_capacity(3);
        for (name, field) in [("mean", &self.mean), ("var", &self.var), ("std", &self.std)] {
            let path = dir.join(format!("{prefix}-{name}.npy"));
            write_npy(&path, &to_array4(field.clone())?)?;
            written.push(path);
        }
        Ok(written)
    }
}

/// 反力の集計。1行が1サンプルで、`[荷重 (dof), 反力平均 (dof), 反力標準偏差 (dof)]`。
#[derive(Debug, Clone, PartialEq)]
pub struct ReactionForces {
    pub rows: Array2<f32>,
}

impl ReactionForces {
    /// `<run-id>-<test-folder>-F.npy`
    pub fn file_name(run_id: &str, test_folder: &str) -> String {
        format!("{run_id}-{test_folder}-F.npy")
    }

    pub fn write_npy(&self, path: impl AsRef<Path>) -> Result<()> {
        write_npy(path, &self.rows)?;
        Ok(())
    }
}

/// 1回の推論結果。反力は要求された場合のみ含まれます。
#[derive(Debug, Clone)]
pub struct InferenceOutcome<B: Backend> {
    pub stats: PredictionStats<B>,
    pub reaction: Option<ReactionForces>,
}

/// 確率的な順伝播を繰り返し、境界補正済みの予測を集計します。
pub struct InferenceAggregator<B: Backend> {
    assembler: ResidualAssembler<B>,
    draws: usize,
}

impl<B: Backend> InferenceAggregator<B> {
    pub fn new(assembler: ResidualAssembler<B>, draws: usize) -> Self {
        Self {
            assembler,
            draws: draws.max(1),
        }
    }

    pub fn draws(&self) -> usize {
        self.draws
    }

    /// 予測の平均・分散・標準偏差。分散は `mean((x - mean)²)` (標本分散ではない)。
    pub fn predict<M: FieldSurrogate<B>>(&self, model: &M, features: Tensor<B, 4>) -> Result<PredictionStats<B>> {
        Ok(self.run(model, features, false)?.stats)
    }

    /// 予測統計と、`with_reaction` なら同じドローから求めた反力を返します。
    pub fn run<M: FieldSurrogate<B>>(
        &self,
        model: &M,
        features: Tensor<B, 4>,
        with_reaction: bool,
    ) -> Result<InferenceOutcome<B>> {
        let inference_start = Instant::now();
        let layout = *self.assembler.layout();
        let mut samples = Vec::with_capacity(self.draws);
        let mut reactions = Vec::new();
        let mut loads = None;
        for _ in 0..self.draws {
            let output = model.forward(features.clone());
            layout.check_prediction(&output)?;
            let (prediction, inputs) = layout.split_output(output);
            if with_reaction {
                if loads.is_none() {
                    loads = Some(boundary_loads(&inputs, &layout));
                }
                let residual = self.assembler.assemble(&inputs, prediction)?;
                samples.push(residual.corrected);
                reactions.push(residual.reaction);
            } else {
                samples.push(self.assembler.apply_dirichlet(&inputs, prediction)?);
            }
        }
        let (mean, var) = moments::<B, 4, 5>(samples);
        let std = var.clone().sqrt();
        let reaction = match loads {
            Some(loads) => Some(reaction_rows(loads, reactions)?),
            None => None,
        };
        info!(
            "推論が完了しました。draws={}, 出力形状: {:?}, 推論時間: {:.2?}",
            self.draws,
            mean.dims(),
            inference_start.elapsed()
        );
        Ok(InferenceOutcome {
            stats: PredictionStats { mean, var, std },
            reaction,
        })
    }
}

/// `[荷重, Σ 節点平均, Σ 節点標準偏差]`。統計はドロー間で節点ごとに取ってから空間方向に合計します。
fn reaction_rows<B: Backend>(loads: Tensor<B, 2>, reactions: Vec<Tensor<B, 4>>) -> Result<ReactionForces> {
    if reactions.is_empty() {
        return Err(PdeError::TensorData("反力のサンプルがありません".to_string()));
    }
    let (mean, var) = moments::<B, 4, 5>(reactions);
    let rows = Tensor::cat(vec![loads, spatial_sum(mean), spatial_sum(var.sqrt())], 1);
    Ok(ReactionForces { rows: to_array2(rows)? })
}

/// サンプルを新しい先頭軸に積み、平均と (偏りのある) 分散を求めます。
fn moments<B: Backend, const D: usize, const E: usize>(samples: Vec<Tensor<B, D>>) -> (Tensor<B, D>, Tensor<B, D>) {
    let stacked = Tensor::<B, D>::stack::<E>(samples, 0);
    let mean = stacked.clone().mean_dim(0);
    let var = (stacked - mean.clone()).powi_scalar(2).mean_dim(0);
    (mean.squeeze::<D>(0), var.squeeze::<D>(0))
}

/// `[b, h, w, c]` → `[b, c]`
fn spatial_sum<B: Backend>(field: Tensor<B, 4>) -> Tensor<B, 2> {
    let [b, h, w, c] = field.dims();
    field.reshape([b, h * w, c]).sum_dim(1).reshape([b, c])
}

/// ノイマンチャンネルの最大値を物理量に戻した荷重 `[b, dof]`。
fn boundary_loads<B: Backend>(features: &Tensor<B, 4>, layout: &FieldLayout) -> Tensor<B, 2> {
    let [b, h, w, _] = features.dims();
    let blocks = (0..layout.neumann.blocks())
        .map(|k| layout.neumann_block(features.clone(), k).reshape([b, h * w, layout.dof]))
        .collect();
    let peak = Tensor::cat(blocks, 1).max_dim(1).reshape([b, layout.dof]);
    to_physical(peak)
}

fn to_array4<B: Backend>(field: Tensor<B, 4>) -> Result<Array4<f32>> {
    let [b, h, w, c] = field.dims();
    let values = field
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| PdeError::TensorData(format!("{e:?}")))?;
    Array4::from_shape_vec((b, h, w, c), values).map_err(|e| PdeError::TensorData(e.to_string()))
}

fn to_array2<B: Backend>(field: Tensor<B, 2>) -> Result<Array2<f32>> {
    let [rows, cols] = field.dims();
    let values = field
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| PdeError::TensorData(format!("{e:?}")))?;
    Array2::from_shape_vec((rows, cols), values).map_err(|e| PdeError::TensorData(e.to_string()))
}
