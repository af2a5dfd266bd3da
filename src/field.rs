//! 構造格子上の場テンソル `[batch, height, width, channel]` のチャンネル構成。
//!
//! 入力特徴量は `dof` 個の値チャンネル (ディリクレ値) と、1つまたは2つの
//! ノイマンチャンネルブロックから構成されます。モデルの出力は予測値 `dof`
//! チャンネルの後ろに入力特徴量をそのまま連結したものです。

use crate::error::{PdeError, Result};
use burn::prelude::Backend;
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};

/// ノイマン境界条件のチャンネル配置。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NeumannLayout {
    /// 旧形式: 自由度ごとに1ブロック。辺の向きは隣接節点から判定します。
    Single,
    /// 新形式: 水平な辺に作用するブロックと鉛直な辺に作用するブロックの2つ。
    Dual,
}

impl NeumannLayout {
    pub fn from_flag(use_two_neumann_channel: bool) -> Self {
        if use_two_neumann_channel {
            NeumannLayout::Dual
        } else {
            NeumannLayout::Single
        }
    }

    pub fn blocks(self) -> usize {
        match self {
            NeumannLayout::Single => 1,
            NeumannLayout::Dual => 2,
        }
    }
}

/// 自由度数とノイマン配置から決まるチャンネル構成。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldLayout {
    pub dof: usize,
    pub neumann: NeumannLayout,
}

impl FieldLayout {
    pub fn new(dof: usize, neumann: NeumannLayout) -> Self {
        Self { dof, neumann }
    }

    /// 入力特徴量のチャンネル数 (`2·dof` または `3·dof`)。
    pub fn feature_channels(&self) -> usize {
        self.dof * (1 + self.neumann.blocks())
    }

    /// モデル出力のチャンネル数 (`3·dof` または `4·dof`)。
    pub fn prediction_channels(&self) -> usize {
        self.dof + self.feature_channels()
    }

    /// 入力特徴量がこの構成で解釈できるか検査します。
    pub fn check_features<B: Backend>(&self, features: &Tensor<B, 4>) -> Result<()> {
        let dims = features.dims();
        if dims[3] < self.feature_channels() {
            return Err(PdeError::shape(
                "入力特徴量",
                format!("{} チャンネル以上 (dof={})", self.feature_channels(), self.dof),
                &dims,
            ));
        }
        if dims[1] < 2 || dims[2] < 2 {
            return Err(PdeError::shape("入力特徴量", "2x2 以上の格子", &dims));
        }
        Ok(())
    }

    /// モデル出力のチャンネル数を検査します。
    pub fn check_prediction<B: Backend>(&self, output: &Tensor<B, 4>) -> Result<()> {
        let dims = output.dims();
        if dims[3] != self.prediction_channels() {
            return Err(PdeError::shape(
                "モデル出力",
                format!("{} チャンネル", self.prediction_channels()),
                &dims,
            ));
        }
        Ok(())
    }

    /// 値 (ディリクレ) チャンネル `0..dof`。
    pub fn value_block<B: Backend>(&self, field: Tensor<B, 4>) -> Tensor<B, 4> {
        channels(field, 0, self.dof)
    }

    /// `k` 番目のノイマンチャンネルブロック。
    pub fn neumann_block<B: Backend>(&self, field: Tensor<B, 4>, k: usize) -> Tensor<B, 4> {
        let start = self.dof * (1 + k);
        channels(field, start, start + self.dof)
    }

    /// モデル出力を予測値と入力特徴量に分割します。
    pub fn split_output<B: Backend>(&self, output: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 4>) {
        let prediction = channels(output.clone(), 0, self.dof);
        let features = channels(output, self.dof, self.prediction_channels());
        (prediction, features)
    }
}

/// [0, 1] にスケールされた量を物理量 (`2·s − 1`) に戻します。
pub fn to_physical<B: Backend, const D: usize>(scaled: Tensor<B, D>) -> Tensor<B, D> {
    scaled.mul_scalar(2.0).sub_scalar(1.0)
}

/// チャンネル軸を `start..end` で切り出します。
pub fn channels<B: Backend>(field: Tensor<B, 4>, start: usize, end: usize) -> Tensor<B, 4> {
    let [b, h, w, _] = field.dims();
    field.slice([0..b, 0..h, 0..w, start..end])
}

/// 空間軸 (height, width) の周囲をゼロで埋めます。
pub fn pad_spatial<B: Backend>(
    field: Tensor<B, 4>,
    top: usize,
    bottom: usize,
    left: usize,
    right: usize,
) -> Tensor<B, 4> {
    let device = field.device();
    let [b, h, _, c] = field.dims();
    let mut rows = Vec::with_capacity(3);
    let mut field = field;
    // 先に幅方向、次に高さ方向を埋める
    if left > 0 || right > 0 {
        let mut cols = Vec::with_capacity(3);
        if left > 0 {
            cols.push(Tensor::zeros([b, h, left, c], &device));
        }
        cols.push(field);
        if right > 0 {
            cols.push(Tensor::zeros([b, h, right, c], &device));
        }
        field = Tensor::cat(cols, 2);
    }
    let w = field.dims()[2];
    if top > 0 {
        rows.push(Tensor::zeros([b, top, w, c], &device));
    }
    rows.push(field);
    if bottom > 0 {
        rows.push(Tensor::zeros([b, bottom, w, c], &device));
    }
    Tensor::cat(rows, 1)
}

/// 格子の4隅オフセット `(di, dj)` から見た節点値を要素格子 `[b, h-1, w-1, c]` に切り出します。
pub fn corner<B: Backend>(field: Tensor<B, 4>, di: usize, dj: usize) -> Tensor<B, 4> {
    let [b, h, w, c] = field.dims();
    field.slice([0..b, di..h - 1 + di, dj..w - 1 + dj, 0..c])
}

/// 双一次要素の局所節点順: (i,j), (i,j+1), (i+1,j+1), (i+1,j)。
pub const ELEMENT_CORNERS: [(usize, usize); 4] = [(0, 0), (0, 1), (1, 1), (1, 0)];

/// 節点場を要素ごとの節点値 `[b, h-1, w-1, 4·c]` (節点優先の並び) に並べ替えます。
pub fn gather_element_nodes<B: Backend>(field: Tensor<B, 4>) -> Tensor<B, 4> {
    let corners = ELEMENT_CORNERS
        .iter()
        .map(|&(di, dj)| corner(field.clone(), di, dj))
        .collect();
    Tensor::cat(corners, 3)
}

/// 要素ごとの節点量 `[b, h-1, w-1, 4·dof]` を節点格子 `[b, h, w, dof]` に足し込みます。
pub fn scatter_element_nodes<B: Backend>(element: Tensor<B, 4>, dof: usize) -> Tensor<B, 4> {
    let [b, h, w, _] = element.dims();
    let mut nodal = Tensor::zeros([b, h + 1, w + 1, dof], &element.device());
    for (k, &(di, dj)) in ELEMENT_CORNERS.iter().enumerate() {
        let part = channels(element.clone(), k * dof, (k + 1) * dof);
        nodal = nodal + pad_spatial(part, di, 1 - di, dj, 1 - dj);
    }
    nodal
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::TensorData;

    type TestBackend = NdArray<f32>;

    #[test]
    fn layout_channel_counts() {
        let single = FieldLayout::new(2, NeumannLayout::Single);
        assert_eq!(single.feature_channels(), 4);
        assert_eq!(single.prediction_channels(), 6);
        let dual = FieldLayout::new(2, NeumannLayout::Dual);
        assert_eq!(dual.feature_channels(), 6);
        assert_eq!(dual.prediction_channels(), 8);
    }

    #[test]
    fn scatter_sums_shared_nodes() {
        let device = Default::default();
        // 3x3 節点 = 2x2 要素、各要素の全局所節点に 1 を置く
        let element = Tensor::<TestBackend, 4>::ones([1, 2, 2, 4], &device);
        let nodal = scatter_element_nodes(element, 1);
        let values = nodal.into_data().to_vec::<f32>().unwrap();
        assert_eq!(values, vec![1.0, 2.0, 1.0, 2.0, 4.0, 2.0, 1.0, 2.0, 1.0]);
    }

    #[test]
    fn gather_follows_local_node_order() {
        let device = Default::default();
        let data = TensorData::new(vec![0.0f32, 1.0, 2.0, 3.0], [1, 2, 2, 1]);
        let field = Tensor::<TestBackend, 4>::from_data(data, &device);
        let gathered = gather_element_nodes(field);
        assert_eq!(gathered.dims(), [1, 1, 1, 4]);
        let values = gathered.into_data().to_vec::<f32>().unwrap();
        assert_eq!(values, vec![0.0, 1.0, 3.0, 2.0]);
    }

    #[test]
    fn narrow_feature_tensor_is_rejected() {
        let device = Default::default();
        let layout = FieldLayout::new(2, NeumannLayout::Dual);
        let features = Tensor::<TestBackend, 4>::zeros([1, 4, 4, 4], &device);
        assert!(matches!(
            layout.check_features(&features),
            Err(PdeError::ShapeMismatch { .. })
        ));
    }
}
