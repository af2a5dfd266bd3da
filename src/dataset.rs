//! メモリ上の場データセット `[N, H, W, C]`。

use crate::error::{PdeError, Result};
use crate::field::{FieldLayout, NeumannLayout};
use burn::prelude::Backend;
use burn::tensor::{Tensor, TensorData};
use ndarray::{Array4, Axis, s};
use ndarray_npy::read_npy;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::ops::Range;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct FieldDataset {
    layout: FieldLayout,
    features: Array4<f32>,
    /// 比較用の参照解 (学習には使いません)
    labels: Array4<f32>,
}

impl FieldDataset {
    pub fn new(layout: FieldLayout, features: Array4<f32>, labels: Array4<f32>) -> Result<Self> {
        let dims = features.shape().to_vec();
        if labels.shape() != dims.as_slice() {
            return Err(PdeError::shape("ラベル", format!("{dims:?}"), labels.shape()));
        }
        if dims[3] < layout.feature_channels() {
            return Err(PdeError::shape(
                "データセットの特徴量",
                format!("{} チャンネル以上", layout.feature_channels()),
                &dims,
            ));
        }
        if dims[1] < 2 || dims[2] < 2 {
            return Err(PdeError::shape("データセットの特徴量", "2x2 以上の格子", &dims));
        }
        Ok(Self {
            layout,
            features,
            labels,
        })
    }

    pub fn from_npy(layout: FieldLayout, features: impl AsRef<Path>, labels: impl AsRef<Path>) -> Result<Self> {
        let features: Array4<f32> = read_npy(features)?;
        let labels: Array4<f32> = read_npy(labels)?;
        Self::new(layout, features, labels)
    }

    /// 左辺を固定し、右辺に x 方向トラクションを与えた正方板。
    ///
    /// 参照解は持たないため、ラベルには特徴量をそのまま入れます。
    pub fn synthetic_plate(layout: FieldLayout, samples: usize, size: usize, seed: u64) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let channels = layout.feature_channels();
        let traction_block = match layout.neumann {
            NeumannLayout::Single => 0,
            NeumannLayout::Dual => 1,
        };
        let mut features = Array4::<f32>::from_elem((samples, size, size, channels), -1.0);
        for n in 0..samples {
            let load: f32 = rng.random_range(0.55..1.0);
            for i in 0..size {
                for d in 0..layout.dof {
                    features[[n, i, 0, d]] = 0.5;
                    let traction = if d == 0 { load } else { 0.5 };
                    features[[n, i, size - 1, layout.dof * (1 + traction_block) + d]] = traction;
                }
            }
        }
        let labels = features.clone();
        Self::new(layout, features, labels)
    }

    pub fn layout(&self) -> &FieldLayout {
        &self.layout
    }

    pub fn len(&self) -> usize {
        self.features.shape()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `[height, width]`
    pub fn grid(&self) -> [usize; 2] {
        [self.features.shape()[1], self.features.shape()[2]]
    }

    /// 単位正方形上の格子間隔 `1 / (W - 1)`。
    pub fn grid_spacing(&self) -> f64 {
        1.0 / (self.grid()[1] - 1) as f64
    }

    pub fn labels(&self) -> &Array4<f32> {
        &self.labels
    }

    /// バッチごとのサンプル範囲。最後のバッチは端数になります。
    pub fn batches(&self, batch_size: usize) -> Vec<Range<usize>> {
        let batch_size = batch_size.max(1);
        (0..self.len())
            .step_by(batch_size)
            .map(|start| start..(start + batch_size).min(self.len()))
            .collect()
    }

    pub fn num_batches(&self, batch_size: usize) -> usize {
        self.len().div_ceil(batch_size.max(1))
    }

    /// 指定範囲の特徴量テンソル。チャンネルはレイアウト幅に切り詰めます。
    pub fn features<B: Backend>(&self, range: Range<usize>, device: &B::Device) -> Tensor<B, 4> {
        let width = self.layout.feature_channels();
        let view = self.features.slice(s![range, .., .., 0..width]);
        let shape = view.shape().to_vec();
        let data = TensorData::new(view.iter().copied().collect::<Vec<f32>>(), shape);
        Tensor::from_data(data, device)
    }

    pub fn all_features<B: Backend>(&self, device: &B::Device) -> Tensor<B, 4> {
        self.features(0..self.len(), device)
    }

    fn select(&self, indices: &[usize]) -> Self {
        Self {
            layout: self.layout,
            features: self.features.select(Axis(0), indices),
            labels: self.labels.select(Axis(0), indices),
        }
    }

    /// シード付きでシャッフルし、学習 / 検証 / テストに 8:1:1 で分割します。
    ///
    /// 3 サンプル以上あれば検証とテストに少なくとも1つずつ割り当てます。
    pub fn split(&self, seed: u64) -> (Self, Self, Self) {
        let n = self.len();
        let mut indices = (0..n).collect::<Vec<_>>();
        indices.shuffle(&mut StdRng::seed_from_u64(seed));
        let held_out = if n >= 3 { (n / 10).max(1) } else { 0 };
        let n_train = n - 2 * held_out;
        let (train, rest) = indices.split_at(n_train);
        let (val, test) = rest.split_at(held_out);
        (self.select(train), self.select(val), self.select(test))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use ndarray_npy::write_npy;

    type TestBackend = NdArray<f32>;

    fn layout() -> FieldLayout {
        FieldLayout::new(2, NeumannLayout::Single)
    }

    #[test]
    fn batches_cover_dataset_with_remainder() {
        let data = FieldDataset::synthetic_plate(layout(), 10, 5, 0).unwrap();
        let batches = data.batches(4);
        assert_eq!(batches, vec![0..4, 4..8, 8..10]);
        assert_eq!(data.num_batches(4), 3);
        assert_eq!(data.grid_spacing(), 0.25);
    }

    #[test]
    fn split_is_seeded_and_disjoint() {
        let data = FieldDataset::synthetic_plate(layout(), 20, 4, 1).unwrap();
        let (train, val, test) = data.split(7);
        assert_eq!((train.len(), val.len(), test.len()), (16, 2, 2));
        let (again, _, _) = data.split(7);
        assert_eq!(train.features, again.features);
    }

    #[test]
    fn plate_encodes_clamp_and_traction() {
        let dual = FieldLayout::new(2, NeumannLayout::Dual);
        let data = FieldDataset::synthetic_plate(dual, 1, 4, 3).unwrap();
        let x = data.all_features::<TestBackend>(&Default::default());
        assert_eq!(x.dims(), [1, 4, 4, 6]);
        let values = x.into_data().to_vec::<f32>().unwrap();
        let at = |i: usize, j: usize, c: usize| values[(i * 4 + j) * 6 + c];
        assert_eq!(at(2, 0, 0), 0.5);
        assert_eq!(at(2, 1, 0), -1.0);
        assert!(at(2, 3, 4) >= 0.55);
        assert_eq!(at(2, 3, 2), -1.0);
    }

    #[test]
    fn loads_npy_pair_and_checks_shapes() {
        let dir = tempfile::tempdir().unwrap();
        let features = Array4::<f32>::from_elem((2, 3, 3, 4), -1.0);
        let labels = Array4::<f32>::zeros((2, 3, 3, 4));
        write_npy(dir.path().join("f.npy"), &features).unwrap();
        write_npy(dir.path().join("l.npy"), &labels).unwrap();
        let data = FieldDataset::from_npy(layout(), dir.path().join("f.npy"), dir.path().join("l.npy")).unwrap();
        assert_eq!(data.len(), 2);

        let narrow = Array4::<f32>::zeros((2, 3, 3, 2));
        assert!(matches!(
            FieldDataset::new(layout(), narrow.clone(), narrow),
            Err(PdeError::ShapeMismatch { .. })
        ));
    }
}
