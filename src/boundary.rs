//! 入力場の境界条件コードからディリクレ/ノイマン領域のマスクを求めます。
//!
//! 値チャンネルは規定された変位 (0以上にスケール済み) を、それ以外の領域内節点では
//! `-1`、領域外では `-2` を保持します。ノイマンチャンネルも同様で、0以上の値が
//! 規定されたトラクションを表します。

use crate::error::Result;
use crate::field::FieldLayout;
use burn::prelude::Backend;
use burn::tensor::Tensor;

/// これより大きい値を「境界条件が規定されている」とみなすしきい値。
pub const PRESCRIBED_THRESHOLD: f32 = -0.5;
/// これより大きい値を「計算領域の内側」とみなすしきい値。
pub const DOMAIN_THRESHOLD: f32 = -1.5;

/// ディリクレ領域とノイマン領域の 0/1 マスク (`[batch, h, w, dof]`)。
#[derive(Debug, Clone)]
pub struct BoundaryMasks<B: Backend> {
    pub dirichlet: Tensor<B, 4>,
    pub neumann: Tensor<B, 4>,
}

impl<B: Backend> BoundaryMasks<B> {
    /// ディリクレ節点以外で 1 となるマスク。
    pub fn not_dirichlet(&self) -> Tensor<B, 4> {
        self.dirichlet.clone().neg().add_scalar(1.0)
    }

    /// ノイマン節点以外で 1 となるマスク。
    pub fn not_neumann(&self) -> Tensor<B, 4> {
        self.neumann.clone().neg().add_scalar(1.0)
    }
}

/// 入力特徴量からマスクを計算します。
///
/// 学習パラメータも乱数も使わない純粋な関数で、同じ入力に対しては常に同一のマスクを返します。
/// 1つの節点が両方の領域に属することはなく、コードが重なった場合はディリクレが優先されます。
pub fn classify<B: Backend>(features: &Tensor<B, 4>, layout: &FieldLayout) -> Result<BoundaryMasks<B>> {
    layout.check_features(features)?;

    let values = layout.value_block(features.clone());
    let dirichlet = values.greater_elem(PRESCRIBED_THRESHOLD).float();

    let mut flagged = layout
        .neumann_block(features.clone(), 0)
        .greater_elem(PRESCRIBED_THRESHOLD)
        .float();
    for k in 1..layout.neumann.blocks() {
        let block = layout
            .neumann_block(features.clone(), k)
            .greater_elem(PRESCRIBED_THRESHOLD)
            .float();
        flagged = (flagged + block).clamp_max(1.0);
    }
    let neumann = flagged * dirichlet.clone().neg().add_scalar(1.0);

    Ok(BoundaryMasks { dirichlet, neumann })
}

/// `k` 番目のノイマンブロックで規定されている節点 (ディリクレ節点を除く)。
pub fn neumann_block_mask<B: Backend>(
    features: &Tensor<B, 4>,
    layout: &FieldLayout,
    masks: &BoundaryMasks<B>,
    k: usize,
) -> Tensor<B, 4> {
    layout
        .neumann_block(features.clone(), k)
        .greater_elem(PRESCRIBED_THRESHOLD)
        .float()
        * masks.not_dirichlet()
}
