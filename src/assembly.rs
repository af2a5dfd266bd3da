//! 要素残差を節点残差に変換し、境界条件と組み合わせます。

use crate::boundary::{self, BoundaryMasks, DOMAIN_THRESHOLD};
use crate::error::{PdeError, Result};
use crate::field::{FieldLayout, NeumannLayout, corner, pad_spatial, scatter_element_nodes, to_physical};
use crate::physics::BulkResidual;
use burn::prelude::Backend;
use burn::tensor::{Distribution, Tensor};

/// ダミー場で「計算領域外」を表す値。
pub const DUMMY_SENTINEL: f32 = -1.0;
/// ダミー場がこれより大きい節点を有効とみなします (`DUMMY_SENTINEL` と対)。
pub const VALID_THRESHOLD: f32 = -0.9;

/// 残差の組み立て結果。すべて節点格子 `[batch, h, w, dof]` 上の量です。
#[derive(Debug, Clone)]
pub struct AssembledResidual<B: Backend> {
    /// ディリクレ節点を規定値で上書きした予測
    pub corrected: Tensor<B, 4>,
    /// 要素残差を節点に集めたバルク残差
    pub nodal: Tensor<B, 4>,
    /// ノイマン境界の目標残差 (外力)
    pub neumann_target: Tensor<B, 4>,
    /// ディリクレ・ノイマン以外の節点に限定した残差
    pub body: Tensor<B, 4>,
    /// ノイマン領域の残差と目標残差の差
    pub neumann_discrepancy: Tensor<B, 4>,
    /// ディリクレ節点に限定した残差 (反力)
    pub reaction: Tensor<B, 4>,
    /// 物理損失に用いる、ディリクレ節点を除いた残差
    pub reduced: Tensor<B, 4>,
    /// 領域内で乱数、領域外で `DUMMY_SENTINEL` となるダミー場
    pub dummy: Tensor<B, 4>,
}

/// 境界分類・物理残差・ノイマン外力から節点残差を組み立てます。
pub struct ResidualAssembler<B: Backend> {
    layout: FieldLayout,
    dh: f64,
    physics: Box<dyn BulkResidual<B>>,
}

pub struct ResidualAssemblerBuilder<B: Backend> {
    layout: FieldLayout,
    dh: f64,
    physics: Option<Box<dyn BulkResidual<B>>>,
}

impl<B: Backend> ResidualAssemblerBuilder<B> {
    pub fn physics(mut self, physics: Box<dyn BulkResidual<B>>) -> Self {
        self.physics = Some(physics);
        self
    }

    pub fn build(self) -> Result<ResidualAssembler<B>> {
        let physics = self.physics.ok_or_else(|| {
            PdeError::PhysicsNotImplemented(format!(
                "dof={} の問題にバルク残差関数が設定されていません",
                self.layout.dof
            ))
        })?;
        if physics.dof() != self.layout.dof {
            return Err(PdeError::shape(
                "物理残差の自由度",
                format!("dof={}", self.layout.dof),
                &[physics.dof()],
            ));
        }
        Ok(ResidualAssembler {
            layout: self.layout,
            dh: self.dh,
            physics,
        })
    }
}

impl<B: Backend> ResidualAssembler<B> {
    pub fn builder(layout: FieldLayout, dh: f64) -> ResidualAssemblerBuilder<B> {
        ResidualAssemblerBuilder {
            layout,
            dh,
            physics: None,
        }
    }

    pub fn layout(&self) -> &FieldLayout {
        &self.layout
    }

    pub fn dh(&self) -> f64 {
        self.dh
    }

    pub fn physics_name(&self) -> &str {
        self.physics.name()
    }

    fn check_prediction(&self, features: &Tensor<B, 4>, prediction: &Tensor<B, 4>) -> Result<()> {
        let [b, h, w, _] = features.dims();
        let dims = prediction.dims();
        if dims != [b, h, w, self.layout.dof] {
            return Err(PdeError::shape(
                "予測場",
                format!("[{b}, {h}, {w}, {}]", self.layout.dof),
                &dims,
            ));
        }
        Ok(())
    }

    /// 予測のディリクレ節点だけを入力の規定値で置き換えます。
    pub fn apply_dirichlet(&self, features: &Tensor<B, 4>, prediction: Tensor<B, 4>) -> Result<Tensor<B, 4>> {
        let masks = boundary::classify(features, &self.layout)?;
        self.check_prediction(features, &prediction)?;
        Ok(self.corrected(features, &masks, prediction))
    }

    fn corrected(&self, features: &Tensor<B, 4>, masks: &BoundaryMasks<B>, prediction: Tensor<B, 4>) -> Tensor<B, 4> {
        let values = self.layout.value_block(features.clone());
        let dirichlet_values = values * masks.dirichlet.clone();
        prediction * masks.not_dirichlet() + dirichlet_values
    }

    /// 残差を組み立てます。
    ///
    /// 全節点残差を求めてからノイマン外力を差し引き、最後に領域でマスクします。
    /// 先にマスクするとノイマン領域の差分が消えてしまうため、この順序は変えられません。
    pub fn assemble(&self, features: &Tensor<B, 4>, prediction: Tensor<B, 4>) -> Result<AssembledResidual<B>> {
        let masks = boundary::classify(features, &self.layout)?;
        self.check_prediction(features, &prediction)?;
        let corrected = self.corrected(features, &masks, prediction);

        let neumann_target = self.neumann_target(features, &masks);
        let dummy = fill_dummy(self.layout.value_block(features.clone()));

        let element = self.physics.element_residual(corrected.clone(), self.dh);
        let element_mask = element_residual_mask(dummy.clone());
        let nodal = scatter_element_nodes(element * element_mask, self.layout.dof);

        let reaction = nodal.clone() * masks.dirichlet.clone();
        let neumann_discrepancy = nodal.clone() * masks.neumann.clone() - neumann_target.clone();
        let not_dirichlet = nodal.clone() * masks.not_dirichlet();
        let body = not_dirichlet.clone() * masks.not_neumann();
        let reduced = not_dirichlet - neumann_target.clone();

        Ok(AssembledResidual {
            corrected,
            nodal,
            neumann_target,
            body,
            neumann_discrepancy,
            reaction,
            reduced,
            dummy,
        })
    }

    /// ノイマン境界のトラクションを線形要素の整合荷重として節点に配分します。
    fn neumann_target(&self, features: &Tensor<B, 4>, masks: &BoundaryMasks<B>) -> Tensor<B, 4> {
        let mut target = Tensor::zeros(masks.neumann.dims(), &masks.neumann.device());
        for k in 0..self.layout.neumann.blocks() {
            let flag = boundary::neumann_block_mask(features, &self.layout, masks, k);
            let traction = to_physical(self.layout.neumann_block(features.clone(), k)) * flag.clone();
            target = match (self.layout.neumann, k) {
                (NeumannLayout::Single, _) => {
                    target
                        + edge_loads(traction.clone(), flag.clone(), 2, self.dh)
                        + edge_loads(traction, flag, 1, self.dh)
                }
                (NeumannLayout::Dual, 0) => target + edge_loads(traction, flag, 2, self.dh),
                (NeumannLayout::Dual, _) => target + edge_loads(traction, flag, 1, self.dh),
            };
        }
        target
    }
}

/// `axis` 方向に隣接する2節点がともにノイマン節点である辺の荷重。
///
/// 辺長 `dh` の線形分布トラクションに対し、各端点へ `dh·(2t_a + t_b)/6` を配分します。
fn edge_loads<B: Backend>(traction: Tensor<B, 4>, flag: Tensor<B, 4>, axis: usize, dh: f64) -> Tensor<B, 4> {
    let active = shifted(flag.clone(), axis, 0) * shifted(flag, axis, 1);
    let t_a = shifted(traction.clone(), axis, 0);
    let t_b = shifted(traction, axis, 1);
    let to_a = (t_a.clone().mul_scalar(2.0) + t_b.clone()) * active.clone();
    let to_b = (t_a + t_b.mul_scalar(2.0)) * active;
    let (to_a, to_b) = (to_a.mul_scalar(dh / 6.0), to_b.mul_scalar(dh / 6.0));
    if axis == 2 {
        pad_spatial(to_a, 0, 0, 0, 1) + pad_spatial(to_b, 0, 0, 1, 0)
    } else {
        pad_spatial(to_a, 0, 1, 0, 0) + pad_spatial(to_b, 1, 0, 0, 0)
    }
}

/// `axis` (1: 高さ, 2: 幅) 方向に長さを1つ縮め、`offset` だけずらした部分場。
fn shifted<B: Backend>(field: Tensor<B, 4>, axis: usize, offset: usize) -> Tensor<B, 4> {
    let [b, h, w, c] = field.dims();
    if axis == 2 {
        field.slice([0..b, 0..h, offset..w - 1 + offset, 0..c])
    } else {
        field.slice([0..b, offset..h - 1 + offset, 0..w, 0..c])
    }
}

/// 計算領域内の節点を [0, 1) の乱数で、領域外を `DUMMY_SENTINEL` で埋めます。
pub fn fill_dummy<B: Backend>(values: Tensor<B, 4>) -> Tensor<B, 4> {
    let device = values.device();
    let inside = values.clone().greater_elem(DOMAIN_THRESHOLD);
    let random = Tensor::random(values.shape(), Distribution::Uniform(0.0, 1.0), &device);
    Tensor::full(values.shape(), DUMMY_SENTINEL, &device).mask_where(inside, random)
}

/// ダミー場から作る有効節点マスク (0/1)。
pub fn validity_mask<B: Backend>(dummy: Tensor<B, 4>) -> Tensor<B, 4> {
    dummy.greater_elem(VALID_THRESHOLD).float()
}

/// 4隅がすべて有効な要素だけを残す要素残差マスク `[batch, h-1, w-1, 4·dof]`。
pub fn element_residual_mask<B: Backend>(dummy: Tensor<B, 4>) -> Tensor<B, 4> {
    let valid = validity_mask(dummy);
    let element = corner(valid.clone(), 0, 0)
        * corner(valid.clone(), 0, 1)
        * corner(valid.clone(), 1, 1)
        * corner(valid, 1, 0);
    Tensor::cat(vec![element.clone(), element.clone(), element.clone(), element], 3)
}
