//! PDE ごとのバルク残差 (弱形式の要素残差) を与える戦略オブジェクト。

use crate::field::{gather_element_nodes, to_physical};
use burn::prelude::Backend;
use burn::tensor::{Tensor, TensorData};

/// 要素レベルのバルク残差を評価する能力。
///
/// 入力は境界補正済みの節点予測 `[batch, h, w, dof]`、出力は要素格子上の
/// 局所節点残差 `[batch, h-1, w-1, 4·dof]` です (局所節点順は
/// [`crate::field::ELEMENT_CORNERS`])。決定的かつ微分可能でなければなりません。
pub trait BulkResidual<B: Backend>: Send + Sync {
    fn name(&self) -> &str;

    fn dof(&self) -> usize;

    fn element_residual(&self, solution: Tensor<B, 4>, dh: f64) -> Tensor<B, 4>;
}

const GAUSS_POINT: f64 = 0.577_350_269_189_625_8;
/// 局所節点の参照座標 (ξ は幅方向、η は高さ方向)。
const NODE_SIGNS: [(f64, f64); 4] = [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)];

/// 双一次四角形要素の要素行列 (`4·dof` 正方、行優先)。
#[derive(Debug, Clone, PartialEq)]
pub struct ElementMatrix {
    size: usize,
    values: Vec<f64>,
}

impl ElementMatrix {
    fn zeros(size: usize) -> Self {
        Self {
            size,
            values: vec![0.0; size * size],
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.values[row * self.size + col]
    }

    fn add(&mut self, row: usize, col: usize, value: f64) {
        self.values[row * self.size + col] += value;
    }

    fn to_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 2> {
        let values = self.values.iter().map(|v| *v as f32).collect::<Vec<f32>>();
        Tensor::from_data(TensorData::new(values, [self.size, self.size]), device)
    }

    /// 2x2 ガウス積分で `Σ_gp f(∇N) |J|` を組み立てます。
    ///
    /// 辺長 `h` の正方形要素では 2 次元の剛性は `h` に依存しないため、単位長で評価します。
    fn integrate(size: usize, mut point: impl FnMut(&mut Self, &[[f64; 2]; 4], f64)) -> Self {
        let h = 1.0;
        let det_j = h * h / 4.0;
        let mut matrix = Self::zeros(size);
        for &gxi in &[-GAUSS_POINT, GAUSS_POINT] {
            for &geta in &[-GAUSS_POINT, GAUSS_POINT] {
                let mut grads = [[0.0; 2]; 4];
                for (a, &(sx, sy)) in NODE_SIGNS.iter().enumerate() {
                    let dn_dxi = 0.25 * sx * (1.0 + geta * sy);
                    let dn_deta = 0.25 * sy * (1.0 + gxi * sx);
                    grads[a] = [dn_dxi * 2.0 / h, dn_deta * 2.0 / h];
                }
                point(&mut matrix, &grads, det_j);
            }
        }
        matrix
    }

    /// スカラー拡散 (ポアソン) 方程式の要素行列。
    pub fn diffusion(conductivity: f64) -> Self {
        Self::integrate(4, |m, grads, det_j| {
            for a in 0..4 {
                for b in 0..4 {
                    let dot = grads[a][0] * grads[b][0] + grads[a][1] * grads[b][1];
                    m.add(a, b, conductivity * dot * det_j);
                }
            }
        })
    }

    /// 平面ひずみ線形弾性の要素剛性行列。自由度の並びは `node·2 + component`。
    pub fn plane_strain(youngs_modulus: f64, poisson_ratio: f64) -> Self {
        let nu = poisson_ratio;
        let c = youngs_modulus / ((1.0 + nu) * (1.0 - 2.0 * nu));
        let d = [
            [c * (1.0 - nu), c * nu, 0.0],
            [c * nu, c * (1.0 - nu), 0.0],
            [0.0, 0.0, c * (1.0 - 2.0 * nu) / 2.0],
        ];
        Self::integrate(8, |m, grads, det_j| {
            // ひずみ-変位行列 (3x8)
            let mut strain = [[0.0; 8]; 3];
            for a in 0..4 {
                strain[0][2 * a] = grads[a][0];
                strain[1][2 * a + 1] = grads[a][1];
                strain[2][2 * a] = grads[a][1];
                strain[2][2 * a + 1] = grads[a][0];
            }
            for i in 0..8 {
                for j in 0..8 {
                    let mut value = 0.0;
                    for p in 0..3 {
                        for q in 0..3 {
                            value += strain[p][i] * d[p][q] * strain[q][j];
                        }
                    }
                    m.add(i, j, value * det_j);
                }
            }
        })
    }
}

/// 要素行列と要素節点値の積で残差を与える線形 PDE。
#[derive(Debug, Clone)]
pub struct LinearElementResidual {
    name: String,
    dof: usize,
    matrix: ElementMatrix,
}

impl LinearElementResidual {
    pub fn linear_elasticity(youngs_modulus: f64, poisson_ratio: f64) -> Self {
        Self {
            name: "linear_elasticity".to_string(),
            dof: 2,
            matrix: ElementMatrix::plane_strain(youngs_modulus, poisson_ratio),
        }
    }

    pub fn diffusion(conductivity: f64) -> Self {
        Self {
            name: "diffusion".to_string(),
            dof: 1,
            matrix: ElementMatrix::diffusion(conductivity),
        }
    }

    pub fn matrix(&self) -> &ElementMatrix {
        &self.matrix
    }
}

impl<B: Backend> BulkResidual<B> for LinearElementResidual {
    fn name(&self) -> &str {
        &self.name
    }

    fn dof(&self) -> usize {
        self.dof
    }

    fn element_residual(&self, solution: Tensor<B, 4>, _dh: f64) -> Tensor<B, 4> {
        let nodes = gather_element_nodes(to_physical(solution));
        let [b, h, w, n] = nodes.dims();
        let matrix = self.matrix.to_tensor::<B>(&nodes.device());
        // 要素行列は対称なので転置は不要
        nodes.reshape([b * h * w, n]).matmul(matrix).reshape([b, h, w, n])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn assert_close(a: f64, b: f64) {
        assert!((a - b).abs() < 1e-9, "{a} != {b}");
    }

    #[test]
    fn diffusion_matrix_matches_closed_form() {
        let m = ElementMatrix::diffusion(1.0);
        assert_close(m.get(0, 0), 2.0 / 3.0);
        assert_close(m.get(0, 1), -1.0 / 6.0);
        assert_close(m.get(0, 2), -1.0 / 3.0);
        assert_close(m.get(0, 3), -1.0 / 6.0);
    }

    #[test]
    fn element_matrices_are_symmetric_with_rigid_null_space() {
        for m in [ElementMatrix::diffusion(2.0), ElementMatrix::plane_strain(1.0, 0.3)] {
            let n = m.size();
            for i in 0..n {
                for j in 0..n {
                    assert_close(m.get(i, j), m.get(j, i));
                }
            }
        }
        // 剛体並進 (x方向) に対して内力はゼロ
        let k = ElementMatrix::plane_strain(1.0, 0.3);
        for i in 0..8 {
            let row: f64 = (0..4).map(|a| k.get(i, 2 * a)).sum();
            assert_close(row, 0.0);
        }
    }

    #[test]
    fn uniform_field_has_zero_residual() {
        let device = Default::default();
        let physics = LinearElementResidual::linear_elasticity(1.0, 0.3);
        let solution = Tensor::<TestBackend, 4>::full([2, 4, 5, 2], 0.8, &device);
        let residual = BulkResidual::<TestBackend>::element_residual(&physics, solution, 0.25);
        assert_eq!(residual.dims(), [2, 3, 4, 8]);
        let max = residual.abs().max().into_scalar();
        assert!(max < 1e-5);
    }
}
