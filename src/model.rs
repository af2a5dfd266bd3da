use crate::error::PdeError;
use crate::warm_start::ParameterCorrespondence;
use burn::config::Config;
use burn::module::{Module, Param};
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{Initializer, PaddingConfig2d, Tanh};
use burn::prelude::Backend;
use burn::tensor::module::conv2d;
use burn::tensor::ops::ConvOptions;
use burn::tensor::{Distribution, Tensor};
use tracing::debug;

/// KL 項で `log` を取る前の事後標準偏差の下限。
const POSTERIOR_SCALE_FLOOR: f64 = 1.0e-30;

/// 代理モデルの構成。
#[derive(Config, Debug)]
pub struct NetworkConfig {
    /// 入力特徴量のチャンネル数
    pub in_channels: usize,
    /// 予測する自由度数
    pub dof: usize,
    /// 中間層のチャンネル数
    #[config(default = "vec![16, 16]")]
    pub hidden_channels: Vec<usize>,
    /// 畳み込みカーネルの一辺 (奇数)
    #[config(default = 3)]
    pub kernel_size: usize,
    /// ベイズモデルの残差尺度 `Sigma2` の初期値
    #[config(default = 1.0e-2)]
    pub sigma2: f64,
}

impl NetworkConfig {
    /// 各層の (入力, 出力) チャンネル数。
    fn layer_channels(&self) -> Vec<[usize; 2]> {
        let mut widths = vec![self.in_channels];
        widths.extend(self.hidden_channels.iter().copied());
        widths.push(self.dof);
        widths.windows(2).map(|w| [w[0], w[1]]).collect()
    }
}

/// 代理モデルの入出力契約。
///
/// 入力 `[batch, h, w, C]` に対し、予測 `dof` チャンネルの後ろに入力をそのまま連結した
/// `[batch, h, w, dof + C]` を返します。
pub trait FieldSurrogate<B: Backend>: Module<B> + Sized {
    fn from_config(config: &NetworkConfig, device: &B::Device) -> Self;

    fn forward(&self, features: Tensor<B, 4>) -> Tensor<B, 4>;

    /// 学習可能な残差尺度 `Sigma2` (ベイズモデルのみ)。
    fn uncertainty_scale(&self) -> Option<Tensor<B, 1>> {
        None
    }

    /// 事後分布と事前分布の KL ダイバージェンス (ベイズモデルのみ)。
    fn kl_divergence(&self) -> Option<Tensor<B, 1>> {
        None
    }

    /// 決定論モデルの学習済みパラメータで事後分布の位置パラメータを初期化します。
    ///
    /// 位置パラメータを持たないモデルでは、読み込み先が 0 個となり常に失敗します。
    fn warm_start(self, source: &PointEstimates<B>, _scale_multiplier: f64) -> crate::error::Result<Self> {
        Err(PdeError::WeightLoadMismatch {
            role: "kernel",
            saved: source.kernels.len(),
            expected: 0,
        })
    }
}

/// 名前付きの点推定パラメータ (ウォームスタートの読み込み元)。
#[derive(Debug, Clone)]
pub struct PointEstimates<B: Backend> {
    pub kernels: Vec<(String, Tensor<B, 4>)>,
    pub biases: Vec<(String, Tensor<B, 1>)>,
}

/// `[b, h, w, c]` → `[b, c, h, w]`
fn to_channels_first<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    x.permute([0, 3, 1, 2])
}

/// `[b, c, h, w]` → `[b, h, w, c]`
fn to_channels_last<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    x.permute([0, 2, 3, 1])
}

/// 決定論的な畳み込み代理モデル。
#[derive(Module, Debug)]
pub struct DeterministicNet<B: Backend> {
    convs: Vec<Conv2d<B>>,
    activation: Tanh,
}

impl<B: Backend> DeterministicNet<B> {
    /// ウォームスタート用に重みとバイアスを層順に取り出します。
    pub fn point_estimates(&self) -> PointEstimates<B> {
        let mut kernels = Vec::with_capacity(self.convs.len());
        let mut biases = Vec::with_capacity(self.convs.len());
        for (i, conv) in self.convs.iter().enumerate() {
            kernels.push((format!("convs.{i}.kernel"), conv.weight.val().detach()));
            if let Some(bias) = &conv.bias {
                biases.push((format!("convs.{i}.bias"), bias.val().detach()));
            }
        }
        PointEstimates { kernels, biases }
    }
}

impl<B: Backend> FieldSurrogate<B> for DeterministicNet<B> {
    fn from_config(config: &NetworkConfig, device: &B::Device) -> Self {
        let padding = config.kernel_size / 2;
        let convs = config
            .layer_channels()
            .into_iter()
            .map(|channels| {
                Conv2dConfig::new(channels, [config.kernel_size, config.kernel_size])
                    .with_padding(PaddingConfig2d::Explicit(padding, padding))
                    .init(device)
            })
            .collect();
        Self {
            convs,
            activation: Tanh::new(),
        }
    }

    fn forward(&self, features: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = to_channels_first(features.clone());
        let last = self.convs.len() - 1;
        for (i, conv) in self.convs.iter().enumerate() {
            x = conv.forward(x);
            if i < last {
                x = self.activation.forward(x);
            }
        }
        Tensor::cat(vec![to_channels_last(x), features], 3)
    }
}

/// 平均場ガウス事後分布を持つ畳み込み層。
///
/// 順伝播のたびに `w = loc + softplus(untransformed_scale)·ε` をサンプルします。
#[derive(Module, Debug)]
pub struct VariationalConv2d<B: Backend> {
    kernel_posterior_loc: Param<Tensor<B, 4>>,
    kernel_posterior_untransformed_scale: Param<Tensor<B, 4>>,
    bias_posterior_loc: Param<Tensor<B, 1>>,
    padding: usize,
}

impl<B: Backend> VariationalConv2d<B> {
    fn new(channels: [usize; 2], kernel_size: usize, device: &B::Device) -> Self {
        let [c_in, c_out] = channels;
        let shape = [c_out, c_in, kernel_size, kernel_size];
        let fan_in = (c_in * kernel_size * kernel_size) as f64;
        Self {
            kernel_posterior_loc: Initializer::Normal {
                mean: 0.0,
                std: (2.0 / fan_in).sqrt(),
            }
            .init(shape, device),
            kernel_posterior_untransformed_scale: Initializer::Normal { mean: -9.0, std: 0.1 }.init(shape, device),
            bias_posterior_loc: Initializer::Zeros.init([c_out], device),
            padding: kernel_size / 2,
        }
    }

    /// `softplus(x) = max(x, 0) + log1p(exp(-|x|))`。大きな負の `x` でも 0 に丸めません。
    fn scale(&self) -> Tensor<B, 4> {
        let x = self.kernel_posterior_untransformed_scale.val();
        x.clone().clamp_min(0.0) + x.abs().neg().exp().log1p()
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let loc = self.kernel_posterior_loc.val();
        let eps = Tensor::random(loc.shape(), Distribution::Normal(0.0, 1.0), &loc.device());
        let kernel = loc + self.scale() * eps;
        let options = ConvOptions::new([1, 1], [self.padding, self.padding], [1, 1], 1);
        conv2d(x, kernel, Some(self.bias_posterior_loc.val()), options)
    }

    /// 標準正規事前分布に対する KL ダイバージェンス。
    pub fn kl_divergence(&self) -> Tensor<B, 1> {
        let scale = self.scale();
        let loc = self.kernel_posterior_loc.val();
        (scale.clone().powi_scalar(2) + loc.powi_scalar(2))
            .mul_scalar(0.5)
            .sub(scale.clamp_min(POSTERIOR_SCALE_FLOOR).log())
            .sub_scalar(0.5)
            .sum()
    }
}

/// ベイズ (変分) 畳み込み代理モデル。
#[derive(Module, Debug)]
pub struct BayesianNet<B: Backend> {
    convs: Vec<VariationalConv2d<B>>,
    activation: Tanh,
    sigma2: Param<Tensor<B, 1>>,
}

impl<B: Backend> BayesianNet<B> {
    fn posterior_location_ids(&self) -> (Vec<String>, Vec<String>) {
        let kernels = (0..self.convs.len())
            .map(|i| format!("convs.{i}.kernel_posterior_loc"))
            .collect();
        let biases = (0..self.convs.len())
            .map(|i| format!("convs.{i}.bias_posterior_loc"))
            .collect();
        (kernels, biases)
    }
}

impl<B: Backend> FieldSurrogate<B> for BayesianNet<B> {
    fn from_config(config: &NetworkConfig, device: &B::Device) -> Self {
        let convs = config
            .layer_channels()
            .into_iter()
            .map(|channels| VariationalConv2d::new(channels, config.kernel_size, device))
            .collect();
        Self {
            convs,
            activation: Tanh::new(),
            sigma2: Initializer::Constant { value: config.sigma2 }.init([1], device),
        }
    }

    fn forward(&self, features: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = to_channels_first(features.clone());
        let last = self.convs.len() - 1;
        for (i, conv) in self.convs.iter().enumerate() {
            x = conv.forward(x);
            if i < last {
                x = self.activation.forward(x);
            }
        }
        Tensor::cat(vec![to_channels_last(x), features], 3)
    }

    fn uncertainty_scale(&self) -> Option<Tensor<B, 1>> {
        Some(self.sigma2.val().abs())
    }

    fn kl_divergence(&self) -> Option<Tensor<B, 1>> {
        self.convs
            .iter()
            .map(|conv| conv.kl_divergence())
            .reduce(|a, b| a + b)
    }

    fn warm_start(mut self, source: &PointEstimates<B>, scale_multiplier: f64) -> crate::error::Result<Self> {
        let (kernel_ids, bias_ids) = self.posterior_location_ids();
        let source_kernels = source.kernels.iter().map(|(id, _)| id.clone()).collect::<Vec<_>>();
        let source_biases = source.biases.iter().map(|(id, _)| id.clone()).collect::<Vec<_>>();
        let kernels = ParameterCorrespondence::build("kernel", &source_kernels, &kernel_ids)?;
        let biases = ParameterCorrespondence::build("bias", &source_biases, &bias_ids)?;

        for pair in &kernels {
            let value = source.kernels[pair.source].1.clone();
            let conv = &mut self.convs[pair.destination];
            if value.dims() != conv.kernel_posterior_loc.val().dims() {
                return Err(PdeError::shape(
                    "ウォームスタートのカーネル",
                    format!("{:?}", conv.kernel_posterior_loc.val().dims()),
                    &value.dims(),
                ));
            }
            debug!("{}: {} <- {}", kernels.role(), pair.destination_id, pair.source_id);
            conv.kernel_posterior_loc = Param::from_tensor(value);
        }
        for pair in &biases {
            let value = source.biases[pair.source].1.clone();
            let conv = &mut self.convs[pair.destination];
            if value.dims() != conv.bias_posterior_loc.val().dims() {
                return Err(PdeError::shape(
                    "ウォームスタートのバイアス",
                    format!("{:?}", conv.bias_posterior_loc.val().dims()),
                    &value.dims(),
                ));
            }
            debug!("{}: {} <- {}", biases.role(), pair.destination_id, pair.source_id);
            conv.bias_posterior_loc = Param::from_tensor(value);
        }
        for conv in self.convs.iter_mut() {
            let scaled = conv.kernel_posterior_untransformed_scale.val().mul_scalar(scale_multiplier);
            conv.kernel_posterior_untransformed_scale = Param::from_tensor(scaled.detach());
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn config() -> NetworkConfig {
        NetworkConfig::new(4, 2).with_hidden_channels(vec![3])
    }

    #[test]
    fn output_appends_features_after_prediction() {
        let device = Default::default();
        let features = Tensor::<TestBackend, 4>::random([2, 5, 6, 4], Distribution::Default, &device);
        for output in [
            DeterministicNet::<TestBackend>::from_config(&config(), &device).forward(features.clone()),
            BayesianNet::<TestBackend>::from_config(&config(), &device).forward(features.clone()),
        ] {
            assert_eq!(output.dims(), [2, 5, 6, 6]);
            let tail = output.slice([0..2, 0..5, 0..6, 2..6]);
            let diff = (tail - features.clone()).abs().max().into_scalar();
            assert_eq!(diff, 0.0);
        }
    }

    #[test]
    fn bayesian_net_exposes_scale_and_kl() {
        let device = Default::default();
        let net = BayesianNet::<TestBackend>::from_config(&config().with_sigma2(0.25), &device);
        let sigma2 = net.uncertainty_scale().unwrap().into_scalar();
        assert_eq!(sigma2, 0.25);
        assert!(net.kl_divergence().unwrap().into_scalar() > 0.0);
        let deterministic = DeterministicNet::<TestBackend>::from_config(&config(), &device);
        assert!(deterministic.uncertainty_scale().is_none());
    }

    #[test]
    fn warm_start_copies_locations_and_rescales() {
        let device = Default::default();
        let source = DeterministicNet::<TestBackend>::from_config(&config(), &device);
        let estimates = source.point_estimates();
        let target = BayesianNet::<TestBackend>::from_config(&config(), &device);
        let before = target.convs[0].kernel_posterior_untransformed_scale.val();
        let loaded = target.warm_start(&estimates, 2.0).unwrap();

        let diff = (loaded.convs[1].kernel_posterior_loc.val() - estimates.kernels[1].1.clone())
            .abs()
            .max()
            .into_scalar();
        assert_eq!(diff, 0.0);
        let rescaled = (loaded.convs[0].kernel_posterior_untransformed_scale.val() - before.mul_scalar(2.0))
            .abs()
            .max()
            .into_scalar();
        assert!(rescaled < 1e-6);
    }

    #[test]
    fn warm_started_posterior_keeps_positive_scale_and_finite_kl() {
        let device = Default::default();
        let source = DeterministicNet::<TestBackend>::from_config(&config(), &device);
        let loaded = BayesianNet::<TestBackend>::from_config(&config(), &device)
            .warm_start(&source.point_estimates(), 2.0)
            .unwrap();
        // 未変換スケールはおよそ -18
        for conv in &loaded.convs {
            let min_scale = conv.scale().min().into_scalar();
            assert!(min_scale > 0.0, "{min_scale}");
        }
        let kl = loaded.kl_divergence().unwrap().into_scalar();
        assert!(kl.is_finite(), "{kl}");
    }

    #[test]
    fn network_config_defaults() {
        let config = NetworkConfig::new(4, 2);
        assert_eq!(config.hidden_channels, vec![16, 16]);
        assert_eq!(config.kernel_size, 3);
        assert_eq!(config.layer_channels(), vec![[4, 16], [16, 16], [16, 2]]);
    }

    #[test]
    fn warm_start_with_different_depth_fails() {
        let device = Default::default();
        let source = DeterministicNet::<TestBackend>::from_config(&config().with_hidden_channels(vec![3, 3]), &device);
        let target = BayesianNet::<TestBackend>::from_config(&config(), &device);
        assert!(matches!(
            target.warm_start(&source.point_estimates(), 2.0),
            Err(PdeError::WeightLoadMismatch { role: "kernel", saved: 3, expected: 2 })
        ));
    }

    #[test]
    fn deterministic_destination_cannot_be_warm_started() {
        let device = Default::default();
        let source = DeterministicNet::<TestBackend>::from_config(&config(), &device);
        let target = DeterministicNet::<TestBackend>::from_config(&config(), &device);
        assert!(target.warm_start(&source.point_estimates(), 2.0).is_err());
    }
}
