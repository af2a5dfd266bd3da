use crate::workflow::{DataSource, InferRequest, ReactionOutput, TrainRequest};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// clapでコマンドラインの構造を定義します。
#[derive(Parser, Debug)]
#[command(author, version, about = "Weak-form PDE-constrained surrogate training with Burn", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// 実行するサブコマンドを定義します（train または infer）。
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 代理モデルを学習し、チェックポイントと推論結果を保存します
    Train(TrainArgs),
    /// 保存されたチェックポイントを使い、推論を実行します
    Infer(InferArgs),
}

/// データの指定 (`.npy` の組、または合成データ)。
#[derive(Args, Debug)]
pub struct DataArgs {
    /// 特徴量 `[N, H, W, C]` の .npy
    #[arg(long, requires = "labels")]
    pub features: Option<PathBuf>,
    /// ラベル `[N, H, W, C]` の .npy
    #[arg(long, requires = "features")]
    pub labels: Option<PathBuf>,
    /// 合成データのサンプル数
    #[arg(long, default_value_t = 16)]
    pub synthetic: usize,
    /// 合成データの格子サイズ
    #[arg(long, default_value_t = 9)]
    pub grid: usize,
}

impl DataArgs {
    fn source(&self) -> DataSource {
        match (&self.features, &self.labels) {
            (Some(features), Some(labels)) => DataSource::Npy {
                features: features.clone(),
                labels: labels.clone(),
            },
            _ => DataSource::SyntheticPlate {
                samples: self.synthetic,
                size: self.grid,
            },
        }
    }
}

#[derive(Args, Debug)]
pub struct OutputArgs {
    /// results/ と restart/ を置くディレクトリ
    #[arg(long, default_value = ".")]
    pub workspace: PathBuf,
    /// 反力を `<run-id>-<test-folder>-F.npy` に書き出す
    #[arg(short = 'r', long)]
    pub reaction_force: bool,
    #[arg(long, default_value = "test")]
    pub test_folder: String,
}

impl OutputArgs {
    fn reaction(&self) -> Option<ReactionOutput> {
        self.reaction_force.then(|| ReactionOutput {
            test_folder: self.test_folder.clone(),
        })
    }
}

#[derive(Args, Debug)]
pub struct TrainArgs {
    /// 設定ファイル (TOML)
    #[arg(required_unless_present = "restart_from")]
    pub config: Option<PathBuf>,
    /// 保存済みの実行記録 (.json) から再開する
    #[arg(long = "restart-from", visible_alias = "rf")]
    pub restart_from: Option<PathBuf>,
    /// 再開するチェックポイントのエポック (省略時は最新)
    #[arg(long = "restart-at", visible_alias = "ra")]
    pub restart_at: Option<usize>,
    /// 決定論モデルの実行記録から事後分布を初期化する
    #[arg(long = "init-from", visible_alias = "init")]
    pub init_from: Option<PathBuf>,
    /// 再開後に実行するエポック数
    #[arg(short = 'c', long = "continue-run")]
    pub continue_run: Option<usize>,
    #[command(flatten)]
    pub data: DataArgs,
    #[command(flatten)]
    pub output: OutputArgs,
}

impl TrainArgs {
    pub fn request(&self) -> TrainRequest {
        TrainRequest {
            config: self.config.clone(),
            restart_from: self.restart_from.clone(),
            restart_at: self.restart_at,
            init_from: self.init_from.clone(),
            continue_run: self.continue_run,
            data: self.data.source(),
            workspace: self.output.workspace.clone(),
            reaction: self.output.reaction(),
        }
    }
}

#[derive(Args, Debug)]
pub struct InferArgs {
    /// 学習時の実行記録 (.json)
    pub record: PathBuf,
    #[arg(long = "restart-at", visible_alias = "ra")]
    pub restart_at: Option<usize>,
    #[command(flatten)]
    pub data: DataArgs,
    #[command(flatten)]
    pub output: OutputArgs,
}

impl InferArgs {
    pub fn request(&self) -> InferRequest {
        InferRequest {
            record: self.record.clone(),
            restart_at: self.restart_at,
            data: self.data.source(),
            workspace: self.output.workspace.clone(),
            reaction: self.output.reaction(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_does_not_require_config() {
        let cli = Cli::try_parse_from(["weak-pde", "train", "--restart-from", "results/run.json", "-c", "50"]).unwrap();
        let Commands::Train(args) = cli.command else {
            panic!("train ではありません");
        };
        let request = args.request();
        assert_eq!(request.continue_run, Some(50));
        assert!(request.config.is_none());
        assert!(matches!(request.data, DataSource::SyntheticPlate { samples: 16, size: 9 }));
    }

    #[test]
    fn fresh_run_requires_config() {
        assert!(Cli::try_parse_from(["weak-pde", "train"]).is_err());
    }

    #[test]
    fn reaction_output_carries_test_folder() {
        let cli = Cli::try_parse_from(["weak-pde", "infer", "run.json", "-r", "--test-folder", "holdout"]).unwrap();
        let Commands::Infer(args) = cli.command else {
            panic!("infer ではありません");
        };
        assert_eq!(args.request().reaction.unwrap().test_folder, "holdout");
    }
}
