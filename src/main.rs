//! # 弱形式 PDE 拘束付き代理モデル
//!
//! `burn` フレームワークで、構造格子上の境界値問題 (定常弾性・拡散) の解場を近似する
//! 畳み込み代理モデルを学習します。損失はデータ整合項と、有限要素の弱形式から組み立てた
//! 物理残差項の2段階で切り替えます。
//!
//! ## 使い方
//!
//! ### 学習
//! ```bash
//! cargo run --release -- train plate.toml
//! ```
//!
//! ### 再開
//! ```bash
//! cargo run --release -- train --restart-from results/<run-id>.json -c 50
//! ```
//!
//! ### 推論
//! ```bash
//! cargo run --release -- infer results/<run-id>.json -r
//! ```

use clap::Parser;
use tracing_subscriber::EnvFilter;
use weak_pde::cli::{Cli, Commands};
use weak_pde::workflow;

/// プログラムのエントリーポイント。
///
/// コマンドライン引数を解析し、`train`または`infer`の処理に振り分けます。
fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("weak_pde=info")))
        .init();

    let cli = Cli::parse();
    match &cli.command {
        Commands::Train(args) => {
            let record = workflow::run_train(&args.request())?;
            tracing::info!("=> 実行記録: results/{}.json", record.run_id);
        }
        Commands::Infer(args) => workflow::run_infer(&args.request())?,
    }
    Ok(())
}
