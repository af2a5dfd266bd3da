//! # 弱形式 PDE 拘束付き代理モデルのライブラリ
//!
//! `burn` フレームワークを使用して、境界条件を埋め込んだ場テンソルから残差を組み立て、
//! データ整合フェーズと物理残差フェーズの2段階で代理モデルを学習するための主要な
//! コンポーネントを提供します。

pub mod assembly;
pub mod boundary;
pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod dataset;
pub mod error;
pub mod field;
pub mod inference;
pub mod loss;
pub mod model;
pub mod physics;
pub mod plot;
pub mod schedule;
pub mod training;
pub mod warm_start;
pub mod workflow;

pub use error::{PdeError, Result};
