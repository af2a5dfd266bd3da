use std::path::PathBuf;
use thiserror::Error;

/// ワークフロー全体で使用するエラー型。
///
/// `CheckpointNotFound` 以外はすべて致命的で、オプティマイザのステップより前に
/// 実行を中断します。
#[derive(Error, Debug)]
pub enum PdeError {
    /// 場テンソルの次元・チャンネル数が想定と一致しない
    #[error("テンソル形状が不正です ({what}): 期待値 {expected}, 実際 {actual:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: String,
        actual: Vec<usize>,
    },

    /// バルク残差関数が与えられていない
    #[error("物理残差関数が実装されていません: {0}")]
    PhysicsNotImplemented(String),

    /// ウォームスタート時のパラメータ数 (または形状) の不一致
    #[error(
        "ウォームスタートのパラメータが一致しません ({role}): 読み込み元 {saved} 個, 読み込み先 {expected} 個"
    )]
    WeightLoadMismatch {
        role: &'static str,
        saved: usize,
        expected: usize,
    },

    /// 未知のオプティマイザ名
    #[error("未知のオプティマイザです: '{0}'")]
    UnknownOptimizer(String),

    /// 再開用チェックポイントが見つからない (致命的ではない)
    #[error("チェックポイントが見つかりません: {}", .0.display())]
    CheckpointNotFound(PathBuf),

    /// 新規実行で設定ファイルが指定されていない
    #[error("設定ファイルが指定されていません (再開しない場合は必須です)")]
    MissingConfig,

    #[error("I/Oエラー: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSONのシリアライズに失敗しました: {0}")]
    Json(#[from] serde_json::Error),

    #[error("設定ファイルの解析に失敗しました: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("モデルの保存・読み込みに失敗しました: {0}")]
    Recorder(#[from] burn::record::RecorderError),

    #[error(".npy の書き込みに失敗しました: {0}")]
    WriteNpy(#[from] ndarray_npy::WriteNpyError),

    #[error(".npy の読み込みに失敗しました: {0}")]
    ReadNpy(#[from] ndarray_npy::ReadNpyError),

    /// テンソルからホスト側データへの変換失敗
    #[error("テンソルデータの変換に失敗しました: {0}")]
    TensorData(String),

    #[error("グラフの描画に失敗しました: {0}")]
    Plot(String),
}

impl PdeError {
    pub fn shape(what: &'static str, expected: impl Into<String>, actual: &[usize]) -> Self {
        PdeError::ShapeMismatch {
            what,
            expected: expected.into(),
            actual: actual.to_vec(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PdeError>;
