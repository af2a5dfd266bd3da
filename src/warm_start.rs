//! 決定論モデル → ベイズモデルのパラメータ対応表。

use crate::error::{PdeError, Result};

/// 対応表の1行。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterPair {
    /// 読み込み元の添字
    pub source: usize,
    /// 読み込み先の添字
    pub destination: usize,
    pub source_id: String,
    pub destination_id: String,
}

/// 読み込み元と読み込み先のパラメータを宣言順に対応付けた表。
///
/// 名前の一致ではなく位置で対応させ、個数が異なる場合は構築に失敗します。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterCorrespondence {
    role: &'static str,
    pairs: Vec<ParameterPair>,
}

impl ParameterCorrespondence {
    pub fn build(role: &'static str, saved: &[String], expected: &[String]) -> Result<Self> {
        if saved.len() != expected.len() {
            return Err(PdeError::WeightLoadMismatch {
                role,
                saved: saved.len(),
                expected: expected.len(),
            });
        }
        let pairs = saved
            .iter()
            .zip(expected)
            .enumerate()
            .map(|(i, (source_id, destination_id))| ParameterPair {
                source: i,
                destination: i,
                source_id: source_id.clone(),
                destination_id: destination_id.clone(),
            })
            .collect();
        Ok(Self { role, pairs })
    }

    pub fn role(&self) -> &'static str {
        self.role
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ParameterPair> {
        self.pairs.iter()
    }
}

impl<'a> IntoIterator for &'a ParameterCorrespondence {
    type Item = &'a ParameterPair;
    type IntoIter = std::slice::Iter<'a, ParameterPair>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
