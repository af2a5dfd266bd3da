//! 学習フェーズと損失重みのスケジュール。

use serde::{Deserialize, Serialize};

/// データ項と物理項の重み (`BetaMSELoss`, `BetaPDELoss`)。
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossWeights {
    pub mse: f32,
    pub pde: f32,
}

impl LossWeights {
    /// INIT フェーズ: データ整合項のみ
    pub const DATA: Self = Self { mse: 1.0, pde: 0.0 };
    /// PHYSICS フェーズ: 物理残差項のみ
    pub const PHYSICS: Self = Self { mse: 0.0, pde: 1.0 };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Init,
    Physics,
}

impl Phase {
    pub fn weights(self) -> LossWeights {
        match self {
            Phase::Init => LossWeights::DATA,
            Phase::Physics => LossWeights::PHYSICS,
        }
    }
}

/// エポック `0..initial_epoch` を INIT、`initial_epoch..epochs` を PHYSICS とする2段階スケジュール。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseSchedule {
    pub initial_epoch: usize,
    pub epochs: usize,
}

impl PhaseSchedule {
    pub fn new(initial_epoch: usize, epochs: usize) -> Self {
        Self { initial_epoch, epochs }
    }

    /// 再開時のスケジュール。常に PHYSICS から始まり、`continue_run` エポック実行します。
    pub fn resumed(continue_run: usize) -> Self {
        Self {
            initial_epoch: 0,
            epochs: continue_run,
        }
    }

    pub fn phase_at(&self, epoch: usize) -> Phase {
        if epoch < self.initial_epoch {
            Phase::Init
        } else {
            Phase::Physics
        }
    }
}

/// 1回の実行に紐づく学習状態。
///
/// 損失重みを書き換えられるのはオーケストレータ (`begin_epoch`) だけで、損失関数は
/// `&TrainingContext` 経由で読み取るのみです。`begin_epoch` は `&mut self` を取るため、
/// そのエポックの順伝播が始まる前に書き込みが完了していることが借用規則で保証されます。
#[derive(Debug, Clone)]
pub struct TrainingContext {
    epoch: usize,
    phase: Phase,
    weights: LossWeights,
}

impl Default for TrainingContext {
    fn default() -> Self {
        Self {
            epoch: 0,
            phase: Phase::Init,
            weights: LossWeights::DATA,
        }
    }
}

impl TrainingContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// 固定の重みを持つコンテキスト (推論・評価用)。
    pub fn with_phase(phase: Phase) -> Self {
        Self {
            epoch: 0,
            phase,
            weights: phase.weights(),
        }
    }

    /// エポック境界で重みを切り替えます。
    pub(crate) fn begin_epoch(&mut self, schedule: &PhaseSchedule, epoch: usize) -> LossWeights {
        self.epoch = epoch;
        self.phase = schedule.phase_at(epoch);
        self.weights = self.phase.weights();
        self.weights
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn weights(&self) -> LossWeights {
        self.weights
    }
}
