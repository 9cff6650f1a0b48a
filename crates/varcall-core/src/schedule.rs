//! Adaptive Schedule Controller
//!
//! エポック毎の検証損失履歴から直近6点のジグザグ（差分の符号が交互に反転）を検出し、
//! 学習率・正則化係数の減衰を指示する。減衰回数には上限があり、
//! 使い切った時点で学習を打ち切る。

use crate::epoch::ValidationRecord;

/// 判定に使う直近エポック数
pub const ZIGZAG_WINDOW: usize = 6;

/// エポック終了時の判定結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleDecision {
    /// そのまま続行
    Continue,
    /// 学習率・正則化係数を減衰して続行
    Decay,
    /// 減衰回数を使い切ったので終了
    Exhausted,
}

/// 減衰スケジュールの状態
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdaptiveSchedule {
    /// 残り減衰回数
    remaining: u32,
    /// 前回の減衰（または開始）からのエポック数
    since_reset: usize,
    decays_applied: u32,
}

impl AdaptiveSchedule {
    pub fn new(max_decays: u32) -> Self {
        Self {
            remaining: max_decays,
            since_reset: 0,
            decays_applied: 0,
        }
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub fn since_reset(&self) -> usize {
        self.since_reset
    }

    pub fn decays_applied(&self) -> u32 {
        self.decays_applied
    }

    /// エポック終了ごとに1回呼ぶ
    ///
    /// 前回リセットから6エポック以上経過している場合のみ直近6点を判定する。
    pub fn on_epoch_done(&mut self, history: &[ValidationRecord]) -> ScheduleDecision {
        self.since_reset += 1;
        if self.since_reset < ZIGZAG_WINDOW || history.len() < ZIGZAG_WINDOW {
            return ScheduleDecision::Continue;
        }

        let window: Vec<f64> = history[history.len() - ZIGZAG_WINDOW..]
            .iter()
            .map(|r| r.loss_sum)
            .collect();
        if !is_oscillating(&window) {
            return ScheduleDecision::Continue;
        }

        self.remaining = self.remaining.saturating_sub(1);
        if self.remaining == 0 {
            return ScheduleDecision::Exhausted;
        }
        self.decays_applied += 1;
        self.since_reset = 0;
        ScheduleDecision::Decay
    }
}

/// 6点の損失列がジグザグか
///
/// 差分 `d[k] = L[k] - L[k+1]` の符号が `+,-,+,-,+` または `-,+,-,+,-` なら真。
/// 先頭の差分が正でも負でもない場合（0 や NaN）も真とする。
pub fn is_oscillating(losses: &[f64]) -> bool {
    debug_assert_eq!(losses.len(), ZIGZAG_WINDOW);
    let d: Vec<f64> = losses.windows(2).map(|w| w[0] - w[1]).collect();
    if d[0] > 0.0 {
        d[1] < 0.0 && d[2] > 0.0 && d[3] < 0.0 && d[4] > 0.0
    } else if d[0] < 0.0 {
        d[1] > 0.0 && d[2] < 0.0 && d[3] > 0.0 && d[4] < 0.0
    } else {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history(losses: &[f64]) -> Vec<ValidationRecord> {
        losses
            .iter()
            .enumerate()
            .map(|(i, &loss_sum)| ValidationRecord {
                loss_sum,
                epoch: i + 1,
            })
            .collect()
    }

    #[test]
    fn test_zigzag_patterns() {
        assert!(is_oscillating(&[10.0, 8.0, 9.0, 7.0, 9.0, 6.0]));
        assert!(is_oscillating(&[6.0, 9.0, 7.0, 9.0, 8.0, 10.0]));
        assert!(!is_oscillating(&[10.0, 9.0, 8.0, 7.0, 6.0, 5.0]));
        assert!(!is_oscillating(&[10.0, 8.0, 9.0, 7.0, 6.0, 5.0]));
    }

    #[test]
    fn test_flat_first_difference_flags() {
        assert!(is_oscillating(&[5.0, 5.0, 4.0, 3.0, 2.0, 1.0]));
        assert!(is_oscillating(&[f64::NAN, 5.0, 4.0, 3.0, 2.0, 1.0]));
    }

    #[test]
    fn test_not_evaluated_before_window_fills() {
        let mut schedule = AdaptiveSchedule::new(3);
        let losses = [10.0, 8.0, 9.0, 7.0, 9.0, 6.0];
        for n in 1..ZIGZAG_WINDOW {
            assert_eq!(schedule.on_epoch_done(&history(&losses[..n])), ScheduleDecision::Continue);
        }
        assert_eq!(schedule.on_epoch_done(&history(&losses)), ScheduleDecision::Decay);
        assert_eq!(schedule.remaining(), 2);
        assert_eq!(schedule.decays_applied(), 1);
        assert_eq!(schedule.since_reset(), 0);
    }

    #[test]
    fn test_counter_reset_delays_next_check() {
        let mut schedule = AdaptiveSchedule::new(3);
        let mut losses = vec![10.0, 8.0, 9.0, 7.0, 9.0, 6.0];
        assert_eq!(schedule.on_epoch_done(&history(&losses)), ScheduleDecision::Decay);
        // 直後の5エポックはジグザグでも判定しない
        for k in 0..5 {
            losses.push(if k % 2 == 0 { 8.0 } else { 5.0 });
            assert_eq!(schedule.on_epoch_done(&history(&losses)), ScheduleDecision::Continue);
        }
        losses.push(4.0);
        assert_eq!(schedule.on_epoch_done(&history(&losses)), ScheduleDecision::Decay);
        assert_eq!(schedule.remaining(), 1);
    }

    #[test]
    fn test_monotonic_never_decays() {
        let mut schedule = AdaptiveSchedule::new(1);
        let losses: Vec<f64> = (0..20).map(|i| 100.0 - i as f64).collect();
        for n in 1..=losses.len() {
            assert_eq!(schedule.on_epoch_done(&history(&losses[..n])), ScheduleDecision::Continue);
        }
        assert_eq!(schedule.remaining(), 1);
    }

    #[test]
    fn test_budget_of_one_exhausts_on_first_flag() {
        let mut schedule = AdaptiveSchedule::new(1);
        let losses = [10.0, 8.0, 9.0, 7.0, 9.0, 6.0];
        for n in 1..ZIGZAG_WINDOW {
            schedule.on_epoch_done(&history(&losses[..n]));
        }
        assert_eq!(schedule.on_epoch_done(&history(&losses)), ScheduleDecision::Exhausted);
        assert_eq!(schedule.remaining(), 0);
        assert_eq!(schedule.decays_applied(), 0);
    }
}
