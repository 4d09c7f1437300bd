//! Windowed p95 latency controller.
//!
//! Holds tail latency under a budget by adjusting the frame stride, never by
//! touching accuracy. The controller owns a ring buffer of the last W
//! per-frame durations (recorded for processed AND skipped frames) and is
//! the sole mutator of `stride`.
//!
//! Policy, evaluated once per frame after its duration is recorded:
//!
//! - warmup: fewer than `max(W, 30)` samples since the last stride change →
//!   `p95_window_ms` is `None`, stride held
//! - `p95 > budget` and stride < max → stride += 1 (strict inequality: a
//!   p95 exactly at budget holds)
//! - `p95 < budget · low_water` for W consecutive frames → stride −= 1
//! - otherwise hold
//!
//! Any stride change clears the window and the low-water streak so the next
//! decision measures the new stride rather than a mix of two regimes.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::calibration::quantile_linear;

/// Controller tuning, resolved once from the global config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub budget_ms: f64,
    pub window: usize,
    pub low_water: f64,
    pub auto_stride: bool,
    pub min_stride: u32,
    pub max_stride: u32,
    pub start_stride: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            budget_ms: 66.0,
            window: 120,
            low_water: 0.8,
            auto_stride: true,
            min_stride: 1,
            max_stride: 4,
            start_stride: 1,
        }
    }
}

/// What the controller decided after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrideDecision {
    Hold,
    Raised(u32),
    Lowered(u32),
}

/// Windowed p95 latency controller. Owned by the hot loop; never observed
/// mid-frame from outside.
#[derive(Debug)]
pub struct LatencyController {
    cfg: ControllerConfig,
    durations: VecDeque<f64>,
    samples_since_change: usize,
    stride: u32,
    low_water_streak: usize,
    frames_total: u64,
    frames_processed: u64,
}

impl LatencyController {
    pub fn new(cfg: ControllerConfig) -> Self {
        let stride = cfg.start_stride.clamp(cfg.min_stride, cfg.max_stride);
        Self {
            durations: VecDeque::with_capacity(cfg.window),
            samples_since_change: 0,
            stride,
            low_water_streak: 0,
            frames_total: 0,
            frames_processed: 0,
            cfg,
        }
    }

    /// Current stride; always `>= 1`.
    #[inline]
    pub fn stride(&self) -> u32 {
        self.stride
    }

    /// True when the hot loop should fully process this frame index.
    #[inline]
    pub fn should_process(&self, frame_idx: u64) -> bool {
        frame_idx % self.stride as u64 == 0
    }

    /// Record that a frame was fully processed (stages ran).
    pub fn note_processed(&mut self) {
        self.frames_processed += 1;
    }

    /// Record a frame duration (processed or skipped) and apply the policy.
    pub fn record_frame(&mut self, duration_ms: f64) -> StrideDecision {
        self.frames_total += 1;
        if self.durations.len() == self.cfg.window {
            self.durations.pop_front();
        }
        self.durations.push_back(duration_ms);
        self.samples_since_change += 1;

        if !self.cfg.auto_stride {
            return StrideDecision::Hold;
        }
        let warmup = self.cfg.window.max(30);
        if self.samples_since_change < warmup {
            return StrideDecision::Hold;
        }
        let p95 = match self.p95_window_ms() {
            Some(p) => p,
            None => return StrideDecision::Hold,
        };

        if p95 > self.cfg.budget_ms && self.stride < self.cfg.max_stride {
            self.stride += 1;
            self.on_stride_change();
            info!(stride = self.stride, p95_ms = p95, "stride raised");
            return StrideDecision::Raised(self.stride);
        }
        if p95 < self.cfg.budget_ms * self.cfg.low_water {
            self.low_water_streak += 1;
            if self.low_water_streak >= self.cfg.window && self.stride > self.cfg.min_stride {
                self.stride -= 1;
                self.on_stride_change();
                info!(stride = self.stride, p95_ms = p95, "stride lowered");
                return StrideDecision::Lowered(self.stride);
            }
        } else {
            self.low_water_streak = 0;
        }
        StrideDecision::Hold
    }

    fn on_stride_change(&mut self) {
        self.durations.clear();
        self.samples_since_change = 0;
        self.low_water_streak = 0;
    }

    /// Windowed p95, or `None` during warmup.
    pub fn p95_window_ms(&self) -> Option<f64> {
        self.window_quantile(0.95)
    }

    /// Windowed p50, or `None` during warmup.
    pub fn p50_window_ms(&self) -> Option<f64> {
        self.window_quantile(0.50)
    }

    /// Windowed p99, or `None` during warmup.
    pub fn p99_window_ms(&self) -> Option<f64> {
        self.window_quantile(0.99)
    }

    fn window_quantile(&self, q: f64) -> Option<f64> {
        let warmup = self.cfg.window.max(30);
        if self.samples_since_change < warmup || self.durations.is_empty() {
            return None;
        }
        let mut sorted: Vec<f32> = self.durations.iter().map(|&d| d as f32).collect();
        sorted.sort_by(f32::total_cmp);
        Some(quantile_linear(&sorted, q) as f64)
    }

    /// Mean-rate fps over the current window, or `None` when empty.
    pub fn fps_window(&self) -> Option<f64> {
        if self.durations.is_empty() {
            return None;
        }
        let avg = self.durations.iter().sum::<f64>() / self.durations.len() as f64;
        if avg > 0.0 {
            Some(1000.0 / avg)
        } else {
            None
        }
    }

    pub fn frames_total(&self) -> u64 {
        self.frames_total
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(budget: f64, window: usize) -> ControllerConfig {
        ControllerConfig {
            budget_ms: budget,
            window,
            ..ControllerConfig::default()
        }
    }

    #[test]
    fn warmup_holds_stride_and_reports_none() {
        let mut ctl = LatencyController::new(cfg(33.0, 120));
        for _ in 0..119 {
            assert_eq!(ctl.record_frame(100.0), StrideDecision::Hold);
            assert!(ctl.p95_window_ms().is_none());
        }
        assert_eq!(ctl.stride(), 1);
    }

    #[test]
    fn sustained_over_budget_raises_stride_once_per_window() {
        let mut ctl = LatencyController::new(cfg(33.0, 120));
        // Alternating 40ms / 10ms: p95 of the full window is 40 > 33.
        let mut decisions = Vec::new();
        for i in 0..200u64 {
            let ms = if i % 2 == 0 { 40.0 } else { 10.0 };
            decisions.push(ctl.record_frame(ms));
        }
        // One raise at frame 120, then a fresh warmup that does not complete
        // within the remaining 80 frames.
        assert_eq!(ctl.stride(), 2);
        assert_eq!(
            decisions
                .iter()
                .filter(|d| matches!(d, StrideDecision::Raised(_)))
                .count(),
            1
        );
    }

    #[test]
    fn p95_exactly_at_budget_holds() {
        let mut ctl = LatencyController::new(cfg(33.0, 120));
        for _ in 0..150 {
            ctl.record_frame(33.0);
        }
        assert_eq!(ctl.stride(), 1);
        let p95 = ctl.p95_window_ms().unwrap();
        assert!((p95 - 33.0).abs() < 1e-9);
    }

    #[test]
    fn low_water_streak_lowers_stride_after_full_window() {
        let mut base = cfg(33.0, 40);
        base.start_stride = 2;
        let mut ctl = LatencyController::new(base);
        // warmup = max(40, 30) = 40, then 40 consecutive low-water frames.
        let mut lowered = false;
        for _ in 0..200 {
            if matches!(ctl.record_frame(5.0), StrideDecision::Lowered(_)) {
                lowered = true;
                break;
            }
        }
        assert!(lowered);
        assert_eq!(ctl.stride(), 1);
    }

    #[test]
    fn stride_change_clears_window() {
        let mut ctl = LatencyController::new(cfg(33.0, 120));
        for _ in 0..120 {
            ctl.record_frame(50.0);
        }
        assert_eq!(ctl.stride(), 2);
        // Window cleared: p95 unavailable until warmup completes again.
        assert!(ctl.p95_window_ms().is_none());
    }

    #[test]
    fn auto_stride_off_never_adjusts() {
        let mut base = cfg(33.0, 120);
        base.auto_stride = false;
        let mut ctl = LatencyController::new(base);
        for _ in 0..300 {
            assert_eq!(ctl.record_frame(100.0), StrideDecision::Hold);
        }
        assert_eq!(ctl.stride(), 1);
    }

    #[test]
    fn small_window_still_requires_thirty_samples() {
        let mut ctl = LatencyController::new(cfg(33.0, 10));
        // 30.0ms sits between low-water (26.4) and budget, so stride holds
        // and the window is never cleared by a change.
        for i in 0..29 {
            ctl.record_frame(30.0);
            assert!(ctl.p95_window_ms().is_none(), "sample {i}");
        }
        ctl.record_frame(30.0);
        assert!(ctl.p95_window_ms().is_some());
    }
}
