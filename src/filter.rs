//! 移動平均・統計フィルタ群。
//!
//! 頭の高さ・向き・回転の「ゆっくり動く」推定値を保持する。

use nalgebra::{UnitQuaternion, Vector2};
use std::collections::HashMap;

use crate::math::nlerp;

/// 単純な指数移動平均（スカラー）
#[derive(Debug, Clone, Copy)]
pub struct Ema {
    alpha: f32,
    value: f32,
}

impl Ema {
    pub fn new(alpha: f32, initial: f32) -> Self {
        Self { alpha, value: initial }
    }

    pub fn update(&mut self, sample: f32) -> f32 {
        self.value = self.alpha * sample + (1.0 - self.alpha) * self.value;
        self.value
    }

    pub fn value(&self) -> f32 {
        self.value
    }

    pub fn reset(&mut self, value: f32) {
        self.value = value;
    }
}

/// XZ平面上の向きベクトルの指数移動平均
#[derive(Debug, Clone, Copy)]
pub struct FacingAverage {
    alpha: f32,
    value: Vector2<f32>,
}

impl FacingAverage {
    pub fn new(alpha: f32, initial: Vector2<f32>) -> Self {
        Self { alpha, value: initial }
    }

    pub fn update(&mut self, sample: Vector2<f32>) -> Vector2<f32> {
        self.update_with(sample, self.alpha)
    }

    /// 係数をフレームごとに変えたい場合（dt依存の時定数）
    pub fn update_with(&mut self, sample: Vector2<f32>, alpha: f32) -> Vector2<f32> {
        let alpha = alpha.clamp(0.0, 1.0);
        self.value = alpha * sample + (1.0 - alpha) * self.value;
        self.value
    }

    pub fn value(&self) -> Vector2<f32> {
        self.value
    }

    pub fn reset(&mut self, value: Vector2<f32>) {
        self.value = value;
    }
}

/// クォータニオン移動平均（NLERP、最短経路）
///
/// 頭の平均回転の追従レートは 0.03。
#[derive(Debug, Clone, Copy)]
pub struct QuatAverage {
    rate: f32,
    value: UnitQuaternion<f32>,
}

impl QuatAverage {
    pub const HEAD_ROTATION_RATE: f32 = 0.03;

    pub fn new(rate: f32) -> Self {
        Self {
            rate,
            value: UnitQuaternion::identity(),
        }
    }

    pub fn update(&mut self, sample: &UnitQuaternion<f32>) -> UnitQuaternion<f32> {
        self.value = nlerp(&self.value, sample, self.rate);
        self.value
    }

    pub fn value(&self) -> UnitQuaternion<f32> {
        self.value
    }

    pub fn reset(&mut self, value: UnitQuaternion<f32>) {
        self.value = value;
    }
}

/// 頭の高さの最頻値推定。
///
/// センチメートル単位の読みを500サンプルのリングバッファに貯め、
/// 最頻値（モード）を立ち高さの推定に使う。モードは増加方向にしか
/// 更新されない。リセット要求時のみ 2cm の補正を引いて再設定し、
/// バッファをクリアする。
#[derive(Debug, Clone)]
pub struct HeightModeBuffer {
    readings: Vec<i32>,
    capacity: usize,
    next: usize,
    current_mode_cm: i32,
}

/// モード確定後に引く補正量（メートル）
const MODE_CORRECTION: f32 = 0.02;
const CENTIMETERS_PER_METER: f32 = 100.0;

impl HeightModeBuffer {
    pub const DEFAULT_CAPACITY: usize = 500;

    pub fn new(capacity: usize) -> Self {
        Self {
            readings: Vec::with_capacity(capacity),
            capacity,
            next: 0,
            current_mode_cm: 0,
        }
    }

    /// 高さサンプル（メートル）を追加して現在のモード（メートル）を返す
    pub fn push(&mut self, height_m: f32, reset_requested: bool) -> f32 {
        let reading_cm = (height_m * CENTIMETERS_PER_METER).round() as i32;
        if self.readings.len() < self.capacity {
            self.readings.push(reading_cm);
        } else {
            self.readings[self.next] = reading_cm;
            self.next = (self.next + 1) % self.capacity;
        }

        let mut counts: HashMap<i32, usize> = HashMap::new();
        let mut best = self.current_mode_cm;
        let mut best_count = 0usize;
        for &r in &self.readings {
            let c = counts.entry(r).or_insert(0);
            *c += 1;
            if *c > best_count {
                best_count = *c;
                best = r;
            }
        }

        if reset_requested {
            self.current_mode_cm =
                best - (MODE_CORRECTION * CENTIMETERS_PER_METER).round() as i32;
            self.readings.clear();
            self.next = 0;
        } else if best > self.current_mode_cm {
            // 立ち高さの推定は上にしか伸びない
            self.current_mode_cm = best;
        }

        self.mode()
    }

    /// 現在のモード（メートル）
    pub fn mode(&self) -> f32 {
        self.current_mode_cm as f32 / CENTIMETERS_PER_METER
    }

    pub fn clear(&mut self) {
        self.readings.clear();
        self.next = 0;
        self.current_mode_cm = 0;
    }
}
