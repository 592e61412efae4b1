//! 座位・立位の分類器。
//!
//! 頭のセンサー高さから「座っているか立っているか」をヒステリシス付きで
//! 判定する。判定の基準となる転換点（tipping point）は、座位では平均高さ、
//! 立位では高さの最頻値に追従する。状態が変わると呼び出し側は体の基準を
//! 取り直す必要がある。
//!
//! ついでにしゃがみ（長時間の低頭位）と歩行状態もここで持つ。

use crate::config::SitStandConfig;
use crate::filter::{Ema, HeightModeBuffer};
use crate::pose::TrackedPose;

/// 座位/立位の状態機械
#[derive(Debug, Clone)]
pub struct SitStandClassifier {
    cfg: SitStandConfig,
    user_height: f32,
    sitting: bool,
    locked: bool,
    timer: f32,
    tipping_point: f32,
    average_height: Ema,
    standing_height: HeightModeBuffer,
    height_reset_requested: bool,
    squat_timer: f32,
    squat_detected: bool,
    walking: bool,
}

impl SitStandClassifier {
    pub fn new(cfg: SitStandConfig, user_height: f32) -> Self {
        let average_height = Ema::new(cfg.height_filter_coefficient, user_height);
        Self {
            cfg,
            user_height,
            sitting: false,
            locked: false,
            timer: 0.0,
            tipping_point: user_height,
            average_height,
            standing_height: HeightModeBuffer::new(HeightModeBuffer::DEFAULT_CAPACITY),
            height_reset_requested: false,
            squat_timer: 0.0,
            squat_detected: false,
            walking: false,
        }
    }

    /// 高さ統計を更新し状態機械を1ステップ進める。状態が変わったら true。
    ///
    /// `away` の間、または頭が無効な間は統計をユーザー身長へ戻して
    /// 立位に固定する。ロック中は状態も統計も動かさない。
    pub fn update(&mut self, head_sensor: &TrackedPose, away: bool, dt: f32) -> bool {
        if self.locked {
            return false;
        }

        if away || !head_sensor.is_valid() {
            self.average_height.reset(self.user_height);
            self.tipping_point = self.user_height;
            self.timer = 0.0;
            let changed = self.sitting;
            self.sitting = false;
            return changed;
        }

        let reading = head_sensor.translation.y;
        self.average_height.update(reading);
        let reset = self.height_reset_requested;
        self.height_reset_requested = false;
        self.standing_height.push(reading, reset);

        if self.sitting {
            if reading > self.cfg.standing_multiple * self.tipping_point {
                self.timer += dt;
                if self.timer >= self.cfg.standing_timeout {
                    self.transition(reading, false);
                    return true;
                }
            } else if reading < self.cfg.sitting_multiple * self.tipping_point {
                // 基準が狂ったまま座り直した場合の救済:
                // 座位のまま、より低い位置で基準を取り直す
                self.timer += dt;
                if self.timer >= self.cfg.sitting_timeout {
                    self.transition(reading, true);
                    return true;
                }
            } else {
                self.timer = 0.0;
                if self.average_height.value() > self.cfg.sitting_upper_bound {
                    // 座位なのに平均が高すぎる: 分類の誤りとみなして立位へ
                    // （統計は正しいとみなしてそのまま残す）
                    self.squat_timer = 0.0;
                    self.sitting = false;
                    return true;
                }
                // 座位の転換点は平均高さに追従する
                self.tipping_point = self.average_height.value();
            }
        } else if reading < self.cfg.sitting_multiple * self.tipping_point {
            self.timer += dt;
            if self.timer >= self.cfg.sitting_timeout {
                self.transition(reading, true);
                return true;
            }
        } else {
            self.timer = 0.0;
            // 立位の転換点は最頻値に追従する
            self.tipping_point = self.standing_height.mode();
        }
        false
    }

    fn transition(&mut self, reading: f32, sitting: bool) {
        self.average_height.reset(reading);
        self.tipping_point = reading;
        self.timer = 0.0;
        self.squat_timer = 0.0;
        self.sitting = sitting;
    }

    /// 長時間の低頭位（しゃがみ込み）の検出。
    /// 上体がほぼ垂直のまま頭だけ下がっている状態が続いたら squat フラグを立てる。
    pub fn update_squat(
        &mut self,
        head_avatar_y: f32,
        default_head_y: f32,
        spine_vertical: bool,
        force_stand: bool,
        dt: f32,
    ) {
        let head_low = head_avatar_y < default_head_y - self.cfg.squat_threshold;
        if head_low && spine_vertical && !force_stand && !self.sitting {
            self.squat_timer += dt;
            if self.squat_timer >= self.cfg.squat_timeout {
                self.squat_detected = true;
                self.squat_timer = 0.0;
            }
        } else {
            self.squat_timer = 0.0;
        }
    }

    /// squat フラグを消費せずに読む
    pub fn squat_flag(&self) -> bool {
        self.squat_detected
    }

    /// squat フラグを消費して返す（垂直リセンタリングの起動で使う）
    pub fn take_squat_flag(&mut self) -> bool {
        let flag = self.squat_detected;
        self.squat_detected = false;
        flag
    }

    /// 頭の速度から歩行状態を解除する
    pub fn note_head_speed(&mut self, speed: f32) {
        if self.walking && speed < self.cfg.walk_speed_threshold {
            self.walking = false;
        }
    }

    pub fn set_walking(&mut self, walking: bool) {
        self.walking = walking;
    }

    pub fn is_walking(&self) -> bool {
        self.walking
    }

    pub fn is_sitting(&self) -> bool {
        self.sitting
    }

    /// スクリプトからの強制設定。統計も現在の基準へ取り直す。
    pub fn set_sitting(&mut self, sitting: bool) {
        let reading = self.average_height.value();
        self.transition(reading, sitting);
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn set_locked(&mut self, locked: bool) {
        self.locked = locked;
    }

    /// ユーザー身長の変更。away時のフォールバック基準も変わる。
    pub fn set_user_height(&mut self, user_height: f32) {
        self.user_height = user_height;
    }

    /// 次のサンプルで立ち高さ最頻値を取り直す
    pub fn request_height_reset(&mut self) {
        self.height_reset_requested = true;
    }

    pub fn average_height(&self) -> f32 {
        self.average_height.value()
    }

    pub fn standing_height_mode(&self) -> f32 {
        self.standing_height.mode()
    }

    pub fn walk_speed_threshold(&self) -> f32 {
        self.cfg.walk_speed_threshold
    }

    #[cfg(test)]
    fn timer(&self) -> f32 {
        self.timer
    }
}
