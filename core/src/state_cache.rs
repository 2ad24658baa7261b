// Copyright 2025 HEM Sp. z o.o.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::BTreeMap;

use crate::definitions::{LedColor, Rgb, DEFAULT_BRIGHTNESS, DEFAULT_GAMMA, DEFAULT_SMOOTH};

/// Last device state some backend confirmed. Replayed onto every backend that becomes
/// authoritative.
#[derive(Debug, Clone, PartialEq)]
pub struct LogicalState {
    pub led_count: usize,
    pub brightness: u8,
    pub gamma: f64,
    pub smooth: u8,
    colors: BTreeMap<usize, Rgb>,
}

impl Default for LogicalState {
    fn default() -> Self {
        Self {
            led_count: 0,
            brightness: DEFAULT_BRIGHTNESS,
            gamma: DEFAULT_GAMMA,
            smooth: DEFAULT_SMOOTH,
            colors: BTreeMap::new(),
        }
    }
}

impl LogicalState {
    pub fn new(brightness: u8, gamma: f64, smooth: u8) -> Self {
        Self { brightness, gamma, smooth, ..Default::default() }
    }

    pub fn color(&self, index: usize) -> Option<Rgb> {
        self.colors.get(&index).copied()
    }

    pub fn has_colors(&self) -> bool {
        !self.colors.is_empty()
    }

    /// Returns `false` when `index` is outside the strip and nothing was recorded.
    pub fn record_color(&mut self, index: usize, color: Rgb) -> bool {
        if index >= self.led_count {
            return false;
        }
        self.colors.insert(index, color);
        true
    }

    pub fn record_color_to_all(&mut self, color: Rgb) {
        for index in 0..self.led_count {
            self.colors.insert(index, color);
        }
    }

    /// `Skip` entries and entries past the strip leave the cache untouched.
    pub fn record_colors(&mut self, colors: &[LedColor]) {
        for (index, entry) in colors.iter().enumerate().take(self.led_count) {
            if let LedColor::Color(color) = entry {
                self.colors.insert(index, *color);
            }
        }
    }

    /// One entry per LED; LEDs that were never colored are skipped.
    pub fn replay_colors(&self) -> Vec<LedColor> {
        (0..self.led_count)
            .map(|index| self.colors.get(&index).map_or(LedColor::Skip, |c| LedColor::Color(*c)))
            .collect()
    }
}
