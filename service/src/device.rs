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

use lightbridge_core::{LedColor, LedDevice, Rgb};
use log::debug;

/// Direct-device slot used until a native transport is linked in. It never opens, so the
/// arbiter always moves on to the companion application.
pub struct UnlinkedDevice;

impl LedDevice for UnlinkedDevice {
    fn open(&mut self) -> bool {
        debug!("No native LED transport linked in");
        false
    }

    fn close(&mut self) {}

    fn count_leds(&self) -> usize {
        0
    }

    fn set_color(&mut self, _index: usize, _color: Rgb) -> bool {
        false
    }

    fn set_color_to_all(&mut self, _color: Rgb) -> bool {
        false
    }

    fn set_colors(&mut self, _colors: &[LedColor]) -> bool {
        false
    }

    fn set_brightness(&mut self, _value: u8) -> bool {
        false
    }

    fn set_gamma(&mut self, _value: f64) -> bool {
        false
    }

    fn set_smooth(&mut self, _value: u8) -> bool {
        false
    }

    fn turn_on(&mut self) -> bool {
        false
    }

    fn turn_off(&mut self) -> bool {
        false
    }
}
