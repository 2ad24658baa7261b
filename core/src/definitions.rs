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

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

pub const MAX_BRIGHTNESS: u8 = 100;
pub const MAX_GAMMA: f64 = 10.0;
pub const DEFAULT_GAMMA: f64 = 2.2;
pub const DEFAULT_SMOOTH: u8 = 255;
pub const DEFAULT_BRIGHTNESS: u8 = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
}

impl Display for Rgb {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{},{},{}", self.r, self.g, self.b)
    }
}

/// One entry of a full-strip color update. `Skip` keeps whatever the LED showed before
/// and travels as `-1` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LedColor {
    Color(Rgb),
    Skip,
}

impl From<Rgb> for LedColor {
    fn from(value: Rgb) -> Self {
        LedColor::Color(value)
    }
}

impl LedColor {
    pub fn color(&self) -> Option<Rgb> {
        match self {
            LedColor::Color(rgb) => Some(*rgb),
            LedColor::Skip => None,
        }
    }
}

/// The three interchangeable ways of reaching the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Direct,
    Companion,
    Proxy,
}

impl Display for BackendKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Direct => write!(f, "direct device"),
            BackendKind::Companion => write!(f, "companion app"),
            BackendKind::Proxy => write!(f, "proxy peer"),
        }
    }
}

/// Which backend the arbiter currently routes device commands to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Authority {
    #[default]
    Idle,
    Direct,
    Companion,
    Proxy,
}

impl Authority {
    pub fn backend(&self) -> Option<BackendKind> {
        match self {
            Authority::Idle => None,
            Authority::Direct => Some(BackendKind::Direct),
            Authority::Companion => Some(BackendKind::Companion),
            Authority::Proxy => Some(BackendKind::Proxy),
        }
    }
}

impl From<BackendKind> for Authority {
    fn from(kind: BackendKind) -> Self {
        match kind {
            BackendKind::Direct => Authority::Direct,
            BackendKind::Companion => Authority::Companion,
            BackendKind::Proxy => Authority::Proxy,
        }
    }
}

/// Events visible to the embedding application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LightEvent {
    /// A backend became authoritative and every cached setting was replayed onto it.
    Connected,
    /// No backend is able to drive the device anymore.
    Disconnected,
    /// The proxy peer started playing video.
    Play,
    /// The proxy peer paused video.
    Pause,
}

/// Which backend wins when the proxy peer appears while another backend is active.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArbitrationPolicy {
    /// The proxy always takes over from the direct device and the companion app.
    #[default]
    ProxyPreempts,
    /// Whatever backend connected first keeps authority until it is lost.
    FirstConnected,
}
