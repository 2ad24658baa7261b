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

use crate::definitions::{LedColor, Rgb, MAX_BRIGHTNESS, MAX_GAMMA};
use crate::errors::BackendError;
use crate::protocol::framer::{encode, EventCode, FrameStyle};
use crate::queue::{LineCommand, Reply, ReplyResult};

/// Commands sent to the proxy peer.
#[derive(Debug, Clone, PartialEq)]
pub enum ProxyCommand {
    CountLeds,
    SetColor { index: usize, color: Rgb },
    SetColorToAll(Rgb),
    SetColors(Vec<LedColor>),
    SetBrightness(u8),
    SetSmooth(u8),
    SetGamma(f64),
    TurnOff,
    TurnOn,
    Reconnect,
    SetPort(u16),
}

impl ProxyCommand {
    pub fn event_code(&self) -> EventCode {
        match self {
            ProxyCommand::CountLeds => EventCode::CountLeds,
            ProxyCommand::SetColor { .. } => EventCode::SetColor,
            ProxyCommand::SetColorToAll(_) => EventCode::SetColorToAll,
            ProxyCommand::SetColors(_) => EventCode::SetColors,
            ProxyCommand::SetBrightness(_) => EventCode::SetBrightness,
            ProxyCommand::SetSmooth(_) => EventCode::SetSmooth,
            ProxyCommand::SetGamma(_) => EventCode::SetGamma,
            ProxyCommand::TurnOff => EventCode::TurnOff,
            ProxyCommand::TurnOn => EventCode::TurnOn,
            ProxyCommand::Reconnect => EventCode::Reconnect,
            ProxyCommand::SetPort(_) => EventCode::SetPort,
        }
    }

    pub fn payload(&self) -> String {
        match self {
            ProxyCommand::CountLeds
            | ProxyCommand::TurnOff
            | ProxyCommand::TurnOn
            | ProxyCommand::Reconnect => String::new(),
            ProxyCommand::SetColor { index, color } => format!("{index},{color}"),
            ProxyCommand::SetColorToAll(color) => color.to_string(),
            ProxyCommand::SetColors(colors) => colors
                .iter()
                .map(|entry| match entry {
                    LedColor::Color(color) => color.to_string(),
                    LedColor::Skip => "-1".to_string(),
                })
                .collect::<Vec<_>>()
                .join(";"),
            ProxyCommand::SetBrightness(value) => (*value).min(MAX_BRIGHTNESS).to_string(),
            ProxyCommand::SetSmooth(value) => value.to_string(),
            ProxyCommand::SetGamma(value) => gamma_tenths(*value).to_string(),
            ProxyCommand::SetPort(port) => port.to_string(),
        }
    }
}

/// Gamma travels as an integer number of tenths.
fn gamma_tenths(gamma: f64) -> u32 {
    if !gamma.is_finite() {
        return 0;
    }
    (gamma.clamp(0.0, MAX_GAMMA) * 10.0).round() as u32
}

/// A [`ProxyCommand`] bound to the frame revision it is written with.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyFrame {
    pub style: FrameStyle,
    pub command: ProxyCommand,
}

impl LineCommand for ProxyFrame {
    fn encode(&self) -> String {
        encode(self.style, self.command.event_code(), &self.command.payload())
    }

    fn decode_reply(&self, payload: &str) -> ReplyResult {
        let payload = payload.trim();
        match self.command {
            ProxyCommand::CountLeds => payload
                .parse::<usize>()
                .map(Reply::Count)
                .map_err(|_| BackendError::Protocol(format!("invalid LED count {payload:?}"))),
            _ => match payload {
                "1" => Ok(Reply::Ack(true)),
                "0" => Ok(Reply::Ack(false)),
                other => Err(BackendError::Protocol(format!("invalid acknowledgement {other:?}"))),
            },
        }
    }
}
