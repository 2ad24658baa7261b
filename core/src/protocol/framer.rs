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

//! Line framing of the proxy socket protocol.
//!
//! Outbound frames are `<code><payload>\n`. The code is either the decimal event code
//! (numeric revision) or the letter `'a' + code` (letter revision). Inbound frames carry a
//! single digit tag: `0` is a reply to the command in flight, `1..=5` are notifications.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable event codes of the proxy protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EventCode {
    CountLeds = 0,
    SetColor = 1,
    SetColorToAll = 2,
    // 3 was used for rectangle updates and is not sent anymore
    SetBrightness = 4,
    SetSmooth = 5,
    SetGamma = 6,
    TurnOff = 7,
    TurnOn = 8,
    Reconnect = 9,
    SetColors = 10,
    SetPort = 11,
}

impl EventCode {
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// How event codes are written on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameStyle {
    /// Single decimal digit; only codes `0..=9` can be expressed.
    Numeric,
    #[default]
    Letter,
}

impl FrameStyle {
    pub fn supports(self, code: EventCode) -> bool {
        match self {
            FrameStyle::Numeric => code.code() <= 9,
            FrameStyle::Letter => true,
        }
    }
}

/// Encode one outbound frame including the trailing newline.
///
/// An empty payload is omitted, so `encode(FrameStyle::Letter, EventCode::CountLeds, "")`
/// yields `"a\n"`.
pub fn encode(style: FrameStyle, code: EventCode, payload: &str) -> String {
    let mut line = String::with_capacity(payload.len() + 3);
    match style {
        FrameStyle::Numeric => line.push_str(&code.code().to_string()),
        FrameStyle::Letter => line.push(char::from(b'a' + code.code())),
    }
    line.push_str(payload);
    line.push('\n');
    line
}

/// Out-of-band messages the proxy peer sends without being asked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Notification {
    Playing,
    Paused,
    DeviceConnected,
    DeviceDisconnected,
    InvalidArguments,
}

impl Notification {
    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            1 => Some(Notification::Playing),
            2 => Some(Notification::Paused),
            3 => Some(Notification::DeviceConnected),
            4 => Some(Notification::DeviceDisconnected),
            5 => Some(Notification::InvalidArguments),
            _ => None,
        }
    }

    pub fn tag(self) -> u32 {
        match self {
            Notification::Playing => 1,
            Notification::Paused => 2,
            Notification::DeviceConnected => 3,
            Notification::DeviceDisconnected => 4,
            Notification::InvalidArguments => 5,
        }
    }
}

impl Display for Notification {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Notification::Playing => write!(f, "playing"),
            Notification::Paused => write!(f, "paused"),
            Notification::DeviceConnected => write!(f, "device connected"),
            Notification::DeviceDisconnected => write!(f, "device disconnected"),
            Notification::InvalidArguments => write!(f, "invalid arguments"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame<'a> {
    /// Reply to the command currently in flight.
    Response(&'a str),
    Notification(Notification, &'a str),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Empty frame")]
    Empty,

    #[error("Unknown frame tag {0:?}")]
    UnknownTag(char),
}

/// Split one inbound line into its tag and payload.
pub fn decode(line: &str) -> Result<InboundFrame<'_>, FrameError> {
    let line = line.trim_end_matches(['\r', '\n']);
    let mut chars = line.chars();
    let tag = chars.next().ok_or(FrameError::Empty)?;
    let payload = chars.as_str();
    match tag.to_digit(10) {
        Some(0) => Ok(InboundFrame::Response(payload)),
        Some(digit) => Notification::from_tag(digit)
            .map(|notification| InboundFrame::Notification(notification, payload))
            .ok_or(FrameError::UnknownTag(tag)),
        None => Err(FrameError::UnknownTag(tag)),
    }
}

/// Peer side of [`encode`]: recover the event code and payload of an outbound frame.
pub fn parse_command(style: FrameStyle, line: &str) -> Option<(u8, &str)> {
    let line = line.trim_end_matches(['\r', '\n']);
    match style {
        FrameStyle::Letter => {
            let first = *line.as_bytes().first()?;
            if !(b'a'..=b'z').contains(&first) {
                return None;
            }
            Some((first - b'a', &line[1..]))
        }
        FrameStyle::Numeric => {
            let first = line.chars().next()?.to_digit(10)?;
            Some((first as u8, &line[1..]))
        }
    }
}
