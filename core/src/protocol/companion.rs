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

//! Text vocabulary of the companion application's API server.
//!
//! Getters are answered with `<key>:<value>`, setters with a bare `ok`.

use crate::definitions::Rgb;
use crate::errors::BackendError;
use crate::queue::{LineCommand, Reply, ReplyResult};

const REPLY_OK: &str = "ok";
const LOCK_SUCCESS: &str = "success";

#[derive(Debug, Clone, PartialEq)]
pub enum CompanionCommand {
    ApiKey(String),
    CountLeds,
    Lock,
    Unlock,
    Profiles,
    Profile,
    Status,
    ApiStatus,
    SetStatus(bool),
    SetProfile(String),
    SetGamma(f64),
    SetSmooth(u8),
    SetBrightness(u8),
    /// `(led id, color)` pairs; LED ids are the companion's 1-based numbering.
    SetColors(Vec<(usize, Rgb)>),
}

impl CompanionCommand {
    fn body(&self) -> String {
        match self {
            CompanionCommand::ApiKey(key) => format!("apikey:{key}"),
            CompanionCommand::CountLeds => "getcountleds".to_string(),
            CompanionCommand::Lock => "lock".to_string(),
            CompanionCommand::Unlock => "unlock".to_string(),
            CompanionCommand::Profiles => "getprofiles".to_string(),
            CompanionCommand::Profile => "getprofile".to_string(),
            CompanionCommand::Status => "getstatus".to_string(),
            CompanionCommand::ApiStatus => "getstatusapi".to_string(),
            CompanionCommand::SetStatus(on) => {
                format!("setstatus:{}", if *on { "on" } else { "off" })
            }
            CompanionCommand::SetProfile(name) => format!("setprofile:{name}"),
            CompanionCommand::SetGamma(gamma) => format!("setgamma:{}", format_gamma(*gamma)),
            CompanionCommand::SetSmooth(value) => format!("setsmooth:{value}"),
            CompanionCommand::SetBrightness(value) => format!("setbrightness:{value}"),
            CompanionCommand::SetColors(entries) => {
                let mut line = String::from("setcolor:");
                for (id, color) in entries {
                    line.push_str(&format!("{id}-{color};"));
                }
                line
            }
        }
    }
}

/// Value part of a `<key>:<value>` reply.
fn reply_value(payload: &str) -> Result<&str, BackendError> {
    payload
        .split_once(':')
        .map(|(_, value)| value)
        .ok_or_else(|| BackendError::Protocol(format!("expected key:value reply, got {payload:?}")))
}

/// At most three significant digits without trailing zeros (`2.2`, `1`, `2.35`).
pub fn format_gamma(gamma: f64) -> String {
    if gamma == 0.0 || !gamma.is_finite() {
        return "0".to_string();
    }
    let magnitude = gamma.abs().log10().floor() as i32;
    let decimals = (2 - magnitude).max(0) as usize;
    let text = format!("{gamma:.decimals$}");
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        text
    }
}

impl LineCommand for CompanionCommand {
    fn encode(&self) -> String {
        let mut line = self.body();
        line.push('\n');
        line
    }

    fn decode_reply(&self, payload: &str) -> ReplyResult {
        let payload = payload.trim();
        match self {
            CompanionCommand::CountLeds => {
                let value = reply_value(payload)?;
                value
                    .trim()
                    .parse::<usize>()
                    .map(Reply::Count)
                    .map_err(|_| BackendError::Protocol(format!("invalid LED count {value:?}")))
            }
            CompanionCommand::Lock | CompanionCommand::Unlock => {
                Ok(Reply::Ack(reply_value(payload)? == LOCK_SUCCESS))
            }
            CompanionCommand::Profiles => Ok(Reply::List(
                reply_value(payload)?
                    .split(';')
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect(),
            )),
            CompanionCommand::Profile | CompanionCommand::Status | CompanionCommand::ApiStatus => {
                Ok(Reply::Value(reply_value(payload)?.to_string()))
            }
            _ => Ok(Reply::Ack(payload == REPLY_OK)),
        }
    }
}
