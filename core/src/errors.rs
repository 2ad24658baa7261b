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

use std::io;
use thiserror::Error;

use crate::definitions::BackendKind;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Not connected")]
    NotConnected,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Device rejected the command")]
    Rejected,

    #[error("Device is not available")]
    Unavailable,

    #[error("Authentication with API key failed")]
    AuthFailed,

    #[error("Could not acquire the device lock")]
    LockRefused,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),
}

impl BackendError {
    /// Whether this failure means the authoritative backend has silently died and the
    /// arbiter has to pick one again.
    pub fn triggers_rearbitration(&self) -> bool {
        matches!(
            self,
            BackendError::NotConnected | BackendError::Transport(_) | BackendError::Rejected
        )
    }
}

impl From<io::Error> for BackendError {
    fn from(error: io::Error) -> Self {
        BackendError::Transport(error.to_string())
    }
}

/// Errors returned through the control handle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    #[error("{kind} backend failed: {source}")]
    Backend {
        kind: BackendKind,
        #[source]
        source: BackendError,
    },

    #[error("No backend could be connected")]
    NoBackend,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Arbiter is not running")]
    Stopped,
}

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed settings: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Invalid setting {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}
