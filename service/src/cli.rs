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

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use log::LevelFilter;

use lightbridge_core::{ArbitrationPolicy, Settings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn to_level_filter(self) -> LevelFilter {
        match self {
            LogLevel::Trace => LevelFilter::Trace,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Error => LevelFilter::Error,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Policy {
    /// A proxy peer always takes over
    ProxyPreempts,
    /// A proxy peer is used only when nothing else is connected
    FirstConnected,
}

impl From<Policy> for ArbitrationPolicy {
    fn from(policy: Policy) -> Self {
        match policy {
            Policy::ProxyPreempts => ArbitrationPolicy::ProxyPreempts,
            Policy::FirstConnected => ArbitrationPolicy::FirstConnected,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Set the log level
    #[arg(short, long, value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    /// Also write the log to this file
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Settings file; defaults to $LIGHTBRIDGE_SETTINGS or the user config directory
    #[arg(short, long)]
    pub settings: Option<PathBuf>,

    /// Port of the proxy socket server
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Address of the companion application's API server
    #[arg(long)]
    pub companion_host: Option<String>,

    #[arg(long)]
    pub companion_port: Option<u16>,

    /// API key expected by the companion application
    #[arg(long)]
    pub apikey: Option<String>,

    #[arg(long, value_enum)]
    pub policy: Option<Policy>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commands {
    /// Run the service until Ctrl+C (default)
    Run,
    /// Print the effective settings as JSON
    Settings,
    /// List the profiles of the companion application
    Profiles,
}

impl Cli {
    /// Settings from the file with command line overrides on top. Not persisted.
    pub fn apply_overrides(&self, settings: &mut Settings) {
        if let Some(port) = self.port {
            settings.port = port;
        }
        if let Some(host) = &self.companion_host {
            settings.companion.host = host.clone();
        }
        if let Some(port) = self.companion_port {
            settings.companion.port = port;
        }
        if let Some(apikey) = &self.apikey {
            settings.companion.apikey = apikey.clone();
        }
        if let Some(policy) = self.policy {
            settings.policy = policy.into();
        }
    }
}
