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

mod cli;
mod device;
mod logger;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use log::{debug, error, info, warn};
use tokio::sync::broadcast::error::RecvError;

use lightbridge_core::settings::{default_settings_path, SettingsStore};
use lightbridge_core::{
    Arbiter, Backends, CompanionBackend, DeviceBackend, DirectBackend, JsonFileSettingsStore,
    LightEvent, LightHandle, ProxyBackend, Settings,
};

use crate::cli::{Cli, Commands};
use crate::device::UnlinkedDevice;
use crate::logger::init_logger;

fn load_settings(cli: &Cli) -> anyhow::Result<(Arc<JsonFileSettingsStore>, Settings)> {
    let path = cli.settings.clone().unwrap_or_else(default_settings_path);
    let store = Arc::new(JsonFileSettingsStore::new(path));
    let mut settings = store
        .load()
        .with_context(|| format!("Loading settings from {}", store.path().display()))?;
    cli.apply_overrides(&mut settings);
    settings.validate().context("Invalid command line overrides")?;
    Ok((store, settings))
}

async fn log_light_events(handle: LightHandle) {
    let mut events = handle.subscribe();
    loop {
        match events.recv().await {
            Ok(LightEvent::Connected) => {
                info!("Light connected through {:?} with {} LEDs", handle.authority(), handle.led_count())
            }
            Ok(event) => info!("Light event: {:?}", event),
            Err(RecvError::Lagged(n)) => warn!("Missed {} light events", n),
            Err(RecvError::Closed) => break,
        }
    }
}

async fn run(store: Arc<JsonFileSettingsStore>, settings: Settings) -> anyhow::Result<()> {
    let proxy = Arc::new(
        ProxyBackend::bind(&settings.host, settings.port, settings.frame_style)
            .await
            .with_context(|| format!("Binding proxy socket server to {}:{}", settings.host, settings.port))?,
    );
    let companion = Arc::new(CompanionBackend::new(settings.companion.clone()));
    let direct = Arc::new(DirectBackend::new(UnlinkedDevice));
    let backends = Backends { direct, companion, proxy: proxy.clone() };

    let (arbiter, handle) = Arbiter::with_settings(backends, store, settings);
    let arbiter_service = arbiter.run();
    tokio::spawn(log_light_events(handle.clone()));

    if let Err(e) = handle.connect(None).await {
        // the idle ping and an attaching proxy peer keep trying
        warn!("Initial connect failed: {}", e);
    }

    debug!("Press Ctrl+C to exit");
    tokio::signal::ctrl_c().await.context("Listening for Ctrl+C")?;
    info!("Received Ctrl+C signal, exiting...");

    if let Err(e) = arbiter_service.shutdown().await {
        error!("Error shutting down arbiter: {}", e);
    }
    proxy.shutdown().await;
    Ok(())
}

async fn list_profiles(settings: Settings) -> anyhow::Result<()> {
    let companion = CompanionBackend::new(settings.companion.clone());
    companion.connect().await.with_context(|| {
        format!("Connecting to companion app at {}:{}", settings.companion.host, settings.companion.port)
    })?;
    let profiles = companion.profiles().await;
    let current = companion.profile().await.ok();
    companion.disconnect().await;
    for profile in profiles? {
        let marker = if current.as_deref() == Some(profile.as_str()) { "*" } else { " " };
        println!("{marker} {profile}");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if let Err(e) = init_logger(cli.log_file.as_deref(), cli.log_level) {
        eprintln!("Failed to initialize logger: {}", e);
    }

    let (store, settings) = load_settings(&cli)?;
    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            info!("Settings: {}", store.path().display());
            run(store, settings).await
        }
        Commands::Settings => {
            println!("{}", serde_json::to_string_pretty(&settings)?);
            Ok(())
        }
        Commands::Profiles => list_profiles(settings).await,
    }
}
