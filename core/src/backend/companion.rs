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

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::timeout;

use crate::backend::{BackendEvent, ConnectOptions, DeviceBackend};
use crate::connection::LineLink;
use crate::definitions::{BackendKind, LedColor, Rgb};
use crate::errors::BackendError;
use crate::protocol::CompanionCommand;
use crate::queue::Reply;

pub const DEFAULT_COMPANION_HOST: &str = "127.0.0.1";
pub const DEFAULT_COMPANION_PORT: u16 = 3636;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 2000;
/// Key the companion application ships with.
pub const DEFAULT_COMPANION_APIKEY: &str = "{15b3fc7b-5495-43e0-801f-93fe73742962}";

/// Where the companion application's API server lives and how to talk to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompanionConfig {
    pub host: String,
    pub port: u16,
    /// Sent right after connecting; an empty key skips the exchange.
    pub apikey: String,
    /// Companion LED ids (1-based) for the first LEDs; the rest map to `index + 1`.
    pub led_map: Vec<usize>,
    pub connect_timeout_ms: u64,
}

impl Default for CompanionConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_COMPANION_HOST.to_string(),
            port: DEFAULT_COMPANION_PORT,
            apikey: DEFAULT_COMPANION_APIKEY.to_string(),
            led_map: Vec::new(),
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
        }
    }
}

impl CompanionConfig {
    pub fn apply(&mut self, options: &ConnectOptions) {
        if let Some(host) = &options.host {
            self.host = host.clone();
        }
        if let Some(port) = options.port {
            self.port = port;
        }
        if let Some(apikey) = &options.apikey {
            self.apikey = apikey.clone();
        }
        if let Some(led_map) = &options.led_map {
            self.led_map = led_map.clone();
        }
    }
}

/// Index `i` of the strip is companion LED `map[i]`.
fn build_led_map(configured: &[usize], count: usize) -> Vec<usize> {
    (0..count)
        .map(|index| configured.get(index).copied().unwrap_or(index + 1))
        .collect()
}

struct Session {
    link: Arc<LineLink<CompanionCommand>>,
    led_map: Vec<usize>,
}

/// Client of the companion application's text API.
pub struct CompanionBackend {
    config: Mutex<CompanionConfig>,
    session: Mutex<Option<Session>>,
    events: broadcast::Sender<BackendEvent>,
}

impl CompanionBackend {
    pub fn new(config: CompanionConfig) -> Self {
        let (events, _) = broadcast::channel(16);
        Self { config: Mutex::new(config), session: Mutex::new(None), events }
    }

    pub fn config(&self) -> CompanionConfig {
        self.config.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn link(&self) -> Result<Arc<LineLink<CompanionCommand>>, BackendError> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|session| session.link.clone())
            .ok_or(BackendError::NotConnected)
    }

    fn led_map(&self) -> Vec<usize> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|session| session.led_map.clone())
            .unwrap_or_default()
    }

    async fn request(&self, command: CompanionCommand) -> Result<Reply, BackendError> {
        self.link()?.request(command).await
    }

    async fn open_session(&self, config: &CompanionConfig) -> Result<(), BackendError> {
        if config.host.trim().is_empty() || config.port == 0 {
            return Err(BackendError::InvalidArgument(format!(
                "companion address {}:{}",
                config.host, config.port
            )));
        }
        let connect_timeout = Duration::from_millis(config.connect_timeout_ms);
        let stream = timeout(connect_timeout, TcpStream::connect((config.host.as_str(), config.port)))
            .await
            .map_err(|_| BackendError::Transport("connect timed out".to_string()))??;
        let _ = stream.set_nodelay(true);

        let events = self.events.clone();
        let link = LineLink::spawn(stream, move || {
            warn!("Connection to companion app lost");
            let _ = events.send(BackendEvent::ConnectionLost);
        });
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(Session { link: Arc::new(link), led_map: Vec::new() });
        debug!("Connected to companion app at {}:{}", config.host, config.port);

        if !config.apikey.is_empty() {
            match self.request(CompanionCommand::ApiKey(config.apikey.clone())).await?.into_ack() {
                Ok(()) => {}
                Err(BackendError::Rejected) => return Err(BackendError::AuthFailed),
                Err(e) => return Err(e),
            }
        }

        let count = self.request(CompanionCommand::CountLeds).await?.into_count()?;
        if let Some(session) = self.session.lock().unwrap_or_else(PoisonError::into_inner).as_mut() {
            session.led_map = build_led_map(&config.led_map, count);
        }
        Ok(())
    }

    async fn close_session(&self) {
        let session = self.session.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(session) = session {
            match Arc::try_unwrap(session.link) {
                Ok(link) => link.close().await,
                // a request still holds the link; its task stops once every handle is gone
                Err(_) => debug!("Companion link still in use while closing"),
            }
        }
    }

    pub async fn lock(&self) -> Result<(), BackendError> {
        match self.request(CompanionCommand::Lock).await?.into_ack() {
            Err(BackendError::Rejected) => Err(BackendError::LockRefused),
            other => other,
        }
    }

    pub async fn unlock(&self) -> Result<(), BackendError> {
        self.request(CompanionCommand::Unlock).await?.into_ack()
    }

    pub async fn profiles(&self) -> Result<Vec<String>, BackendError> {
        self.request(CompanionCommand::Profiles).await?.into_list()
    }

    pub async fn profile(&self) -> Result<String, BackendError> {
        self.request(CompanionCommand::Profile).await?.into_value()
    }

    pub async fn set_profile(&self, name: &str) -> Result<(), BackendError> {
        self.request(CompanionCommand::SetProfile(name.to_string())).await?.into_ack()
    }

    pub async fn status(&self) -> Result<String, BackendError> {
        self.request(CompanionCommand::Status).await?.into_value()
    }

    pub async fn api_status(&self) -> Result<String, BackendError> {
        self.request(CompanionCommand::ApiStatus).await?.into_value()
    }

    async fn send_colors(&self, entries: Vec<(usize, Rgb)>) -> Result<(), BackendError> {
        self.request(CompanionCommand::SetColors(entries)).await?.into_ack()
    }
}

#[async_trait]
impl DeviceBackend for CompanionBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Companion
    }

    fn configure(&self, options: &ConnectOptions) {
        self.config.lock().unwrap_or_else(PoisonError::into_inner).apply(options);
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<BackendEvent>> {
        Some(self.events.subscribe())
    }

    fn is_connected(&self) -> bool {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|session| session.link.is_open())
    }

    async fn connect(&self) -> Result<(), BackendError> {
        if self.is_connected() {
            return Ok(());
        }
        // drop a session whose socket died underneath us
        self.close_session().await;

        let config = self.config();
        if let Err(e) = self.open_session(&config).await {
            self.close_session().await;
            return Err(e);
        }
        if let Err(e) = self.lock().await {
            warn!("Companion app refused the lock: {}", e);
            let _ = self.unlock().await;
            self.close_session().await;
            return Err(e);
        }
        info!("Companion app at {}:{} locked", config.host, config.port);
        Ok(())
    }

    async fn disconnect(&self) {
        if self.link().is_err() {
            return;
        }
        if let Err(e) = self.unlock().await {
            debug!("Unlock before disconnect failed: {}", e);
        }
        self.close_session().await;
        info!("Disconnected from companion app");
    }

    async fn led_count(&self) -> Result<usize, BackendError> {
        self.link()?;
        Ok(self.led_map().len())
    }

    async fn set_color(&self, index: usize, color: Rgb) -> Result<(), BackendError> {
        let led_map = self.led_map();
        let id = *led_map.get(index).ok_or_else(|| {
            BackendError::InvalidArgument(format!("LED {index} out of range 0..{}", led_map.len()))
        })?;
        self.send_colors(vec![(id, color)]).await
    }

    async fn set_color_to_all(&self, color: Rgb) -> Result<(), BackendError> {
        let led_map = self.led_map();
        if led_map.is_empty() {
            return Err(BackendError::InvalidArgument("no LEDs to color".to_string()));
        }
        self.send_colors(led_map.into_iter().map(|id| (id, color)).collect()).await
    }

    async fn set_colors(&self, colors: &[LedColor]) -> Result<(), BackendError> {
        if colors.is_empty() {
            return Err(BackendError::InvalidArgument("empty color list".to_string()));
        }
        let entries: Vec<(usize, Rgb)> = self
            .led_map()
            .into_iter()
            .zip(colors)
            .filter_map(|(id, entry)| entry.color().map(|color| (id, color)))
            .collect();
        if entries.is_empty() {
            return Ok(());
        }
        self.send_colors(entries).await
    }

    async fn set_brightness(&self, value: u8) -> Result<(), BackendError> {
        self.request(CompanionCommand::SetBrightness(value)).await?.into_ack()
    }

    async fn set_gamma(&self, value: f64) -> Result<(), BackendError> {
        self.request(CompanionCommand::SetGamma(value)).await?.into_ack()
    }

    async fn set_smooth(&self, value: u8) -> Result<(), BackendError> {
        self.request(CompanionCommand::SetSmooth(value)).await?.into_ack()
    }

    async fn turn_on(&self) -> Result<(), BackendError> {
        self.request(CompanionCommand::SetStatus(true)).await?.into_ack()
    }

    async fn turn_off(&self) -> Result<(), BackendError> {
        self.request(CompanionCommand::SetStatus(false)).await?.into_ack()
    }
}
