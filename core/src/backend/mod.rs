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

pub mod companion;
pub mod direct;
pub mod proxy;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::definitions::{BackendKind, LedColor, Rgb};
use crate::errors::BackendError;
use crate::protocol::Notification;

pub use companion::{CompanionBackend, CompanionConfig};
pub use direct::{DirectBackend, LedDevice};
pub use proxy::ProxyBackend;

/// Events a backend raises on its own, outside of any command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendEvent {
    /// The connection dropped without being asked to.
    ConnectionLost,
    /// A proxy peer became the active peer.
    PeerAttached,
    /// The last proxy peer went away.
    PeerDetached,
    Notification(Notification),
}

/// Per-call overrides of how a backend reaches its device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectOptions {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub apikey: Option<String>,
    pub led_map: Option<Vec<usize>>,
}

/// One way of driving the LED device. The arbiter holds one instance per kind and
/// reuses it across reconnects.
#[async_trait]
pub trait DeviceBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Apply connection overrides. They take effect on the next `connect`.
    fn configure(&self, _options: &ConnectOptions) {}

    fn subscribe(&self) -> Option<broadcast::Receiver<BackendEvent>> {
        None
    }

    /// Whether the link established by the last successful `connect` is still up.
    fn is_connected(&self) -> bool;

    async fn connect(&self) -> Result<(), BackendError>;

    async fn disconnect(&self);

    async fn led_count(&self) -> Result<usize, BackendError>;

    async fn set_color(&self, index: usize, color: Rgb) -> Result<(), BackendError>;

    async fn set_color_to_all(&self, color: Rgb) -> Result<(), BackendError>;

    async fn set_colors(&self, colors: &[LedColor]) -> Result<(), BackendError>;

    async fn set_brightness(&self, value: u8) -> Result<(), BackendError>;

    async fn set_gamma(&self, value: f64) -> Result<(), BackendError>;

    async fn set_smooth(&self, value: u8) -> Result<(), BackendError>;

    async fn turn_on(&self) -> Result<(), BackendError>;

    async fn turn_off(&self) -> Result<(), BackendError>;
}

/// The proxy backend additionally owns a listening socket whose port can be moved.
#[async_trait]
pub trait ProxyControl: DeviceBackend {
    fn as_backend(&self) -> &dyn DeviceBackend;

    fn is_peer_attached(&self) -> bool;

    async fn set_port(&self, port: u16) -> Result<(), BackendError>;
}
