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

//! Backend arbitration.
//!
//! A single task owns the choice of the authoritative backend. Requests from
//! [`LightHandle`]s and events raised by the backends are handled one at a time, so a
//! connect sequence never overlaps another one or a device command.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::select;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{interval_at, sleep, Instant, Interval, MissedTickBehavior};

use crate::backend::{BackendEvent, ConnectOptions, DeviceBackend, ProxyControl};
use crate::definitions::{
    ArbitrationPolicy, Authority, BackendKind, LedColor, LightEvent, Rgb, MAX_BRIGHTNESS, MAX_GAMMA,
};
use crate::errors::{BackendError, ControlError, SettingsError};
use crate::protocol::Notification;
use crate::resync::resynchronize;
use crate::service::{spawn_service, ServiceHandle, StopHandle};
use crate::settings::{Settings, SettingsStore};
use crate::state_cache::LogicalState;

const REQUEST_BUFFER: usize = 32;
const EVENT_BUFFER: usize = 32;

/// The three backends, created once and reused across reconnects.
pub struct Backends {
    pub direct: Arc<dyn DeviceBackend>,
    pub companion: Arc<dyn DeviceBackend>,
    pub proxy: Arc<dyn ProxyControl>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArbiterConfig {
    pub policy: ArbitrationPolicy,
    pub retry: RetryPolicy,
    pub ping_interval: Option<Duration>,
}

impl From<&Settings> for ArbiterConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            policy: settings.policy,
            retry: RetryPolicy {
                attempts: settings.retry.attempts.max(1),
                delay: Duration::from_millis(settings.retry.delay_ms),
            },
            ping_interval: settings.ping_interval_ms.map(Duration::from_millis),
        }
    }
}

/// What the arbiter currently believes, published after every change.
#[derive(Debug, Clone, PartialEq)]
pub struct ArbiterSnapshot {
    pub authority: Authority,
    /// The authoritative backend was resynchronized and accepts commands.
    pub connected: bool,
    /// A connect sequence is running.
    pub connecting: bool,
    pub peer_attached: bool,
    pub state: LogicalState,
}

/// Device commands routed to the authoritative backend.
#[derive(Debug, Clone, PartialEq)]
enum DeviceCommand {
    SetColor { index: usize, color: Rgb },
    SetColorToAll(Rgb),
    SetColors(Vec<LedColor>),
    SetBrightness(u8),
    SetGamma(f64),
    SetSmooth(u8),
    TurnOn,
    TurnOff,
}

impl DeviceCommand {
    fn validate(&self) -> Result<(), ControlError> {
        match self {
            DeviceCommand::SetColors(colors) if colors.is_empty() => {
                Err(ControlError::InvalidArgument("empty color list".to_string()))
            }
            DeviceCommand::SetBrightness(value) if *value > MAX_BRIGHTNESS => Err(
                ControlError::InvalidArgument(format!("brightness {value} exceeds {MAX_BRIGHTNESS}")),
            ),
            DeviceCommand::SetGamma(value)
                if !value.is_finite() || !(0.0..=MAX_GAMMA).contains(value) =>
            {
                Err(ControlError::InvalidArgument(format!("gamma {value} outside 0..={MAX_GAMMA}")))
            }
            _ => Ok(()),
        }
    }

    async fn apply(&self, backend: &dyn DeviceBackend) -> Result<(), BackendError> {
        match self {
            DeviceCommand::SetColor { index, color } => backend.set_color(*index, *color).await,
            DeviceCommand::SetColorToAll(color) => backend.set_color_to_all(*color).await,
            DeviceCommand::SetColors(colors) => backend.set_colors(colors).await,
            DeviceCommand::SetBrightness(value) => backend.set_brightness(*value).await,
            DeviceCommand::SetGamma(value) => backend.set_gamma(*value).await,
            DeviceCommand::SetSmooth(value) => backend.set_smooth(*value).await,
            DeviceCommand::TurnOn => backend.turn_on().await,
            DeviceCommand::TurnOff => backend.turn_off().await,
        }
    }

    /// Update the cache after the backend confirmed the command.
    fn record(&self, state: &mut LogicalState) {
        match self {
            DeviceCommand::SetColor { index, color } => {
                state.record_color(*index, *color);
            }
            DeviceCommand::SetColorToAll(color) => state.record_color_to_all(*color),
            DeviceCommand::SetColors(colors) => state.record_colors(colors),
            DeviceCommand::SetBrightness(value) => state.brightness = *value,
            DeviceCommand::SetGamma(value) => state.gamma = *value,
            DeviceCommand::SetSmooth(value) => state.smooth = *value,
            DeviceCommand::TurnOn | DeviceCommand::TurnOff => {}
        }
    }

    /// Copy the persisted part of the command into `settings`. Returns `false` when
    /// nothing in it is persisted.
    fn write_back(&self, settings: &mut Settings) -> bool {
        match self {
            DeviceCommand::SetBrightness(value) => settings.brightness = *value,
            DeviceCommand::SetGamma(value) => settings.gamma = *value,
            DeviceCommand::SetSmooth(value) => settings.smooth = *value,
            _ => return false,
        }
        true
    }
}

enum Operation {
    Connect(Option<ConnectOptions>),
    Disconnect,
    Device(DeviceCommand),
    SetPort(u16),
}

struct Request {
    operation: Operation,
    reply: oneshot::Sender<Result<(), ControlError>>,
}

/// Cloneable control surface of a running [`Arbiter`].
#[derive(Clone)]
pub struct LightHandle {
    requests: mpsc::Sender<Request>,
    events: broadcast::Sender<LightEvent>,
    snapshot: watch::Receiver<ArbiterSnapshot>,
}

impl LightHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<LightEvent> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> ArbiterSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Receiver that is notified on every published snapshot.
    pub fn watch(&self) -> watch::Receiver<ArbiterSnapshot> {
        self.snapshot.clone()
    }

    pub fn state(&self) -> LogicalState {
        self.snapshot.borrow().state.clone()
    }

    pub fn authority(&self) -> Authority {
        self.snapshot.borrow().authority
    }

    pub fn is_connected(&self) -> bool {
        self.snapshot.borrow().connected
    }

    pub fn led_count(&self) -> usize {
        self.snapshot.borrow().state.led_count
    }

    /// Run the connect sequence unless a backend is already connected. Options are applied
    /// to the companion backend before it is tried.
    pub async fn connect(&self, options: Option<ConnectOptions>) -> Result<(), ControlError> {
        self.call(Operation::Connect(options)).await
    }

    pub async fn disconnect(&self) -> Result<(), ControlError> {
        self.call(Operation::Disconnect).await
    }

    pub async fn set_color(&self, index: usize, color: Rgb) -> Result<(), ControlError> {
        self.device(DeviceCommand::SetColor { index, color }).await
    }

    pub async fn set_color_to_all(&self, color: Rgb) -> Result<(), ControlError> {
        self.device(DeviceCommand::SetColorToAll(color)).await
    }

    pub async fn set_colors(&self, colors: Vec<LedColor>) -> Result<(), ControlError> {
        self.device(DeviceCommand::SetColors(colors)).await
    }

    pub async fn set_brightness(&self, value: u8) -> Result<(), ControlError> {
        self.device(DeviceCommand::SetBrightness(value)).await
    }

    pub async fn set_gamma(&self, value: f64) -> Result<(), ControlError> {
        self.device(DeviceCommand::SetGamma(value)).await
    }

    pub async fn set_smooth(&self, value: u8) -> Result<(), ControlError> {
        self.device(DeviceCommand::SetSmooth(value)).await
    }

    pub async fn turn_on(&self) -> Result<(), ControlError> {
        self.device(DeviceCommand::TurnOn).await
    }

    pub async fn turn_off(&self) -> Result<(), ControlError> {
        self.device(DeviceCommand::TurnOff).await
    }

    /// Move the proxy listener to `port` and persist it.
    pub async fn set_port(&self, port: u16) -> Result<(), ControlError> {
        self.call(Operation::SetPort(port)).await
    }

    async fn device(&self, command: DeviceCommand) -> Result<(), ControlError> {
        self.call(Operation::Device(command)).await
    }

    async fn call(&self, operation: Operation) -> Result<(), ControlError> {
        let (reply, reply_rx) = oneshot::channel();
        self.requests
            .send(Request { operation, reply })
            .await
            .map_err(|_| ControlError::Stopped)?;
        reply_rx.await.map_err(|_| ControlError::Stopped)?
    }
}

pub struct Arbiter {
    backends: Backends,
    config: ArbiterConfig,
    store: Arc<dyn SettingsStore>,
    settings: Settings,
    state: LogicalState,
    authority: Authority,
    connected: bool,
    connecting: bool,
    peer_attached: bool,
    /// A `Disconnected` went out and no `Connected` followed yet.
    disconnect_announced: bool,
    requests: mpsc::Receiver<Request>,
    events: broadcast::Sender<LightEvent>,
    snapshot: watch::Sender<ArbiterSnapshot>,
}

impl Arbiter {
    /// Build an arbiter from the settings in `store`.
    pub fn new(
        backends: Backends,
        store: Arc<dyn SettingsStore>,
    ) -> Result<(Self, LightHandle), SettingsError> {
        let settings = store.load()?;
        settings.validate()?;
        Ok(Self::with_settings(backends, store, settings))
    }

    pub fn with_settings(
        backends: Backends,
        store: Arc<dyn SettingsStore>,
        settings: Settings,
    ) -> (Self, LightHandle) {
        let config = ArbiterConfig::from(&settings);
        let state = LogicalState::new(settings.brightness, settings.gamma, settings.smooth);
        let (requests_tx, requests) = mpsc::channel(REQUEST_BUFFER);
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let initial = ArbiterSnapshot {
            authority: Authority::Idle,
            connected: false,
            connecting: false,
            peer_attached: false,
            state: state.clone(),
        };
        let (snapshot, snapshot_rx) = watch::channel(initial);
        let handle = LightHandle { requests: requests_tx, events: events.clone(), snapshot: snapshot_rx };
        let arbiter = Self {
            backends,
            config,
            store,
            settings,
            state,
            authority: Authority::Idle,
            connected: false,
            connecting: false,
            peer_attached: false,
            disconnect_announced: false,
            requests,
            events,
            snapshot,
        };
        (arbiter, handle)
    }

    /// Spawn the arbiter loop in the background.
    pub fn run(self) -> ServiceHandle {
        spawn_service(move |stop| self.event_loop(stop))
    }

    async fn event_loop(mut self, mut stop: StopHandle) {
        let mut proxy_events = self.backends.proxy.subscribe();
        let mut companion_events = self.backends.companion.subscribe();
        let mut direct_events = self.backends.direct.subscribe();
        // a peer may have attached before we subscribed
        self.peer_attached = self.backends.proxy.is_peer_attached();
        self.publish();
        let mut ping = self.config.ping_interval.map(|period| {
            let mut ping = interval_at(Instant::now() + period, period);
            ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ping
        });

        loop {
            select! {
                biased;
                _ = stop.signaled() => {
                    info!("Arbiter shutdown requested");
                    break;
                }
                event = next_event(&mut proxy_events) => {
                    self.on_backend_event(BackendKind::Proxy, event).await;
                }
                event = next_event(&mut companion_events) => {
                    self.on_backend_event(BackendKind::Companion, event).await;
                }
                event = next_event(&mut direct_events) => {
                    self.on_backend_event(BackendKind::Direct, event).await;
                }
                request = self.requests.recv() => match request {
                    Some(request) => self.on_request(request).await,
                    None => {
                        info!("All light handles dropped; stopping arbiter");
                        break;
                    }
                },
                _ = tick(&mut ping) => self.on_ping().await,
            }
        }
        self.release().await;
        self.connected = false;
        self.publish();
    }

    fn backend(&self, kind: BackendKind) -> &dyn DeviceBackend {
        match kind {
            BackendKind::Direct => self.backends.direct.as_ref(),
            BackendKind::Companion => self.backends.companion.as_ref(),
            BackendKind::Proxy => self.backends.proxy.as_backend(),
        }
    }

    fn publish(&self) {
        self.snapshot.send_replace(ArbiterSnapshot {
            authority: self.authority,
            connected: self.connected,
            connecting: self.connecting,
            peer_attached: self.peer_attached,
            state: self.state.clone(),
        });
    }

    fn notify(&self, event: LightEvent) {
        debug!("Light event: {:?}", event);
        let _ = self.events.send(event);
    }

    fn announce_disconnected(&mut self) {
        if !self.disconnect_announced {
            self.disconnect_announced = true;
            self.notify(LightEvent::Disconnected);
        }
    }

    async fn on_request(&mut self, request: Request) {
        let result = match request.operation {
            Operation::Connect(options) => {
                if let Some(options) = options {
                    self.configure(&options);
                }
                self.connect().await
            }
            Operation::Disconnect => {
                self.disconnect().await;
                Ok(())
            }
            Operation::Device(command) => self.run_device_command(command).await,
            Operation::SetPort(port) => self.set_port(port).await,
        };
        let _ = request.reply.send(result);
    }

    /// Hand connection overrides to the backends and remember the companion ones.
    fn configure(&mut self, options: &ConnectOptions) {
        self.backends.companion.configure(options);
        self.backends.direct.configure(options);
        let mut companion = self.settings.companion.clone();
        companion.apply(options);
        if companion != self.settings.companion {
            self.settings.companion = companion;
            self.persist(|stored| stored.companion.apply(options));
        }
    }

    /// Connect unless already connected; runs the full retrying sequence.
    async fn connect(&mut self) -> Result<(), ControlError> {
        if self.connected && self.authority != Authority::Idle {
            return Ok(());
        }
        self.connecting = true;
        self.publish();
        let result = self.connect_sequence().await;
        self.connecting = false;
        if result.is_err() {
            self.authority = if self.peer_attached { Authority::Proxy } else { Authority::Idle };
            self.connected = false;
            self.state.led_count = 0;
            warn!("No backend could be connected");
            self.announce_disconnected();
        }
        self.publish();
        result
    }

    async fn connect_sequence(&mut self) -> Result<(), ControlError> {
        let attempts = self.config.retry.attempts.max(1);
        for attempt in 1..=attempts {
            if attempt > 1 {
                sleep(self.config.retry.delay).await;
            }
            if self.try_candidates().await {
                return Ok(());
            }
            debug!("Connect attempt {}/{} failed", attempt, attempts);
        }
        Err(ControlError::NoBackend)
    }

    /// One pass over the candidates in priority order.
    async fn try_candidates(&mut self) -> bool {
        for kind in self.candidates() {
            if self.activate(kind).await {
                return true;
            }
        }
        false
    }

    fn candidates(&self) -> Vec<BackendKind> {
        if self.peer_attached {
            vec![BackendKind::Proxy]
        } else {
            vec![BackendKind::Direct, BackendKind::Companion]
        }
    }

    /// Connect `kind`, make it authoritative and replay the cached state onto it.
    async fn activate(&mut self, kind: BackendKind) -> bool {
        if let Err(e) = self.backend(kind).connect().await {
            debug!("The {} is not available: {}", kind, e);
            return false;
        }
        self.authority = kind.into();
        self.connected = false;
        if self.resync().await {
            return true;
        }
        if kind != BackendKind::Proxy {
            self.backend(kind).disconnect().await;
        }
        self.authority = Authority::Idle;
        false
    }

    /// Replay the cache onto the authoritative backend; emits `Connected` on success.
    async fn resync(&mut self) -> bool {
        let Some(kind) = self.authority.backend() else {
            return false;
        };
        let mut state = self.state.clone();
        match resynchronize(self.backend(kind), &mut state).await {
            Ok(_) => {
                self.state = state;
                self.connected = true;
                self.publish();
                info!("The {} is authoritative with {} LEDs", kind, self.state.led_count);
                self.disconnect_announced = false;
                self.notify(LightEvent::Connected);
                true
            }
            Err(e) => {
                warn!("The {} could not be resynchronized: {}", kind, e);
                self.connected = false;
                false
            }
        }
    }

    /// Let go of the authoritative backend.
    async fn release(&mut self) {
        if let Some(kind) = self.authority.backend() {
            if kind != BackendKind::Proxy {
                self.backend(kind).disconnect().await;
            }
            info!("Released the {}", kind);
        }
        self.authority = Authority::Idle;
    }

    async fn disconnect(&mut self) {
        let was_connected = self.connected;
        self.release().await;
        self.connected = false;
        self.state.led_count = 0;
        self.publish();
        if was_connected {
            self.announce_disconnected();
        }
    }

    /// The authoritative backend failed; drop it and pick one again.
    async fn rearbitrate(&mut self) {
        self.release().await;
        self.connected = false;
        self.publish();
        let _ = self.connect().await;
    }

    async fn run_device_command(&mut self, command: DeviceCommand) -> Result<(), ControlError> {
        command.validate()?;
        if !self.connected {
            self.connect().await?;
        }
        let Some(kind) = self.authority.backend() else {
            return Err(ControlError::NoBackend);
        };
        let result = command.apply(self.backend(kind)).await;
        match result {
            Ok(()) => {
                command.record(&mut self.state);
                if command.write_back(&mut self.settings) {
                    self.persist(|stored| {
                        command.write_back(stored);
                    });
                }
                self.publish();
                Ok(())
            }
            Err(source) => {
                if source.triggers_rearbitration() {
                    warn!("The {} failed a command ({}); re-arbitrating", kind, source);
                    self.rearbitrate().await;
                }
                Err(ControlError::Backend { kind, source })
            }
        }
    }

    async fn set_port(&mut self, port: u16) -> Result<(), ControlError> {
        if port == 0 {
            return Err(ControlError::InvalidArgument("port 0".to_string()));
        }
        self.backends
            .proxy
            .set_port(port)
            .await
            .map_err(|source| ControlError::Backend { kind: BackendKind::Proxy, source })?;
        self.settings.port = port;
        self.persist(|stored| stored.port = port);
        Ok(())
    }

    /// Apply `update` to what the store holds and save that. Overrides that only live in
    /// `self.settings` never reach the store.
    fn persist(&self, update: impl FnOnce(&mut Settings)) {
        let mut stored = match self.store.load() {
            Ok(stored) => stored,
            Err(e) => {
                warn!("Settings not saved, reading them back failed: {}", e);
                return;
            }
        };
        update(&mut stored);
        if let Err(e) = self.store.save(&stored) {
            warn!("Saving settings failed: {}", e);
        }
    }

    async fn on_ping(&mut self) {
        if self.authority != Authority::Idle || self.peer_attached || self.connected {
            return;
        }
        debug!("Idle; trying to reconnect");
        if self.try_candidates().await {
            self.publish();
        }
    }

    async fn on_backend_event(&mut self, kind: BackendKind, event: BackendEvent) {
        match (kind, event) {
            (BackendKind::Proxy, BackendEvent::PeerAttached) => self.on_peer_attached().await,
            (BackendKind::Proxy, BackendEvent::PeerDetached) => self.on_peer_detached().await,
            (BackendKind::Proxy, BackendEvent::Notification(notification)) => {
                self.on_notification(notification).await
            }
            (_, BackendEvent::ConnectionLost) => {
                if self.authority.backend() != Some(kind) {
                    debug!("Lost the {}, which is not authoritative", kind);
                } else if self.backend(kind).is_connected() {
                    // raised by a session that was already replaced
                    debug!("Ignoring a stale connection loss of the {}", kind);
                } else {
                    warn!("Lost the {}; falling back", kind);
                    self.authority = Authority::Idle;
                    self.connected = false;
                    self.publish();
                    let _ = self.connect().await;
                }
            }
            (kind, event) => debug!("Ignoring {:?} from the {}", event, kind),
        }
    }

    async fn on_peer_attached(&mut self) {
        self.peer_attached = true;
        let takes_over = match self.config.policy {
            ArbitrationPolicy::ProxyPreempts => true,
            ArbitrationPolicy::FirstConnected => {
                self.authority == Authority::Idle || self.authority == Authority::Proxy || !self.connected
            }
        };
        if !takes_over {
            info!("Proxy peer attached; keeping the current backend");
            self.publish();
            return;
        }
        if self.authority != Authority::Proxy {
            self.release().await;
        }
        self.authority = Authority::Proxy;
        self.connected = false;
        self.publish();
        match self.backends.proxy.connect().await {
            Ok(()) => {
                self.resync().await;
            }
            // the peer reports DeviceConnected once its device is ready
            Err(e) => debug!("Proxy peer device not ready: {}", e),
        }
        self.publish();
    }

    async fn on_peer_detached(&mut self) {
        self.peer_attached = false;
        if self.authority != Authority::Proxy {
            self.publish();
            return;
        }
        info!("Proxy peer detached; falling back");
        self.authority = Authority::Idle;
        self.connected = false;
        self.publish();
        let _ = self.connect().await;
    }

    async fn on_notification(&mut self, notification: Notification) {
        match notification {
            Notification::Playing => self.notify(LightEvent::Play),
            Notification::Paused => self.notify(LightEvent::Pause),
            Notification::DeviceConnected => {
                if self.authority == Authority::Proxy
                    || (self.authority == Authority::Idle && self.peer_attached)
                {
                    self.authority = Authority::Proxy;
                    self.resync().await;
                    self.publish();
                }
            }
            Notification::DeviceDisconnected => {
                if self.authority == Authority::Proxy && self.connected {
                    self.connected = false;
                    self.state.led_count = 0;
                    self.publish();
                    self.announce_disconnected();
                }
            }
            Notification::InvalidArguments => warn!("Proxy peer rejected the arguments of a command"),
        }
    }
}

async fn next_event(receiver: &mut Option<broadcast::Receiver<BackendEvent>>) -> BackendEvent {
    loop {
        let Some(rx) = receiver.as_mut() else {
            return std::future::pending().await;
        };
        let received = rx.recv().await;
        match received {
            Ok(event) => return event,
            Err(RecvError::Lagged(n)) => warn!("Backend events lagged by {} messages; catching up", n),
            Err(RecvError::Closed) => *receiver = None,
        }
    }
}

async fn tick(ping: &mut Option<Interval>) {
    match ping {
        Some(ping) => {
            ping.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{CompanionBackend, CompanionConfig, ProxyBackend};
    use crate::protocol::FrameStyle;
    use crate::settings::{JsonFileSettingsStore, MemorySettingsStore, RetrySettings};
    use crate::testing::{companion_replies, init_logging, FakeCompanion, Journal, MockBackend};
    use std::net::SocketAddr;
    use std::sync::Mutex;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpStream;
    use tokio::time::timeout;

    const GREEN: Rgb = Rgb::new(0, 255, 0);
    const RED: Rgb = Rgb::new(255, 0, 0);
    const WAIT: Duration = Duration::from_secs(2);

    struct Rig {
        journal: Journal,
        direct: Arc<MockBackend>,
        companion: Arc<MockBackend>,
        proxy: Arc<MockBackend>,
        store: Arc<MemorySettingsStore>,
        handle: LightHandle,
        service: ServiceHandle,
    }

    fn quick_settings() -> Settings {
        Settings {
            retry: RetrySettings { attempts: 2, delay_ms: 0 },
            ping_interval_ms: None,
            ..Default::default()
        }
    }

    fn rig(settings: Settings) -> Rig {
        init_logging();
        let journal = Journal::default();
        let direct = MockBackend::new(BackendKind::Direct, &journal, 10);
        let companion = MockBackend::new(BackendKind::Companion, &journal, 10);
        let proxy = MockBackend::new(BackendKind::Proxy, &journal, 10);
        let store = Arc::new(MemorySettingsStore::new(settings));
        let backends = Backends {
            direct: direct.clone(),
            companion: companion.clone(),
            proxy: proxy.clone(),
        };
        let (arbiter, handle) = Arbiter::new(backends, store.clone()).unwrap();
        let service = arbiter.run();
        Rig { journal, direct, companion, proxy, store, handle, service }
    }

    async fn wait_until(handle: &LightHandle, predicate: impl FnMut(&ArbiterSnapshot) -> bool) -> ArbiterSnapshot {
        let mut snapshots = handle.watch();
        let snapshot = timeout(WAIT, snapshots.wait_for(predicate)).await.unwrap().unwrap();
        snapshot.clone()
    }

    async fn next_light_event(events: &mut broadcast::Receiver<LightEvent>) -> LightEvent {
        timeout(WAIT, events.recv()).await.unwrap().unwrap()
    }

    /// Proxy peer that acknowledges everything and reports `led_count` LEDs.
    async fn answering_peer(addr: SocketAddr, led_count: usize) -> Arc<Mutex<Vec<String>>> {
        let stream = TcpStream::connect(addr).await.unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        tokio::spawn({
            let seen = seen.clone();
            async move {
                let (read_half, mut writer) = stream.into_split();
                let mut lines = BufReader::new(read_half).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    seen.lock().unwrap().push(line.clone());
                    let reply = if line == "0" { format!("0{led_count}") } else { "01".to_string() };
                    if writer.write_all(format!("{reply}\n").as_bytes()).await.is_err() {
                        break;
                    }
                }
            }
        });
        seen
    }

    fn position(entries: &[String], entry: &str) -> usize {
        entries.iter().position(|e| e == entry).unwrap_or_else(|| panic!("{entry} missing in {entries:?}"))
    }

    #[tokio::test]
    async fn connect_replays_settings_in_order_and_announces_it() {
        let rig = rig(quick_settings());
        let mut events = rig.handle.subscribe();

        rig.handle.connect(None).await.unwrap();

        assert_eq!(
            rig.journal.entries(),
            vec![
                "direct:connect",
                "direct:led_count",
                "direct:set_smooth(255)",
                "direct:set_gamma(2.2)",
                "direct:set_brightness(100)",
            ]
        );
        assert_eq!(next_light_event(&mut events).await, LightEvent::Connected);
        assert_eq!(rig.handle.authority(), Authority::Direct);
        assert!(rig.handle.is_connected());
        assert_eq!(rig.handle.led_count(), 10);

        // a second connect is a no-op
        rig.handle.connect(None).await.unwrap();
        assert_eq!(rig.journal.count("direct:connect"), 1);
        rig.service.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn unavailable_direct_device_falls_through_to_the_companion() {
        let rig = rig(quick_settings());
        rig.direct.set_connect_ok(false);

        rig.handle.connect(None).await.unwrap();

        assert_eq!(rig.handle.authority(), Authority::Companion);
        let entries = rig.journal.entries();
        assert!(position(&entries, "direct:connect") < position(&entries, "companion:connect"));
        assert_eq!(rig.journal.count("companion:led_count"), 1);
    }

    #[tokio::test]
    async fn failed_resync_releases_the_backend_and_tries_the_next() {
        let rig = rig(quick_settings());
        rig.direct.fail("set_gamma");

        rig.handle.connect(None).await.unwrap();

        assert_eq!(rig.handle.authority(), Authority::Companion);
        let entries = rig.journal.entries();
        assert!(position(&entries, "direct:set_gamma(2.2)") < position(&entries, "direct:disconnect"));
        assert!(position(&entries, "direct:disconnect") < position(&entries, "companion:connect"));
        assert_eq!(rig.journal.count("direct:set_brightness(100)"), 0);
    }

    #[tokio::test]
    async fn exhausted_retries_report_a_single_disconnect() {
        let rig = rig(Settings {
            retry: RetrySettings { attempts: 3, delay_ms: 1 },
            ..quick_settings()
        });
        rig.direct.set_connect_ok(false);
        rig.companion.set_connect_ok(false);
        let mut events = rig.handle.subscribe();

        assert_eq!(rig.handle.connect(None).await, Err(ControlError::NoBackend));

        assert_eq!(rig.journal.count("direct:connect"), 3);
        assert_eq!(rig.journal.count("companion:connect"), 3);
        assert_eq!(next_light_event(&mut events).await, LightEvent::Disconnected);
        assert!(events.try_recv().is_err());
        let snapshot = rig.handle.snapshot();
        assert_eq!(snapshot.authority, Authority::Idle);
        assert!(!snapshot.connected && !snapshot.connecting);
    }

    #[tokio::test]
    async fn commands_connect_on_demand() {
        let rig = rig(quick_settings());

        rig.handle.set_smooth(10).await.unwrap();

        let entries = rig.journal.entries();
        assert_eq!(entries.first().map(String::as_str), Some("direct:connect"));
        assert_eq!(entries.last().map(String::as_str), Some("direct:set_smooth(10)"));
        assert_eq!(rig.handle.state().smooth, 10);
    }

    #[tokio::test]
    async fn invalid_arguments_never_reach_a_backend() {
        let rig = rig(quick_settings());

        assert!(matches!(rig.handle.set_brightness(101).await, Err(ControlError::InvalidArgument(_))));
        assert!(matches!(rig.handle.set_gamma(f64::NAN).await, Err(ControlError::InvalidArgument(_))));
        assert!(matches!(rig.handle.set_gamma(10.5).await, Err(ControlError::InvalidArgument(_))));
        assert!(matches!(rig.handle.set_colors(Vec::new()).await, Err(ControlError::InvalidArgument(_))));
        assert!(rig.journal.entries().is_empty());
    }

    #[tokio::test]
    async fn confirmed_settings_are_cached_and_persisted() {
        let rig = rig(quick_settings());
        rig.handle.connect(None).await.unwrap();

        rig.handle.set_brightness(40).await.unwrap();
        rig.handle.set_gamma(1.8).await.unwrap();

        assert_eq!(rig.handle.state().brightness, 40);
        let saved = rig.store.current();
        assert_eq!(saved.brightness, 40);
        assert_eq!(saved.gamma, 1.8);
        assert_eq!(rig.store.save_count(), 2);

        // colors are cached but not persisted
        rig.handle.set_color(2, RED).await.unwrap();
        assert_eq!(rig.handle.state().color(2), Some(RED));
        assert_eq!(rig.store.save_count(), 2);
    }

    #[tokio::test]
    async fn rejected_command_switches_to_another_backend() {
        let rig = rig(quick_settings());
        rig.handle.connect(None).await.unwrap();
        rig.direct.fail("set_color_to_all");
        rig.direct.set_connect_ok(false);

        let result = rig.handle.set_color_to_all(GREEN).await;

        assert_eq!(
            result,
            Err(ControlError::Backend { kind: BackendKind::Direct, source: BackendError::Rejected })
        );
        assert_eq!(rig.handle.authority(), Authority::Companion);
        assert!(rig.handle.is_connected());
        let entries = rig.journal.entries();
        assert!(position(&entries, "direct:disconnect") < position(&entries, "companion:connect"));
        // the failed command is not cached
        assert_eq!(rig.handle.state().color(0), None);
    }

    #[tokio::test]
    async fn attaching_proxy_peer_preempts_and_receives_cached_colors() {
        let rig = rig(quick_settings());
        rig.handle.connect(None).await.unwrap();
        rig.handle.set_color_to_all(GREEN).await.unwrap();
        rig.handle.set_color(3, RED).await.unwrap();

        rig.proxy.emit(BackendEvent::PeerAttached);
        let snapshot = wait_until(&rig.handle, |s| s.authority == Authority::Proxy && s.connected).await;

        assert!(snapshot.peer_attached);
        let entries = rig.journal.entries();
        assert!(position(&entries, "direct:disconnect") < position(&entries, "proxy:connect"));
        let expected = (0..10)
            .map(|index| if index == 3 { RED.to_string() } else { GREEN.to_string() })
            .collect::<Vec<_>>()
            .join(";");
        assert_eq!(entries.last(), Some(&format!("proxy:set_colors({expected})")));
    }

    #[tokio::test]
    async fn first_connected_policy_keeps_the_current_backend() {
        let rig = rig(Settings { policy: ArbitrationPolicy::FirstConnected, ..quick_settings() });
        rig.handle.connect(None).await.unwrap();

        rig.proxy.emit(BackendEvent::PeerAttached);
        let snapshot = wait_until(&rig.handle, |s| s.peer_attached).await;

        assert_eq!(snapshot.authority, Authority::Direct);
        assert_eq!(rig.journal.count("proxy:connect"), 0);
        assert_eq!(rig.journal.count("direct:disconnect"), 0);
    }

    #[tokio::test]
    async fn detached_peer_falls_back_to_local_backends() {
        let rig = rig(quick_settings());
        rig.handle.connect(None).await.unwrap();
        rig.proxy.emit(BackendEvent::PeerAttached);
        wait_until(&rig.handle, |s| s.authority == Authority::Proxy && s.connected).await;

        rig.proxy.emit(BackendEvent::PeerDetached);
        let snapshot = wait_until(&rig.handle, |s| s.authority == Authority::Direct && s.connected).await;

        assert!(!snapshot.peer_attached);
        assert_eq!(rig.journal.count("direct:connect"), 2);
    }

    #[tokio::test]
    async fn peer_device_notifications_drive_the_connection_state() {
        let rig = rig(quick_settings());
        rig.direct.set_connect_ok(false);
        rig.companion.set_connect_ok(false);
        rig.proxy.set_connect_ok(false);
        rig.handle.connect(None).await.unwrap_err();
        let mut events = rig.handle.subscribe();

        rig.proxy.emit(BackendEvent::PeerAttached);
        wait_until(&rig.handle, |s| s.authority == Authority::Proxy && s.peer_attached).await;
        assert!(!rig.handle.is_connected());

        rig.proxy.emit(BackendEvent::Notification(Notification::DeviceConnected));
        assert_eq!(next_light_event(&mut events).await, LightEvent::Connected);
        assert!(rig.handle.is_connected());

        rig.proxy.emit(BackendEvent::Notification(Notification::DeviceDisconnected));
        assert_eq!(next_light_event(&mut events).await, LightEvent::Disconnected);
        assert_eq!(rig.handle.authority(), Authority::Proxy);
    }

    #[tokio::test]
    async fn playback_notifications_are_forwarded() {
        let rig = rig(quick_settings());
        rig.handle.connect(None).await.unwrap();
        let mut events = rig.handle.subscribe();

        rig.proxy.emit(BackendEvent::Notification(Notification::Playing));
        rig.proxy.emit(BackendEvent::Notification(Notification::Paused));

        assert_eq!(next_light_event(&mut events).await, LightEvent::Play);
        assert_eq!(next_light_event(&mut events).await, LightEvent::Pause);
    }

    #[tokio::test]
    async fn disconnect_releases_and_announces() {
        let rig = rig(quick_settings());
        rig.handle.connect(None).await.unwrap();
        let mut events = rig.handle.subscribe();

        rig.handle.disconnect().await.unwrap();

        assert_eq!(next_light_event(&mut events).await, LightEvent::Disconnected);
        assert_eq!(rig.handle.authority(), Authority::Idle);
        assert_eq!(rig.journal.entries().last().map(String::as_str), Some("direct:disconnect"));
    }

    #[tokio::test]
    async fn port_changes_are_persisted() {
        let rig = rig(quick_settings());

        rig.handle.set_port(6100).await.unwrap();
        assert_eq!(rig.journal.entries(), vec!["proxy:set_port(6100)"]);
        assert_eq!(rig.store.current().port, 6100);

        assert!(matches!(rig.handle.set_port(0).await, Err(ControlError::InvalidArgument(_))));
        rig.proxy.fail("set_port");
        assert_eq!(
            rig.handle.set_port(6200).await,
            Err(ControlError::Backend { kind: BackendKind::Proxy, source: BackendError::Rejected })
        );
        assert_eq!(rig.store.current().port, 6100);
    }

    #[tokio::test]
    async fn idle_ping_reconnects_once_a_backend_shows_up() {
        let rig = rig(Settings { ping_interval_ms: Some(20), ..quick_settings() });
        rig.direct.set_connect_ok(false);
        rig.companion.set_connect_ok(false);
        rig.handle.connect(None).await.unwrap_err();

        rig.companion.set_connect_ok(true);
        let snapshot = wait_until(&rig.handle, |s| s.connected).await;
        assert_eq!(snapshot.authority, Authority::Companion);
    }

    #[tokio::test]
    async fn stopped_arbiter_refuses_requests() {
        let rig = rig(quick_settings());
        rig.handle.connect(None).await.unwrap();
        let handle = rig.handle.clone();

        rig.service.shutdown().await.unwrap();

        assert_eq!(handle.turn_on().await, Err(ControlError::Stopped));
        assert_eq!(rig.journal.entries().last().map(String::as_str), Some("direct:disconnect"));
    }

    #[tokio::test]
    async fn companion_app_drives_a_ten_led_strip() {
        init_logging();
        let fake = FakeCompanion::start(companion_replies(10)).await;
        let journal = Journal::default();
        let direct = MockBackend::new(BackendKind::Direct, &journal, 10);
        direct.set_connect_ok(false);
        let proxy = MockBackend::new(BackendKind::Proxy, &journal, 10);
        let companion = Arc::new(CompanionBackend::new(CompanionConfig {
            port: fake.addr().port(),
            ..Default::default()
        }));
        let backends = Backends { direct, companion, proxy };
        let store = Arc::new(MemorySettingsStore::new(quick_settings()));
        let (arbiter, handle) = Arbiter::new(backends, store).unwrap();
        let _service = arbiter.run();
        let mut events = handle.subscribe();

        handle.set_color_to_all(GREEN).await.unwrap();
        handle.set_color(3, RED).await.unwrap();

        assert_eq!(handle.authority(), Authority::Companion);
        let state = handle.state();
        for index in 0..10 {
            let expected = if index == 3 { RED } else { GREEN };
            assert_eq!(state.color(index), Some(expected), "LED {index}");
        }
        let all_green = (1..=10).map(|id| format!("{id}-0,255,0;")).collect::<String>();
        let received = fake.received();
        assert!(received.contains(&"lock".to_string()));
        assert!(received.contains(&format!("setcolor:{all_green}")));
        assert_eq!(received.last().map(String::as_str), Some("setcolor:4-255,0,0;"));
        assert_eq!(next_light_event(&mut events).await, LightEvent::Connected);

        // a dropped socket is noticed and the companion is connected again
        fake.hang_up();
        assert_eq!(next_light_event(&mut events).await, LightEvent::Connected);
        assert_eq!(fake.received().iter().filter(|line| line.as_str() == "lock").count(), 2);
    }

    #[tokio::test]
    async fn numeric_proxy_peer_gets_cached_colors_led_by_led() {
        init_logging();
        let journal = Journal::default();
        let direct = MockBackend::new(BackendKind::Direct, &journal, 10);
        let companion = MockBackend::new(BackendKind::Companion, &journal, 10);
        let proxy = Arc::new(ProxyBackend::bind("127.0.0.1", 0, FrameStyle::Numeric).await.unwrap());
        let backends = Backends { direct, companion, proxy: proxy.clone() };
        let store = Arc::new(MemorySettingsStore::new(quick_settings()));
        let (arbiter, handle) = Arbiter::new(backends, store).unwrap();
        let _service = arbiter.run();
        handle.connect(None).await.unwrap();
        handle.set_color(1, RED).await.unwrap();

        let seen = answering_peer(proxy.local_addr(), 10).await;
        let snapshot = wait_until(&handle, |s| s.authority == Authority::Proxy && s.connected).await;

        assert_eq!(snapshot.state.color(1), Some(RED));
        assert_eq!(
            seen.lock().unwrap().clone(),
            vec!["9", "0", "5255", "622", "4100", "11,255,0,0"]
        );
        assert_eq!(journal.count("direct:disconnect"), 1);
    }

    #[tokio::test]
    async fn connection_loss_during_a_command_reconnects_once() {
        init_logging();
        let fake = FakeCompanion::start(|line: &str| {
            if line == "setbrightness:77" {
                None
            } else {
                companion_replies(10)(line)
            }
        })
        .await;
        let journal = Journal::default();
        let direct = MockBackend::new(BackendKind::Direct, &journal, 10);
        direct.set_connect_ok(false);
        let proxy = MockBackend::new(BackendKind::Proxy, &journal, 10);
        let companion = Arc::new(CompanionBackend::new(CompanionConfig {
            port: fake.addr().port(),
            ..Default::default()
        }));
        let backends = Backends { direct, companion, proxy };
        let store = Arc::new(MemorySettingsStore::new(quick_settings()));
        let (arbiter, handle) = Arbiter::new(backends, store).unwrap();
        let _service = arbiter.run();
        handle.connect(None).await.unwrap();
        let mut events = handle.subscribe();

        let unanswered = tokio::spawn({
            let handle = handle.clone();
            async move { handle.set_brightness(77).await }
        });
        timeout(WAIT, async {
            while !fake.received().iter().any(|line| line == "setbrightness:77") {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        fake.hang_up();

        assert!(matches!(
            unanswered.await.unwrap(),
            Err(ControlError::Backend { kind: BackendKind::Companion, source: BackendError::Transport(_) })
        ));
        assert_eq!(next_light_event(&mut events).await, LightEvent::Connected);
        // the loss reported by the replaced session changes nothing
        assert!(timeout(Duration::from_millis(300), events.recv()).await.is_err());
        assert_eq!(handle.authority(), Authority::Companion);
        assert_eq!(fake.received().iter().filter(|line| line.as_str() == "lock").count(), 2);
        assert_eq!(fake.received().iter().filter(|line| line.as_str() == "getcountleds").count(), 2);
    }

    #[tokio::test]
    async fn runtime_overrides_stay_out_of_the_settings_file() {
        init_logging();
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonFileSettingsStore::new(dir.path().join("settings.json")));
        store.save(&Settings::default()).unwrap();
        let mut settings = store.load().unwrap();
        settings.companion.apikey = "from-command-line".to_string();
        settings.policy = ArbitrationPolicy::FirstConnected;
        settings.retry = RetrySettings { attempts: 1, delay_ms: 0 };
        settings.ping_interval_ms = None;

        let journal = Journal::default();
        let backends = Backends {
            direct: MockBackend::new(BackendKind::Direct, &journal, 10),
            companion: MockBackend::new(BackendKind::Companion, &journal, 10),
            proxy: MockBackend::new(BackendKind::Proxy, &journal, 10),
        };
        let (arbiter, handle) = Arbiter::with_settings(backends, store.clone(), settings);
        let _service = arbiter.run();

        handle.set_brightness(40).await.unwrap();
        handle.set_port(6100).await.unwrap();

        let saved = store.load().unwrap();
        assert_eq!(saved.brightness, 40);
        assert_eq!(saved.port, 6100);
        let defaults = Settings::default();
        assert_eq!(saved.companion, defaults.companion);
        assert_eq!(saved.policy, defaults.policy);
        assert_eq!(saved.retry, defaults.retry);
        assert_eq!(saved.ping_interval_ms, defaults.ping_interval_ms);
    }

    #[tokio::test]
    async fn disconnect_is_announced_once_until_connected_again() {
        let rig = rig(quick_settings());
        rig.handle.connect(None).await.unwrap();
        rig.proxy.emit(BackendEvent::PeerAttached);
        wait_until(&rig.handle, |s| s.authority == Authority::Proxy && s.connected).await;
        let mut events = rig.handle.subscribe();

        rig.proxy.set_connect_ok(false);
        rig.proxy.emit(BackendEvent::Notification(Notification::DeviceDisconnected));
        assert_eq!(next_light_event(&mut events).await, LightEvent::Disconnected);

        assert_eq!(rig.handle.turn_on().await, Err(ControlError::NoBackend));
        assert!(events.try_recv().is_err());
    }
}
