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

//! Socket server for the proxy peer.
//!
//! The peer (a video renderer plugin) connects as a client and drives whichever device it
//! controls on our behalf. Several sockets may be open at once, but only the oldest one is
//! the active peer; the others wait until it goes away.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, LinesCodec};

use crate::backend::{BackendEvent, DeviceBackend, ProxyControl};
use crate::connection::MAX_LINE_LENGTH;
use crate::definitions::{BackendKind, LedColor, Rgb};
use crate::errors::BackendError;
use crate::protocol::framer::{decode, EventCode, FrameError, FrameStyle, InboundFrame};
use crate::protocol::{ProxyCommand, ProxyFrame};
use crate::queue::{Pending, Reply, ReplyResult, SingleFlightQueue};
use crate::service::{spawn_service, ServiceHandle, StopHandle};

pub const DEFAULT_PROXY_HOST: &str = "127.0.0.1";
pub const DEFAULT_PROXY_PORT: u16 = 6000;
const REQUEST_BUFFER: usize = 32;

enum ServerRequest {
    Command(Pending<ProxyFrame>),
    /// Move the listener without involving a peer.
    Relisten { port: u16, reply: oneshot::Sender<Result<(), BackendError>> },
}

enum PeerInput {
    Line { peer: u64, line: String },
    Closed { peer: u64 },
}

struct Peer {
    id: u64,
    addr: SocketAddr,
    writer: OwnedWriteHalf,
    reader: JoinHandle<()>,
}

struct Shared {
    local_addr: Mutex<SocketAddr>,
    peer_attached: AtomicBool,
    restarts: AtomicUsize,
    events: broadcast::Sender<BackendEvent>,
}

impl Shared {
    fn emit(&self, event: BackendEvent) {
        let _ = self.events.send(event);
    }
}

/// Backend that forwards device commands to the proxy peer.
pub struct ProxyBackend {
    style: FrameStyle,
    requests: mpsc::Sender<ServerRequest>,
    shared: Arc<Shared>,
    service: Mutex<Option<ServiceHandle>>,
}

impl ProxyBackend {
    /// Bind `host:port` and start accepting peers. Port `0` picks a free port.
    pub async fn bind(host: &str, port: u16, style: FrameStyle) -> Result<Self, BackendError> {
        let listener = TcpListener::bind((host, port)).await?;
        let local_addr = listener.local_addr()?;
        info!("Proxy socket server listening on {}", local_addr);

        let (events, _) = broadcast::channel(32);
        let shared = Arc::new(Shared {
            local_addr: Mutex::new(local_addr),
            peer_attached: AtomicBool::new(false),
            restarts: AtomicUsize::new(0),
            events,
        });
        let (requests, requests_rx) = mpsc::channel(REQUEST_BUFFER);
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let server = ProxyServer {
            host: host.to_string(),
            listener,
            peers: Vec::new(),
            next_peer_id: 0,
            queue: SingleFlightQueue::new(),
            peer_tx,
            peer_rx,
            shared: shared.clone(),
        };
        let service = spawn_service(move |stop| server.run(stop, requests_rx));
        Ok(Self { style, requests, shared, service: Mutex::new(Some(service)) })
    }

    pub fn local_addr(&self) -> SocketAddr {
        *self.shared.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// How many times the listener moved to another port.
    pub fn listener_restarts(&self) -> usize {
        self.shared.restarts.load(Ordering::SeqCst)
    }

    pub fn style(&self) -> FrameStyle {
        self.style
    }

    /// Stop listening, drop every peer and fail whatever is still pending.
    pub async fn shutdown(&self) {
        let service = self.service.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(service) = service {
            if let Err(e) = service.shutdown().await {
                warn!("Proxy server task ended abnormally: {}", e);
            }
        }
    }

    async fn request(&self, command: ProxyCommand) -> ReplyResult {
        if !self.style.supports(command.event_code()) {
            return Err(BackendError::Unsupported("command needs the letter frame revision"));
        }
        let (pending, reply_rx) = Pending::channel(ProxyFrame { style: self.style, command });
        self.requests
            .send(ServerRequest::Command(pending))
            .await
            .map_err(|_| BackendError::NotConnected)?;
        reply_rx.await.unwrap_or(Err(BackendError::NotConnected))
    }

    async fn relisten(&self, port: u16) -> Result<(), BackendError> {
        let (reply, reply_rx) = oneshot::channel();
        self.requests
            .send(ServerRequest::Relisten { port, reply })
            .await
            .map_err(|_| BackendError::NotConnected)?;
        reply_rx.await.unwrap_or(Err(BackendError::NotConnected))
    }
}

#[async_trait]
impl DeviceBackend for ProxyBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Proxy
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<BackendEvent>> {
        Some(self.shared.events.subscribe())
    }

    fn is_connected(&self) -> bool {
        self.is_peer_attached()
    }

    /// Ask the peer to (re)open the device it controls.
    async fn connect(&self) -> Result<(), BackendError> {
        self.request(ProxyCommand::Reconnect).await?.into_ack()
    }

    async fn disconnect(&self) {
        // the peer owns its device; there is nothing to release on our side
        debug!("Proxy backend released");
    }

    async fn led_count(&self) -> Result<usize, BackendError> {
        self.request(ProxyCommand::CountLeds).await?.into_count()
    }

    async fn set_color(&self, index: usize, color: Rgb) -> Result<(), BackendError> {
        self.request(ProxyCommand::SetColor { index, color }).await?.into_ack()
    }

    async fn set_color_to_all(&self, color: Rgb) -> Result<(), BackendError> {
        self.request(ProxyCommand::SetColorToAll(color)).await?.into_ack()
    }

    async fn set_colors(&self, colors: &[LedColor]) -> Result<(), BackendError> {
        if colors.is_empty() {
            return Err(BackendError::InvalidArgument("empty color list".to_string()));
        }
        if self.style.supports(EventCode::SetColors) {
            return self.request(ProxyCommand::SetColors(colors.to_vec())).await?.into_ack();
        }
        // the numeric revision has no bulk command
        for (index, entry) in colors.iter().enumerate() {
            if let LedColor::Color(color) = entry {
                self.set_color(index, *color).await?;
            }
        }
        Ok(())
    }

    async fn set_brightness(&self, value: u8) -> Result<(), BackendError> {
        self.request(ProxyCommand::SetBrightness(value)).await?.into_ack()
    }

    async fn set_gamma(&self, value: f64) -> Result<(), BackendError> {
        self.request(ProxyCommand::SetGamma(value)).await?.into_ack()
    }

    async fn set_smooth(&self, value: u8) -> Result<(), BackendError> {
        self.request(ProxyCommand::SetSmooth(value)).await?.into_ack()
    }

    async fn turn_on(&self) -> Result<(), BackendError> {
        self.request(ProxyCommand::TurnOn).await?.into_ack()
    }

    async fn turn_off(&self) -> Result<(), BackendError> {
        self.request(ProxyCommand::TurnOff).await?.into_ack()
    }
}

#[async_trait]
impl ProxyControl for ProxyBackend {
    fn as_backend(&self) -> &dyn DeviceBackend {
        self
    }

    fn is_peer_attached(&self) -> bool {
        self.shared.peer_attached.load(Ordering::SeqCst)
    }

    /// With a peer attached the peer is told about the new port first and the listener
    /// moves once it acknowledges. Without a peer the listener moves right away.
    async fn set_port(&self, port: u16) -> Result<(), BackendError> {
        if port == 0 {
            return Err(BackendError::InvalidArgument("port 0".to_string()));
        }
        if self.is_peer_attached() {
            self.request(ProxyCommand::SetPort(port)).await?.into_ack()
        } else {
            self.relisten(port).await
        }
    }
}

struct ProxyServer {
    host: String,
    listener: TcpListener,
    /// `peers[0]` is the active peer.
    peers: Vec<Peer>,
    next_peer_id: u64,
    queue: SingleFlightQueue<ProxyFrame>,
    peer_tx: mpsc::UnboundedSender<PeerInput>,
    peer_rx: mpsc::UnboundedReceiver<PeerInput>,
    shared: Arc<Shared>,
}

impl ProxyServer {
    async fn run(mut self, mut stop: StopHandle, mut requests: mpsc::Receiver<ServerRequest>) {
        loop {
            select! {
                biased;
                _ = stop.signaled() => {
                    info!("Proxy socket server shutdown requested");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => self.add_peer(stream, addr),
                    Err(e) => warn!("Accepting proxy peer failed: {}", e),
                },
                Some(input) = self.peer_rx.recv() => self.on_peer_input(input).await,
                request = requests.recv() => match request {
                    Some(ServerRequest::Command(pending)) => {
                        if let Some(frame) = self.queue.enqueue(pending) {
                            self.write_active(frame).await;
                        }
                    }
                    Some(ServerRequest::Relisten { port, reply }) => {
                        let _ = reply.send(self.relisten(port).await);
                    }
                    None => break,
                },
            }
        }
        self.drop_peers();
        requests.close();
        while let Ok(request) = requests.try_recv() {
            match request {
                ServerRequest::Command(pending) => pending.resolve(Err(BackendError::NotConnected)),
                ServerRequest::Relisten { reply, .. } => {
                    let _ = reply.send(Err(BackendError::NotConnected));
                }
            }
        }
    }

    fn add_peer(&mut self, stream: TcpStream, addr: SocketAddr) {
        let _ = stream.set_nodelay(true);
        let id = self.next_peer_id;
        self.next_peer_id += 1;
        let (read_half, writer) = stream.into_split();
        let peer_tx = self.peer_tx.clone();
        let reader = tokio::spawn(async move {
            let mut lines =
                FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
            while let Some(line) = lines.next().await {
                match line {
                    Ok(line) => {
                        if peer_tx.send(PeerInput::Line { peer: id, line }).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        debug!("Reading from proxy peer {} failed: {}", addr, e);
                        break;
                    }
                }
            }
            let _ = peer_tx.send(PeerInput::Closed { peer: id });
        });

        self.peers.push(Peer { id, addr, writer, reader });
        if self.peers.len() == 1 {
            self.activate_first();
        } else {
            debug!("Proxy peer {} is waiting until {} goes away", addr, self.peers[0].addr);
        }
    }

    fn activate_first(&mut self) {
        if let Some(peer) = self.peers.first() {
            info!("Proxy peer {} attached", peer.addr);
            self.queue.set_connected(true);
            self.shared.peer_attached.store(true, Ordering::SeqCst);
            self.shared.emit(BackendEvent::PeerAttached);
        }
    }

    async fn on_peer_input(&mut self, input: PeerInput) {
        match input {
            PeerInput::Line { peer, line } => {
                if self.peers.first().map(|active| active.id) != Some(peer) {
                    debug!("Ignoring line from inactive proxy peer");
                    return;
                }
                self.on_line(&line).await;
            }
            PeerInput::Closed { peer } => self.on_peer_closed(peer),
        }
    }

    async fn on_line(&mut self, line: &str) {
        match decode(line) {
            Err(FrameError::Empty) => {}
            Err(e) => warn!("Dropping frame {:?} from proxy peer: {}", line, e),
            Ok(InboundFrame::Notification(notification, _)) => {
                debug!("Proxy peer notification: {}", notification);
                self.shared.emit(BackendEvent::Notification(notification));
            }
            Ok(InboundFrame::Response(payload)) => {
                if let Some(mut delivery) = self.queue.on_response(payload) {
                    if let ProxyCommand::SetPort(port) = delivery.command().command {
                        if delivery.result() == &Ok(Reply::Ack(true)) {
                            if let Err(e) = self.relisten(port).await {
                                delivery.set_result(Err(e));
                            }
                        }
                    }
                    delivery.deliver();
                }
                if let Some(frame) = self.queue.next_frame() {
                    self.write_active(frame).await;
                }
            }
        }
    }

    fn on_peer_closed(&mut self, id: u64) {
        let Some(position) = self.peers.iter().position(|peer| peer.id == id) else {
            return;
        };
        let peer = self.peers.remove(position);
        peer.reader.abort();
        if position != 0 {
            debug!("Inactive proxy peer {} left", peer.addr);
            return;
        }

        info!("Proxy peer {} detached", peer.addr);
        self.queue.fail_all(BackendError::NotConnected);
        if self.peers.is_empty() {
            self.queue.set_connected(false);
            self.shared.peer_attached.store(false, Ordering::SeqCst);
            self.shared.emit(BackendEvent::PeerDetached);
        } else {
            self.activate_first();
        }
    }

    async fn write_active(&mut self, frame: String) {
        let Some(peer) = self.peers.first_mut() else {
            return;
        };
        let written = match peer.writer.write_all(frame.as_bytes()).await {
            Ok(()) => peer.writer.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            warn!("Writing to proxy peer {} failed: {}", peer.addr, e);
            let id = peer.id;
            self.on_peer_closed(id);
        }
    }

    /// Listen on `port` instead. Every peer is dropped; they are expected to come back on
    /// the new port. The old listener stays if the new one cannot be bound, and a restart
    /// on the current port keeps the bound socket.
    async fn relisten(&mut self, port: u16) -> Result<(), BackendError> {
        let current = self.listener.local_addr()?;
        if current.port() != port {
            self.listener = TcpListener::bind((self.host.as_str(), port)).await?;
        }
        let local_addr = self.listener.local_addr()?;
        self.drop_peers();

        *self.shared.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = local_addr;
        let restarts = self.shared.restarts.fetch_add(1, Ordering::SeqCst) + 1;
        info!("Proxy socket server moved to {} (restart #{})", local_addr, restarts);
        Ok(())
    }

    fn drop_peers(&mut self) {
        let had_peer = !self.peers.is_empty();
        for peer in self.peers.drain(..) {
            peer.reader.abort();
        }
        self.queue.fail_all(BackendError::NotConnected);
        self.queue.set_connected(false);
        self.shared.peer_attached.store(false, Ordering::SeqCst);
        if had_peer {
            self.shared.emit(BackendEvent::PeerDetached);
        }
    }
}
