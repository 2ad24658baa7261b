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

//! Test doubles shared by the unit tests of several modules.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::backend::{BackendEvent, DeviceBackend, ProxyControl};
use crate::definitions::{BackendKind, LedColor, Rgb};
use crate::errors::BackendError;

/// Route `log` output of the code under test through the test harness.
pub(crate) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Calls of every mock backend of one test, in the order they happened.
#[derive(Clone, Default)]
pub(crate) struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub(crate) fn push(&self, entry: String) {
        self.0.lock().unwrap().push(entry);
    }

    pub(crate) fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, entry: &str) -> usize {
        self.entries().iter().filter(|e| e.as_str() == entry).count()
    }
}

/// Backend double that records calls as `"<kind>:<call>"` and fails on demand.
pub(crate) struct MockBackend {
    kind: BackendKind,
    journal: Journal,
    led_count: usize,
    connect_ok: AtomicBool,
    connected: AtomicBool,
    failing: Mutex<Vec<&'static str>>,
    peer_attached: AtomicBool,
    events: broadcast::Sender<BackendEvent>,
}

impl MockBackend {
    pub(crate) fn new(kind: BackendKind, journal: &Journal, led_count: usize) -> Arc<Self> {
        let (events, _) = broadcast::channel(16);
        Arc::new(Self {
            kind,
            journal: journal.clone(),
            led_count,
            connect_ok: AtomicBool::new(true),
            connected: AtomicBool::new(false),
            failing: Mutex::new(Vec::new()),
            peer_attached: AtomicBool::new(false),
            events,
        })
    }

    pub(crate) fn set_connect_ok(&self, ok: bool) {
        self.connect_ok.store(ok, Ordering::SeqCst);
    }

    /// Make every later call named `call` fail with `Rejected`.
    pub(crate) fn fail(&self, call: &'static str) {
        self.failing.lock().unwrap().push(call);
    }

    pub(crate) fn emit(&self, event: BackendEvent) {
        match event {
            BackendEvent::PeerAttached => self.peer_attached.store(true, Ordering::SeqCst),
            BackendEvent::PeerDetached => self.peer_attached.store(false, Ordering::SeqCst),
            BackendEvent::ConnectionLost => self.connected.store(false, Ordering::SeqCst),
            _ => {}
        }
        let _ = self.events.send(event);
    }

    fn prefix(&self) -> &'static str {
        match self.kind {
            BackendKind::Direct => "direct",
            BackendKind::Companion => "companion",
            BackendKind::Proxy => "proxy",
        }
    }

    fn call(&self, name: &'static str, detail: String) -> Result<(), BackendError> {
        if detail.is_empty() {
            self.journal.push(format!("{}:{}", self.prefix(), name));
        } else {
            self.journal.push(format!("{}:{}({})", self.prefix(), name, detail));
        }
        if self.failing.lock().unwrap().contains(&name) {
            Err(BackendError::Rejected)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DeviceBackend for MockBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<BackendEvent>> {
        Some(self.events.subscribe())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn connect(&self) -> Result<(), BackendError> {
        self.call("connect", String::new())?;
        if self.connect_ok.load(Ordering::SeqCst) {
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        } else {
            Err(BackendError::Unavailable)
        }
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.call("disconnect", String::new());
    }

    async fn led_count(&self) -> Result<usize, BackendError> {
        self.call("led_count", String::new()).map(|()| self.led_count)
    }

    async fn set_color(&self, index: usize, color: Rgb) -> Result<(), BackendError> {
        self.call("set_color", format!("{index},{color}"))
    }

    async fn set_color_to_all(&self, color: Rgb) -> Result<(), BackendError> {
        self.call("set_color_to_all", color.to_string())
    }

    async fn set_colors(&self, colors: &[LedColor]) -> Result<(), BackendError> {
        let listed = colors
            .iter()
            .map(|entry| entry.color().map_or("-".to_string(), |c| c.to_string()))
            .collect::<Vec<_>>()
            .join(";");
        self.call("set_colors", listed)
    }

    async fn set_brightness(&self, value: u8) -> Result<(), BackendError> {
        self.call("set_brightness", value.to_string())
    }

    async fn set_gamma(&self, value: f64) -> Result<(), BackendError> {
        self.call("set_gamma", value.to_string())
    }

    async fn set_smooth(&self, value: u8) -> Result<(), BackendError> {
        self.call("set_smooth", value.to_string())
    }

    async fn turn_on(&self) -> Result<(), BackendError> {
        self.call("turn_on", String::new())
    }

    async fn turn_off(&self) -> Result<(), BackendError> {
        self.call("turn_off", String::new())
    }
}

#[async_trait]
impl ProxyControl for MockBackend {
    fn as_backend(&self) -> &dyn DeviceBackend {
        self
    }

    fn is_peer_attached(&self) -> bool {
        self.peer_attached.load(Ordering::SeqCst)
    }

    async fn set_port(&self, port: u16) -> Result<(), BackendError> {
        self.call("set_port", port.to_string())
    }
}

type ReplyFn = dyn Fn(&str) -> Option<String> + Send + Sync;

/// Loopback stand-in for the companion application's API server.
pub(crate) struct FakeCompanion {
    addr: SocketAddr,
    received: Arc<Mutex<Vec<String>>>,
    hangups: watch::Sender<u64>,
    accept: JoinHandle<()>,
}

impl FakeCompanion {
    pub(crate) async fn start<F>(replies: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let (hangups, _) = watch::channel(0u64);
        let replies: Arc<ReplyFn> = Arc::new(replies);

        let accept = tokio::spawn({
            let received = received.clone();
            let hangup_rx = hangups.subscribe();
            async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let mut connection_hangups = hangup_rx.clone();
                    connection_hangups.borrow_and_update();
                    tokio::spawn(serve(
                        stream,
                        replies.clone(),
                        received.clone(),
                        connection_hangups,
                    ));
                }
            }
        });
        Self { addr, received, hangups, accept }
    }

    pub(crate) fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub(crate) fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }

    /// Close every open connection; later connections are served normally.
    pub(crate) fn hang_up(&self) {
        self.hangups.send_modify(|generation| *generation += 1);
    }
}

impl Drop for FakeCompanion {
    fn drop(&mut self) {
        self.accept.abort();
        self.hang_up();
    }
}

async fn serve(
    stream: TcpStream,
    replies: Arc<ReplyFn>,
    received: Arc<Mutex<Vec<String>>>,
    mut hangups: watch::Receiver<u64>,
) {
    let (read_half, mut writer) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    loop {
        select! {
            _ = hangups.changed() => break,
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { break };
                received.lock().unwrap().push(line.clone());
                if let Some(reply) = replies(&line) {
                    if writer.write_all(format!("{reply}\n").as_bytes()).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}

/// Replies of a well-behaved companion application driving `led_count` LEDs.
pub(crate) fn companion_replies(led_count: usize) -> impl Fn(&str) -> Option<String> + Send + Sync + 'static {
    move |line: &str| {
        let reply = match line {
            "getcountleds" => format!("countleds:{led_count}"),
            "lock" => "lock:success".to_string(),
            "unlock" => "unlock:success".to_string(),
            "getprofiles" => "profiles:Lightpack;Movies;".to_string(),
            "getprofile" => "profile:Lightpack".to_string(),
            "getstatus" => "status:on".to_string(),
            "getstatusapi" => "statusapi:idle".to_string(),
            _ => "ok".to_string(),
        };
        Some(reply)
    }
}
