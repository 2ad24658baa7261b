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

use futures::StreamExt;
use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::select;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec};

use crate::errors::BackendError;
use crate::queue::{LineCommand, Pending, ReplyResult, SingleFlightQueue};
use crate::service::{spawn_service, ServiceHandle};

pub(crate) const MAX_LINE_LENGTH: usize = 64 * 1024;
const COMMAND_BUFFER: usize = 32;

/// Client side of a line-oriented request/response connection.
///
/// One background task owns the socket and a [`SingleFlightQueue`]; callers hand their
/// commands over a channel and wait on a oneshot for the reply.
pub(crate) struct LineLink<C> {
    commands: mpsc::Sender<Pending<C>>,
    service: ServiceHandle,
}

impl<C: LineCommand> LineLink<C> {
    /// Take over `stream`. `on_lost` runs once if the remote side closes the connection or
    /// an I/O error severs it, never after [`LineLink::close`].
    pub(crate) fn spawn<S, F>(stream: S, on_lost: F) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
        F: FnOnce() + Send + 'static,
    {
        let (commands, mut commands_rx) = mpsc::channel::<Pending<C>>(COMMAND_BUFFER);
        let service = spawn_service(move |mut stop| async move {
            let (read_half, mut write_half) = tokio::io::split(stream);
            let mut lines =
                FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
            let mut queue = SingleFlightQueue::<C>::new();
            queue.set_connected(true);

            let lost = loop {
                let outgoing = select! {
                    biased;
                    _ = stop.signaled() => break false,
                    line = lines.next() => match line {
                        Some(Ok(line)) => {
                            let payload = line.trim();
                            if payload.is_empty() {
                                continue;
                            }
                            if let Some(delivery) = queue.on_response(payload) {
                                delivery.deliver();
                            }
                            queue.next_frame()
                        }
                        Some(Err(e)) => {
                            warn!("Reading from connection failed: {}", e);
                            break true;
                        }
                        None => {
                            debug!("Connection closed by remote side");
                            break true;
                        }
                    },
                    pending = commands_rx.recv() => match pending {
                        Some(pending) => queue.enqueue(pending),
                        None => break false,
                    },
                };
                if let Some(frame) = outgoing {
                    if let Err(e) = write_frame(&mut write_half, &frame).await {
                        warn!("Writing to connection failed: {}", e);
                        break true;
                    }
                }
            };

            let reason = if lost {
                BackendError::Transport("connection lost".to_string())
            } else {
                BackendError::NotConnected
            };
            queue.set_connected(false);
            queue.fail_all(reason.clone());
            // commands that raced the close must not wait forever either
            commands_rx.close();
            while let Ok(pending) = commands_rx.try_recv() {
                pending.resolve(Err(reason.clone()));
            }
            if lost {
                on_lost();
            }
        });
        Self { commands, service }
    }

    /// Queue `command` and wait for its reply.
    pub(crate) async fn request(&self, command: C) -> ReplyResult {
        let (pending, reply_rx) = Pending::channel(command);
        self.commands.send(pending).await.map_err(|_| BackendError::NotConnected)?;
        reply_rx.await.unwrap_or(Err(BackendError::NotConnected))
    }

    pub(crate) fn is_open(&self) -> bool {
        !self.commands.is_closed() && !self.service.is_finished()
    }

    /// Close deliberately: pending commands fail with `NotConnected` and `on_lost` does not run.
    pub(crate) async fn close(self) {
        if let Err(e) = self.service.shutdown().await {
            warn!("Connection task ended abnormally: {}", e);
        }
    }
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &str) -> std::io::Result<()> {
    writer.write_all(frame.as_bytes()).await?;
    writer.flush().await
}
