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

use std::collections::VecDeque;

use log::{debug, warn};
use tokio::sync::oneshot;

use crate::errors::BackendError;

/// Interpreted reply of a single queued command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Count(usize),
    Ack(bool),
    Value(String),
    List(Vec<String>),
}

impl Reply {
    pub fn into_ack(self) -> Result<(), BackendError> {
        match self {
            Reply::Ack(true) => Ok(()),
            Reply::Ack(false) => Err(BackendError::Rejected),
            other => Err(BackendError::Protocol(format!("expected acknowledgement, got {other:?}"))),
        }
    }

    pub fn into_count(self) -> Result<usize, BackendError> {
        match self {
            Reply::Count(count) => Ok(count),
            other => Err(BackendError::Protocol(format!("expected count, got {other:?}"))),
        }
    }

    pub fn into_value(self) -> Result<String, BackendError> {
        match self {
            Reply::Value(value) => Ok(value),
            other => Err(BackendError::Protocol(format!("expected value, got {other:?}"))),
        }
    }

    pub fn into_list(self) -> Result<Vec<String>, BackendError> {
        match self {
            Reply::List(items) => Ok(items),
            other => Err(BackendError::Protocol(format!("expected list, got {other:?}"))),
        }
    }
}

pub type ReplyResult = Result<Reply, BackendError>;

/// A command that travels as one line and is answered by exactly one line.
pub trait LineCommand: Send + 'static {
    /// Full outbound line, terminator included.
    fn encode(&self) -> String;

    /// Interpret the payload of the reply line.
    fn decode_reply(&self, payload: &str) -> ReplyResult;
}

/// A queued command together with the channel its caller waits on.
pub struct Pending<C> {
    command: C,
    reply_tx: oneshot::Sender<ReplyResult>,
}

impl<C> Pending<C> {
    pub fn new(command: C, reply_tx: oneshot::Sender<ReplyResult>) -> Self {
        Self { command, reply_tx }
    }

    pub fn channel(command: C) -> (Self, oneshot::Receiver<ReplyResult>) {
        let (reply_tx, reply_rx) = oneshot::channel();
        (Self::new(command, reply_tx), reply_rx)
    }

    pub fn command(&self) -> &C {
        &self.command
    }

    pub fn resolve(self, result: ReplyResult) {
        // the caller may have given up waiting
        let _ = self.reply_tx.send(result);
    }
}

/// Completed command whose result has not been handed to the caller yet.
///
/// The owner gets a chance to act on the reply (or replace the result) before
/// [`Delivery::deliver`] wakes the caller.
pub struct Delivery<C> {
    pending: Pending<C>,
    result: ReplyResult,
}

impl<C> Delivery<C> {
    pub fn command(&self) -> &C {
        &self.pending.command
    }

    pub fn result(&self) -> &ReplyResult {
        &self.result
    }

    pub fn set_result(&mut self, result: ReplyResult) {
        self.result = result;
    }

    pub fn deliver(self) {
        self.pending.resolve(self.result);
    }
}

/// Pending commands of one half-duplex connection. At most one command is written and
/// awaiting its reply at any time; the rest wait in FIFO order.
pub struct SingleFlightQueue<C> {
    pending: VecDeque<Pending<C>>,
    in_flight: bool,
    connected: bool,
}

impl<C: LineCommand> Default for SingleFlightQueue<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: LineCommand> SingleFlightQueue<C> {
    pub fn new() -> Self {
        Self { pending: VecDeque::new(), in_flight: false, connected: false }
    }

    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    /// Queue a command. Returns the line to write when the command went straight in flight.
    ///
    /// Without a connected peer the command fails immediately and is not queued.
    pub fn enqueue(&mut self, pending: Pending<C>) -> Option<String> {
        if !self.connected {
            debug!("No peer connected; failing command immediately");
            pending.resolve(Err(BackendError::NotConnected));
            return None;
        }
        self.pending.push_back(pending);
        self.next_frame()
    }

    /// Mark the head as in flight and return its line, unless something is in flight already.
    pub fn next_frame(&mut self) -> Option<String> {
        if self.in_flight {
            return None;
        }
        let head = self.pending.front()?;
        self.in_flight = true;
        Some(head.command.encode())
    }

    /// Match a reply payload to the command in flight.
    pub fn on_response(&mut self, payload: &str) -> Option<Delivery<C>> {
        if !self.in_flight {
            warn!("Dropping reply {:?}: no command in flight", payload);
            return None;
        }
        self.in_flight = false;
        let pending = self.pending.pop_front()?;
        let result = pending.command.decode_reply(payload);
        Some(Delivery { pending, result })
    }

    /// Resolve every pending command with `error` and reset the queue.
    pub fn fail_all(&mut self, error: BackendError) -> usize {
        let count = self.pending.len();
        for pending in self.pending.drain(..) {
            pending.resolve(Err(error.clone()));
        }
        self.in_flight = false;
        if count > 0 {
            debug!("Failed {} pending command(s): {}", count, error);
        }
        count
    }
}
