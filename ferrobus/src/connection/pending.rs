/*
 * Copyright (c) 2024. Govcraft
 *
 * Licensed under either of
 *   * Apache License, Version 2.0 (the "License");
 *     you may not use this file except in compliance with the License.
 *     You may obtain a copy of the License at http://www.apache.org/licenses/LICENSE-2.0
 *   * MIT license: http://opensource.org/licenses/MIT
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the applicable License for the specific language governing permissions and
 * limitations under that License.
 */

//! Outgoing calls waiting for their reply.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use ferrobus_core::{BusError, Message};

/// Callback receiving a successful reply.
pub type ReplyCallback = Box<dyn FnOnce(Message) + Send + 'static>;
/// Callback receiving a failed call.
pub type ErrorCallback = Box<dyn FnOnce(BusError) + Send + 'static>;

/// How a pending call is completed.
pub(crate) enum PendingCall {
    Waiter(oneshot::Sender<Result<Message, BusError>>),
    Callback {
        on_reply: ReplyCallback,
        on_error: ErrorCallback,
    },
}

/// Calls keyed by serial. Each entry is removed exactly once.
#[derive(Default)]
pub(crate) struct PendingTable {
    inner: Mutex<PendingState>,
}

#[derive(Default)]
struct PendingState {
    calls: HashMap<u32, PendingCall>,
    closed: bool,
}

impl PendingTable {
    /// Register a call. Fails once the table has been drained.
    pub(crate) fn insert(&self, serial: u32, call: PendingCall) -> Result<(), PendingCall> {
        let mut state = self.inner.lock();
        if state.closed {
            return Err(call);
        }
        state.calls.insert(serial, call);
        Ok(())
    }

    /// Remove the call waiting on `serial`.
    pub(crate) fn take(&self, serial: u32) -> Option<PendingCall> {
        self.inner.lock().calls.remove(&serial)
    }

    /// Remove every call and refuse new ones.
    pub(crate) fn drain(&self) -> Vec<(u32, PendingCall)> {
        let mut state = self.inner.lock();
        state.closed = true;
        state.calls.drain().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().calls.len()
    }
}

/// Handle to the reply of a call started with `call_async`.
///
/// Awaiting the handle yields the reply; [`PendingReply::try_take`] polls it
/// without waiting.
#[derive(Debug)]
pub struct PendingReply {
    serial: u32,
    receiver: oneshot::Receiver<Result<Message, BusError>>,
    done: Option<Result<Message, BusError>>,
    received: bool,
}

impl PendingReply {
    pub(crate) fn new(serial: u32, receiver: oneshot::Receiver<Result<Message, BusError>>) -> Self {
        Self {
            serial,
            receiver,
            done: None,
            received: false,
        }
    }

    /// Serial of the call.
    #[must_use]
    pub const fn serial(&self) -> u32 {
        self.serial
    }

    /// Whether the reply (or a failure) has arrived.
    pub fn is_done(&mut self) -> bool {
        self.poll_ready();
        self.done.is_some()
    }

    /// Take the outcome if it has arrived.
    pub fn try_take(&mut self) -> Option<Result<Message, BusError>> {
        self.poll_ready();
        self.done.take()
    }

    fn poll_ready(&mut self) {
        if self.received {
            return;
        }
        match self.receiver.try_recv() {
            Ok(outcome) => {
                self.received = true;
                self.done = Some(outcome);
            }
            Err(oneshot::error::TryRecvError::Closed) => {
                self.received = true;
                self.done = Some(Err(BusError::Disconnected));
            }
            Err(oneshot::error::TryRecvError::Empty) => {}
        }
    }
}

impl Future for PendingReply {
    type Output = Result<Message, BusError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(outcome) = self.done.take() {
            return Poll::Ready(outcome);
        }
        // The outcome was already handed out by `try_take`.
        if self.received {
            return Poll::Ready(Err(BusError::Disconnected));
        }
        let outcome = match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(outcome)) => outcome,
            Poll::Ready(Err(_)) => Err(BusError::Disconnected),
            Poll::Pending => return Poll::Pending,
        };
        self.received = true;
        Poll::Ready(outcome)
    }
}
