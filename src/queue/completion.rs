//! Completion port for overlapped operations.
//!
//! An overlapped call returns [`IoOutcome::Pending`] at once; the result
//! arrives later as a [`CompletionPacket`] on the port associated with the
//! queue. Packets are posted from whichever task saw the I/O finish, so
//! consumers must not assume any order beyond "after the call".

use tokio::sync::mpsc;

use crate::error::Result;
use crate::http::request::HttpRequest;

/// Caller token identifying one overlapped operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Overlapped(pub u64);

/// Outcome of an operation that may complete later.
#[derive(Debug)]
pub enum IoOutcome<T> {
    Complete(T),
    Pending,
}

impl<T> IoOutcome<T> {
    pub fn is_pending(&self) -> bool {
        matches!(self, IoOutcome::Pending)
    }

    pub fn complete(self) -> Option<T> {
        match self {
            IoOutcome::Complete(value) => Some(value),
            IoOutcome::Pending => None,
        }
    }
}

#[derive(Debug)]
pub enum CompletionData {
    Request(Box<HttpRequest>),
    Body(Vec<u8>),
    Sent(u64),
}

#[derive(Debug)]
pub struct CompletionPacket {
    /// Key given when the port was associated with the queue.
    pub key: u64,
    pub overlapped: Overlapped,
    pub result: Result<CompletionData>,
}

#[derive(Debug, Clone)]
pub struct CompletionPort {
    tx: mpsc::UnboundedSender<CompletionPacket>,
}

pub struct CompletionReceiver {
    rx: mpsc::UnboundedReceiver<CompletionPacket>,
}

impl CompletionPort {
    pub fn new() -> (Self, CompletionReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, CompletionReceiver { rx })
    }

    pub(crate) fn post(&self, packet: CompletionPacket) {
        if self.tx.send(packet).is_err() {
            tracing::debug!("Completion port receiver dropped, packet discarded");
        }
    }
}

impl CompletionReceiver {
    /// Wait for the next packet. `None` once every port clone is gone.
    pub async fn recv(&mut self) -> Option<CompletionPacket> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<CompletionPacket> {
        self.rx.try_recv().ok()
    }
}

/// A completion port bound to a queue with its key.
#[derive(Debug, Clone)]
pub(crate) struct Association {
    pub port: CompletionPort,
    pub key: u64,
}

impl Association {
    pub fn complete(&self, overlapped: Overlapped, result: Result<CompletionData>) {
        self.port.post(CompletionPacket {
            key: self.key,
            overlapped,
            result,
        });
    }
}
