//! Per-attachment outbound path.
//!
//! The session side only ever holds an [`AttachmentHandle`]: a bounded queue
//! sender plus a [`Kicker`]. Pushing never blocks; a full queue means the
//! attachment is too slow and gets kicked. Close notifications travel through
//! the kicker rather than the queue so they are delivered even when the queue
//! is full.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::protocol::{CloseReason, DisplayMode};

pub type AttachmentId = Uuid;

/// Items queued for one attachment's writer task.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Raw process output; decoded to text by the writer.
    Output(Arc<[u8]>),
    ModeSync(DisplayMode),
    Ping,
    Pong,
}

/// Result of a non-blocking push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Push {
    Queued,
    /// Queue full; the caller should drop this attachment.
    Full,
    /// Writer task is gone.
    Closed,
}

/// Forced-close signal for one attachment. The first reason wins.
#[derive(Debug, Clone, Default)]
pub struct Kicker {
    token: CancellationToken,
    reason: Arc<Mutex<Option<CloseReason>>>,
}

impl Kicker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kick(&self, reason: CloseReason) {
        if let Ok(mut slot) = self.reason.lock() {
            slot.get_or_insert(reason);
        }
        self.token.cancel();
    }

    /// Reason passed to the first [`Kicker::kick`], if kicked.
    pub fn reason(&self) -> Option<CloseReason> {
        self.reason.lock().ok().and_then(|slot| *slot)
    }

    /// Resolves once kicked.
    pub async fn kicked(&self) {
        self.token.cancelled().await;
    }
}

/// What a session keeps for each subscriber.
#[derive(Debug, Clone)]
pub struct AttachmentHandle {
    pub id: AttachmentId,
    tx: mpsc::Sender<Outbound>,
    kicker: Kicker,
}

impl AttachmentHandle {
    pub fn try_push(&self, item: Outbound) -> Push {
        match self.tx.try_send(item) {
            Ok(()) => Push::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => Push::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => Push::Closed,
        }
    }

    pub fn kick(&self, reason: CloseReason) {
        self.kicker.kick(reason);
    }

    pub fn kicker(&self) -> &Kicker {
        &self.kicker
    }
}

/// Create a handle/receiver pair with a queue of `depth` items.
pub fn channel(depth: usize) -> (AttachmentHandle, mpsc::Receiver<Outbound>) {
    let (tx, rx) = mpsc::channel(depth.max(1));
    let handle = AttachmentHandle {
        id: Uuid::new_v4(),
        tx,
        kicker: Kicker::new(),
    };
    (handle, rx)
}
