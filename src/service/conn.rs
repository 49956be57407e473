use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use crossbeam::atomic::AtomicCell;
use parking_lot::RwLock;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::AppError;
use crate::AppResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Active,
    Idle,
    Kicked,
    Closed,
}

/// Why a connection was torn down; handed to `ConnHandler::on_disconnect`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DisconnectReason {
    #[error("peer closed")]
    PeerClosed,
    #[error("idle timeout")]
    IdleTimeout,
    #[error("server closed")]
    ServerClosed,
    #[error("cancelled")]
    Cancelled,
    #[error("handler error: {0}")]
    HandlerError(String),
    #[error("io error: {0}")]
    Io(String),
}

/// Per-connection record owned by the manager.
///
/// Handlers hold a non-owning `Arc` for the connection's lifetime; the
/// record stays valid after teardown but `send` fails once the write half
/// is gone. Teardown itself is gated by a one-shot latch so concurrent
/// close paths collapse to a single transition.
#[derive(Debug)]
pub struct ConnContext {
    id: String,
    remote_addr: String,
    created_at: Instant,
    last_active: AtomicCell<Instant>,
    state: AtomicCell<ConnState>,
    tags: RwLock<HashMap<String, String>>,
    close_latch: AtomicBool,
    cancel: CancellationToken,
    writer: Mutex<Option<BufWriter<OwnedWriteHalf>>>,
}

impl ConnContext {
    pub(crate) fn new(id: String, remote_addr: String, writer: OwnedWriteHalf) -> Self {
        let now = Instant::now();
        ConnContext {
            id,
            remote_addr,
            created_at: now,
            last_active: AtomicCell::new(now),
            state: AtomicCell::new(ConnState::Active),
            tags: RwLock::new(HashMap::new()),
            close_latch: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            writer: Mutex::new(Some(BufWriter::new(writer))),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_active(&self) -> Instant {
        self.last_active.load()
    }

    pub fn state(&self) -> ConnState {
        self.state.load()
    }

    /// Refreshes the liveness stamp. Called by handlers whenever the
    /// connection shows application-level activity.
    pub fn touch(&self) {
        self.last_active.store(Instant::now());
        self.state.store(ConnState::Active);
    }

    pub fn set_tag(&self, key: impl Into<String>, value: impl Into<String>) {
        self.tags.write().insert(key.into(), value.into());
    }

    pub fn get_tag(&self, key: &str) -> Option<String> {
        self.tags.read().get(key).cloned()
    }

    pub fn all_tags(&self) -> HashMap<String, String> {
        self.tags.read().clone()
    }

    /// Writes and flushes a reply on the connection.
    pub async fn send(&self, data: &[u8]) -> AppResult<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| AppError::IllegalState(format!("connection {} is closed", self.id)))?;
        writer.write_all(data).await?;
        writer.flush().await?;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.close_latch.load(Ordering::Acquire)
    }

    /// Resolves once the record has been closed from any path. Read loops
    /// select on this to get unblocked by administrative eviction.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    pub(crate) fn mark_idle(&self) {
        self.state.store(ConnState::Idle);
    }

    /// First caller wins the close race: stores the terminal state and
    /// cancels the record's token, which unblocks the connection task and
    /// drops the socket. Later callers get `false` and must do nothing.
    pub(crate) fn begin_close(&self, terminal: ConnState) -> bool {
        if self.close_latch.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.state.store(terminal);
        self.cancel.cancel();
        true
    }

    pub(crate) async fn release_writer(&self) {
        self.writer.lock().await.take();
    }
}
