use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use getset::{CopyGetters, Getters};
use parking_lot::Mutex;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::network::{DEFAULT_MAX_FRAME_SIZE, DEFAULT_READ_CHUNK};
use crate::service::conn::{ConnContext, ConnState, DisconnectReason};
use crate::service::Shutdown;
use crate::AppError;
use crate::AppResult;

/// Callbacks for the lifecycle of managed connections.
///
/// `on_accept` runs before the record is registered; returning an error
/// rejects the connection (it is closed without registration and
/// `on_disconnect` never fires for it). `serve` drives the read side of a
/// registered connection, typically by running
/// [`decode_frames`](crate::network::decode_frames) over the reader; the
/// default implementation parks until the record is closed, for handlers
/// that never read.
#[async_trait]
pub trait ConnHandler: Send + Sync {
    fn on_accept(&self, _conn: &Arc<ConnContext>) -> AppResult<()> {
        Ok(())
    }

    fn on_disconnect(&self, _conn: &Arc<ConnContext>, _reason: &DisconnectReason) {}

    async fn serve(&self, conn: Arc<ConnContext>, reader: OwnedReadHalf) -> AppResult<()> {
        // keep the read half open until the record is torn down
        let _hold = reader;
        conn.cancelled().await;
        Ok(())
    }
}

struct NoopHandler;

impl ConnHandler for NoopHandler {}

#[derive(Debug, Clone, Getters, CopyGetters)]
pub struct ManagerOptions {
    #[getset(get = "pub")]
    addr: String,
    /// 0 means unlimited
    #[getset(get_copy = "pub")]
    max_conn: usize,
    /// zero disables idle reaping
    #[getset(get_copy = "pub")]
    idle_timeout: Duration,
    #[getset(get_copy = "pub")]
    reap_tick: Duration,
    /// read chunk size for per-connection decode loops
    #[getset(get_copy = "pub")]
    read_buffer_size: usize,
    /// handed to the `FrameConfig` of handlers that decode frames
    #[getset(get_copy = "pub")]
    max_frame_size: usize,
}

impl ManagerOptions {
    pub fn new(addr: impl Into<String>) -> Self {
        ManagerOptions {
            addr: addr.into(),
            max_conn: 10_000,
            idle_timeout: Duration::from_secs(180),
            reap_tick: Duration::from_secs(60),
            read_buffer_size: DEFAULT_READ_CHUNK,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    pub fn with_max_conn(mut self, max_conn: usize) -> Self {
        self.max_conn = max_conn;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_reap_tick(mut self, reap_tick: Duration) -> Self {
        self.reap_tick = reap_tick;
        self
    }

    pub fn with_read_buffer_size(mut self, read_buffer_size: usize) -> Self {
        self.read_buffer_size = read_buffer_size;
        self
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }
}

#[derive(Debug, Default)]
struct ConnMetrics {
    active: AtomicI64,
    kicked: AtomicI64,
    idle_reclaimed: AtomicI64,
}

/// Point-in-time counter values; reading never blocks registrations.
#[derive(Debug, Clone, Copy, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct ConnMetricsSnapshot {
    active: i64,
    kicked: i64,
    idle_reclaimed: i64,
}

/// TCP acceptor with a connection registry, idle reaping and administrative
/// eviction. Every registered connection receives exactly one
/// `on_disconnect`, no matter how many close paths race.
pub struct ConnManager {
    shared: Arc<Shared>,
    started: AtomicBool,
    shutdown_complete_tx: Mutex<Option<mpsc::Sender<()>>>,
    shutdown_complete_rx: tokio::sync::Mutex<mpsc::Receiver<()>>,
}

struct Shared {
    opts: ManagerOptions,
    handler: Arc<dyn ConnHandler>,
    conns: Mutex<HashMap<String, Arc<ConnContext>>>,
    metrics: ConnMetrics,
    id_seq: AtomicU64,
    notify_shutdown: broadcast::Sender<()>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl ConnManager {
    pub fn new(opts: ManagerOptions, handler: Option<Arc<dyn ConnHandler>>) -> ConnManager {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);
        ConnManager {
            shared: Arc::new(Shared {
                opts,
                handler: handler.unwrap_or_else(|| Arc::new(NoopHandler)),
                conns: Mutex::new(HashMap::new()),
                metrics: ConnMetrics::default(),
                id_seq: AtomicU64::new(0),
                notify_shutdown,
                local_addr: Mutex::new(None),
            }),
            started: AtomicBool::new(false),
            shutdown_complete_tx: Mutex::new(Some(shutdown_complete_tx)),
            shutdown_complete_rx: tokio::sync::Mutex::new(shutdown_complete_rx),
        }
    }

    /// Binds the listener, surfacing bind errors to the caller, then spawns
    /// the accept loop and the idle reaper.
    pub async fn start(&self) -> AppResult<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(AppError::IllegalState("manager already started".into()));
        }
        let listener = TcpListener::bind(self.shared.opts.addr().as_str()).await?;
        let local_addr = listener.local_addr()?;
        *self.shared.local_addr.lock() = Some(local_addr);

        let complete_tx = self
            .shutdown_complete_tx
            .lock()
            .clone()
            .ok_or_else(|| AppError::IllegalState("manager already stopped".into()))?;

        info!(
            addr = %local_addr,
            max_conn = self.shared.opts.max_conn(),
            idle_timeout = ?self.shared.opts.idle_timeout(),
            reap_tick = ?self.shared.opts.reap_tick(),
            "server started"
        );

        let shared = self.shared.clone();
        let shutdown = Shutdown::new(&self.shared.notify_shutdown);
        let tx = complete_tx.clone();
        tokio::spawn(async move {
            accept_loop(shared, listener, shutdown, tx).await;
        });

        let shared = self.shared.clone();
        let shutdown = Shutdown::new(&self.shared.notify_shutdown);
        tokio::spawn(async move {
            reaper_loop(shared, shutdown, complete_tx).await;
        });

        Ok(())
    }

    /// Signals shutdown, closes every live record with `ServerClosed`, and
    /// waits for the background loops and every per-connection task to exit.
    pub async fn stop(&self) {
        info!("server stopping");
        let _ = self.shared.notify_shutdown.send(());

        {
            let mut conns = self.shared.conns.lock();
            let records: Vec<Arc<ConnContext>> = conns.values().cloned().collect();
            for c in records {
                self.shared.close_conn_locked(
                    &mut conns,
                    &c,
                    ConnState::Closed,
                    &DisconnectReason::ServerClosed,
                );
            }
        }

        // drop our completion sender, then drain until every clone is gone
        self.shutdown_complete_tx.lock().take();
        let mut rx = self.shutdown_complete_rx.lock().await;
        let _ = rx.recv().await;
        info!("server stopped");
    }

    /// The bound address, available after `start`.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.shared.local_addr.lock()
    }

    pub fn close_by_id(&self, id: &str, reason: DisconnectReason) {
        let conn = self.shared.conns.lock().get(id).cloned();
        if let Some(c) = conn {
            self.shared.close_conn(&c, ConnState::Closed, &reason);
        }
    }

    pub fn kick_by_id(&self, id: &str, reason: DisconnectReason) {
        let conn = self.shared.conns.lock().get(id).cloned();
        if let Some(c) = conn {
            self.shared.close_conn(&c, ConnState::Kicked, &reason);
        }
    }

    pub fn kick_all(&self, reason: DisconnectReason) {
        let mut conns = self.shared.conns.lock();
        let records: Vec<Arc<ConnContext>> = conns.values().cloned().collect();
        for c in records {
            self.shared
                .close_conn_locked(&mut conns, &c, ConnState::Kicked, &reason);
        }
        drop(conns);
        info!(reason = %reason, "kick all connections");
    }

    pub fn kick_by_tag(&self, key: &str, value: &str, reason: DisconnectReason) -> usize {
        let mut n = 0;
        {
            let mut conns = self.shared.conns.lock();
            let matched: Vec<Arc<ConnContext>> = conns
                .values()
                .filter(|c| c.get_tag(key).as_deref() == Some(value))
                .cloned()
                .collect();
            for c in matched {
                if self
                    .shared
                    .close_conn_locked(&mut conns, &c, ConnState::Kicked, &reason)
                {
                    n += 1;
                }
            }
        }
        info!(key, value, count = n, reason = %reason, "kick by tag");
        n
    }

    pub fn count_by_tag(&self, key: &str, value: &str) -> usize {
        self.shared
            .conns
            .lock()
            .values()
            .filter(|c| c.get_tag(key).as_deref() == Some(value))
            .count()
    }

    pub fn get(&self, id: &str) -> Option<Arc<ConnContext>> {
        self.shared.conns.lock().get(id).cloned()
    }

    pub fn conn_ids(&self) -> Vec<String> {
        self.shared.conns.lock().keys().cloned().collect()
    }

    pub fn metrics(&self) -> ConnMetricsSnapshot {
        ConnMetricsSnapshot {
            active: self.shared.metrics.active.load(Ordering::Relaxed),
            kicked: self.shared.metrics.kicked.load(Ordering::Relaxed),
            idle_reclaimed: self.shared.metrics.idle_reclaimed.load(Ordering::Relaxed),
        }
    }

    pub fn active_conn(&self) -> i64 {
        self.shared.metrics.active.load(Ordering::Relaxed)
    }

    pub fn kicked_conn(&self) -> i64 {
        self.shared.metrics.kicked.load(Ordering::Relaxed)
    }
}

impl Shared {
    fn generate_id(&self, peer: &SocketAddr) -> String {
        let seq = self.id_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        format!("{}-{}-{}", peer, seq, nanos)
    }

    fn active(&self) -> i64 {
        self.metrics.active.load(Ordering::Relaxed)
    }

    /// Close path for callers that do not hold the table lock.
    fn close_conn(
        &self,
        c: &Arc<ConnContext>,
        terminal: ConnState,
        reason: &DisconnectReason,
    ) -> bool {
        if !c.begin_close(terminal) {
            return false;
        }
        self.conns.lock().remove(c.id());
        self.finish_close(c, terminal, reason);
        true
    }

    /// Close path for callers already iterating under the table lock; must
    /// not re-acquire it.
    fn close_conn_locked(
        &self,
        conns: &mut HashMap<String, Arc<ConnContext>>,
        c: &Arc<ConnContext>,
        terminal: ConnState,
        reason: &DisconnectReason,
    ) -> bool {
        if !c.begin_close(terminal) {
            return false;
        }
        conns.remove(c.id());
        self.finish_close(c, terminal, reason);
        true
    }

    fn finish_close(&self, c: &Arc<ConnContext>, terminal: ConnState, reason: &DisconnectReason) {
        self.metrics.active.fetch_sub(1, Ordering::Relaxed);
        if terminal == ConnState::Kicked {
            self.metrics.kicked.fetch_add(1, Ordering::Relaxed);
            if matches!(reason, DisconnectReason::IdleTimeout) {
                self.metrics.idle_reclaimed.fetch_add(1, Ordering::Relaxed);
            }
        }
        debug!(conn_id = %c.id(), reason = %reason, state = ?terminal, "connection closed");
        self.safe_on_disconnect(c, reason);
    }

    /// A panicking handler must not corrupt manager state.
    fn safe_on_disconnect(&self, c: &Arc<ConnContext>, reason: &DisconnectReason) {
        let result = catch_unwind(AssertUnwindSafe(|| {
            self.handler.on_disconnect(c, reason);
        }));
        if result.is_err() {
            error!(conn_id = %c.id(), "panic in handler on_disconnect");
        }
    }

    fn reap_idle(&self) {
        let idle_timeout = self.opts.idle_timeout();
        if idle_timeout.is_zero() {
            return;
        }
        let now = Instant::now();
        let mut conns = self.conns.lock();
        let expired: Vec<Arc<ConnContext>> = conns
            .values()
            .filter(|c| now.duration_since(c.last_active()) > idle_timeout)
            .cloned()
            .collect();
        for c in expired {
            c.mark_idle();
            info!(
                conn_id = %c.id(),
                idle = ?now.duration_since(c.last_active()),
                "idle kick"
            );
            self.close_conn_locked(&mut conns, &c, ConnState::Kicked, &DisconnectReason::IdleTimeout);
        }
    }
}

async fn accept_loop(
    shared: Arc<Shared>,
    listener: TcpListener,
    mut shutdown: Shutdown,
    shutdown_complete_tx: mpsc::Sender<()>,
) {
    loop {
        let accepted = tokio::select! {
            res = listener.accept() => res,
            _ = shutdown.recv() => break,
        };

        let (socket, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                if shutdown.is_shutdown() {
                    break;
                }
                warn!(error = %e, "accept error, retrying");
                continue;
            }
        };

        let max_conn = shared.opts.max_conn();
        if max_conn > 0 && shared.active() >= max_conn as i64 {
            warn!(
                max_conn,
                active = shared.active(),
                "reject connection: max connections reached"
            );
            drop(socket);
            continue;
        }

        let (reader, writer) = socket.into_split();
        let id = shared.generate_id(&peer);
        let conn = Arc::new(ConnContext::new(id, peer.to_string(), writer));
        conn.touch();

        if let Err(e) = shared.handler.on_accept(&conn) {
            warn!(conn_id = %conn.id(), error = %e, "connection rejected by handler");
            // never registered, so no on_disconnect; dropping the halves
            // closes the socket
            continue;
        }

        shared
            .conns
            .lock()
            .insert(conn.id().to_string(), conn.clone());
        shared.metrics.active.fetch_add(1, Ordering::Relaxed);
        debug!(conn_id = %conn.id(), active = shared.active(), "connection accepted");

        let shared = shared.clone();
        let conn_shutdown = Shutdown::new(&shared.notify_shutdown);
        let complete_tx = shutdown_complete_tx.clone();
        tokio::spawn(async move {
            connection_task(shared, conn, reader, conn_shutdown).await;
            drop(complete_tx);
        });
    }
    debug!("accept loop exited");
}

/// Runs the handler's `serve` until the peer goes away, an I/O error hits,
/// the record is closed administratively, or the server stops. Whichever
/// path wins the record's close latch reports the disconnect reason.
async fn connection_task(
    shared: Arc<Shared>,
    conn: Arc<ConnContext>,
    reader: OwnedReadHalf,
    mut shutdown: Shutdown,
) {
    let handler = shared.handler.clone();
    let served = tokio::select! {
        res = handler.serve(conn.clone(), reader) => Some(res),
        _ = conn.cancelled() => None,
        _ = shutdown.recv() => {
            shared.close_conn(&conn, ConnState::Closed, &DisconnectReason::ServerClosed);
            None
        }
    };

    match served {
        Some(Ok(())) => {
            shared.close_conn(&conn, ConnState::Closed, &DisconnectReason::PeerClosed);
        }
        Some(Err(e)) => {
            shared.close_conn(&conn, ConnState::Closed, &DisconnectReason::Io(e.to_string()));
        }
        // the closing path already recorded its reason
        None => {}
    }

    conn.release_writer().await;
}

async fn reaper_loop(shared: Arc<Shared>, mut shutdown: Shutdown, shutdown_complete_tx: mpsc::Sender<()>) {
    let _complete = shutdown_complete_tx;
    let tick = shared.opts.reap_tick();
    if tick.is_zero() {
        shutdown.recv().await;
        return;
    }
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + tick, tick);
    loop {
        tokio::select! {
            _ = interval.tick() => shared.reap_idle(),
            _ = shutdown.recv() => break,
        }
    }
    debug!("idle reaper exited");
}
