//! Per-connection session.
//!
//! A session tracks where its client is in the join handshake and owns the
//! client's outbound queue. `send` may be called from any thread (the
//! scheduler's broadcast and I/O-task replies race freely); each session has a
//! single writer task that drains its queue one frame at a time, so:
//! - frames reach the transport in `send` order,
//! - at most one write is in flight per connection,
//! - a stalled client only backs up its own queue.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
};

use arena_shared::{transport::MessageSink, world::PlayerId};
use bytes::Bytes;
use tokio::{
    runtime::Handle,
    sync::{mpsc, watch},
};
use tracing::{debug, info, warn};

/// Process-unique session identifier.
pub type SessionId = u64;

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accepted, transport not yet ready.
    Connecting,
    /// Transport ready, waiting for a join request.
    AwaitingJoin,
    /// Owns a player slot.
    Joined,
    /// Transport failed or client left. Terminal.
    Closed,
}

#[derive(Debug)]
struct Membership {
    state: SessionState,
    player_id: Option<PlayerId>,
    nickname: Option<String>,
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Server-side state for one client connection.
pub struct Session {
    id: SessionId,
    peer: Option<SocketAddr>,
    membership: Mutex<Membership>,
    outbox: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    queued: AtomicUsize,
    writing: AtomicBool,
    closed: watch::Sender<bool>,
}

impl Session {
    /// Creates a session and spawns its writer on `runtime`.
    pub fn new(
        id: SessionId,
        peer: Option<SocketAddr>,
        sink: Box<dyn MessageSink>,
        runtime: &Handle,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        let session = Arc::new(Self {
            id,
            peer,
            membership: Mutex::new(Membership {
                state: SessionState::Connecting,
                player_id: None,
                nickname: None,
            }),
            outbox: Mutex::new(Some(tx)),
            queued: AtomicUsize::new(0),
            writing: AtomicBool::new(false),
            closed,
        });
        runtime.spawn(write_loop(Arc::downgrade(&session), rx, sink));
        session
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn state(&self) -> SessionState {
        lock(&self.membership).state
    }

    pub fn player_id(&self) -> Option<PlayerId> {
        lock(&self.membership).player_id
    }

    pub fn nickname(&self) -> Option<String> {
        lock(&self.membership).nickname.clone()
    }

    pub fn is_joined(&self) -> bool {
        self.state() == SessionState::Joined
    }

    pub fn is_alive(&self) -> bool {
        self.state() != SessionState::Closed
    }

    /// Frames accepted by `send` and not yet written.
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    /// Whether the writer is inside a transport write right now.
    pub fn is_writing(&self) -> bool {
        self.writing.load(Ordering::Acquire)
    }

    /// `Connecting -> AwaitingJoin`.
    pub fn mark_ready(&self) -> bool {
        let mut m = lock(&self.membership);
        if m.state != SessionState::Connecting {
            return false;
        }
        m.state = SessionState::AwaitingJoin;
        true
    }

    /// `AwaitingJoin -> Joined`, binding the session to a slot.
    pub fn complete_join(&self, player_id: PlayerId, nickname: &str) -> bool {
        let mut m = lock(&self.membership);
        if m.state != SessionState::AwaitingJoin {
            return false;
        }
        m.state = SessionState::Joined;
        m.player_id = Some(player_id);
        m.nickname = Some(nickname.to_string());
        true
    }

    /// Moves to `Closed` and discards anything still queued. Idempotent;
    /// returns `true` only for the call that actually closed the session.
    pub fn close(&self) -> bool {
        {
            let mut m = lock(&self.membership);
            if m.state == SessionState::Closed {
                return false;
            }
            m.state = SessionState::Closed;
        }
        // Dropping the sender wakes the writer so it can observe the close.
        lock(&self.outbox).take();
        self.queued.store(0, Ordering::Release);
        self.closed.send_replace(true);
        debug!(session_id = self.id, "Session closed");
        true
    }

    /// Resolves once the session is closed, immediately if it already is.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Appends a frame to the outbound queue. Returns `false` if the session
    /// is closed and the frame was dropped.
    pub fn send(&self, frame: Bytes) -> bool {
        let outbox = lock(&self.outbox);
        let Some(tx) = outbox.as_ref() else {
            return false;
        };
        self.queued.fetch_add(1, Ordering::AcqRel);
        if tx.send(frame).is_err() {
            self.dequeued();
            return false;
        }
        true
    }

    fn dequeued(&self) {
        let _ = self
            .queued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .field("player_id", &self.player_id())
            .field("queued", &self.queued())
            .finish()
    }
}

async fn write_loop(
    session: Weak<Session>,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    mut sink: Box<dyn MessageSink>,
) {
    while let Some(frame) = rx.recv().await {
        let Some(s) = session.upgrade() else {
            break;
        };
        if !s.is_alive() {
            break;
        }

        s.writing.store(true, Ordering::Release);
        let result = sink.send_frame(&frame).await;
        s.writing.store(false, Ordering::Release);
        s.dequeued();

        if let Err(e) = result {
            warn!(session_id = s.id, error = %e, "Send error");
            s.close();
            break;
        }
    }

    if let Err(e) = sink.close().await {
        debug!(error = %e, "Sink close failed");
    }
    if let Some(s) = session.upgrade() {
        info!(session_id = s.id, "Session writer stopped");
    }
}
