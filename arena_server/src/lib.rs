//! `arena_server`
//!
//! Server-side systems:
//! - Fixed-rate tick scheduler on its own thread
//! - Per-connection sessions with ordered outbound mailboxes
//! - Join/input/jump/dummy request handling
//! - Snapshot broadcast to joined sessions
//!
//! Threading model:
//! - tokio runtime: accept loop, per-session read loops and writers
//! - tick thread: advance, snapshot, broadcast, prune

pub mod scheduler;
pub mod server;
pub mod session;

pub use scheduler::Scheduler;
pub use server::{bind_ephemeral, GameServer, RunningServer};
pub use session::{Session, SessionState};
