//! `arena_shared`
//!
//! Libraries used by both client and server.
//!
//! Design goals:
//! - Deterministic where practical (seedable RNGs, ordered iteration).
//! - Clear separation of concerns (net, transport, physics, world).
//! - Traits at the collaborator seams (physics backend, message sink).
//! - No `unsafe`.

pub mod config;
pub mod math;
pub mod net;
pub mod physics;
pub mod transport;
pub mod world;
