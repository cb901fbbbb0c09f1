//! `arena_client`
//!
//! Client-side systems:
//! - Connection and join handshake over the framed transport
//! - Input and command sending
//! - Snapshot reception
//! - Random-walk input for bots

pub mod client;
pub mod input;

pub use client::{ClientState, GameClient};
