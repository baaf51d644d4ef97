pub mod client;
pub mod conference;
pub mod config;
pub mod engine;
pub mod error;
pub mod media;
pub mod p2p;
pub mod sdp;
mod session;
pub mod signaling;
#[cfg(test)]
mod testing;
pub mod user_agent;

pub use crate::{client::ConnectionState, error::Error, error::Result};
