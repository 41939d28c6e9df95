//! Client-side stack for the SPICE main-channel guest agent protocol

pub mod bearer;
pub mod caps;
pub mod config;
pub mod framer;
pub mod portfwd;
pub mod protocol;
pub mod queue;
pub mod session;
pub mod transfer;
