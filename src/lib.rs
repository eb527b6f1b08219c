#![forbid(unsafe_code)]

// Stream coordinator library - session/room coordination in front of a mediasoup SFU

pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod host;
pub mod media;
pub mod metrics;
pub mod room;
pub mod session;
pub mod signaling;
