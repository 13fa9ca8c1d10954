//! Wellcall API Library Crate
//!
//! This library contains the core logic for the wellness voice-call service:
//! configuration, database access, the telephony and voice-AI provider
//! clients, the media-stream bridge, the call scheduler, REST handlers, and
//! routing. The `api` binary is a thin wrapper around this library.

pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod models;
pub mod router;
pub mod scheduler;
pub mod state;
pub mod telephony;
pub mod voice;
pub mod ws;
