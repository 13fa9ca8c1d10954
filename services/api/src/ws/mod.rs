//! Realtime bridge between the telephony media stream and the
//! conversational-voice provider.

pub mod outbound;
pub mod protocol;
pub mod session;

pub use session::ws_handler;
