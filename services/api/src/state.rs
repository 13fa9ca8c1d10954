//! Shared application state handed to every handler and background task.

use std::sync::Arc;

use crate::config::Config;
use crate::db::Db;
use crate::telephony::TelephonyGateway;
use crate::voice::VoiceAgent;

pub struct AppState {
    pub db: Arc<Db>,
    pub telephony: Arc<dyn TelephonyGateway>,
    pub voice: Arc<dyn VoiceAgent>,
    pub config: Arc<Config>,
}
