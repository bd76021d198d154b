//! Observer wire messages

use serde::{Deserialize, Serialize};

use super::snapshot::BattlefieldState;
use crate::combat::StateDelta;

/// Messages sent from server to observer
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Full snapshot sent on (re)subscribe
    Subscribed {
        encounter_id: String,
        state: BattlefieldState,
    },
    Unsubscribed {
        encounter_id: String,
    },
    /// One state change in a watched encounter
    Delta {
        encounter_id: String,
        delta: StateDelta,
    },
    Pong,
    Error {
        message: String,
    },
}

/// Messages sent from observer to server
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Subscribe { encounter_id: String },
    Unsubscribe { encounter_id: String },
    /// Keepalive
    Ping,
}
