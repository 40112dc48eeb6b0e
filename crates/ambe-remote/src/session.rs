use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Control messages exchanged on [`CONTROL_TAG`](crate::wire::CONTROL_TAG).
///
/// The server speaks first: `Hello` with the leased channel and the chip's
/// current parity setting, or `Busy` when every channel is taken. After
/// that, `Ping`/`Pong` are the only control traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionMessage {
    Hello { channel: u8, uses_parity: bool },
    Busy { reason: String },
    Ping { seq: u64 },
    Pong { seq: u64 },
}

impl SessionMessage {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}
