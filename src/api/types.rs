//! REST API request/response types.

use serde::{Deserialize, Serialize};

use crate::types::Address;

/// `{"status":"ok"}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
}

impl StatusResponse {
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
        }
    }
}

/// Body of `PUT /users/{name}`.
///
/// Accepts either `{"address": {...}}` or the address object itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UpdateUserRequest {
    Wrapped { address: Address },
    Bare(Address),
}

impl UpdateUserRequest {
    pub fn address(&self) -> Address {
        match self {
            Self::Wrapped { address } | Self::Bare(address) => *address,
        }
    }
}
