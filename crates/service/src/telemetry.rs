use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Periodic status report published on `{prefix}.{name}.telemetry`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Telemetry {
    /// Report counter in hex.
    pub nonce: String,

    /// Status values.
    pub status: BTreeMap<String, Value>,
}

/// Health check request received on `{prefix}.{name}.telemetry.ping`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryPing {
    /// Echoed back in the pong.
    pub nonce: String,

    /// Send time in unix nanoseconds.
    pub timestamp: String,
}

/// Health check answer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryPong {
    /// Nonce of the ping.
    pub nonce: String,

    /// Answer time in unix nanoseconds.
    pub timestamp: String,

    /// One-way latency in nanoseconds.
    pub owl: String,
}
