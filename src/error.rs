// Copyright (c) Loads Orchestrator Contributors
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy for the orchestrator core (spec section 7).

use std::time::Duration;

/// Errors that can surface out of the core to a caller of `RunManager` or
/// `InstancePool`. Per-instance and per-collection failures are swallowed
/// and recorded on the state bag / `RunningGroup` instead of propagating
/// here; only run-fatal conditions reach this type.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("malformed plan or unknown region: {0}")]
    Config(String),

    #[error("cloud provider refused to provision instances after retries: {0}")]
    Provision(String),

    #[error("instance unavailable: {0}")]
    InstanceUnavailable(String),

    #[error("collection drained to zero live members")]
    GroupExhausted,

    #[error("deadline of {0:?} exceeded waiting for {1}")]
    Timeout(Duration, String),

    #[error("transient API error (attempt {attempt}/{max_attempts}): {source}")]
    TransientApi {
        attempt: u32,
        max_attempts: u32,
        #[source]
        source: eyre::Report,
    },

    #[error("unknown region: {0}")]
    UnknownRegion(String),

    #[error("no AMI available for region {region} virtualization {virtualization}")]
    MissingAmi { region: String, virtualization: String },

    #[error("container runtime error: {0}")]
    Runtime(String),

    #[error("ping failed after {attempts} attempts: {url}")]
    Ping { url: String, attempts: u32 },

    #[error("ssh error: {0}")]
    Ssh(String),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// `TimeoutError` is treated as `InstanceUnavailable` by callers per spec
/// section 7; this helper encodes that translation in one place.
impl OrchestratorError {
    pub fn into_instance_unavailable(self) -> Self {
        match self {
            OrchestratorError::Timeout(dur, what) => OrchestratorError::InstanceUnavailable(
                format!("timed out after {dur:?} waiting for {what}"),
            ),
            other => other,
        }
    }
}
