// Copyright (c) Loads Orchestrator Contributors
// SPDX-License-Identifier: Apache-2.0

//! Broker-wide configuration.
//!
//! Grounded on the constructor parameters of `EC2Pool` and `Broker` in
//! `original_source/loadsbroker/aws.py` and `broker.py`, and on the
//! `HekaOptions`/`InfluxOptions` surface referenced (but not defined) by
//! `original_source/loadsbroker/extensions.py`.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The fixed set of regions the pool is willing to operate in. A real
/// deployment narrows this via `Settings::regions`; this is the full
/// catalog `available_instance`/AMI lookups may be asked about.
pub const ALL_REGIONS: &[&str] = &[
    "ap-northeast-1",
    "ap-southeast-1",
    "ap-southeast-2",
    "eu-west-1",
    "sa-east-1",
    "us-east-1",
    "us-west-1",
    "us-west-2",
];

/// Remote endpoint for the Heka log forwarder central collector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HekaOptions {
    pub host: String,
    pub port: u16,
    pub secure: bool,
}

/// Remote endpoint for the InfluxDB sink CAdvisor/Heka report metrics to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfluxOptions {
    pub host: String,
    pub port: u16,
    pub secure: bool,
    pub user: String,
    pub password: String,
}

/// AWS credentials for the broker. When both fields are `None`, the
/// standard AWS credential provider chain (environment, profile, IMDS) is
/// used, matching `aws_access_key_id=None` defaulting to boto's own
/// resolution in the original implementation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AwsCredentials {
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

/// Top-level broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Identifies this broker's instances: `Name=loads-<broker_id>`.
    pub broker_id: String,
    pub credentials: AwsCredentials,
    /// Regions this broker is allowed to allocate in.
    pub regions: Vec<String>,
    pub key_pair: String,
    pub security_group: String,
    /// Cloud-init user-data applied to newly created instances, if any.
    pub user_data: Option<String>,
    /// Production deploys tag-filter their instance listing; tests
    /// disable this so a bare mock EC2 responds to unfiltered queries.
    pub use_filters: bool,
    pub ami_owner_id: String,
    /// Idle duration after which the pool's free instances are eligible
    /// for reaping during shutdown.
    pub max_idle: Duration,
    pub ssh_user: String,
    pub ssh_key_path: String,
    pub heka: Option<HekaOptions>,
    pub influx: Option<InfluxOptions>,
    /// AWS account credentials profile used for Watcher containers that
    /// need to self-describe the instance fleet.
    pub watcher_aws_credentials: Option<AwsCredentials>,
}

impl Settings {
    pub fn is_known_region(&self, region: &str) -> bool {
        self.regions.iter().any(|r| r == region)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_minimal_settings() {
        let json = r#"{
            "broker_id": "1234",
            "credentials": {},
            "regions": ["us-west-2"],
            "key_pair": "loads",
            "security_group": "loads",
            "user_data": null,
            "use_filters": true,
            "ami_owner_id": "595879546273",
            "max_idle": {"secs": 600, "nanos": 0},
            "ssh_user": "core",
            "ssh_key_path": "/keys/loads.pem",
            "heka": null,
            "influx": null,
            "watcher_aws_credentials": null
        }"#;
        let settings: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.broker_id, "1234");
        assert!(settings.is_known_region("us-west-2"));
        assert!(!settings.is_known_region("eu-west-1"));
    }
}
