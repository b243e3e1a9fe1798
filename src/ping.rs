// Copyright (c) Loads Orchestrator Contributors
// SPDX-License-Identifier: Apache-2.0

//! HTTP liveness probe with exponential backoff and jitter (C3).
//!
//! Grounded on `Ping.ping` / `EC2Instance._ping` in
//! `original_source/loadsbroker/aws.py` and `extensions.py`. The original
//! `_ping` raises a bare `raise` on exhaustion (re-raising whatever the
//! last loop iteration's exception variable happened to hold); per spec
//! section 9's Open Questions this is pinned to raising a typed error
//! with the attempt count instead of replicating the ambiguity. Backoff
//! timing (growth and jitter) is delegated to the `backoff` crate rather
//! than hand-rolled, matching how the teacher workspace paces its own
//! retrying API calls.

use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use reqwest::Client;

use crate::error::{OrchestratorError, Result};

pub struct Pinger {
    client: Client,
}

impl Default for Pinger {
    fn default() -> Self {
        Self::new()
    }
}

impl Pinger {
    pub fn new() -> Self {
        Self {
            // `Connection: close`, no redirects: each attempt is a fresh
            // probe of reachability, not a page fetch.
            client: Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .build()
                .expect("reqwest client"),
        }
    }

    /// Issues HEAD requests against `url`, retrying connection failures
    /// with exponential backoff + jitter. Non-connection errors (HTTP >=
    /// 400) count as success: the endpoint is reachable, it just didn't
    /// like this particular request.
    pub async fn ping(&self, url: &str) -> Result<()> {
        self.ping_with(url, 5, Duration::from_millis(500), Duration::from_secs(2), Duration::from_secs(15))
            .await
    }

    pub async fn ping_with(
        &self,
        url: &str,
        attempts: u32,
        initial_interval: Duration,
        max_interval: Duration,
        max_elapsed_time: Duration,
    ) -> Result<()> {
        let mut backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(initial_interval)
            .with_max_interval(max_interval)
            .with_max_elapsed_time(Some(max_elapsed_time))
            .build();

        let mut attempt = 1;
        loop {
            let request = self
                .client
                .head(url)
                .header("Connection", "close")
                .build()
                .map_err(|_| OrchestratorError::Ping { url: url.to_string(), attempts: attempt })?;

            match self.client.execute(request).await {
                Ok(_response) => return Ok(()),
                Err(e) if e.is_connect() || e.is_timeout() => {
                    let Some(delay) = (attempt < attempts).then(|| backoff.next_backoff()).flatten() else {
                        return Err(OrchestratorError::Ping { url: url.to_string(), attempts: attempt });
                    };
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                // A non-connection error (HTTP status, TLS handshake
                // completed but server rejected the method, etc.) means
                // the endpoint answered: treat it as reachable.
                Err(_) => return Ok(()),
            }
        }
    }
}
