// Copyright (c) Loads Orchestrator Contributors
// SPDX-License-Identifier: Apache-2.0

//! Generalizes `original_source/loadsbroker/util.py::retry`: retry an
//! async operation a fixed number of times with exponential backoff
//! between attempts, logging each failure, and surfacing the last error
//! once attempts are exhausted (spec sections 4.7 and 7: transient pool
//! API errors are retried with exponential backoff up to 3 attempts).

use std::future::Future;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use tracing::debug;

/// Retries `op` up to `attempts` times, the same exponential-backoff+
/// jitter pacing `Pinger` uses (`ping.rs`). The first attempt counts as
/// attempt 1. Returns the last error if every attempt fails.
pub async fn retry_async<T, E, F, Fut>(attempts: u32, mut op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Debug,
{
    let mut backoff = ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(100))
        .with_max_interval(Duration::from_secs(5))
        .with_max_elapsed_time(None)
        .build();

    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if attempt >= attempts {
                    return Err(e);
                }
                let delay = backoff.next_backoff().unwrap_or(Duration::from_secs(5));
                debug!(attempt, attempts, delay = ?delay, error = ?e, "attempt failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_after_retries() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> = retry_async(3, |attempt| {
            let calls = &calls;
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if attempt < 3 {
                    Err("not yet")
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_attempts() {
        let result: Result<u32, &str> = retry_async(2, |_| async { Err("always") }).await;
        assert_eq!(result, Err("always"));
    }
}
