//
// Copyright (c) Dell Inc., or its subsidiaries. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//

//! Exponential backoff retry for the upstream controller calls the
//! coordinator fires after a state commit. Classification of whether an
//! error is worth retrying lives with the caller; this crate only owns the
//! backoff schedule and the retry loop.

use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy)]
pub struct RetryWithBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    max_attempts: u32,
}

impl Default for RetryWithBackoff {
    fn default() -> Self {
        RetryWithBackoff {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            max_attempts: 10,
        }
    }
}

impl RetryWithBackoff {
    pub fn new(initial_delay: Duration, max_delay: Duration, multiplier: f64, max_attempts: u32) -> Self {
        RetryWithBackoff {
            initial_delay,
            max_delay,
            multiplier,
            max_attempts,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let scaled = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        Duration::from_secs_f64(scaled).min(self.max_delay)
    }

    /// Runs `op` until it succeeds, `is_retryable` says to give up, or
    /// `max_attempts` is exhausted. The last error is returned on exhaustion.
    pub async fn retry<T, E, F, Fut, R>(&self, mut op: F, is_retryable: R) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    if attempt + 1 >= self.max_attempts || !is_retryable(&e) {
                        return Err(e);
                    }
                    let delay = self.delay_for_attempt(attempt);
                    warn!("attempt {} failed, retrying in {:?}", attempt, delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
