//! Response-body correctness probe
//!
//! The backend answers every route with `"0" × response-size`. The probe
//! keeps fetching until one body matches; a load balancer that is still
//! registering targets answers with errors or short bodies for a while.

use std::time::Duration;

use ekstest_common::poll::{poll, Attempt, PollSpec};
use ekstest_common::{CancellationToken, Error, ErrorKind, Result};
use tracing::{debug, info};

/// Attempts before the probe gives up
pub const CORRECTNESS_ATTEMPTS: u32 = 30;

/// Pause between attempts
pub const CORRECTNESS_INTERVAL: Duration = Duration::from_secs(5);

/// Fetch `url` until its body is `expected_size` zeros
#[derive(Debug, Clone)]
pub struct CorrectnessProbe {
    client: reqwest::Client,
    url: String,
    expected_size: usize,
    attempts: u32,
    every: Duration,
}

impl CorrectnessProbe {
    /// Probe with the default 30 attempts 5 s apart
    pub fn new(client: reqwest::Client, url: impl Into<String>, expected_size: usize) -> Self {
        Self {
            client,
            url: url.into(),
            expected_size,
            attempts: CORRECTNESS_ATTEMPTS,
            every: CORRECTNESS_INTERVAL,
        }
    }

    /// Override the retry schedule
    pub fn with_schedule(mut self, attempts: u32, every: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.every = every;
        self
    }

    async fn attempt(&self) -> Result<Attempt<()>> {
        let resp = match self.client.get(&self.url).send().await {
            Ok(resp) => resp,
            Err(e) => return Ok(Attempt::Retry(format!("GET {} failed: {}", self.url, e))),
        };
        let status = resp.status();
        let body = match resp.text().await {
            Ok(body) => body,
            Err(e) => return Ok(Attempt::Retry(format!("reading body failed: {}", e))),
        };
        if !status.is_success() {
            return Ok(Attempt::Retry(format!("status {}", status)));
        }
        Ok(body_matches(&body, self.expected_size))
    }

    /// Run the probe; a body that never matches is a `probe-assertion`
    pub async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        let spec = PollSpec::attempts(format!("correctness/{}", self.url), self.every, self.attempts);

        let result = poll(&spec, cancel, || async {
            let outcome = self.attempt().await?;
            if let Attempt::Retry(reason) = &outcome {
                debug!(url = %self.url, reason = %reason, "body not correct yet");
            }
            Ok(outcome)
        })
        .await;

        match result {
            Ok(()) => {
                info!(url = %self.url, size = self.expected_size, "response body verified");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::Timeout => {
                Err(Error::probe_assertion("correctness", e.to_string()))
            }
            Err(e) => Err(e),
        }
    }
}

/// Compare a response body with the expected zero-filled payload
pub fn body_matches(body: &str, expected_size: usize) -> Attempt<()> {
    if body.len() != expected_size {
        return Attempt::Retry(format!(
            "body is {} bytes, expected {}",
            body.len(),
            expected_size
        ));
    }
    match body.bytes().position(|b| b != b'0') {
        Some(at) => Attempt::Retry(format!("unexpected byte at offset {}", at)),
        None => Attempt::Done(()),
    }
}
