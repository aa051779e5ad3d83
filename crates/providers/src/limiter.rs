use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

const LOW_QUOTA: u64 = 5;
const LOW_QUOTA_SPACING_MS: u64 = 250;
const DEFAULT_RESUME: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
struct LimiterState {
    remaining: Option<u64>,
    resume_at: Option<Instant>,
}

/// Adaptive call pacing fed by provider-reported remaining-quota signals.
///
/// Shared across worker slots per provider. When the provider reports the
/// quota as exhausted (or a 429 arrives) callers wait until the reported
/// reset; when quota runs low, calls are spaced out instead of racing into
/// the limit.
#[derive(Default)]
pub struct AdaptiveLimiter {
    state: Mutex<LimiterState>,
}

impl AdaptiveLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record quota headers observed on a provider response.
    pub fn record_quota(&self, remaining: u64, reset_after: Option<Duration>) {
        let mut state = self.state.lock().expect("limiter lock");
        state.remaining = Some(remaining);
        if remaining == 0 {
            state.resume_at = Some(Instant::now() + reset_after.unwrap_or(DEFAULT_RESUME));
        }
    }

    /// Record a hard rate-limit rejection.
    pub fn record_exhausted(&self, retry_after: Option<Duration>) {
        let mut state = self.state.lock().expect("limiter lock");
        state.remaining = Some(0);
        state.resume_at = Some(Instant::now() + retry_after.unwrap_or(DEFAULT_RESUME));
    }

    /// Await until a call is allowed to proceed.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().expect("limiter lock");
                match state.resume_at {
                    Some(at) if at > Instant::now() => Some(at - Instant::now()),
                    Some(_) => {
                        state.resume_at = None;
                        state.remaining = None;
                        None
                    }
                    None => match state.remaining {
                        Some(remaining) if remaining < LOW_QUOTA => {
                            // Leave the recorded value in place; each pacer
                            // delay applies per call until fresh headers land.
                            Some(Duration::from_millis(
                                LOW_QUOTA_SPACING_MS * (LOW_QUOTA - remaining),
                            ))
                        }
                        _ => None,
                    },
                }
            };

            match wait {
                None => return,
                Some(delay) if delay.is_zero() => return,
                Some(delay) => {
                    debug!(
                        event_name = "provider.limiter.paced",
                        delay_ms = delay.as_millis() as u64,
                        "pacing provider call on low remaining quota"
                    );
                    tokio::time::sleep(delay).await;
                    let mut state = self.state.lock().expect("limiter lock");
                    if state.resume_at.is_none() {
                        // Paced delay served; allow the call through.
                        if let Some(remaining) = &mut state.remaining {
                            *remaining = remaining.saturating_add(1).min(LOW_QUOTA);
                        }
                        return;
                    }
                }
            }
        }
    }
}
