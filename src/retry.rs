//! Bounded retry with backoff, shared by every session stage
//!
//! A stage runs its unit of work until it succeeds or the attempt budget is
//! spent, sleeping for the backoff between failed attempts. The controller
//! does not know which stage it drives beyond a label for logging.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::OtaError;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Pair,
    Connect,
    Send,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Pair => write!(f, "pair"),
            Stage::Connect => write!(f, "connect"),
            Stage::Send => write!(f, "send"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(rename = "backoff_ms", with = "crate::config::millis")]
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: DEFAULT_BACKOFF,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }
}

/// Where a controller is in its attempt loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    Idle,
    Attempting { attempt: u32 },
    Retrying { failed_attempts: u32 },
    Succeeded { attempts: u32 },
    Exhausted { attempts: u32 },
    Aborted { attempt: u32 },
}

#[derive(Debug)]
pub struct StageSuccess<T> {
    pub value: T,
    pub attempts: u32,
}

#[derive(Debug)]
pub enum StageFailure {
    /// Every attempt failed.
    Exhausted {
        stage: Stage,
        attempts: u32,
        last_error: Option<OtaError>,
    },
    /// An attempt hit an error retrying cannot fix.
    Aborted {
        stage: Stage,
        attempt: u32,
        error: OtaError,
    },
}

impl From<StageFailure> for OtaError {
    fn from(failure: StageFailure) -> Self {
        match failure {
            StageFailure::Exhausted {
                stage, attempts, ..
            } => OtaError::StageExhausted { stage, attempts },
            StageFailure::Aborted { error, .. } => error,
        }
    }
}

pub struct RetryController {
    stage: Stage,
    policy: RetryPolicy,
    state: StageState,
}

impl RetryController {
    pub fn new(stage: Stage, policy: RetryPolicy) -> Self {
        Self {
            stage,
            policy,
            state: StageState::Idle,
        }
    }

    pub fn state(&self) -> StageState {
        self.state
    }

    /// Drive `work` until it succeeds, the budget runs out, or it returns a
    /// fatal error. `work` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&mut self, mut work: F) -> Result<StageSuccess<T>, StageFailure>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, OtaError>>,
    {
        let max = self.policy.max_attempts;
        let mut attempt = 0;
        let mut last_error = None;

        while attempt < max {
            attempt += 1;
            self.state = StageState::Attempting { attempt };
            info!("[{}/{}] {}...", attempt, max, self.stage);

            match work(attempt).await {
                Ok(value) => {
                    self.state = StageState::Succeeded { attempts: attempt };
                    return Ok(StageSuccess {
                        value,
                        attempts: attempt,
                    });
                }
                Err(e) if e.is_fatal() => {
                    warn!("{} aborted on attempt {}: {}", self.stage, attempt, e);
                    self.state = StageState::Aborted { attempt };
                    return Err(StageFailure::Aborted {
                        stage: self.stage,
                        attempt,
                        error: e,
                    });
                }
                Err(e) => {
                    warn!("[{}/{}] {} failed: {}", attempt, max, self.stage, e);
                    last_error = Some(e);
                    if attempt < max {
                        self.state = StageState::Retrying {
                            failed_attempts: attempt,
                        };
                        tokio::time::sleep(self.policy.backoff).await;
                    }
                }
            }
        }

        self.state = StageState::Exhausted { attempts: attempt };
        Err(StageFailure::Exhausted {
            stage: self.stage,
            attempts: attempt,
            last_error,
        })
    }
}

/// Run a boolean unit of work under `policy`. Returns the overall outcome.
pub async fn run_with_retry<F, Fut>(stage: Stage, policy: RetryPolicy, mut attempt_fn: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let mut controller = RetryController::new(stage, policy);
    controller
        .run(|_| {
            let attempt = attempt_fn();
            async move {
                if attempt.await {
                    Ok(())
                } else {
                    Err(OtaError::AttemptFailed { stage })
                }
            }
        })
        .await
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::BleError;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_secs(1))
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_k_failures() {
        for k in 0..5u32 {
            let mut calls = 0u32;
            let ok = run_with_retry(Stage::Pair, policy(k + 1), || {
                calls += 1;
                let succeed = calls > k;
                async move { succeed }
            })
            .await;
            assert!(ok);
            assert_eq!(calls, k + 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_without_extra_calls() {
        let k = 4u32;
        for max_attempts in 1..=k {
            let mut calls = 0u32;
            let ok = run_with_retry(Stage::Connect, policy(max_attempts), || {
                calls += 1;
                let succeed = calls > k;
                async move { succeed }
            })
            .await;
            assert!(!ok);
            assert_eq!(calls, max_attempts);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_only_between_attempts() {
        let before = tokio::time::Instant::now();
        let ok = run_with_retry(Stage::Send, policy(3), || async { false }).await;
        assert!(!ok);
        // Three attempts, two sleeps; no sleep after the last failure.
        let elapsed = before.elapsed();
        assert!(elapsed >= Duration::from_secs(2));
        assert!(elapsed < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_attempts_never_runs() {
        let mut calls = 0u32;
        let ok = run_with_retry(Stage::Pair, policy(0), || {
            calls += 1;
            async { true }
        })
        .await;
        assert!(!ok);
        assert_eq!(calls, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_controller_reports_attempts() {
        let mut controller = RetryController::new(Stage::Connect, policy(10));
        assert_eq!(controller.state(), StageState::Idle);

        let success = controller
            .run(|attempt| async move {
                if attempt < 3 {
                    Err(OtaError::Ble(BleError::ConnectionError("unreachable".into())))
                } else {
                    Ok(attempt * 10)
                }
            })
            .await
            .unwrap();
        assert_eq!(success.value, 30);
        assert_eq!(success.attempts, 3);
        assert_eq!(controller.state(), StageState::Succeeded { attempts: 3 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_keeps_last_error() {
        let mut controller = RetryController::new(Stage::Send, policy(2));
        let failure = controller
            .run(|attempt| async move { Err::<(), _>(OtaError::ChunkWriteFailed { index: attempt as u8 }) })
            .await
            .unwrap_err();

        match failure {
            StageFailure::Exhausted {
                stage,
                attempts,
                last_error,
            } => {
                assert_eq!(stage, Stage::Send);
                assert_eq!(attempts, 2);
                assert!(matches!(last_error, Some(OtaError::ChunkWriteFailed { index: 2 })));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(controller.state(), StageState::Exhausted { attempts: 2 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_aborts_immediately() {
        let mut calls = 0u32;
        let mut controller = RetryController::new(Stage::Connect, policy(10));
        let failure = controller
            .run(|_| {
                calls += 1;
                async { Err::<(), _>(OtaError::PreconditionViolation("wrong characteristic".into())) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls, 1);
        assert!(matches!(failure, StageFailure::Aborted { attempt: 1, .. }));
        assert!(matches!(OtaError::from(failure), OtaError::PreconditionViolation(_)));
        assert_eq!(controller.state(), StageState::Aborted { attempt: 1 });
    }

    #[test]
    fn test_exhausted_converts_to_stage_error() {
        let err = OtaError::from(StageFailure::Exhausted {
            stage: Stage::Pair,
            attempts: 10,
            last_error: None,
        });
        assert_eq!(err.to_string(), "pair stage exhausted after 10 attempts");
    }

    #[test]
    fn test_policy_serde() {
        let policy: RetryPolicy = serde_json::from_str(r#"{"max_attempts": 3, "backoff_ms": 250}"#).unwrap();
        assert_eq!(policy, RetryPolicy::new(3, Duration::from_millis(250)));

        let defaults: RetryPolicy = serde_json::from_str("{}").unwrap();
        assert_eq!(defaults, RetryPolicy::default());
    }
}
