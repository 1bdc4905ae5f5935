//! Admission control run before any payload conversion: a global request
//! rate limit and an optional operator approval prompt.

use std::io::{self, BufRead, Write};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use governor::clock::{Clock, DefaultClock};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::GatewayError;

/// At most one request per `interval`, either rejected with 429 or delayed
/// until the window opens
pub struct RequestLimiter {
    limiter: DefaultDirectRateLimiter,
    wait: bool,
}

impl RequestLimiter {
    pub fn new(interval: Duration, wait: bool) -> Result<Self> {
        let quota = Quota::with_period(interval)
            .context("rate limit interval must be > 0")?
            .allow_burst(NonZeroU32::MIN);

        Ok(Self {
            limiter: RateLimiter::direct(quota),
            wait,
        })
    }

    pub async fn acquire(&self) -> Result<(), GatewayError> {
        if self.wait {
            self.limiter.until_ready().await;
            return Ok(());
        }

        self.limiter.check().map_err(|not_until| {
            let retry_after = not_until.wait_time_from(DefaultClock::default().now());
            debug!(?retry_after, "rate limit exceeded");
            GatewayError::RateLimited {
                retry_after: retry_after.as_secs().max(1),
            }
        })
    }
}

type Prompt = dyn Fn(&str) -> Result<bool> + Send + Sync;

/// Asks the operator before each request is forwarded. Prompts are
/// serialized so only one question is on the terminal at a time.
pub struct ApprovalGate {
    prompt: Option<Arc<Prompt>>,
    lock: Mutex<()>,
}

impl ApprovalGate {
    pub fn disabled() -> Self {
        Self {
            prompt: None,
            lock: Mutex::new(()),
        }
    }

    pub fn terminal() -> Self {
        Self::with_prompt(prompt_yes_no)
    }

    pub fn with_prompt(prompt: impl Fn(&str) -> Result<bool> + Send + Sync + 'static) -> Self {
        Self {
            prompt: Some(Arc::new(prompt)),
            lock: Mutex::new(()),
        }
    }

    pub async fn approve(&self, summary: &str) -> Result<(), GatewayError> {
        let Some(prompt) = self.prompt.clone() else {
            return Ok(());
        };

        let _guard = self.lock.lock().await;
        let question = format!("Forward request {}?", summary);
        let approved = tokio::task::spawn_blocking(move || prompt(&question))
            .await
            .context("approval prompt task failed")??;

        if approved {
            Ok(())
        } else {
            info!(summary, "request rejected by operator");
            Err(GatewayError::Rejected)
        }
    }
}

fn prompt_yes_no(question: &str) -> Result<bool> {
    print!("{} [Y/n] ", question);
    io::stdout().flush()?;

    Ok(read_answer(io::stdin().lock())?)
}

/// A closed input counts as a refusal, not as the empty default answer
fn read_answer(mut reader: impl BufRead) -> io::Result<bool> {
    let mut input = String::new();
    if reader.read_line(&mut input)? == 0 {
        return Ok(false);
    }
    Ok(is_yes(&input))
}

fn is_yes(input: &str) -> bool {
    let input = input.trim().to_lowercase();
    input.is_empty() || input == "y" || input == "yes"
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn second_request_in_window_is_rejected() {
        let limiter = RequestLimiter::new(Duration::from_secs(60), false).unwrap();
        assert!(limiter.acquire().await.is_ok());
        match limiter.acquire().await {
            Err(GatewayError::RateLimited { retry_after }) => assert!(retry_after >= 1),
            other => panic!("expected rate limit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn waiting_limiter_delays_instead_of_failing() {
        let limiter = RequestLimiter::new(Duration::from_millis(50), true).unwrap();
        let start = std::time::Instant::now();
        limiter.acquire().await.unwrap();
        limiter.acquire().await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn zero_interval_is_a_config_error() {
        assert!(RequestLimiter::new(Duration::ZERO, false).is_err());
    }

    #[tokio::test]
    async fn approval_gate_maps_answers() {
        let asked = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&asked);
        let gate = ApprovalGate::with_prompt(move |question| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(question.contains("gpt-5"))
        });

        assert!(gate.approve("model=gpt-5").await.is_ok());
        assert!(matches!(
            gate.approve("model=gpt-4o").await,
            Err(GatewayError::Rejected)
        ));
        assert_eq!(asked.load(Ordering::SeqCst), 2);

        assert!(ApprovalGate::disabled().approve("anything").await.is_ok());
    }

    #[test]
    fn closed_input_is_a_refusal() {
        assert!(!read_answer(io::empty()).unwrap());
        assert!(read_answer("\n".as_bytes()).unwrap());
        assert!(!read_answer("n\n".as_bytes()).unwrap());
    }

    #[test]
    fn empty_answer_means_yes() {
        assert!(is_yes("\n"));
        assert!(is_yes("Y\n"));
        assert!(is_yes(" yes "));
        assert!(!is_yes("n\n"));
        assert!(!is_yes("nope"));
    }
}
