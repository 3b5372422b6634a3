use rand::Rng;

use std::time::Duration;

use super::error::{Error, NetworkFailure};

/// Failures worth another attempt, each with its own delay schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Timeout,
    RateLimit,
    Server,
    Dns,
    Connect,
}

const CLASSES: usize = 5;

impl FailureClass {
    /// `None` for failures that must surface immediately.
    pub fn of(error: &Error) -> Option<Self> {
        match error {
            Error::Network { kind, .. } => Some(match kind {
                NetworkFailure::Timeout => FailureClass::Timeout,
                NetworkFailure::Dns => FailureClass::Dns,
                NetworkFailure::Connect => FailureClass::Connect,
            }),
            Error::RateLimited(_) => Some(FailureClass::RateLimit),
            Error::Server(_) => Some(FailureClass::Server),
            _ => None,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Extra attempts allowed per failure class within one logical request.
    pub max_retries: u32,
    /// Timeouts and connection failures: `timeout_base * 2^attempt`.
    pub timeout_base: Duration,
    pub rate_limit_delay: Duration,
    /// Server failures: `server_base * 2^attempt`, plus up to `server_jitter` of that, capped.
    pub server_base: Duration,
    pub server_jitter: f64,
    pub server_cap: Duration,
    /// DNS failures: `dns_first + dns_step * attempt`.
    pub dns_first: Duration,
    pub dns_step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 3,
            timeout_base: Duration::from_secs(1),
            rate_limit_delay: Duration::from_secs(5),
            server_base: Duration::from_secs(10),
            server_jitter: 0.1,
            server_cap: Duration::from_secs(60),
            dns_first: Duration::from_secs(3),
            dns_step: Duration::from_secs(2),
        }
    }
}

/* 2^16 is far beyond any cap; keeps the shift and multiplication in range */
const MAX_EXPONENT: u32 = 16;

impl RetryPolicy {
    /// Same attempt budget, no waiting between attempts.
    pub fn immediate() -> Self {
        RetryPolicy {
            timeout_base: Duration::ZERO,
            rate_limit_delay: Duration::ZERO,
            server_base: Duration::ZERO,
            server_cap: Duration::ZERO,
            dns_first: Duration::ZERO,
            dns_step: Duration::ZERO,
            ..RetryPolicy::default()
        }
    }

    /// Wait before retry number `attempt` (0-based) of a failure of `class`.
    pub fn delay(&self, class: FailureClass, attempt: u32) -> Duration {
        let doubling = 1u32 << attempt.min(MAX_EXPONENT);
        match class {
            FailureClass::Timeout | FailureClass::Connect => self.timeout_base * doubling,
            FailureClass::RateLimit => self.rate_limit_delay,
            FailureClass::Server => {
                let base = (self.server_base * doubling).min(self.server_cap);
                let jitter = rand::thread_rng().gen_range(0.0..=self.server_jitter.max(0.0));
                base.mul_f64(1.0 + jitter).min(self.server_cap)
            }
            FailureClass::Dns => self.dns_first + self.dns_step * attempt.min(MAX_EXPONENT),
        }
    }

    pub fn start(&self, operation: &'static str) -> Retry<'_> {
        Retry {
            policy: self,
            operation,
            attempts: [0; CLASSES],
            total: 0,
        }
    }
}

/// Attempt bookkeeping for one logical request.
pub struct Retry<'a> {
    policy: &'a RetryPolicy,
    operation: &'static str,
    attempts: [u32; CLASSES],
    total: u32,
}

impl Retry<'_> {
    /// Called with the error of a failed attempt. Sleeps and returns `Ok` if another attempt is
    /// allowed; otherwise hands back the error, wrapped in `Error::UpdateFailed` when it was
    /// retriable but the budget for its class is spent.
    pub async fn backoff(&mut self, error: Error) -> Result<(), Error> {
        self.total += 1;

        let class = match FailureClass::of(&error) {
            Some(class) => class,
            None => return Err(error),
        };

        let attempt = self.attempts[class.index()];
        if attempt >= self.policy.max_retries {
            log::error!(
                "{} failed after {} attempts: {}",
                self.operation,
                self.total,
                error
            );
            return Err(Error::UpdateFailed {
                attempts: self.total,
                cause: Box::new(error),
            });
        }

        let delay = self.policy.delay(class, attempt);
        log::warn!(
            "{} attempt {} failed ({:?}): {}; retrying in {:.1}s",
            self.operation,
            self.total,
            class,
            error,
            delay.as_secs_f64()
        );
        self.attempts[class.index()] += 1;
        tokio::time::sleep(delay).await;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn classification() {
        let timeout = Error::Network {
            kind: NetworkFailure::Timeout,
            message: String::new(),
        };
        assert_eq!(Some(FailureClass::Timeout), FailureClass::of(&timeout));
        assert_eq!(
            Some(FailureClass::RateLimit),
            FailureClass::of(&Error::RateLimited(String::new()))
        );
        assert_eq!(None, FailureClass::of(&Error::Permission(String::new())));
        assert_eq!(None, FailureClass::of(&Error::Authentication(String::new())));
        assert_eq!(None, FailureClass::of(&Error::Data(String::new())));
    }

    #[test]
    fn fixed_schedules() {
        let policy = RetryPolicy::default();
        let timeouts: Vec<_> = (0..3).map(|a| policy.delay(FailureClass::Timeout, a)).collect();
        assert_eq!(vec![secs(1), secs(2), secs(4)], timeouts);

        let dns: Vec<_> = (0..3).map(|a| policy.delay(FailureClass::Dns, a)).collect();
        assert_eq!(vec![secs(3), secs(5), secs(7)], dns);

        for attempt in 0..3 {
            assert_eq!(secs(5), policy.delay(FailureClass::RateLimit, attempt));
        }
    }

    #[test]
    fn server_schedule_is_jittered_and_capped() {
        let policy = RetryPolicy::default();
        for (attempt, base) in [(0, 10.0), (1, 20.0), (2, 40.0)] {
            let delay = policy.delay(FailureClass::Server, attempt).as_secs_f64();
            assert!(delay >= base && delay <= base * 1.1 + 1e-6, "{}", delay);
        }
        assert_eq!(secs(60), policy.delay(FailureClass::Server, 3));
        assert_eq!(secs(60), policy.delay(FailureClass::Server, u32::MAX));
    }

    #[tokio::test]
    async fn budget_is_per_class() {
        let policy = RetryPolicy::immediate();
        let mut retry = policy.start("test");

        for _ in 0..3 {
            assert!(retry.backoff(Error::Server(String::new())).await.is_ok());
        }
        /* a different class still has its own budget */
        assert!(retry.backoff(Error::RateLimited(String::new())).await.is_ok());

        match retry.backoff(Error::Server("last".into())).await {
            Err(Error::UpdateFailed { attempts, cause }) => {
                assert_eq!(5, attempts);
                assert!(matches!(*cause, Error::Server(ref m) if m == "last"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn non_retriable_errors_pass_through() {
        let policy = RetryPolicy::immediate();
        let mut retry = policy.start("test");
        assert!(matches!(
            retry.backoff(Error::Permission("code 8".into())).await,
            Err(Error::Permission(_))
        ));
    }
}
