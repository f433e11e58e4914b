//! Bounded fixed-interval polling.
//!
//! Both waiting stages of an issuance (DNS propagation and ACME order status) share this loop:
//! probe, sleep `interval`, probe again, and give up once `timeout` has elapsed. Giving up is not
//! an error here; each caller turns it into the failure that fits its stage.

use std::{future::Future, time::Duration};

use tokio::time::{sleep, Instant};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Poller {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Poller {
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Poller { interval, timeout }
    }

    /// Runs `probe` until it yields `Some`, fails, or the timeout elapses.
    ///
    /// The probe always runs at least once. `Ok(None)` means the timeout elapsed without the
    /// probe producing a value.
    pub async fn poll<T, F, Fut>(&self, mut probe: F) -> Result<Option<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        // no deadline when the timeout does not fit in an Instant
        let deadline = Instant::now().checked_add(self.timeout);
        let mut attempt = 1u32;

        loop {
            if let Some(value) = probe().await? {
                return Ok(Some(value));
            }

            let now = Instant::now();
            let pause = match deadline {
                Some(deadline) if now >= deadline => {
                    log::debug!("giving up after {attempt} attempts ({:?})", self.timeout);
                    return Ok(None);
                }
                Some(deadline) => self.interval.min(deadline - now),
                None => self.interval,
            };

            log::trace!("attempt {attempt} pending, next in {pause:?}");
            sleep(pause).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::Error;

    fn fast() -> Poller {
        Poller::new(Duration::from_millis(1), Duration::from_millis(50))
    }

    #[tokio::test]
    async fn test_poll_returns_first_value() {
        let calls = &AtomicU32::new(0);

        let res = fast()
            .poll(move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Ok((n == 3).then_some(n))
            })
            .await
            .unwrap();

        assert_eq!(res, Some(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_poll_times_out() {
        let calls = &AtomicU32::new(0);

        let res: Option<()> = fast()
            .poll(move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            })
            .await
            .unwrap();

        assert_eq!(res, None);
        assert!(calls.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_poll_probes_once_with_zero_timeout() {
        let calls = &AtomicU32::new(0);
        let poller = Poller::new(Duration::from_secs(1), Duration::ZERO);

        let res: Option<()> = poller
            .poll(move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            })
            .await
            .unwrap();

        assert_eq!(res, None);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_poll_with_oversized_timeout() {
        let calls = &AtomicU32::new(0);
        let poller = Poller::new(Duration::from_millis(1), Duration::MAX);

        let res = poller
            .poll(move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Ok((n == 2).then_some(n))
            })
            .await
            .unwrap();

        assert_eq!(res, Some(2));
    }

    #[tokio::test]
    async fn test_poll_propagates_probe_error() {
        let res: Result<Option<()>> = fast()
            .poll(|| async { Err(Error::Transport("boom".to_owned())) })
            .await;

        assert!(matches!(res, Err(Error::Transport(_))));
    }
}
