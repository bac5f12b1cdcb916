//! Bounded run-state probing of the managed service.

use std::thread;
use std::time::{Duration, Instant};

use crate::control::{ServiceControl, ServiceRunState};

/// Polls a [`ServiceControl`] backend until a target state or a deadline.
///
/// Every call issues fresh queries; nothing is cached between polls.
pub struct HealthProber<'a> {
    control: &'a dyn ServiceControl,
    timeout: Duration,
    poll_interval: Duration,
}

impl<'a> HealthProber<'a> {
    pub fn new(control: &'a dyn ServiceControl, timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            control,
            timeout,
            poll_interval,
        }
    }

    /// Single snapshot. Backend errors collapse to `Unknown`.
    pub fn probe(&self, service: &str) -> ServiceRunState {
        match self.control.query(service) {
            Ok(state) => state,
            Err(e) => {
                log::debug!("Failed to query {service}: {e:#}");
                ServiceRunState::Unknown
            }
        }
    }

    /// Poll until `target` is observed or the timeout elapses.
    ///
    /// At least one query is always made, even with a zero timeout.
    pub fn wait_for(&self, service: &str, target: ServiceRunState) -> bool {
        let deadline = Instant::now() + self.timeout;

        loop {
            let state = self.probe(service);
            if state == target {
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                log::warn!(
                    "{service} did not reach {target} within {:?} (last seen: {state})",
                    self.timeout
                );
                return false;
            }

            thread::sleep(self.poll_interval.min(deadline - now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Reports `before` for the first `flip_after` queries, then `after`.
    struct FlippingControl {
        queries: AtomicUsize,
        flip_after: usize,
        before: ServiceRunState,
        after: ServiceRunState,
    }

    impl FlippingControl {
        fn new(flip_after: usize, before: ServiceRunState, after: ServiceRunState) -> Self {
            Self {
                queries: AtomicUsize::new(0),
                flip_after,
                before,
                after,
            }
        }
    }

    impl ServiceControl for FlippingControl {
        fn query(&self, _service: &str) -> anyhow::Result<ServiceRunState> {
            let n = self.queries.fetch_add(1, Ordering::SeqCst);
            Ok(if n < self.flip_after { self.before } else { self.after })
        }

        fn start(&self, _service: &str) -> anyhow::Result<()> {
            Ok(())
        }

        fn stop(&self, _service: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct BrokenControl;

    impl ServiceControl for BrokenControl {
        fn query(&self, _service: &str) -> anyhow::Result<ServiceRunState> {
            anyhow::bail!("service manager unreachable")
        }

        fn start(&self, _service: &str) -> anyhow::Result<()> {
            Ok(())
        }

        fn stop(&self, _service: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn waits_until_the_service_reaches_the_target() {
        let control = FlippingControl::new(3, ServiceRunState::Unknown, ServiceRunState::Running);
        let prober = HealthProber::new(&control, Duration::from_secs(5), Duration::from_millis(1));

        assert!(prober.wait_for("agent", ServiceRunState::Running));
        assert_eq!(control.queries.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn gives_up_after_the_timeout() {
        let control = FlippingControl::new(usize::MAX, ServiceRunState::Stopped, ServiceRunState::Running);
        let prober = HealthProber::new(&control, Duration::from_millis(30), Duration::from_millis(5));

        let started = Instant::now();
        assert!(!prober.wait_for("agent", ServiceRunState::Running));
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn zero_timeout_still_queries_once() {
        let control = FlippingControl::new(0, ServiceRunState::Stopped, ServiceRunState::Stopped);
        let prober = HealthProber::new(&control, Duration::ZERO, Duration::from_millis(5));

        assert!(prober.wait_for("agent", ServiceRunState::Stopped));
        assert_eq!(control.queries.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn query_errors_read_as_unknown() {
        let prober = HealthProber::new(&BrokenControl, Duration::ZERO, Duration::from_millis(1));
        assert_eq!(prober.probe("agent"), ServiceRunState::Unknown);
        assert!(!prober.wait_for("agent", ServiceRunState::Running));
    }
}
