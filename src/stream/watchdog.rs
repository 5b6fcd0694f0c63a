//! Heartbeat watchdog for long-lived connections.
//!
//! The delta endpoint writes a bare newline at a fixed cadence when it has
//! nothing else to send. A connection that delivers no bytes at all for the
//! configured timeout is considered stalled even though the socket is open.

use std::pin::Pin;
use std::time::Duration;

use tokio::time::{Instant, Sleep};

/// Single resettable deadline that fires once per arming.
#[derive(Debug)]
pub struct Watchdog {
    timeout: Duration,
    deadline: Option<Pin<Box<Sleep>>>,
}

impl Watchdog {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            deadline: None,
        }
    }

    /// Starts the countdown from now.
    pub fn arm(&mut self, timeout: Duration) {
        self.timeout = timeout;
        self.deadline = Some(Box::pin(tokio::time::sleep(timeout)));
    }

    /// Pushes the deadline out by a full timeout. No-op when disarmed.
    pub fn on_data(&mut self) {
        if let Some(deadline) = self.deadline.as_mut() {
            deadline.as_mut().reset(Instant::now() + self.timeout);
        }
    }

    pub fn disarm(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Resolves when the armed deadline passes, then disarms.
    ///
    /// Never resolves while disarmed. Cancel safe: dropping the future keeps
    /// the deadline intact for the next poll.
    pub async fn stalled(&mut self) {
        match self.deadline.as_mut() {
            Some(deadline) => {
                deadline.as_mut().await;
                self.deadline = None;
            }
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::Instant;

    use super::Watchdog;

    const TIMEOUT: Duration = Duration::from_secs(15);

    #[tokio::test(start_paused = true)]
    async fn fires_after_timeout_without_data() {
        let mut watchdog = Watchdog::new(TIMEOUT);
        let started = Instant::now();
        watchdog.arm(TIMEOUT);
        watchdog.stalled().await;
        assert_eq!(started.elapsed(), TIMEOUT);
        assert!(!watchdog.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn data_pushes_deadline_out() {
        let mut watchdog = Watchdog::new(TIMEOUT);
        let started = Instant::now();
        watchdog.arm(TIMEOUT);

        tokio::time::advance(Duration::from_secs(10)).await;
        watchdog.on_data();
        tokio::time::advance(Duration::from_secs(10)).await;
        watchdog.on_data();

        watchdog.stalled().await;
        assert_eq!(started.elapsed(), Duration::from_secs(35));
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_per_arming() {
        let mut watchdog = Watchdog::new(TIMEOUT);
        watchdog.arm(TIMEOUT);
        watchdog.stalled().await;

        let second = tokio::time::timeout(Duration::from_secs(60), watchdog.stalled()).await;
        assert!(second.is_err(), "disarmed watchdog must not fire again");

        watchdog.arm(TIMEOUT);
        let rearmed = tokio::time::timeout(Duration::from_secs(60), watchdog.stalled()).await;
        assert!(rearmed.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn disarm_is_idempotent_and_silences() {
        let mut watchdog = Watchdog::new(TIMEOUT);
        watchdog.disarm();
        watchdog.arm(TIMEOUT);
        watchdog.disarm();
        watchdog.disarm();
        watchdog.on_data();
        assert!(!watchdog.is_armed());

        let fired = tokio::time::timeout(Duration::from_secs(60), watchdog.stalled()).await;
        assert!(fired.is_err());
    }
}
