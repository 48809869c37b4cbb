//! Time budgets for a request.
//!
//! Three independent budgets:
//!
//! * `connect` applies to each TCP connect attempt (and is the lease wait
//!   bound for a blocking pool).
//! * `read` applies to each individual socket read after connect.
//! * `total` bounds the whole request from the moment [`Timeout::start`]
//!   is called. For streaming bodies this includes user-controlled reads:
//!   a response body read past the total deadline fails with
//!   [`Error::ReadTimeout`].
//!
//! A [`Deadline`] is created once per request entry and carried across
//! retries. The retry controller does not restart it; resetting requires
//! constructing a fresh `Timeout` and calling `start()` again.

use std::time::{Duration, Instant};

use crate::Error;

/// Connect/read/total budgets. `None` means unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timeout {
    /// Budget for each TCP connect attempt.
    pub connect: Option<Duration>,
    /// Budget for each individual socket read.
    pub read: Option<Duration>,
    /// Budget for the entire request.
    pub total: Option<Duration>,
}

impl Timeout {
    /// No limits at all.
    pub const NONE: Timeout = Timeout {
        connect: None,
        read: None,
        total: None,
    };

    pub const fn new(connect: Option<Duration>, read: Option<Duration>) -> Timeout {
        Timeout {
            connect,
            read,
            total: None,
        }
    }

    /// The same budget for both the connect and the read phase.
    pub const fn per_phase(d: Duration) -> Timeout {
        Timeout {
            connect: Some(d),
            read: Some(d),
            total: None,
        }
    }

    /// A single combined budget for the entire request.
    pub const fn total(d: Duration) -> Timeout {
        Timeout {
            connect: None,
            read: None,
            total: Some(d),
        }
    }

    /// Capture the monotonic start for deadline arithmetic.
    pub fn start(&self) -> Deadline {
        let start = Instant::now();
        Deadline {
            timeout: *self,
            total_deadline: self.total.map(|d| start + d),
        }
    }
}

/// A started [`Timeout`].
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    timeout: Timeout,
    total_deadline: Option<Instant>,
}

impl Deadline {
    /// Remaining budget for a connect attempt, bounded by the total.
    ///
    /// `Ok(None)` means unbounded. Errors with [`Error::ConnectTimeout`]
    /// once the total budget is spent.
    pub fn connect_timeout(&self) -> Result<Option<Duration>, Error> {
        self.phase_timeout(self.timeout.connect, Error::ConnectTimeout)
    }

    /// Remaining budget for a single read, bounded by the total.
    ///
    /// Errors with [`Error::ReadTimeout`] once the total budget is spent.
    pub fn read_timeout(&self) -> Result<Option<Duration>, Error> {
        self.phase_timeout(self.timeout.read, Error::ReadTimeout)
    }

    /// Time left of the total budget, `None` when unbounded.
    pub fn total_remaining(&self) -> Option<Duration> {
        self.total_deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// A zero budget is already exhausted: `TcpStream` rejects zero
    /// socket timeouts, so it must never reach the transport.
    fn phase_timeout(
        &self,
        phase: Option<Duration>,
        exhausted: Error,
    ) -> Result<Option<Duration>, Error> {
        let effective = match self.total_remaining() {
            Some(rem) => Some(match phase {
                Some(p) => p.min(rem),
                None => rem,
            }),
            None => phase,
        };
        match effective {
            Some(t) if t.is_zero() => Err(exhausted),
            other => Ok(other),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unbounded_by_default() {
        let d = Timeout::NONE.start();
        assert_eq!(d.connect_timeout().unwrap(), None);
        assert_eq!(d.read_timeout().unwrap(), None);
        assert_eq!(d.total_remaining(), None);
    }

    #[test]
    fn phase_budget_without_total() {
        let t = Timeout::new(Some(Duration::from_secs(3)), Some(Duration::from_secs(7)));
        let d = t.start();
        assert_eq!(d.connect_timeout().unwrap(), Some(Duration::from_secs(3)));
        assert_eq!(d.read_timeout().unwrap(), Some(Duration::from_secs(7)));
    }

    #[test]
    fn total_caps_phase_budget() {
        let t = Timeout {
            connect: Some(Duration::from_secs(60)),
            read: None,
            total: Some(Duration::from_secs(5)),
        };
        let d = t.start();
        let c = d.connect_timeout().unwrap().unwrap();
        assert!(c <= Duration::from_secs(5));
        // read has no own budget but inherits the total bound
        let r = d.read_timeout().unwrap().unwrap();
        assert!(r <= Duration::from_secs(5));
    }

    #[test]
    fn exhausted_total_raises_per_phase_kind() {
        let t = Timeout::total(Duration::from_millis(0));
        let d = t.start();
        assert!(matches!(d.connect_timeout(), Err(Error::ConnectTimeout)));
        assert!(matches!(d.read_timeout(), Err(Error::ReadTimeout)));
    }
}
