//! Client-side bookkeeping for one outstanding call.
//!
//! A [`CallMatcher`] owns the transaction id, destination and retry schedule
//! of a single call. It never touches a socket: the datagram client asks it
//! what to do next (`poll_timer`) and whether a received datagram answers the
//! call (`accept`).

use std::net::SocketAddr;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::CallTiming;
use crate::message::read_xid;

/// Stand-in for deadlines too far away to represent.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `now + after`, clamped to a far-future instant when the sum overflows.
pub fn deadline_after(now: Instant, after: Duration) -> Instant {
    now.checked_add(after).unwrap_or_else(|| now + FAR_FUTURE)
}

/// Lifecycle of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// The request went out once.
    Sent,
    /// The request went out more than once.
    Retransmitted,
    /// A reply carrying our xid arrived.
    Matched,
    /// The total deadline passed.
    TimedOut,
    /// The caller aborted the call.
    Cancelled,
}

impl CallState {
    /// Returns `true` once no further I/O will happen for the call.
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            CallState::Matched | CallState::TimedOut | CallState::Cancelled
        )
    }
}

/// What the caller should do after consulting the timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    /// Keep waiting for a reply until the given instant.
    WaitUntil(Instant),
    /// The retransmit timer fired; send the request again.
    Retransmit,
    /// The total deadline passed.
    GiveUp,
}

/// One outstanding call: xid, destination, backoff schedule and deadline.
#[derive(Debug, Clone)]
pub struct CallMatcher {
    xid: u32,
    dest: SocketAddr,
    first_sent_at: Instant,
    next_retransmit_at: Instant,
    backoff: Duration,
    max_backoff: Duration,
    total_deadline: Instant,
    total_timeout: Duration,
    attempts: u32,
    state: CallState,
}

impl CallMatcher {
    /// Records the first transmission of a call made at `now`.
    pub fn new(xid: u32, dest: SocketAddr, timing: &CallTiming, now: Instant) -> Self {
        let mut matcher = Self {
            xid,
            dest,
            first_sent_at: now,
            next_retransmit_at: now,
            backoff: timing.initial_wait,
            max_backoff: timing.max_backoff.max(timing.initial_wait),
            total_deadline: deadline_after(now, timing.total_timeout),
            total_timeout: timing.total_timeout,
            attempts: 1,
            state: CallState::Sent,
        };
        matcher.arm(now);
        matcher
    }

    fn arm(&mut self, now: Instant) {
        self.next_retransmit_at = deadline_after(now, self.backoff);
        self.backoff = self.backoff.saturating_mul(2).min(self.max_backoff);
    }

    /// Transaction id of the call.
    pub fn xid(&self) -> u32 {
        self.xid
    }

    /// Where the call was sent.
    pub fn dest(&self) -> SocketAddr {
        self.dest
    }

    /// Transmissions so far, the first one included.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Current state.
    pub fn state(&self) -> CallState {
        self.state
    }

    /// When the request first went out.
    pub fn first_sent_at(&self) -> Instant {
        self.first_sent_at
    }

    /// When the retransmit timer fires next.
    pub fn next_retransmit_at(&self) -> Instant {
        self.next_retransmit_at
    }

    /// Absolute deadline of the call.
    pub fn total_deadline(&self) -> Instant {
        self.total_deadline
    }

    /// Configured total timeout, for error reporting.
    pub fn total_timeout(&self) -> Duration {
        self.total_timeout
    }

    /// The interval that will follow the next retransmission.
    pub fn current_backoff(&self) -> Duration {
        self.backoff
    }

    /// Earliest instant at which the caller needs to act again.
    pub fn next_wakeup(&self) -> Instant {
        self.next_retransmit_at.min(self.total_deadline)
    }

    /// Cheap pre-filter: does the datagram start with our xid?
    pub fn matches(&self, datagram: &[u8]) -> bool {
        read_xid(datagram) == Some(self.xid)
    }

    /// Offers a received datagram. Returns `true` and finishes the call if it
    /// carries our xid; anything else is left for the caller to discard.
    pub fn accept(&mut self, datagram: &[u8]) -> bool {
        if self.state.is_finished() || !self.matches(datagram) {
            return false;
        }
        self.state = CallState::Matched;
        true
    }

    /// Decides what to do at `now`. The deadline always wins over a
    /// retransmission that falls due at the same moment.
    pub fn poll_timer(&mut self, now: Instant) -> TimerAction {
        match self.state {
            CallState::TimedOut | CallState::Cancelled | CallState::Matched => {
                return TimerAction::GiveUp
            }
            CallState::Sent | CallState::Retransmitted => {}
        }
        if now >= self.total_deadline {
            self.state = CallState::TimedOut;
            return TimerAction::GiveUp;
        }
        if now >= self.next_retransmit_at {
            return TimerAction::Retransmit;
        }
        TimerAction::WaitUntil(self.next_wakeup())
    }

    /// Records that the request was sent again at `now` and re-arms the timer
    /// with the doubled (capped) interval.
    pub fn on_retransmit(&mut self, now: Instant) {
        if self.state.is_finished() {
            return;
        }
        self.attempts += 1;
        self.state = CallState::Retransmitted;
        self.arm(now);
    }

    /// Pushes a due retransmission back by `delay` without counting an
    /// attempt or advancing the backoff. Used when the socket could not take
    /// the datagram.
    pub fn defer_retransmit(&mut self, now: Instant, delay: Duration) {
        if self.state.is_finished() {
            return;
        }
        self.next_retransmit_at = deadline_after(now, delay);
    }

    /// Stops the call; no further retransmission will be requested.
    pub fn cancel(&mut self) {
        if !self.state.is_finished() {
            self.state = CallState::Cancelled;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dest() -> SocketAddr {
        "127.0.0.1:111".parse().unwrap()
    }

    fn timing(initial: u64, total: u64, max: u64) -> CallTiming {
        CallTiming {
            initial_wait: Duration::from_secs(initial),
            total_timeout: Duration::from_secs(total),
            max_backoff: Duration::from_secs(max),
        }
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        let t0 = Instant::now();
        let mut call = CallMatcher::new(7, dest(), &timing(1, 3600, 30), t0);
        let mut sent_at = t0;
        let mut intervals = Vec::new();
        for _ in 0..8 {
            let due = call.next_retransmit_at();
            intervals.push((due - sent_at).as_secs());
            assert_eq!(call.poll_timer(due), TimerAction::Retransmit);
            call.on_retransmit(due);
            sent_at = due;
        }
        assert_eq!(intervals, vec![1, 2, 4, 8, 16, 30, 30, 30]);
        assert_eq!(call.attempts(), 9);
        assert_eq!(call.state(), CallState::Retransmitted);
    }

    #[test]
    fn test_unbounded_total_timeout_does_not_overflow() {
        let t0 = Instant::now();
        let timing = CallTiming {
            initial_wait: Duration::from_secs(1),
            total_timeout: Duration::MAX,
            max_backoff: Duration::from_secs(30),
        };
        let mut call = CallMatcher::new(1, dest(), &timing, t0);
        assert!(call.total_deadline() > t0 + Duration::from_secs(86_400 * 365));
        let due = call.next_retransmit_at();
        assert_eq!(due - t0, Duration::from_secs(1));
        assert_eq!(call.poll_timer(due), TimerAction::Retransmit);
    }

    #[test]
    fn test_huge_backoff_saturates() {
        let t0 = Instant::now();
        let timing = CallTiming {
            initial_wait: Duration::from_secs(u64::MAX / 2 + 1),
            total_timeout: Duration::from_secs(10),
            max_backoff: Duration::MAX,
        };
        let mut call = CallMatcher::new(2, dest(), &timing, t0);
        assert_eq!(call.current_backoff(), Duration::MAX);
        assert_eq!(call.next_wakeup(), t0 + Duration::from_secs(10));
        call.on_retransmit(t0);
        assert_eq!(call.current_backoff(), Duration::MAX);
        assert_eq!(
            call.poll_timer(t0 + Duration::from_secs(10)),
            TimerAction::GiveUp
        );
    }

    #[test]
    fn test_deferred_retransmit_keeps_schedule() {
        let t0 = Instant::now();
        let mut call = CallMatcher::new(3, dest(), &timing(1, 60, 30), t0);
        let due = call.next_retransmit_at();
        assert_eq!(call.poll_timer(due), TimerAction::Retransmit);
        let backoff = call.current_backoff();

        call.defer_retransmit(due, Duration::from_millis(20));
        let retry = due + Duration::from_millis(20);
        assert_eq!(call.poll_timer(due), TimerAction::WaitUntil(retry));
        assert_eq!(call.attempts(), 1);
        assert_eq!(call.current_backoff(), backoff);
        assert_eq!(call.state(), CallState::Sent);
        assert_eq!(call.poll_timer(retry), TimerAction::Retransmit);
    }

    #[test]
    fn test_wait_until_retransmit_or_deadline() {
        let t0 = Instant::now();
        let mut call = CallMatcher::new(7, dest(), &timing(2, 5, 30), t0);
        assert_eq!(
            call.poll_timer(t0),
            TimerAction::WaitUntil(t0 + Duration::from_secs(2))
        );
        let t2 = t0 + Duration::from_secs(2);
        call.on_retransmit(t2);
        // Next retransmit would be t0+6s, past the deadline.
        assert_eq!(
            call.poll_timer(t2),
            TimerAction::WaitUntil(t0 + Duration::from_secs(5))
        );
    }

    #[test]
    fn test_gives_up_exactly_at_deadline() {
        let t0 = Instant::now();
        let mut call = CallMatcher::new(7, dest(), &timing(1, 5, 30), t0);
        let just_before = t0 + Duration::from_millis(4999);
        assert_ne!(call.poll_timer(just_before), TimerAction::GiveUp);
        assert_eq!(
            call.poll_timer(t0 + Duration::from_secs(5)),
            TimerAction::GiveUp
        );
        assert_eq!(call.state(), CallState::TimedOut);
    }

    #[test]
    fn test_accepts_only_own_xid() {
        let t0 = Instant::now();
        let mut call = CallMatcher::new(0x0102_0304, dest(), &timing(1, 5, 30), t0);
        assert!(!call.accept(&[0, 0, 0, 9, 1, 1]));
        assert!(!call.accept(&[1, 2]));
        assert_eq!(call.state(), CallState::Sent);
        assert!(call.accept(&[1, 2, 3, 4, 0xff]));
        assert_eq!(call.state(), CallState::Matched);
        assert_eq!(call.poll_timer(t0), TimerAction::GiveUp);
    }

    #[test]
    fn test_cancel_stops_retransmission() {
        let t0 = Instant::now();
        let mut call = CallMatcher::new(1, dest(), &timing(1, 5, 30), t0);
        call.cancel();
        assert_eq!(call.state(), CallState::Cancelled);
        assert_eq!(
            call.poll_timer(t0 + Duration::from_secs(1)),
            TimerAction::GiveUp
        );
        call.on_retransmit(t0 + Duration::from_secs(1));
        assert_eq!(call.attempts(), 1);
        assert!(!call.accept(&1u32.to_be_bytes()));
    }

    #[test]
    fn test_zero_total_timeout_gives_up_immediately() {
        let t0 = Instant::now();
        let mut call = CallMatcher::new(1, dest(), &timing(1, 0, 30), t0);
        assert_eq!(call.poll_timer(t0), TimerAction::GiveUp);
    }

    #[test]
    fn test_max_backoff_below_initial_uses_initial() {
        let t0 = Instant::now();
        let call = CallMatcher::new(1, dest(), &timing(4, 60, 1), t0);
        assert_eq!(call.next_retransmit_at() - t0, Duration::from_secs(4));
        assert_eq!(call.current_backoff(), Duration::from_secs(4));
    }
}
