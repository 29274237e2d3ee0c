//! Connection lifecycle as a pure state machine. The driver feeds it the
//! current time and transport events and carries out the returned actions.

use std::fmt;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Closed => "closed",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AppLifecycle {
    #[default]
    Foreground,
    Background,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenAction {
    /// Start a transport connect for the given epoch.
    Connect { epoch: u64 },
    /// Already connecting or open; the background deadline moved.
    KeepOpenUntil(Instant),
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    /// The keep-open window had already elapsed; tear down this epoch.
    Close { epoch: u64 },
    KeepOpenUntil(Instant),
    CancelKeepOpen,
    None,
}

#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    state: ConnectionState,
    lifecycle: AppLifecycle,
    epoch: u64,
    opened_at: Option<Instant>,
    keep_open_until: Option<Instant>,
    background_window: Duration,
}

impl ConnectionMachine {
    pub fn new(background_window: Duration) -> Self {
        Self {
            state: ConnectionState::Closed,
            lifecycle: AppLifecycle::Foreground,
            epoch: 0,
            opened_at: None,
            keep_open_until: None,
            background_window,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn lifecycle(&self) -> AppLifecycle {
        self.lifecycle
    }

    /// Epoch of the current (or most recent) connection attempt.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn opened_at(&self) -> Option<Instant> {
        self.opened_at
    }

    pub fn keep_open_until(&self) -> Option<Instant> {
        self.keep_open_until
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    // Deadlines only ever move forward.
    fn extend_deadline(&mut self, candidate: Instant) -> Instant {
        let deadline = match self.keep_open_until {
            Some(existing) if existing >= candidate => existing,
            _ => candidate,
        };
        self.keep_open_until = Some(deadline);
        deadline
    }

    pub fn request_open(&mut self, now: Instant) -> OpenAction {
        let backgrounded = self.lifecycle == AppLifecycle::Background;
        match self.state {
            ConnectionState::Closed => {
                self.epoch += 1;
                self.state = ConnectionState::Connecting;
                self.opened_at = None;
                self.keep_open_until = None;
                if backgrounded {
                    self.extend_deadline(now + self.background_window);
                }
                OpenAction::Connect { epoch: self.epoch }
            }
            ConnectionState::Connecting | ConnectionState::Open if backgrounded => {
                OpenAction::KeepOpenUntil(self.extend_deadline(now + self.background_window))
            }
            ConnectionState::Connecting | ConnectionState::Open => OpenAction::None,
        }
    }

    /// Returns false when the event belongs to a stale epoch or the machine is
    /// not connecting.
    pub fn mark_open(&mut self, epoch: u64, now: Instant) -> bool {
        if epoch != self.epoch || self.state != ConnectionState::Connecting {
            return false;
        }
        self.state = ConnectionState::Open;
        self.opened_at = Some(now);
        if self.lifecycle == AppLifecycle::Background {
            self.extend_deadline(now + self.background_window);
        }
        true
    }

    /// Transport reported failure or disconnect. Returns true when this
    /// actually closed the current epoch.
    pub fn mark_closed(&mut self, epoch: u64) -> bool {
        if epoch != self.epoch || self.state == ConnectionState::Closed {
            return false;
        }
        self.reset_closed();
        true
    }

    /// Explicit teardown of whatever epoch is live.
    pub fn close(&mut self) -> Option<u64> {
        if self.state == ConnectionState::Closed {
            return None;
        }
        self.reset_closed();
        Some(self.epoch)
    }

    fn reset_closed(&mut self) {
        self.state = ConnectionState::Closed;
        self.opened_at = None;
        self.keep_open_until = None;
    }

    pub fn set_lifecycle(&mut self, lifecycle: AppLifecycle, now: Instant) -> LifecycleAction {
        if lifecycle == self.lifecycle {
            return LifecycleAction::None;
        }
        self.lifecycle = lifecycle;

        match lifecycle {
            AppLifecycle::Foreground => {
                if self.keep_open_until.take().is_some() {
                    LifecycleAction::CancelKeepOpen
                } else {
                    LifecycleAction::None
                }
            }
            AppLifecycle::Background => match self.state {
                ConnectionState::Closed => LifecycleAction::None,
                ConnectionState::Connecting => {
                    LifecycleAction::KeepOpenUntil(self.extend_deadline(now + self.background_window))
                }
                ConnectionState::Open => {
                    let opened_at = self.opened_at.unwrap_or(now);
                    let deadline = self.extend_deadline(opened_at + self.background_window);
                    if deadline <= now {
                        self.reset_closed();
                        LifecycleAction::Close { epoch: self.epoch }
                    } else {
                        LifecycleAction::KeepOpenUntil(deadline)
                    }
                }
            },
        }
    }

    /// Called when the keep-open timer fires. Closes only if the deadline has
    /// really passed, so a timer armed before an extension is harmless.
    pub fn keep_open_expired(&mut self, now: Instant) -> Option<u64> {
        if self.lifecycle != AppLifecycle::Background || self.state == ConnectionState::Closed {
            return None;
        }
        match self.keep_open_until {
            Some(deadline) if deadline <= now => self.close(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(25);

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn concurrent_open_requests_collapse_into_one_attempt() {
        let now = Instant::now();
        let mut m = ConnectionMachine::new(WINDOW);

        assert_eq!(m.request_open(now), OpenAction::Connect { epoch: 1 });
        for _ in 0..10 {
            assert_eq!(m.request_open(now), OpenAction::None);
        }
        assert!(m.mark_open(1, now));
        for _ in 0..10 {
            assert_eq!(m.request_open(now), OpenAction::None);
        }
        assert_eq!(m.state(), ConnectionState::Open);
        assert_eq!(m.epoch(), 1);
    }

    #[test]
    fn illegal_transitions_are_noops() {
        let now = Instant::now();
        let mut m = ConnectionMachine::new(WINDOW);

        assert!(!m.mark_open(1, now));
        assert!(!m.mark_closed(0));
        assert_eq!(m.close(), None);

        m.request_open(now);
        assert!(m.mark_open(1, now));
        assert!(!m.mark_open(1, now));
        assert_eq!(m.state(), ConnectionState::Open);
    }

    #[test]
    fn stale_epoch_events_are_ignored() {
        let now = Instant::now();
        let mut m = ConnectionMachine::new(WINDOW);

        m.request_open(now);
        assert!(m.mark_closed(1));
        assert_eq!(m.request_open(now), OpenAction::Connect { epoch: 2 });

        // The first attempt's late callbacks must not touch epoch 2.
        assert!(!m.mark_open(1, now));
        assert!(!m.mark_closed(1));
        assert_eq!(m.state(), ConnectionState::Connecting);
        assert!(m.mark_open(2, now));
    }

    #[test]
    fn background_requests_extend_but_never_shorten() {
        let t0 = Instant::now();
        let mut m = ConnectionMachine::new(WINDOW);
        m.set_lifecycle(AppLifecycle::Background, t0);

        assert_eq!(m.request_open(t0), OpenAction::Connect { epoch: 1 });
        assert!(m.mark_open(1, t0 + secs(2)));
        assert_eq!(m.keep_open_until(), Some(t0 + secs(27)));

        assert_eq!(
            m.request_open(t0 + secs(10)),
            OpenAction::KeepOpenUntil(t0 + secs(35))
        );
        // A call whose window ends earlier keeps the later deadline.
        m.keep_open_until = Some(t0 + secs(60));
        assert_eq!(
            m.request_open(t0 + secs(11)),
            OpenAction::KeepOpenUntil(t0 + secs(60))
        );
    }

    #[test]
    fn keep_open_window_elapses_to_closed() {
        let t0 = Instant::now();
        let mut m = ConnectionMachine::new(WINDOW);
        m.set_lifecycle(AppLifecycle::Background, t0);
        m.request_open(t0);
        m.mark_open(1, t0);

        assert_eq!(m.keep_open_expired(t0 + secs(24)), None);
        assert_eq!(m.state(), ConnectionState::Open);
        assert_eq!(m.keep_open_expired(t0 + secs(25)), Some(1));
        assert_eq!(m.state(), ConnectionState::Closed);
        assert_eq!(m.keep_open_until(), None);
    }

    #[test]
    fn foreground_never_expires() {
        let t0 = Instant::now();
        let mut m = ConnectionMachine::new(WINDOW);
        m.request_open(t0);
        m.mark_open(1, t0);
        assert_eq!(m.keep_open_until(), None);
        assert_eq!(m.keep_open_expired(t0 + secs(3600)), None);
    }

    #[test]
    fn entering_background_uses_open_time() {
        let t0 = Instant::now();
        let mut m = ConnectionMachine::new(WINDOW);
        m.request_open(t0);
        m.mark_open(1, t0);

        assert_eq!(
            m.set_lifecycle(AppLifecycle::Background, t0 + secs(5)),
            LifecycleAction::KeepOpenUntil(t0 + secs(25))
        );
        assert_eq!(
            m.set_lifecycle(AppLifecycle::Foreground, t0 + secs(6)),
            LifecycleAction::CancelKeepOpen
        );
        assert_eq!(
            m.set_lifecycle(AppLifecycle::Background, t0 + secs(40)),
            LifecycleAction::Close { epoch: 1 }
        );
        assert_eq!(m.state(), ConnectionState::Closed);
    }

    #[test]
    fn repeated_lifecycle_is_noop() {
        let t0 = Instant::now();
        let mut m = ConnectionMachine::new(WINDOW);
        assert_eq!(
            m.set_lifecycle(AppLifecycle::Foreground, t0),
            LifecycleAction::None
        );
        assert_eq!(
            m.set_lifecycle(AppLifecycle::Background, t0),
            LifecycleAction::None
        );
        assert_eq!(
            m.set_lifecycle(AppLifecycle::Background, t0),
            LifecycleAction::None
        );
    }
}
