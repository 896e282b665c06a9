//! Per-server failure tracking.
//!
//! An [`IssueLog`] is created the first time a server fails and lives until
//! the server is removed from the ring. It never touches timers or sockets:
//! every transition takes the current time and returns the events to publish
//! plus at most one [`Action`] for the client to carry out.
//!
//! ```text
//! Healthy -> Locked (budget left) -> Healthy once the retry delay passes
//!         -> Dead (budget spent)  -> Reconnecting -> Healthy
//!                                 -> Removed (remove_on_failure)
//! ```

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Recent error messages kept per server.
const MAX_MESSAGES: usize = 16;

#[derive(Debug, Clone)]
pub struct IssueSettings {
    /// Failures allowed before the server is marked dead.
    pub failures: u32,
    /// Lock-out after a failure that leaves budget.
    pub retry: Duration,
    /// A failure this long after the first one of an episode resets the budget.
    pub failures_timeout: Duration,
    /// Delay between reconnection probes.
    pub reconnect: Duration,
    pub remove_on_failure: bool,
}

/// Lifecycle notifications published on [`Client::events`](crate::Client::events).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A server failed but still has budget left.
    Issue(Details),
    /// A server used up its budget and is marked dead.
    Failure(Details),
    /// A reconnection probe is starting.
    Reconnecting(Details),
    /// A dead server answered a probe and is healthy again.
    Reconnected(Details),
    /// A server was taken out of the ring.
    Remove(Details),
}

impl Event {
    pub fn details(&self) -> &Details {
        match self {
            Event::Issue(d)
            | Event::Failure(d)
            | Event::Reconnecting(d)
            | Event::Reconnected(d)
            | Event::Remove(d) => d,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Event::Issue(_) => "issue",
            Event::Failure(_) => "failure",
            Event::Reconnecting(_) => "reconnecting",
            Event::Reconnected(_) => "reconnect",
            Event::Remove(_) => "remove",
        }
    }
}

/// Snapshot of a server's issue log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Details {
    pub server: String,
    pub failures_left: u32,
    pub total_failures: u64,
    pub reconnect_attempts: u64,
    pub reconnect_successes: u64,
    pub messages: Vec<String>,
    /// Set on `Remove` when a fail-over server took the slot.
    pub replaced_by: Option<String>,
}

/// Follow-up work the client has to schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Start a probe loop with this interval.
    Reconnect(Duration),
    /// Take the server out of the ring.
    Remove,
}

/// Result of one transition.
#[derive(Debug, Default)]
pub struct Transition {
    pub events: Vec<Event>,
    pub action: Option<Action>,
}

#[derive(Debug)]
pub struct IssueLog {
    server: String,
    settings: IssueSettings,
    failures_left: u32,
    episode_start: Option<Instant>,
    locked_until: Option<Instant>,
    dead: bool,
    reconnecting: bool,
    total_failures: u64,
    reconnect_attempts: u64,
    reconnect_successes: u64,
    messages: VecDeque<String>,
}

impl IssueLog {
    pub fn new(server: &str, settings: IssueSettings) -> Self {
        Self {
            server: server.to_owned(),
            failures_left: settings.failures,
            settings,
            episode_start: None,
            locked_until: None,
            dead: false,
            reconnecting: false,
            total_failures: 0,
            reconnect_attempts: 0,
            reconnect_successes: 0,
            messages: VecDeque::new(),
        }
    }

    /// False while locked out after a failure or dead.
    pub fn is_available(&self, now: Instant) -> bool {
        !self.dead && self.locked_until.is_none_or(|until| now >= until)
    }

    /// Record a connection failure.
    pub fn record(&mut self, message: &str, now: Instant) -> Transition {
        self.push_message(message);
        self.total_failures += 1;

        // already dead: the probe loop owns recovery
        if self.dead {
            return Transition::default();
        }

        // commands that were in flight when the server went down all land
        // here; one lock window spends one unit of budget
        if self.locked_until.is_some_and(|until| now < until) {
            return Transition::default();
        }

        match self.episode_start {
            Some(start) if now.duration_since(start) >= self.settings.failures_timeout => {
                self.failures_left = self.settings.failures;
                self.episode_start = Some(now);
            }
            Some(_) => {}
            None => self.episode_start = Some(now),
        }

        self.failures_left = self.failures_left.saturating_sub(1);
        if self.failures_left > 0 {
            self.locked_until = Some(now + self.settings.retry);
            return Transition {
                events: vec![Event::Issue(self.details())],
                action: None,
            };
        }

        self.dead = true;
        self.locked_until = None;
        let events = vec![Event::Failure(self.details())];
        if self.settings.remove_on_failure {
            return Transition {
                events,
                action: Some(Action::Remove),
            };
        }

        if self.reconnecting {
            return Transition {
                events,
                action: None,
            };
        }
        self.reconnecting = true;
        Transition {
            events,
            action: Some(Action::Reconnect(self.settings.reconnect)),
        }
    }

    /// A probe is about to run.
    pub fn reconnect_attempt(&mut self) -> Event {
        self.reconnect_attempts += 1;
        Event::Reconnecting(self.details())
    }

    /// A probe failed; the loop keeps going.
    pub fn reconnect_failed(&mut self, message: &str) {
        self.push_message(message);
    }

    /// A probe succeeded: back to a fresh, healthy log.
    pub fn reconnected(&mut self) -> Event {
        self.reconnect_successes += 1;
        self.dead = false;
        self.reconnecting = false;
        self.locked_until = None;
        self.episode_start = None;
        self.failures_left = self.settings.failures;
        self.messages.clear();
        Event::Reconnected(self.details())
    }

    pub fn details(&self) -> Details {
        Details {
            server: self.server.clone(),
            failures_left: self.failures_left,
            total_failures: self.total_failures,
            reconnect_attempts: self.reconnect_attempts,
            reconnect_successes: self.reconnect_successes,
            messages: self.messages.iter().cloned().collect(),
            replaced_by: None,
        }
    }

    fn push_message(&mut self, message: &str) {
        if self.messages.len() == MAX_MESSAGES {
            self.messages.pop_front();
        }
        self.messages.push_back(message.to_owned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(failures: u32) -> IssueSettings {
        IssueSettings {
            failures,
            retry: Duration::from_secs(30),
            failures_timeout: Duration::from_secs(300),
            reconnect: Duration::from_secs(60),
            remove_on_failure: false,
        }
    }

    #[test]
    fn failure_with_budget_locks() {
        let now = Instant::now();
        let mut log = IssueLog::new("a:11211", settings(3));

        let t = log.record("connection refused", now);
        assert!(matches!(t.events.as_slice(), [Event::Issue(d)] if d.failures_left == 2));
        assert_eq!(t.action, None);
        assert!(!log.is_available(now));
        assert!(!log.is_available(now + Duration::from_secs(29)));
        assert!(log.is_available(now + Duration::from_secs(30)));
    }

    #[test]
    fn budget_exhaustion_starts_reconnect_once() {
        let now = Instant::now();
        let mut log = IssueLog::new("a:11211", settings(2));

        log.record("first", now);
        let t = log.record("second", now + Duration::from_secs(31));
        assert!(matches!(t.events.as_slice(), [Event::Failure(_)]));
        assert_eq!(t.action, Some(Action::Reconnect(Duration::from_secs(60))));
        assert!(!log.is_available(now + Duration::from_secs(3600)));

        let t = log.record("third", now + Duration::from_secs(32));
        assert!(t.events.is_empty());
        assert_eq!(t.action, None);
        assert_eq!(log.details().total_failures, 3);
    }

    #[test]
    fn failures_within_lock_window_spend_one_unit() {
        let now = Instant::now();
        let mut log = IssueLog::new("a:11211", settings(3));

        let first = log.record("refused", now);
        assert!(matches!(first.events.as_slice(), [Event::Issue(d)] if d.failures_left == 2));
        for i in 1..5 {
            let t = log.record("refused", now + Duration::from_millis(i));
            assert!(t.events.is_empty());
            assert_eq!(t.action, None);
        }
        let details = log.details();
        assert_eq!(details.failures_left, 2);
        assert_eq!(details.total_failures, 5);
        assert_eq!(details.messages.len(), 5);

        // once the window has passed the next failure counts again
        let t = log.record("refused", now + Duration::from_secs(30));
        assert!(matches!(t.events.as_slice(), [Event::Issue(d)] if d.failures_left == 1));
    }

    #[test]
    fn remove_on_failure() {
        let mut config = settings(1);
        config.remove_on_failure = true;
        let mut log = IssueLog::new("a:11211", config);

        let t = log.record("boom", Instant::now());
        assert_eq!(t.action, Some(Action::Remove));
        assert!(matches!(t.events.as_slice(), [Event::Failure(_)]));
    }

    #[test]
    fn quiet_period_resets_budget() {
        let now = Instant::now();
        let mut log = IssueLog::new("a:11211", settings(2));

        log.record("first", now);
        assert_eq!(log.details().failures_left, 1);

        let t = log.record("much later", now + Duration::from_secs(301));
        assert!(matches!(t.events.as_slice(), [Event::Issue(_)]));
        assert_eq!(log.details().failures_left, 1);
        assert!(log.is_available(now + Duration::from_secs(331)));
    }

    #[test]
    fn reconnect_resets_state() {
        let now = Instant::now();
        let mut log = IssueLog::new("a:11211", settings(1));

        log.record("down", now);
        assert!(!log.is_available(now));

        let attempt = log.reconnect_attempt();
        assert_eq!(attempt.details().reconnect_attempts, 1);
        log.reconnect_failed("still down");
        assert_eq!(log.details().messages, vec!["down", "still down"]);

        let event = log.reconnected();
        assert_eq!(event.name(), "reconnect");
        assert_eq!(event.details().reconnect_successes, 1);
        assert!(log.is_available(now));
        assert_eq!(log.details().failures_left, 1);
        assert!(log.details().messages.is_empty());

        // a new episode schedules a new probe loop
        let t = log.record("down again", now + Duration::from_secs(10));
        assert_eq!(t.action, Some(Action::Reconnect(Duration::from_secs(60))));
    }

    #[test]
    fn messages_are_bounded() {
        let now = Instant::now();
        let mut log = IssueLog::new("a:11211", settings(1));
        for i in 0..40 {
            log.record(&format!("error {i}"), now);
        }
        let messages = log.details().messages;
        assert_eq!(messages.len(), MAX_MESSAGES);
        assert_eq!(messages.last().map(String::as_str), Some("error 39"));
    }
}
