use std::time::Duration;

use log::{debug, info, warn};

use crate::config::ConnectivityConfig;
use crate::credentials::Credentials;
use crate::ports::{Link, Session};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkPhase {
    Disconnected,
    Connecting { started_ms: u64, timeout_ms: u64 },
    LinkUp,
    SessionUp,
}

impl LinkPhase {
    pub fn link_up(self) -> bool {
        matches!(self, Self::LinkUp | Self::SessionUp)
    }

    pub fn session_up(self) -> bool {
        self == Self::SessionUp
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectivityEvent {
    ConnectStarted { timeout_ms: u64 },
    LinkUp,
    LinkAttemptFailed { offline_ms: u64, next_retry_ms: u64 },
    LinkLost,
    SessionEstablished,
    SessionAttemptFailed { attempt: u32, retry_at_ms: u64 },
    SessionLost,
}

/// Non-blocking link and broker-session supervisor. One `poll` per cycle;
/// nothing here waits except the bounded session handshake.
#[derive(Debug, Clone)]
pub struct ConnectivitySupervisor {
    config: ConnectivityConfig,
    phase: LinkPhase,
    disconnected_since_ms: Option<u64>,
    last_attempt_ms: Option<u64>,
    link_failures: u32,
    session_attempts: u32,
    next_session_attempt_ms: u64,
}

impl ConnectivitySupervisor {
    pub fn new(config: ConnectivityConfig, boot_ms: u64) -> Self {
        Self {
            config,
            phase: LinkPhase::Disconnected,
            disconnected_since_ms: Some(boot_ms),
            last_attempt_ms: None,
            link_failures: 0,
            session_attempts: 0,
            next_session_attempt_ms: 0,
        }
    }

    pub fn phase(&self) -> LinkPhase {
        self.phase
    }

    pub fn disconnected_since_ms(&self) -> Option<u64> {
        self.disconnected_since_ms
    }

    pub fn link_failures(&self) -> u32 {
        self.link_failures
    }

    pub fn offline_ms(&self, now_ms: u64) -> u64 {
        self.disconnected_since_ms
            .map(|since| now_ms.saturating_sub(since))
            .unwrap_or(0)
    }

    /// Fast cadence while the outage is young, slow cadence afterwards.
    pub fn retry_interval_ms(&self, now_ms: u64) -> u64 {
        if self.offline_ms(now_ms) < self.config.fast_retry_window_ms {
            self.config.fast_retry_interval_ms
        } else {
            self.config.slow_retry_interval_ms
        }
    }

    pub fn next_link_attempt_ms(&self, now_ms: u64) -> u64 {
        self.last_attempt_ms
            .map(|last| last.saturating_add(self.retry_interval_ms(now_ms)))
            .unwrap_or(now_ms)
    }

    pub fn poll(
        &mut self,
        now_ms: u64,
        credentials: &Credentials,
        client_id: &str,
        link: &mut dyn Link,
        session: &mut dyn Session,
    ) -> Vec<ConnectivityEvent> {
        let mut events = Vec::new();
        let link_up = link.is_up();

        match self.phase {
            LinkPhase::Connecting {
                started_ms,
                timeout_ms,
            } => {
                if link_up {
                    self.on_link_up(&mut events);
                } else if now_ms.saturating_sub(started_ms) >= timeout_ms {
                    link.abort();
                    self.link_failures = self.link_failures.saturating_add(1);
                    self.disconnected_since_ms.get_or_insert(started_ms);
                    self.phase = LinkPhase::Disconnected;
                    let next_retry_ms = self.next_link_attempt_ms(now_ms);
                    warn!(
                        "wifi connect timed out after {timeout_ms} ms (failures: {}, offline {} s)",
                        self.link_failures,
                        self.offline_ms(now_ms) / 1_000
                    );
                    events.push(ConnectivityEvent::LinkAttemptFailed {
                        offline_ms: self.offline_ms(now_ms),
                        next_retry_ms,
                    });
                }
                return events;
            }
            LinkPhase::LinkUp | LinkPhase::SessionUp if !link_up => {
                warn!("wifi link lost");
                self.phase = LinkPhase::Disconnected;
                self.disconnected_since_ms.get_or_insert(now_ms);
                self.reset_session_backoff();
                events.push(ConnectivityEvent::LinkLost);
            }
            LinkPhase::Disconnected if link_up => {
                self.on_link_up(&mut events);
            }
            _ => {}
        }

        match self.phase {
            LinkPhase::Disconnected => {
                self.maybe_begin_connect(now_ms, credentials, link, &mut events)
            }
            LinkPhase::LinkUp | LinkPhase::SessionUp => {
                self.maintain_session(now_ms, client_id, session, &mut events)
            }
            LinkPhase::Connecting { .. } => {}
        }

        events
    }

    fn on_link_up(&mut self, events: &mut Vec<ConnectivityEvent>) {
        info!("wifi link up after {} failed attempt(s)", self.link_failures);
        self.phase = LinkPhase::LinkUp;
        self.link_failures = 0;
        self.disconnected_since_ms = None;
        self.reset_session_backoff();
        events.push(ConnectivityEvent::LinkUp);
    }

    fn maybe_begin_connect(
        &mut self,
        now_ms: u64,
        credentials: &Credentials,
        link: &mut dyn Link,
        events: &mut Vec<ConnectivityEvent>,
    ) {
        if !credentials.has_network() {
            return;
        }
        if self.last_attempt_ms.is_some() && now_ms < self.next_link_attempt_ms(now_ms) {
            return;
        }

        let timeout_ms = if self.last_attempt_ms.is_none() {
            self.config.initial_connect_timeout_ms
        } else {
            self.config.reconnect_timeout_ms
        };
        self.last_attempt_ms = Some(now_ms);

        match link.begin_connect(credentials) {
            Ok(()) => {
                info!("connecting to wifi `{}` (timeout {timeout_ms} ms)", credentials.ssid);
                self.phase = LinkPhase::Connecting {
                    started_ms: now_ms,
                    timeout_ms,
                };
                events.push(ConnectivityEvent::ConnectStarted { timeout_ms });
            }
            Err(err) => {
                self.link_failures = self.link_failures.saturating_add(1);
                warn!("wifi connect could not start: {err}");
                events.push(ConnectivityEvent::LinkAttemptFailed {
                    offline_ms: self.offline_ms(now_ms),
                    next_retry_ms: self.next_link_attempt_ms(now_ms),
                });
            }
        }
    }

    fn maintain_session(
        &mut self,
        now_ms: u64,
        client_id: &str,
        session: &mut dyn Session,
        events: &mut Vec<ConnectivityEvent>,
    ) {
        let up = session.is_up();
        match (self.phase, up) {
            (LinkPhase::SessionUp, true) => return,
            (LinkPhase::SessionUp, false) => {
                warn!("broker session lost");
                self.phase = LinkPhase::LinkUp;
                self.reset_session_backoff();
                events.push(ConnectivityEvent::SessionLost);
            }
            (LinkPhase::LinkUp, true) => {
                self.phase = LinkPhase::SessionUp;
                events.push(ConnectivityEvent::SessionEstablished);
                return;
            }
            _ => {}
        }

        if now_ms < self.next_session_attempt_ms {
            return;
        }

        let deadline = Duration::from_millis(self.config.session_deadline_ms);
        match session.connect(client_id, deadline) {
            Ok(()) => {
                info!("broker session established as `{client_id}`");
                self.phase = LinkPhase::SessionUp;
                self.reset_session_backoff();
                events.push(ConnectivityEvent::SessionEstablished);
            }
            Err(err) => {
                self.session_attempts += 1;
                let attempt = self.session_attempts;
                let retry_at_ms = if attempt >= self.config.session_max_attempts {
                    self.session_attempts = 0;
                    now_ms.saturating_add(self.config.session_cooldown_ms)
                } else {
                    now_ms.saturating_add(self.config.session_retry_delay_ms)
                };
                self.next_session_attempt_ms = retry_at_ms;
                warn!("broker connect attempt {attempt} failed: {err}");
                debug!("next broker attempt at {retry_at_ms} ms");
                events.push(ConnectivityEvent::SessionAttemptFailed {
                    attempt,
                    retry_at_ms,
                });
            }
        }
    }

    fn reset_session_backoff(&mut self) {
        self.session_attempts = 0;
        self.next_session_attempt_ms = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::TransportError;
    use crate::telemetry::OutboundMessage;
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct FakeLink {
        up: bool,
        connect_on_begin: bool,
        begins: Vec<u64>,
        clock: u64,
    }

    impl Link for FakeLink {
        fn begin_connect(&mut self, _: &Credentials) -> Result<(), TransportError> {
            self.begins.push(self.clock);
            if self.connect_on_begin {
                self.up = true;
            }
            Ok(())
        }
        fn is_up(&mut self) -> bool {
            self.up
        }
        fn abort(&mut self) {
            self.up = false;
        }
    }

    #[derive(Default)]
    struct FakeSession {
        up: bool,
        accept: bool,
        attempts: u32,
    }

    impl Session for FakeSession {
        fn connect(&mut self, _: &str, deadline: Duration) -> Result<(), TransportError> {
            self.attempts += 1;
            if self.accept {
                self.up = true;
                Ok(())
            } else {
                Err(TransportError::Timeout(deadline))
            }
        }
        fn is_up(&mut self) -> bool {
            self.up
        }
        fn subscribe(&mut self, _: &str) -> Result<(), TransportError> {
            Ok(())
        }
        fn publish(&mut self, _: &OutboundMessage) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn credentials() -> Credentials {
        Credentials {
            ssid: "net".to_string(),
            password: "pass".to_string(),
            ..Credentials::default()
        }
    }

    fn poll_at(
        supervisor: &mut ConnectivitySupervisor,
        link: &mut FakeLink,
        session: &mut FakeSession,
        now_ms: u64,
    ) -> Vec<ConnectivityEvent> {
        link.clock = now_ms;
        supervisor.poll(now_ms, &credentials(), "esp32-X", link, session)
    }

    #[test]
    fn retries_fast_then_slow() {
        let mut supervisor = ConnectivitySupervisor::new(ConnectivityConfig::default(), 0);
        let mut link = FakeLink::default();
        let mut session = FakeSession::default();

        // Poll once a second for twenty minutes with the access point absent.
        for second in 0..=1_200u64 {
            poll_at(&mut supervisor, &mut link, &mut session, second * 1_000);
        }

        let begins_s: Vec<u64> = link.begins.iter().map(|ms| ms / 1_000).collect();
        // First attempt times out at 20 s; fast attempts every 30 s from the
        // previous start until the outage passes five minutes.
        assert_eq!(&begins_s[..4], &[0, 30, 60, 90]);
        let fast = begins_s.iter().filter(|s| **s < 300).count();
        assert_eq!(fast, 10);
        for pair in begins_s.windows(2).filter(|pair| pair[0] >= 300) {
            assert_eq!(pair[1] - pair[0], 300);
        }
        assert!(supervisor.disconnected_since_ms().is_some());
    }

    #[test]
    fn connect_never_blocks_and_times_out() {
        let mut supervisor = ConnectivitySupervisor::new(ConnectivityConfig::default(), 0);
        let mut link = FakeLink::default();
        let mut session = FakeSession::default();

        let events = poll_at(&mut supervisor, &mut link, &mut session, 0);
        assert_eq!(
            events,
            vec![ConnectivityEvent::ConnectStarted { timeout_ms: 20_000 }]
        );
        assert!(poll_at(&mut supervisor, &mut link, &mut session, 19_999).is_empty());

        let events = poll_at(&mut supervisor, &mut link, &mut session, 20_000);
        assert_eq!(
            events,
            vec![ConnectivityEvent::LinkAttemptFailed {
                offline_ms: 20_000,
                next_retry_ms: 30_000
            }]
        );
        assert_eq!(supervisor.phase(), LinkPhase::Disconnected);

        let events = poll_at(&mut supervisor, &mut link, &mut session, 30_000);
        assert_eq!(
            events,
            vec![ConnectivityEvent::ConnectStarted { timeout_ms: 8_000 }]
        );
    }

    #[test]
    fn link_then_session_clears_outage() {
        let mut supervisor = ConnectivitySupervisor::new(ConnectivityConfig::default(), 0);
        let mut link = FakeLink {
            connect_on_begin: true,
            ..FakeLink::default()
        };
        let mut session = FakeSession {
            accept: true,
            ..FakeSession::default()
        };

        poll_at(&mut supervisor, &mut link, &mut session, 0);
        let events = poll_at(&mut supervisor, &mut link, &mut session, 250);
        assert_eq!(events, vec![ConnectivityEvent::LinkUp]);
        assert_eq!(supervisor.disconnected_since_ms(), None);

        let events = poll_at(&mut supervisor, &mut link, &mut session, 500);
        assert_eq!(events, vec![ConnectivityEvent::SessionEstablished]);
        assert!(supervisor.phase().session_up());

        link.up = false;
        session.up = false;
        let events = poll_at(&mut supervisor, &mut link, &mut session, 60_000);
        assert_eq!(events[0], ConnectivityEvent::LinkLost);
        assert_eq!(supervisor.disconnected_since_ms(), Some(60_000));
    }

    #[test]
    fn session_attempts_burst_then_cool_down() {
        let mut supervisor = ConnectivitySupervisor::new(ConnectivityConfig::default(), 0);
        let mut link = FakeLink {
            connect_on_begin: true,
            ..FakeLink::default()
        };
        let mut session = FakeSession::default();

        poll_at(&mut supervisor, &mut link, &mut session, 0);
        for tick in 1..=20u64 {
            poll_at(&mut supervisor, &mut link, &mut session, tick * 500);
        }
        // The burst caps at five attempts, then waits out the cool-down.
        assert_eq!(session.attempts, 5);

        for tick in 21..=80u64 {
            poll_at(&mut supervisor, &mut link, &mut session, tick * 500);
        }
        assert!(session.attempts > 5 && session.attempts <= 10);
    }

    #[test]
    fn no_attempt_without_network_credentials() {
        let mut supervisor = ConnectivitySupervisor::new(ConnectivityConfig::default(), 0);
        let mut link = FakeLink::default();
        let mut session = FakeSession::default();
        let events = supervisor.poll(0, &Credentials::default(), "id", &mut link, &mut session);
        assert!(events.is_empty());
        assert!(link.begins.is_empty());
    }
}
