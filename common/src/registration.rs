use log::{info, warn};
use serde::Serialize;

use crate::credentials::Credentials;
use crate::identity::DeviceIdentity;
use crate::ports::Backend;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistrationRequest {
    pub controller_id: String,
    pub email: String,
    pub controller_name: String,
    pub factory_name: String,
}

impl RegistrationRequest {
    pub fn new(identity: &DeviceIdentity, credentials: &Credentials) -> Self {
        Self {
            controller_id: identity.controller_id().to_string(),
            email: credentials.email.clone(),
            controller_name: credentials.controller_name.clone(),
            factory_name: credentials.factory_name.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationOutcome {
    /// Already registered, offline, or credentials incomplete.
    Idle,
    NotDue,
    Registered,
    Failed { attempt: u32, retry_at_ms: u64 },
}

#[derive(Debug, Clone)]
pub struct RegistrationAgent {
    registered: bool,
    attempts: u32,
    next_attempt_ms: u64,
    retry_interval_ms: u64,
}

impl RegistrationAgent {
    pub fn new(registered: bool, retry_interval_ms: u64) -> Self {
        Self {
            registered,
            attempts: 0,
            next_attempt_ms: 0,
            retry_interval_ms,
        }
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn poll(
        &mut self,
        now_ms: u64,
        session_up: bool,
        identity: &DeviceIdentity,
        credentials: &Credentials,
        backend: &mut dyn Backend,
    ) -> RegistrationOutcome {
        if self.registered || !session_up || !credentials.is_complete() {
            return RegistrationOutcome::Idle;
        }
        if now_ms < self.next_attempt_ms {
            return RegistrationOutcome::NotDue;
        }

        self.attempts = self.attempts.saturating_add(1);
        let request = RegistrationRequest::new(identity, credentials);
        info!(
            "registering controller {} (attempt {})",
            request.controller_id, self.attempts
        );

        let failure = match backend.register(&request) {
            Ok(status) if (200..300).contains(&status) => {
                info!("registration accepted with status {status}");
                self.registered = true;
                return RegistrationOutcome::Registered;
            }
            Ok(status) => format!("status {status}"),
            Err(err) => err.to_string(),
        };

        self.next_attempt_ms = now_ms.saturating_add(self.retry_interval_ms);
        warn!(
            "registration attempt {} failed ({failure}), retrying in {} s",
            self.attempts,
            self.retry_interval_ms / 1_000
        );
        RegistrationOutcome::Failed {
            attempt: self.attempts,
            retry_at_ms: self.next_attempt_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::TransportError;
    use crate::thresholds::ThresholdResponse;
    use pretty_assertions::assert_eq;

    struct ScriptedBackend {
        statuses: Vec<Result<u16, TransportError>>,
        requests: Vec<RegistrationRequest>,
    }

    impl Backend for ScriptedBackend {
        fn register(&mut self, request: &RegistrationRequest) -> Result<u16, TransportError> {
            self.requests.push(request.clone());
            if self.statuses.is_empty() {
                Ok(200)
            } else {
                self.statuses.remove(0)
            }
        }

        fn fetch_thresholds(&mut self, _: &str) -> Result<ThresholdResponse, TransportError> {
            Err(TransportError::NotConnected)
        }
    }

    fn complete() -> Credentials {
        Credentials {
            ssid: "net".to_string(),
            password: "pw".to_string(),
            email: "a@b.c".to_string(),
            controller_name: "Tent".to_string(),
            factory_name: "Plant".to_string(),
        }
    }

    #[test]
    fn retries_on_fixed_interval_until_accepted() {
        let identity = DeviceIdentity::from_mac([1, 2, 3, 4, 5, 6], "ESP32");
        let mut backend = ScriptedBackend {
            statuses: vec![Err(TransportError::Io("refused".to_string())), Ok(503)],
            requests: Vec::new(),
        };
        let mut agent = RegistrationAgent::new(false, 60_000);

        assert_eq!(
            agent.poll(0, true, &identity, &complete(), &mut backend),
            RegistrationOutcome::Failed {
                attempt: 1,
                retry_at_ms: 60_000
            }
        );
        assert_eq!(
            agent.poll(59_999, true, &identity, &complete(), &mut backend),
            RegistrationOutcome::NotDue
        );
        assert!(matches!(
            agent.poll(60_000, true, &identity, &complete(), &mut backend),
            RegistrationOutcome::Failed { attempt: 2, .. }
        ));
        assert_eq!(
            agent.poll(120_000, true, &identity, &complete(), &mut backend),
            RegistrationOutcome::Registered
        );
        assert_eq!(agent.attempts(), 3);
        assert_eq!(backend.requests[0].controller_id, "01:02:03:04:05:06");

        assert_eq!(
            agent.poll(500_000, true, &identity, &complete(), &mut backend),
            RegistrationOutcome::Idle
        );
        assert_eq!(backend.requests.len(), 3);
    }

    #[test]
    fn waits_for_session_and_complete_credentials() {
        let identity = DeviceIdentity::from_mac([1, 2, 3, 4, 5, 6], "ESP32");
        let mut backend = ScriptedBackend {
            statuses: Vec::new(),
            requests: Vec::new(),
        };
        let mut agent = RegistrationAgent::new(false, 60_000);
        let mut partial = complete();
        partial.email.clear();

        assert_eq!(
            agent.poll(0, false, &identity, &complete(), &mut backend),
            RegistrationOutcome::Idle
        );
        assert_eq!(
            agent.poll(0, true, &identity, &partial, &mut backend),
            RegistrationOutcome::Idle
        );
        assert!(backend.requests.is_empty());
    }
}
