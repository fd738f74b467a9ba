use log::warn;

use crate::mode::ModeCommand;
use crate::provisioning::IntakeRecord;
use crate::topics::TopicSet;

/// Work handed from transport callbacks to the control loop. Callbacks never
/// touch device state directly; they parse, enqueue, and return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    Mode(ModeCommand),
    Credentials(IntakeRecord),
    FactoryReset,
}

/// Maps a broker message to an inbound event. Unknown topics and malformed
/// payloads are logged and dropped.
pub fn route_broker_message(
    topics: &TopicSet,
    topic: &str,
    payload: &[u8],
) -> Option<InboundEvent> {
    if topic != topics.mode_set() {
        warn!("ignoring message on unexpected topic `{topic}`");
        return None;
    }
    match ModeCommand::parse(payload) {
        Ok(command) => Some(InboundEvent::Mode(command)),
        Err(err) => {
            warn!("dropping mode command on `{topic}`: {err}");
            None
        }
    }
}

/// Parses a short-range credential write.
pub fn route_credential_write(payload: &[u8]) -> Option<InboundEvent> {
    match IntakeRecord::from_json(payload) {
        Ok(record) => Some(InboundEvent::Credentials(record)),
        Err(err) => {
            warn!("dropping credential record: {err}");
            None
        }
    }
}

/// Collects a credential write that arrives in offset-addressed chunks, as a
/// GATT long (prepared) write does, and routes it once executed.
#[derive(Debug, Default)]
pub struct CredentialWriteBuffer {
    data: Vec<u8>,
    overflowed: bool,
}

impl CredentialWriteBuffer {
    /// Upper bound on an assembled record.
    pub const MAX_BYTES: usize = 512;

    pub fn new() -> Self {
        Self::default()
    }

    /// Places `chunk` at `offset`. Returns false once the record no longer fits;
    /// the rest of the write is then discarded.
    pub fn append(&mut self, offset: usize, chunk: &[u8]) -> bool {
        let end = offset.saturating_add(chunk.len());
        if self.overflowed || offset > self.data.len() || end > Self::MAX_BYTES {
            self.overflowed = true;
            return false;
        }
        self.data.truncate(offset);
        self.data.extend_from_slice(chunk);
        true
    }

    pub fn cancel(&mut self) {
        self.data.clear();
        self.overflowed = false;
    }

    /// Routes the assembled record and resets the buffer.
    pub fn finish(&mut self) -> Option<InboundEvent> {
        let overflowed = std::mem::take(&mut self.overflowed);
        let data = std::mem::take(&mut self.data);
        if overflowed {
            warn!("dropping credential write larger than {} bytes", Self::MAX_BYTES);
            return None;
        }
        route_credential_write(&data)
    }
}
