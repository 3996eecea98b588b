//! Message envelope: stamping and routing of outgoing messages.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::debug;

use cnet_proto::{ContractMessage, MessageId, Recipient, SessionId};

use crate::runtime::Runtime;

/// Default lifetime of a message whose sender did not pick one.
const DEFAULT_EXPIRATION_SECS: i64 = 10;

/// One role's envelope onto the transport.
///
/// Stamps outgoing messages with the session id, protocol id and an
/// expiration time, resolves default recipients and hands delivery to the
/// [`Runtime`]. Sending is fire-and-continue; the returned [`MessageId`] is
/// the correlation handle for matching replies to this particular send.
pub struct Channel {
    session_id: SessionId,
    remote_id: Option<SessionId>,
    protocol_id: String,
    recipients: Vec<Recipient>,
    runtime: Arc<dyn Runtime>,
}

impl Channel {
    /// An envelope with a fresh session id and no remote peer yet
    /// (manager side).
    pub fn new(
        runtime: Arc<dyn Runtime>,
        protocol_id: impl Into<String>,
        recipients: Vec<Recipient>,
    ) -> Self {
        Self {
            session_id: SessionId::new(),
            remote_id: None,
            protocol_id: protocol_id.into(),
            recipients,
            runtime,
        }
    }

    /// An envelope bound to a known remote session (contractor side,
    /// created from the announcement that spawned it).
    pub fn for_remote(
        runtime: Arc<dyn Runtime>,
        protocol_id: impl Into<String>,
        remote_id: Option<SessionId>,
        recipients: Vec<Recipient>,
    ) -> Self {
        Self {
            session_id: SessionId::new(),
            remote_id,
            protocol_id: protocol_id.into(),
            recipients,
            runtime,
        }
    }

    /// This role's session id.
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// The protocol this contract negotiates under.
    pub fn protocol_id(&self) -> &str {
        &self.protocol_id
    }

    /// The default peer set.
    pub fn recipients(&self) -> &[Recipient] {
        &self.recipients
    }

    /// The transport collaborator.
    pub fn runtime(&self) -> &dyn Runtime {
        self.runtime.as_ref()
    }

    /// Current time, per the transport's clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.runtime.now()
    }

    /// Stamp and send a message.
    ///
    /// When the message has no expiration of its own it gets `expiration`,
    /// or `now + 10s` when the caller did not pick one either. Recipients
    /// default to the contract's peer set; `remote_id` overrides the
    /// receiver session stamp for sends addressed to one specific peer.
    pub fn send(
        &self,
        mut msg: ContractMessage,
        expiration: Option<DateTime<Utc>>,
        recipients: Option<&[Recipient]>,
        remote_id: Option<SessionId>,
    ) -> MessageId {
        msg.sender_id = Some(self.session_id);
        msg.receiver_id = remote_id.or(self.remote_id);
        msg.protocol_id = Some(self.protocol_id.clone());
        if msg.expiration_time.is_none() {
            msg.expiration_time = Some(
                expiration.unwrap_or_else(|| self.now() + Duration::seconds(DEFAULT_EXPIRATION_SECS)),
            );
        }
        let to = recipients.unwrap_or(&self.recipients);
        debug!(
            session = %self.session_id,
            kind = %msg.kind(),
            recipients = to.len(),
            "sending message"
        );
        self.runtime.send(self.session_id, to, msg)
    }

    /// Forward a message composed by someone else, restamping only the
    /// receiver. Used when a bid is handed over to a nested contractor.
    pub fn handover(&self, mut msg: ContractMessage) -> MessageId {
        msg.receiver_id = self.remote_id;
        debug!(session = %self.session_id, kind = %msg.kind(), "handing message over");
        self.runtime.handover(self.session_id, &self.recipients, msg)
    }

    /// Drop this session's listener registration.
    pub fn unregister(&self) {
        self.runtime.unregister_listener(self.session_id);
    }
}
