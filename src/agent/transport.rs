//! Agent 消息收发（与 HTTP 框架无关）
//!
//! POST：Agent 提交的消息（会话数据或会话建立请求）。
//! GET：长轮询取走发往 Agent 的消息。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::core::error::ProtocolViolation;
use crate::state::store::EntityCache;

use super::host_state::HostStateCollection;
use super::message::{Message, MessageType, PostEnvelope};
use super::queues::{Drain, HostQueueCollection};
use super::registration::{CertificateRegistry, ClientIdentity};
use super::session::{DataVerdict, SessionCollection};

pub struct AgentTransport {
    queues: Arc<HostQueueCollection>,
    sessions: Arc<SessionCollection>,
    hosts: Arc<HostStateCollection>,
    certificates: Arc<CertificateRegistry>,
    cache: Arc<EntityCache>,
    long_poll: Duration,
}

impl AgentTransport {
    pub fn new(
        queues: Arc<HostQueueCollection>,
        sessions: Arc<SessionCollection>,
        hosts: Arc<HostStateCollection>,
        certificates: Arc<CertificateRegistry>,
        cache: Arc<EntityCache>,
        long_poll: Duration,
    ) -> Self {
        Self {
            queues,
            sessions,
            hosts,
            certificates,
            cache,
            long_poll,
        }
    }

    pub fn long_poll(&self) -> Duration {
        self.long_poll
    }

    /// 处理 Agent 的 POST
    pub fn post_messages(&self, identity: &ClientIdentity, body: Value) -> Result<(), ProtocolViolation> {
        let fqdn = self.certificates.validate(identity)?;

        if body.get("messages").is_none() {
            return Err(ProtocolViolation::Malformed("Missing attribute 'messages'".into()));
        }
        let envelope: PostEnvelope =
            serde_json::from_value(body).map_err(|e| ProtocolViolation::Malformed(e.to_string()))?;
        let messages = envelope.messages.unwrap_or_default();

        // 每条消息的 fqdn 必须与证书一致
        if let Some(bad) = messages.iter().find(|m| m.fqdn != fqdn) {
            tracing::warn!(fqdn = %fqdn, claimed = %bad.fqdn, "Incorrect client name");
            return Err(ProtocolViolation::IncorrectClientName(bad.fqdn.clone()));
        }

        tracing::debug!(fqdn = %fqdn, count = messages.len(), "Agent POST");
        for message in messages {
            match message.kind {
                MessageType::Data => self.forward_data(&fqdn, message),
                MessageType::SessionCreateRequest => {
                    self.create_session(&fqdn, &message, envelope.client_start_time)?
                }
                other => {
                    tracing::warn!(fqdn = %fqdn, kind = ?other, "Ignoring unexpected message from agent")
                }
            }
        }
        Ok(())
    }

    fn forward_data(&self, fqdn: &str, message: Message) {
        match self.sessions.accept_data(&message) {
            DataVerdict::Accept => {
                tracing::debug!(
                    fqdn,
                    plugin = ?message.plugin(),
                    session_id = ?message.session_id(),
                    seq = ?message.session_seq,
                    "Forwarding valid message"
                );
                self.queues.receive(message);
            }
            DataVerdict::Duplicate => {}
            DataVerdict::UnknownSession => {
                let plugin = message.plugin().unwrap_or_default();
                tracing::warn!(
                    fqdn,
                    plugin,
                    session_id = ?message.session_id(),
                    "Terminating session because unknown"
                );
                self.queues
                    .send(Message::session_terminate(fqdn, plugin, None));
            }
        }
    }

    fn create_session(
        &self,
        fqdn: &str,
        message: &Message,
        client_start_time: Option<DateTime<Utc>>,
    ) -> Result<(), ProtocolViolation> {
        let plugin = message
            .plugin()
            .ok_or_else(|| ProtocolViolation::Malformed("session request without plugin".into()))?;
        let client_start_time = client_start_time
            .ok_or_else(|| ProtocolViolation::Malformed("Missing attribute 'client_start_time'".into()))?;

        let session = self.sessions.create(fqdn, plugin);
        tracing::info!(fqdn, plugin, session_id = %session.id, "Creating session");

        // 先于应答入队：仍挂在队列上的旧 Agent GET 收到屏障后脱离
        self.queues.send(Message::tx_barrier(fqdn, client_start_time));
        self.queues
            .send(Message::session_create_response(fqdn, plugin, &session.id));
        Ok(())
    }

    /// 处理 Agent 的长轮询 GET
    pub async fn get_messages(
        &self,
        identity: &ClientIdentity,
        server_boot_time: DateTime<Utc>,
        client_start_time: DateTime<Utc>,
    ) -> Result<Vec<Message>, ProtocolViolation> {
        let fqdn = self.certificates.validate(identity)?;
        if self.cache.host_by_fqdn(&fqdn).is_none() {
            tracing::error!(fqdn = %fqdn, "GET from unknown server");
            return Err(ProtocolViolation::UnknownServer(fqdn));
        }

        let mut messages = Vec::new();
        let contact = self
            .hosts
            .update(&fqdn, Some(server_boot_time), Some(client_start_time));
        if contact.require_reset {
            messages.push(Message::session_terminate_all(&fqdn));
        }

        let queues = self.queues.get(&fqdn);
        match queues.drain(self.long_poll, client_start_time).await {
            Drain::Messages(drained) => messages.extend(drained),
            Drain::Detached => return Ok(Vec::new()),
        }

        let messages = self.sessions.filter_outbound(&fqdn, messages);
        tracing::debug!(fqdn = %fqdn, count = messages.len(), %client_start_time, "Agent GET");
        Ok(messages)
    }
}
