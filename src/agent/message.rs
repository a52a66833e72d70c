//! Agent 通信消息格式
//!
//! 管理端与主机 Agent 之间以 JSON 消息通信。出站（TX）消息由 GET 长轮询取走，
//! 入站（RX）消息由 POST 提交后分发给对应插件的处理器。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 消息类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    /// 会话内数据
    Data,
    /// Agent 请求建立会话
    SessionCreateRequest,
    /// 会话建立应答（携带新会话 ID）
    SessionCreateResponse,
    /// 会话已建立（仅在管理端内部向插件通知）
    SessionCreate,
    SessionTerminate,
    SessionTerminateAll,
    /// 出站屏障：持有旧 client_start_time 的 GET 见到后立即脱离
    TxBarrier,
}

/// 单条消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub fqdn: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub plugin: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub session_seq: Option<u64>,
    #[serde(default)]
    pub body: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_start_time: Option<DateTime<Utc>>,
}

impl Message {
    fn control(fqdn: &str, kind: MessageType, plugin: Option<&str>, session_id: Option<&str>) -> Self {
        Self {
            fqdn: fqdn.to_string(),
            kind,
            plugin: plugin.map(str::to_string),
            session_id: session_id.map(str::to_string),
            session_seq: None,
            body: Value::Null,
            client_start_time: None,
        }
    }

    pub fn data(fqdn: &str, plugin: &str, session_id: &str, body: Value) -> Self {
        Self {
            body,
            ..Self::control(fqdn, MessageType::Data, Some(plugin), Some(session_id))
        }
    }

    pub fn session_create(fqdn: &str, plugin: &str, session_id: &str) -> Self {
        Self::control(fqdn, MessageType::SessionCreate, Some(plugin), Some(session_id))
    }

    pub fn session_create_response(fqdn: &str, plugin: &str, session_id: &str) -> Self {
        Self::control(
            fqdn,
            MessageType::SessionCreateResponse,
            Some(plugin),
            Some(session_id),
        )
    }

    pub fn session_terminate(fqdn: &str, plugin: &str, session_id: Option<&str>) -> Self {
        Self::control(fqdn, MessageType::SessionTerminate, Some(plugin), session_id)
    }

    pub fn session_terminate_all(fqdn: &str) -> Self {
        Self::control(fqdn, MessageType::SessionTerminateAll, None, None)
    }

    pub fn tx_barrier(fqdn: &str, client_start_time: DateTime<Utc>) -> Self {
        Self {
            client_start_time: Some(client_start_time),
            ..Self::control(fqdn, MessageType::TxBarrier, None, None)
        }
    }

    pub fn plugin(&self) -> Option<&str> {
        self.plugin.as_deref()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }
}

/// POST /agent/message 的请求体
#[derive(Debug, Clone, Deserialize)]
pub struct PostEnvelope {
    /// 缺失时按协议违规处理，因此保留为 Option
    #[serde(default)]
    pub messages: Option<Vec<Message>>,
    #[serde(default)]
    pub client_start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub server_boot_time: Option<DateTime<Utc>>,
}

/// GET /agent/message 的响应体
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageBatch {
    pub messages: Vec<Message>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_format() {
        let msg = Message::session_terminate("oss1", "action_runner", None);
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "fqdn": "oss1",
                "type": "SESSION_TERMINATE",
                "plugin": "action_runner",
                "session_id": null,
                "session_seq": null,
                "body": null,
            })
        );
    }

    #[test]
    fn test_agent_message_parses_without_optional_fields() {
        let msg: Message = serde_json::from_value(json!({
            "fqdn": "oss1",
            "type": "SESSION_CREATE_REQUEST",
            "plugin": "action_runner",
        }))
        .unwrap();
        assert_eq!(msg.kind, MessageType::SessionCreateRequest);
        assert_eq!(msg.session_id(), None);
        assert!(msg.body.is_null());
    }

    #[test]
    fn test_envelope_without_messages() {
        let envelope: PostEnvelope = serde_json::from_value(json!({})).unwrap();
        assert!(envelope.messages.is_none());
    }
}
