//! 会话管理
//!
//! 每个 (主机, 插件) 至多一个会话。会话的建立与终止会以内部消息通知插件
//! （RX 方向），对 Agent 的重置则放入主机出站队列（TX 方向）。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use super::message::{Message, MessageType};
use super::queues::HostQueueCollection;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: String,
    pub plugin: String,
    /// 最近接受的入站序号
    last_seq: Option<u64>,
}

impl Session {
    fn new(plugin: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            plugin: plugin.to_string(),
            last_seq: None,
        }
    }
}

/// 入站 DATA 的判定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataVerdict {
    Accept,
    /// 序号重复或倒退，丢弃
    Duplicate,
    /// 会话未知或已被替换
    UnknownSession,
}

type SessionKey = (String, String);

pub struct SessionCollection {
    sessions: Mutex<HashMap<SessionKey, Session>>,
    queues: Arc<HostQueueCollection>,
}

impl SessionCollection {
    pub fn new(queues: Arc<HostQueueCollection>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            queues,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SessionKey, Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn key(fqdn: &str, plugin: &str) -> SessionKey {
        (fqdn.to_string(), plugin.to_string())
    }

    pub fn get(&self, fqdn: &str, plugin: &str) -> Option<Session> {
        self.lock().get(&Self::key(fqdn, plugin)).cloned()
    }

    pub fn current_id(&self, fqdn: &str, plugin: &str) -> Option<String> {
        self.get(fqdn, plugin).map(|s| s.id)
    }

    /// 新建会话，替换已有会话
    pub fn create(&self, fqdn: &str, plugin: &str) -> Session {
        let mut sessions = self.lock();
        let session = Session::new(plugin);
        if let Some(old) = sessions.insert(Self::key(fqdn, plugin), session.clone()) {
            tracing::warn!(fqdn, plugin, session_id = %old.id, "Destroying session to create new one");
            self.queues
                .receive(Message::session_terminate(fqdn, plugin, Some(&old.id)));
        }
        self.queues
            .receive(Message::session_create(fqdn, plugin, &session.id));
        session
    }

    /// 校验入站 DATA 的会话与序号
    ///
    /// 序号缺失时总是接受；出现跳号只记录日志，消息照常接受。
    pub fn accept_data(&self, message: &Message) -> DataVerdict {
        let (Some(plugin), Some(session_id)) = (message.plugin(), message.session_id()) else {
            return DataVerdict::UnknownSession;
        };
        let mut sessions = self.lock();
        let Some(session) = sessions.get_mut(&Self::key(&message.fqdn, plugin)) else {
            return DataVerdict::UnknownSession;
        };
        if session.id != session_id {
            return DataVerdict::UnknownSession;
        }

        let Some(seq) = message.session_seq else {
            return DataVerdict::Accept;
        };
        match session.last_seq {
            Some(last) if seq <= last => {
                tracing::warn!(
                    fqdn = %message.fqdn,
                    plugin,
                    session_id,
                    seq,
                    last,
                    "Dropping duplicate message"
                );
                return DataVerdict::Duplicate;
            }
            Some(last) if seq > last + 1 => {
                tracing::warn!(
                    fqdn = %message.fqdn,
                    plugin,
                    session_id,
                    expected = last + 1,
                    seq,
                    "Gap in session sequence"
                );
            }
            _ => {}
        }
        session.last_seq = Some(seq);
        DataVerdict::Accept
    }

    /// 过滤出站消息：DATA 与会话应答只发往当前会话，终止消息总是发送
    pub fn filter_outbound(&self, fqdn: &str, messages: Vec<Message>) -> Vec<Message> {
        let sessions = self.lock();
        messages
            .into_iter()
            .filter(|message| match message.kind {
                MessageType::SessionTerminate | MessageType::SessionTerminateAll => true,
                _ => {
                    let current = message
                        .plugin()
                        .and_then(|p| sessions.get(&Self::key(fqdn, p)))
                        .map(|s| s.id.as_str());
                    let valid = current.is_some() && current == message.session_id();
                    if !valid {
                        tracing::debug!(
                            fqdn,
                            plugin = ?message.plugin(),
                            session_id = ?message.session_id(),
                            current = ?current,
                            "Dropping message with stale session id"
                        );
                    }
                    valid
                }
            })
            .collect()
    }

    fn terminate_locked(&self, sessions: &mut HashMap<SessionKey, Session>, fqdn: &str, plugin: &str) {
        if let Some(session) = sessions.remove(&Self::key(fqdn, plugin)) {
            tracing::warn!(fqdn, plugin, session_id = %session.id, "Terminating session");
        }
        self.queues
            .send(Message::session_terminate(fqdn, plugin, None));
    }

    /// TX 方向的重置：通知 Agent 该会话已不存在
    pub fn reset_session(&self, fqdn: &str, plugin: &str, session_id: &str) {
        let mut sessions = self.lock();
        if sessions.contains_key(&Self::key(fqdn, plugin)) {
            self.terminate_locked(&mut sessions, fqdn, plugin);
        } else {
            tracing::warn!(fqdn, plugin, session_id, "Ignoring request to terminate unknown session");
        }
    }

    /// 重置某插件在所有主机上的会话
    pub fn reset_plugin_sessions(&self, plugin: &str) {
        let mut sessions = self.lock();
        let victims: Vec<String> = sessions
            .keys()
            .filter(|(_, p)| p == plugin)
            .map(|(fqdn, _)| fqdn.clone())
            .collect();
        for fqdn in victims {
            self.terminate_locked(&mut sessions, &fqdn, plugin);
        }
    }

    /// 双向重置某主机的所有会话：通知插件会话结束，并告知 Agent 已被放弃
    pub fn reset_fqdn_sessions(&self, fqdn: &str) {
        let mut sessions = self.lock();
        let victims: Vec<Session> = sessions
            .iter()
            .filter(|((f, _), _)| f == fqdn)
            .map(|(_, s)| s.clone())
            .collect();
        for session in victims {
            tracing::info!(fqdn, plugin = %session.plugin, session_id = %session.id, "Terminating session");
            self.queues.receive(Message::session_terminate(
                fqdn,
                &session.plugin,
                Some(&session.id),
            ));
            self.terminate_locked(&mut sessions, fqdn, &session.plugin);
        }
    }

    pub fn remove_host(&self, fqdn: &str) {
        self.lock().retain(|(f, _), _| f != fqdn);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
