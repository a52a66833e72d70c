//! Agent 动作调用（action_runner 插件）
//!
//! 请求以 DATA 消息发出，体为 `{type: ACTION_START, id, action, args}`；Agent 以
//! `{type: ACTION_COMPLETE, id, result, exception, subprocesses}` 回复。
//!
//! - 会话被替换时，旧会话上未完成的调用在新会话上重发
//! - 会话终止时，未完成的调用以 Unreachable 失败
//! - 收到未知会话的回复时，重置该会话

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::error::AgentError;
use crate::jobs::step::AgentInvoker;

use super::message::{Message, MessageType};
use super::queues::{HostQueueCollection, RxHandler};
use super::session::SessionCollection;

pub const ACTION_RUNNER: &str = "action_runner";

/// 已取消调用的记录保留时长，迟到的回复据此识别
const CANCELLED_RETENTION: Duration = Duration::from_secs(10 * 60);

type Reply = Result<Value, AgentError>;

struct ActionInFlight {
    id: String,
    session_id: String,
    fqdn: String,
    action: String,
    args: Value,
    reply: oneshot::Sender<Reply>,
}

impl ActionInFlight {
    fn request(&self) -> Message {
        Message::data(
            &self.fqdn,
            ACTION_RUNNER,
            &self.session_id,
            json!({
                "type": "ACTION_START",
                "id": self.id,
                "action": self.action,
                "args": self.args,
            }),
        )
    }

    fn cancellation(&self) -> Message {
        Message::data(
            &self.fqdn,
            ACTION_RUNNER,
            &self.session_id,
            json!({
                "type": "ACTION_CANCEL",
                "id": self.id,
                "action": null,
                "args": null,
            }),
        )
    }
}

#[derive(Debug, Deserialize)]
struct ActionComplete {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    id: String,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    exception: Option<String>,
    #[serde(default)]
    subprocesses: Vec<Value>,
}

#[derive(Default)]
struct RpcState {
    /// fqdn -> 当前 action_runner 会话
    sessions: HashMap<String, String>,
    /// 会话 -> (调用 ID -> 调用)
    session_rpcs: HashMap<String, HashMap<String, ActionInFlight>>,
    cancelled: VecDeque<(Instant, String)>,
}

impl RpcState {
    fn remember_cancelled(&mut self, id: String) {
        let now = Instant::now();
        while self
            .cancelled
            .front()
            .is_some_and(|(at, _)| now.duration_since(*at) > CANCELLED_RETENTION)
        {
            self.cancelled.pop_front();
        }
        self.cancelled.push_back((now, id));
    }

    fn was_cancelled(&self, id: &str) -> bool {
        self.cancelled.iter().any(|(_, c)| c == id)
    }

    fn take_rpc(&mut self, id: &str) -> Option<ActionInFlight> {
        self.session_rpcs
            .values_mut()
            .find_map(|rpcs| rpcs.remove(id))
    }
}

pub struct AgentRpc {
    state: Mutex<RpcState>,
    queues: Arc<HostQueueCollection>,
    sessions: Arc<SessionCollection>,
    session_wait_timeout: Duration,
    /// 会话变化计数，等待会话的调用订阅它
    generation: watch::Sender<u64>,
}

impl AgentRpc {
    pub fn new(
        queues: Arc<HostQueueCollection>,
        sessions: Arc<SessionCollection>,
        session_wait_timeout: Duration,
    ) -> Arc<Self> {
        let (generation, _) = watch::channel(0);
        Arc::new(Self {
            state: Mutex::new(RpcState::default()),
            queues,
            sessions,
            session_wait_timeout,
            generation,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RpcState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bump(&self) {
        self.generation.send_modify(|g| *g += 1);
    }

    /// 清掉遗留会话（管理端重启后 Agent 需重新建立），并开始处理入站消息
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        self.sessions.reset_plugin_sessions(ACTION_RUNNER);
        self.queues.serve(self.clone(), cancel)
    }

    /// 服务停止时让所有未完成调用失败
    pub fn complete_all(&self) {
        let mut state = self.lock();
        for (_, rpcs) in state.session_rpcs.drain() {
            for (_, rpc) in rpcs {
                tracing::info!(rpc_id = %rpc.id, fqdn = %rpc.fqdn, "Erroring in-flight rpc");
                let _ = rpc.reply.send(Err(AgentError::Unreachable {
                    fqdn: rpc.fqdn.clone(),
                    detail: "cancelled due to service shutdown".into(),
                }));
            }
        }
    }

    pub fn remove(&self, fqdn: &str) {
        self.lock().sessions.remove(fqdn);
        self.bump();
    }

    pub fn in_flight(&self) -> usize {
        self.lock().session_rpcs.values().map(HashMap::len).sum()
    }

    fn abort_session(
        &self,
        state: &mut RpcState,
        fqdn: &str,
        reason: &str,
        old_session_id: &str,
        new_session_id: Option<&str>,
    ) {
        tracing::warn!(fqdn, session_id = old_session_id, reason, "Aborting session");
        match new_session_id {
            Some(new) => {
                state.sessions.insert(fqdn.to_string(), new.to_string());
            }
            None => {
                state.sessions.remove(fqdn);
            }
        }

        let old_rpcs = state.session_rpcs.remove(old_session_id).unwrap_or_default();
        for (id, mut rpc) in old_rpcs {
            match new_session_id {
                Some(new) => {
                    tracing::warn!(
                        rpc_id = %id,
                        session_id = new,
                        previous = old_session_id,
                        reason,
                        "Re-issuing rpc"
                    );
                    rpc.session_id = new.to_string();
                    self.queues.send(rpc.request());
                    state
                        .session_rpcs
                        .entry(new.to_string())
                        .or_default()
                        .insert(id, rpc);
                }
                None => {
                    let _ = rpc.reply.send(Err(AgentError::Unreachable {
                        fqdn: fqdn.to_string(),
                        detail: format!("communications error because {reason}"),
                    }));
                }
            }
        }
    }

    fn on_action_complete(&self, state: &mut RpcState, message: &Message) {
        let fqdn = message.fqdn.as_str();
        let Some(session_id) = message.session_id() else {
            return;
        };
        let response: ActionComplete = match serde_json::from_value(message.body.clone()) {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(fqdn, error = %e, "Malformed rpc response");
                return;
            }
        };
        if response.kind != "ACTION_COMPLETE" {
            tracing::error!(fqdn, kind = %response.kind, "Unexpected rpc message type");
            return;
        }

        match state.sessions.get(fqdn).cloned() {
            Some(current) if current != session_id => {
                tracing::info!(fqdn, session_id = %current, replaced_by = session_id, "Cancelling session");
                self.abort_session(state, fqdn, "session cancelled", &current, None);
                self.sessions.reset_session(fqdn, ACTION_RUNNER, session_id);
            }
            Some(_) => {
                let rpc = state
                    .session_rpcs
                    .get_mut(session_id)
                    .and_then(|rpcs| rpcs.remove(&response.id));
                match rpc {
                    Some(rpc) => {
                        tracing::info!(rpc_id = %rpc.id, fqdn, "Completing rpc");
                        let reply = match response.exception {
                            Some(exception) => Err(AgentError::Failure {
                                fqdn: rpc.fqdn.clone(),
                                action: rpc.action.clone(),
                                message: exception,
                            }),
                            None => Ok(response.result),
                        };
                        if !response.subprocesses.is_empty() {
                            tracing::debug!(rpc_id = %rpc.id, subprocesses = ?response.subprocesses, "Rpc subprocesses");
                        }
                        let _ = rpc.reply.send(reply);
                    }
                    None if state.was_cancelled(&response.id) => {
                        tracing::debug!(rpc_id = %response.id, "Response received from a cancelled rpc");
                    }
                    None => {
                        tracing::error!(rpc_id = %response.id, "Response received from unknown rpc");
                    }
                }
            }
            None => {
                tracing::info!(fqdn, session_id, "Response on unknown session");
                self.sessions.reset_session(fqdn, ACTION_RUNNER, session_id);
            }
        }
    }

    fn handle(&self, message: &Message) {
        let mut state = self.lock();
        let fqdn = message.fqdn.as_str();
        match message.kind {
            MessageType::SessionCreate => {
                let Some(session_id) = message.session_id() else {
                    return;
                };
                match state.sessions.get(fqdn).cloned() {
                    Some(old) => {
                        self.abort_session(&mut state, fqdn, "new session created", &old, Some(session_id))
                    }
                    None => {
                        state.sessions.insert(fqdn.to_string(), session_id.to_string());
                    }
                }
                tracing::info!(fqdn, session_id, "Action runner session established");
            }
            MessageType::SessionTerminate => {
                let Some(session_id) = message.session_id() else {
                    return;
                };
                if state.sessions.get(fqdn).map(String::as_str) == Some(session_id) {
                    self.abort_session(&mut state, fqdn, "session terminated", session_id, None);
                } else if let Some(stale) = state.session_rpcs.remove(session_id) {
                    for (_, rpc) in stale {
                        let _ = rpc.reply.send(Err(AgentError::Unreachable {
                            fqdn: fqdn.to_string(),
                            detail: "session terminated".into(),
                        }));
                    }
                }
            }
            MessageType::SessionTerminateAll => {
                let all: Vec<(String, String)> = state
                    .sessions
                    .iter()
                    .map(|(f, s)| (f.clone(), s.clone()))
                    .collect();
                for (fqdn, session_id) in all {
                    self.abort_session(&mut state, &fqdn, "all sessions terminated", &session_id, None);
                }
            }
            MessageType::Data => self.on_action_complete(&mut state, message),
            other => tracing::debug!(fqdn, kind = ?other, "Ignoring message"),
        }
        drop(state);
        self.bump();
    }

    fn send_request(
        &self,
        fqdn: &str,
        action: &str,
        args: Value,
    ) -> Result<(String, oneshot::Receiver<Reply>), AgentError> {
        let mut state = self.lock();
        let Some(session_id) = state.sessions.get(fqdn).cloned() else {
            tracing::warn!(fqdn, "No action runner session");
            return Err(AgentError::Unreachable {
                fqdn: fqdn.to_string(),
                detail: "no session".into(),
            });
        };

        let (reply, rx) = oneshot::channel();
        let rpc = ActionInFlight {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.clone(),
            fqdn: fqdn.to_string(),
            action: action.to_string(),
            args,
            reply,
        };
        let id = rpc.id.clone();
        tracing::debug!(rpc_id = %id, fqdn, action, session_id = %session_id, "Sending rpc");
        self.queues.send(rpc.request());
        state
            .session_rpcs
            .entry(session_id)
            .or_default()
            .insert(id.clone(), rpc);
        Ok((id, rx))
    }

    /// 取消未完成的调用；已完成或已中止的调用忽略
    fn send_cancellation(&self, id: &str) {
        let mut state = self.lock();
        match state.take_rpc(id) {
            Some(rpc) => {
                tracing::warn!(rpc_id = id, fqdn = %rpc.fqdn, "Cancelling rpc");
                self.queues.send(rpc.cancellation());
            }
            None => tracing::debug!(rpc_id = id, "Dropping cancellation of finished rpc"),
        }
        state.remember_cancelled(id.to_string());
    }

    /// 等待直到 `ready` 成立或超时
    async fn wait_until(&self, timeout: Duration, ready: impl Fn(&RpcState) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        let mut changes = self.generation.subscribe();
        loop {
            if ready(&*self.lock()) {
                return true;
            }
            match tokio::time::timeout_at(deadline, changes.changed()).await {
                Ok(Ok(())) => continue,
                _ => return ready(&*self.lock()),
            }
        }
    }
}

/// 调用结束前被丢弃（超时、任务取消）时向 Agent 发送取消
struct InFlightGuard<'a> {
    rpc: &'a AgentRpc,
    id: String,
    armed: bool,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.rpc.send_cancellation(&self.id);
        }
    }
}

#[async_trait]
impl RxHandler for AgentRpc {
    fn plugin(&self) -> &str {
        ACTION_RUNNER
    }

    async fn on_rx(&self, message: Message) {
        tracing::debug!(fqdn = %message.fqdn, kind = ?message.kind, "Rpc rx");
        self.handle(&message);
    }
}

#[async_trait]
impl AgentInvoker for AgentRpc {
    async fn invoke(
        &self,
        fqdn: &str,
        action: &str,
        args: Value,
        cancel: CancellationToken,
    ) -> Result<Value, AgentError> {
        self.await_session(fqdn, self.session_wait_timeout).await?;
        let (id, reply) = self.send_request(fqdn, action, args)?;
        let mut guard = InFlightGuard {
            rpc: self,
            id,
            armed: true,
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                Err(AgentError::Cancelled)
            }
            reply = reply => {
                guard.armed = false;
                reply.unwrap_or_else(|_| Err(AgentError::Unreachable {
                    fqdn: fqdn.to_string(),
                    detail: "rpc abandoned".into(),
                }))
            }
        }
    }

    async fn await_session(&self, fqdn: &str, timeout: Duration) -> Result<(), AgentError> {
        if self
            .wait_until(timeout, |state| state.sessions.contains_key(fqdn))
            .await
        {
            return Ok(());
        }
        tracing::error!(fqdn, timeout_secs = timeout.as_secs(), "No action runner session");
        Err(AgentError::Unreachable {
            fqdn: fqdn.to_string(),
            detail: format!("no session after {} seconds", timeout.as_secs()),
        })
    }

    fn session_id(&self, fqdn: &str) -> Option<String> {
        self.lock().sessions.get(fqdn).cloned()
    }

    async fn await_restart(
        &self,
        fqdn: &str,
        previous: Option<String>,
        timeout: Duration,
    ) -> Result<(), AgentError> {
        let previous = previous.or_else(|| self.session_id(fqdn));
        tracing::info!(fqdn, previous = ?previous, "Awaiting agent restart");
        let restarted = self
            .wait_until(timeout, |state| {
                state
                    .sessions
                    .get(fqdn)
                    .is_some_and(|current| Some(current) != previous.as_ref())
            })
            .await;
        if restarted {
            Ok(())
        } else {
            Err(AgentError::Unreachable {
                fqdn: fqdn.to_string(),
                detail: format!("did not restart within {} seconds", timeout.as_secs()),
            })
        }
    }
}
