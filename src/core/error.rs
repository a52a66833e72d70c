//! 错误类型
//!
//! 按发生位置划分：规划（PlanningError）、锁（LockError）、步骤执行（StepError）、
//! Agent 通信（AgentError）、持久化（StoreError）、传输边界（ProtocolViolation）、
//! 注册（RegistrationError）。传输边界的两类错误可直接映射为 HTTP 状态码。

use thiserror::Error;

use crate::state::entity::EntityId;

/// 规划 / 提交阶段的错误：命令在任何 Job 运行前被拒绝，无副作用
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulingError {
    #[error("{entity} has no state '{state}'")]
    UnknownState { entity: EntityId, state: String },

    #[error("{entity} cannot be moved to '{state}' (available: {available:?})")]
    InvalidState {
        entity: EntityId,
        state: String,
        available: Vec<String>,
    },

    #[error("no route for {entity} from '{from}' to '{to}'")]
    NoRoute {
        entity: EntityId,
        from: String,
        to: String,
    },

    #[error("dependency cycle between {0:?}")]
    Cycle(Vec<String>),

    #[error("entity not found: {0}")]
    EntityNotFound(EntityId),

    #[error("job {0} not found")]
    JobNotFound(u64),

    #[error("command {0} not found")]
    CommandNotFound(u64),

    #[error("inconsistent lock chain on {item}: expected begin '{expected}', found '{found}'")]
    InconsistentLocks {
        item: EntityId,
        expected: String,
        found: String,
    },

    #[error("invalid job request: {0}")]
    InvalidRequest(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// 锁获取失败
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// 暂时冲突，Job 保持 planned，下一轮调度重试
    #[error("lock conflict on {item} (held by job {holder})")]
    Conflict { item: EntityId, holder: u64 },

    /// 写锁的 begin_state 与实体当前状态不符
    #[error("{item} is in state '{actual}', expected '{expected}'")]
    PreconditionViolated {
        item: EntityId,
        expected: String,
        actual: String,
    },
}

/// Agent 调用结果错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    /// 超时、会话中断、无法建立会话
    #[error("agent on {fqdn} unreachable: {detail}")]
    Unreachable { fqdn: String, detail: String },

    /// Agent 执行了命令并报告失败
    #[error("agent on {fqdn} failed '{action}': {message}")]
    Failure {
        fqdn: String,
        action: String,
        message: String,
    },

    #[error("agent call cancelled")]
    Cancelled,
}

/// 单个步骤的错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StepError {
    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error("step failed: {0}")]
    Failed(String),

    #[error("step cancelled")]
    Cancelled,
}

/// 持久化协作者错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("entity not found: {0}")]
    NotFound(EntityId),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// 传输边界上的协议违规：请求在此被拒绝，不会进入调度器
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    /// 证书无效或未知
    #[error("client certificate rejected")]
    Forbidden,

    #[error("incorrect client name: {0}")]
    IncorrectClientName(String),

    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("unknown server '{0}'")]
    UnknownServer(String),
}

impl ProtocolViolation {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Forbidden => 403,
            Self::IncorrectClientName(_) | Self::Malformed(_) | Self::UnknownServer(_) => 400,
        }
    }
}

/// 注册 / 引导相关错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("registration token rejected")]
    InvalidToken,

    /// 重新注册时客户端证书无效
    #[error("client certificate rejected")]
    Unauthenticated,

    #[error("unknown server '{0}'")]
    UnknownHost(String),

    #[error("version incompatibility between manager {manager} and agent {agent}")]
    VersionMismatch { manager: String, agent: String },

    /// CSR 与声明的 FQDN 不一致；对方可能在冒充，响应体留空
    #[error("certificate request does not match fqdn")]
    FqdnMismatch,

    #[error("fqdn in use")]
    FqdnInUse,

    #[error("{0}")]
    BadProfile(String),

    #[error("malformed request: {0}")]
    Malformed(String),

    /// 签发方自身故障（密钥、证书读写或签名失败）
    #[error("certificate authority error: {0}")]
    Authority(String),

    #[error("scheduling failed: {0}")]
    Scheduling(#[from] SchedulingError),
}

impl RegistrationError {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidToken | Self::Unauthenticated => 403,
            Self::Scheduling(_) | Self::Authority(_) => 500,
            _ => 400,
        }
    }
}
