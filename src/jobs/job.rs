//! Job 数据结构
//!
//! Job 是调度的基本单位：可选地执行一个实体状态迁移，声明依赖、锁与有序步骤。

use serde::{Deserialize, Serialize};

use crate::state::entity::EntityId;

use super::kinds::JobType;

/// Job ID（单调递增）
pub type JobId = u64;

/// Job 状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// 已创建，依赖与锁尚未确定
    Pending,
    /// 依赖与锁已确定，等待前序 Job / 谓词 / 锁
    Planned,
    /// 已获得全部锁，等待工作槽位
    Runnable,
    Running,
    Complete,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Cancelled)
    }
}

/// 实体状态迁移 (entity, from, to)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateTransition {
    pub entity: EntityId,
    pub from_state: String,
    pub to_state: String,
}

impl StateTransition {
    pub fn new(entity: EntityId, from_state: &str, to_state: &str) -> Self {
        Self {
            entity,
            from_state: from_state.to_string(),
            to_state: to_state.to_string(),
        }
    }
}

/// 状态锁
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateLock {
    pub job: JobId,
    pub locked_item: EntityId,
    pub begin_state: Option<String>,
    pub end_state: Option<String>,
    pub write: bool,
}

impl StateLock {
    pub fn read(job: JobId, locked_item: EntityId) -> Self {
        Self {
            job,
            locked_item,
            begin_state: None,
            end_state: None,
            write: false,
        }
    }

    pub fn write(
        job: JobId,
        locked_item: EntityId,
        begin_state: Option<&str>,
        end_state: Option<&str>,
    ) -> Self {
        Self {
            job,
            locked_item,
            begin_state: begin_state.map(str::to_string),
            end_state: end_state.map(str::to_string),
            write: true,
        }
    }
}

/// 失败类别，区分“主机不可达”与“主机拒绝执行”
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    StepFailure,
    AgentUnreachable,
    AgentFailure,
    /// 锁获取时实体状态与迁移起点不符
    PreconditionViolated,
    /// 生成步骤失败（如引用的实体已不存在）
    InvalidSteps,
    /// 管理进程在 Job 运行期间重启，实际结果未知
    ManagerRestarted,
}

/// Job 的首个失败
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: FailureKind,
    /// 失败步骤的描述
    pub step: Option<String>,
    pub message: String,
}

/// 单步执行记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step: String,
    pub success: bool,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub started_at: i64,
    pub finished_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: JobType,
    pub status: JobStatus,
    pub description: String,
    /// 非迁移类 Job 作用的实体（如重启的主机）
    pub subject: Option<EntityId>,
    pub transition: Option<StateTransition>,
    /// 主机列表类 Job 的主机
    pub hosts: Vec<EntityId>,
    pub locks: Vec<StateLock>,
    /// 必须先到达终态的 Job
    pub wait_for: Vec<JobId>,
    pub requires_confirmation: bool,
    pub cancellable: bool,
    pub failure: Option<JobFailure>,
    pub step_results: Vec<StepResult>,
    pub created_at: i64,
    pub modified_at: i64,
}

impl Job {
    pub fn new(id: JobId, job_type: JobType) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            id,
            job_type,
            status: JobStatus::Pending,
            description: String::new(),
            subject: None,
            transition: None,
            hosts: Vec::new(),
            locks: Vec::new(),
            wait_for: Vec::new(),
            requires_confirmation: job_type.requires_confirmation(),
            cancellable: job_type.cancellable(),
            failure: None,
            step_results: Vec::new(),
            created_at: now,
            modified_at: now,
        }
    }

    pub fn with_transition(mut self, transition: StateTransition) -> Self {
        self.subject = Some(transition.entity);
        self.transition = Some(transition);
        self
    }

    pub fn with_subject(mut self, subject: EntityId) -> Self {
        self.subject = Some(subject);
        self
    }

    pub fn with_hosts(mut self, hosts: Vec<EntityId>) -> Self {
        self.hosts = hosts;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub(crate) fn set_status(&mut self, status: JobStatus) {
        self.status = status;
        self.modified_at = chrono::Utc::now().timestamp_millis();
    }

    /// 本 Job 的写锁目标
    pub fn write_locked_items(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.locks.iter().filter(|l| l.write).map(|l| l.locked_item)
    }
}

/// 维护类操作的显式 Job 请求（不经路径规划）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "class", rename_all = "snake_case")]
pub enum JobSpec {
    RebootHost { host: EntityId },
    ShutdownHost { host: EntityId },
    UpdateDevices { hosts: Vec<EntityId> },
    DetectTargets { hosts: Vec<EntityId> },
    ForceRemoveHost { host: EntityId },
}

impl JobSpec {
    pub fn job_type(&self) -> JobType {
        match self {
            Self::RebootHost { .. } => JobType::RebootHost,
            Self::ShutdownHost { .. } => JobType::ShutdownHost,
            Self::UpdateDevices { .. } => JobType::UpdateDevices,
            Self::DetectTargets { .. } => JobType::DetectTargets,
            Self::ForceRemoveHost { .. } => JobType::ForceRemoveHost,
        }
    }
}
