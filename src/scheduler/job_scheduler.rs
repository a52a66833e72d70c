//! Job 调度器
//!
//! 所有调度状态（Job、命令、已声明锁、运行期锁）放在一把互斥锁后面，
//! 锁从不跨越 `.await` 持有。每次状态变化后调用 `advance` 重新评估 planned Job：
//!
//! - `wait_for` 尚未全部终结：继续等待
//! - 全部终结但依赖不满足：依赖已不可能被满足，取消（由此形成级联取消）
//! - 锁冲突：保持 planned
//! - 写锁起点状态不符：失败（PreconditionViolated）
//! - 否则获得锁，进入 runnable，等待工作槽位后 running
//!
//! Job 成功后通过缓存应用迁移（先 invalidate 再回源写入），失败时实体保持原状态。

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::core::error::{LockError, SchedulingError, StoreError};
use crate::jobs::job::{FailureKind, Job, JobFailure, JobId, JobSpec, JobStatus, StateTransition};
use crate::jobs::kinds;
use crate::jobs::step::{AgentInvoker, ExecutionReport, JobOutcome, Step, StepExecutor, StepTimeouts};
use crate::state::catalog;
use crate::state::entity::{EntityId, EntityKind, EntityPayload, HostRecord, InstallMethod, LnetRecord, ProfileRegistry};
use crate::state::store::EntityCache;

use super::command::{Command, CommandId};
use super::lock_cache::LockCache;
use super::lock_manager::LockManager;
use super::planner::{self, CommandPlanner, JobPreference, JobPreview, Plan};

/// 调度器参数
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub max_workers: usize,
    pub max_db_connections: usize,
    pub preference: JobPreference,
    pub rpc_timeout: Duration,
    pub timeouts: StepTimeouts,
    /// 内存中保留的已结束命令数，更早的连同其 Job 一起淘汰
    pub retained_commands: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_workers: 8,
            max_db_connections: 10,
            preference: JobPreference::Unconfirmed,
            rpc_timeout: Duration::from_secs(300),
            timeouts: StepTimeouts {
                deploy: Duration::from_secs(600),
                restart: Duration::from_secs(300),
            },
            retained_commands: 1000,
        }
    }
}

/// 取消请求的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// 尚未开始，已直接取消
    Cancelled,
    /// 已通知执行中的 Job，协作式退出
    Signalled,
    /// 正在运行且不可取消，将运行到结束
    NotCancellable,
    AlreadyFinished,
}

#[derive(Default)]
struct SchedulerInner {
    jobs: BTreeMap<JobId, Job>,
    commands: BTreeMap<CommandId, Command>,
    lock_cache: LockCache,
    locks: LockManager,
    tokens: HashMap<JobId, CancellationToken>,
    next_job_id: JobId,
    next_command_id: CommandId,
}

impl SchedulerInner {
    fn refresh_commands(&mut self) {
        let jobs = &self.jobs;
        for command in self.commands.values_mut().filter(|c| !c.complete) {
            command.refresh(jobs);
        }
    }

    /// 只保留最近 `keep` 条已结束命令；被淘汰命令独占的终态 Job 一并丢弃
    fn prune_completed(&mut self, keep: usize) -> usize {
        let complete: Vec<CommandId> = self
            .commands
            .values()
            .filter(|c| c.complete)
            .map(|c| c.id)
            .collect();
        let excess = complete.len().saturating_sub(keep);
        for command_id in &complete[..excess] {
            let Some(command) = self.commands.remove(command_id) else {
                continue;
            };
            for job_id in command.job_ids {
                let shared = self.commands.values().any(|c| c.job_ids.contains(&job_id));
                let terminal = self.jobs.get(&job_id).map(Job::is_terminal).unwrap_or(false);
                if terminal && !shared {
                    self.jobs.remove(&job_id);
                }
            }
        }
        excess
    }

    /// 把 Job 置为终态并释放其锁
    fn finish_job(&mut self, job_id: JobId, status: JobStatus, failure: Option<JobFailure>) {
        if let Some(job) = self.jobs.get_mut(&job_id) {
            job.set_status(status);
            job.failure = failure;
        }
        self.locks.release(job_id);
        self.lock_cache.remove_job(job_id);
        self.tokens.remove(&job_id);
    }
}

type ReadyJob = (JobId, Vec<Box<dyn Step>>, CancellationToken);

/// 主机移除 Job 完成后的清理，例如吊销证书、丢弃会话
pub trait HostRemovalHook: Send + Sync {
    fn host_removed(&self, fqdn: &str);
}

pub struct JobScheduler {
    inner: Mutex<SchedulerInner>,
    cache: Arc<EntityCache>,
    profiles: Arc<ProfileRegistry>,
    executor: StepExecutor,
    workers: Arc<Semaphore>,
    settings: SchedulerSettings,
    generation: watch::Sender<u64>,
    removal_hooks: RwLock<Vec<Arc<dyn HostRemovalHook>>>,
}

impl JobScheduler {
    pub fn new(
        cache: Arc<EntityCache>,
        profiles: Arc<ProfileRegistry>,
        agent: Arc<dyn AgentInvoker>,
        settings: SchedulerSettings,
    ) -> Arc<Self> {
        let (generation, _) = watch::channel(0);
        let inner = SchedulerInner {
            next_job_id: 1,
            next_command_id: 1,
            ..Default::default()
        };
        Arc::new(Self {
            inner: Mutex::new(inner),
            executor: StepExecutor::new(agent, settings.max_db_connections, settings.rpc_timeout),
            workers: Arc::new(Semaphore::new(settings.max_workers.max(1))),
            cache,
            profiles,
            settings,
            generation,
            removal_hooks: RwLock::new(Vec::new()),
        })
    }

    /// 注册主机移除后的清理；在调度锁之外调用
    pub fn on_host_removed(&self, hook: Arc<dyn HostRemovalHook>) {
        self.removal_hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(hook);
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bump(&self) {
        self.generation.send_modify(|g| *g = g.wrapping_add(1));
    }

    pub fn cache(&self) -> &Arc<EntityCache> {
        &self.cache
    }

    pub fn profiles(&self) -> &Arc<ProfileRegistry> {
        &self.profiles
    }

    /// 请求实体到达 `state`
    pub fn set_state(
        self: &Arc<Self>,
        entity: EntityId,
        state: &str,
        message: &str,
        preference: Option<JobPreference>,
    ) -> Result<CommandId, SchedulingError> {
        self.set_states(&[(entity, state.to_string())], message, preference)
    }

    /// 同一命令中请求多个实体的目标状态
    pub fn set_states(
        self: &Arc<Self>,
        targets: &[(EntityId, String)],
        message: &str,
        preference: Option<JobPreference>,
    ) -> Result<CommandId, SchedulingError> {
        let preference = preference.unwrap_or(self.settings.preference);
        let command_id = {
            let mut inner = self.lock();
            let plan = {
                let mut planner =
                    CommandPlanner::new(&self.cache, &self.profiles, &inner.lock_cache, preference);
                for (entity, state) in targets {
                    planner.plan_state(*entity, state)?;
                }
                planner.finish(inner.next_job_id)?
            };
            self.commit(&mut inner, plan, message)
        };
        self.advance();
        Ok(command_id)
    }

    /// 提交显式维护类 Job（不经路径规划）
    pub fn submit_jobs(
        self: &Arc<Self>,
        specs: &[JobSpec],
        message: &str,
    ) -> Result<CommandId, SchedulingError> {
        if specs.is_empty() {
            return Err(SchedulingError::InvalidRequest("no jobs requested".into()));
        }
        let command_id = {
            let mut inner = self.lock();
            let plan = {
                let mut planner = CommandPlanner::new(
                    &self.cache,
                    &self.profiles,
                    &inner.lock_cache,
                    self.settings.preference,
                );
                for spec in specs {
                    planner.plan_job(spec)?;
                }
                planner.finish(inner.next_job_id)?
            };
            self.commit(&mut inner, plan, message)
        };
        self.advance();
        Ok(command_id)
    }

    fn commit(&self, inner: &mut SchedulerInner, plan: Plan, message: &str) -> CommandId {
        let Plan {
            jobs,
            attached,
            lock_cache,
        } = plan;
        inner.next_job_id += jobs.len() as JobId;
        inner.lock_cache = lock_cache;

        let mut job_ids = attached;
        for job in jobs {
            tracing::debug!(job_id = job.id, job = %job.description, wait_for = ?job.wait_for, "Job planned");
            job_ids.push(job.id);
            inner.jobs.insert(job.id, job);
        }

        let command_id = inner.next_command_id;
        inner.next_command_id += 1;
        let mut command = Command::new(command_id, message, job_ids);
        command.refresh(&inner.jobs);
        tracing::info!(command_id, jobs = command.job_ids.len(), request = message, "Command created");
        inner.commands.insert(command_id, command);
        command_id
    }

    /// 试运行规划，不创建任何 Job
    pub fn get_transition_consequences(
        &self,
        entity: EntityId,
        state: &str,
    ) -> Result<Vec<JobPreview>, SchedulingError> {
        let inner = self.lock();
        let mut planner = CommandPlanner::new(
            &self.cache,
            &self.profiles,
            &inner.lock_cache,
            self.settings.preference,
        );
        planner.plan_state(entity, state)?;
        let plan = planner.finish(inner.next_job_id)?;
        Ok(plan
            .jobs
            .into_iter()
            .map(|job| JobPreview {
                job_type: job.job_type,
                requires_confirmation: job.requires_confirmation,
                entity: job.subject,
                description: job.description,
            })
            .collect())
    }

    /// 从预期状态出发可请求的目标状态
    pub fn available_transitions(&self, entity: EntityId) -> Result<Vec<String>, SchedulingError> {
        let inner = self.lock();
        let current = self
            .cache
            .get(entity)
            .map_err(|_| SchedulingError::EntityNotFound(entity))?;
        let expected = inner
            .lock_cache
            .expected_state(entity)
            .map(str::to_string)
            .unwrap_or_else(|| current.state.clone());
        Ok(catalog::available_states(
            &current.with_state(&expected),
            &self.profiles,
        ))
    }

    /// 重新评估 planned Job 并派发可运行的
    pub fn advance(self: &Arc<Self>) {
        let ready = {
            let mut inner = self.lock();
            let ready = self.evaluate(&mut inner);
            inner.refresh_commands();
            let pruned = inner.prune_completed(self.settings.retained_commands.max(1));
            if pruned > 0 {
                tracing::debug!(pruned, "Evicted completed commands");
            }
            ready
        };
        for (job_id, steps, token) in ready {
            let scheduler = Arc::clone(self);
            tokio::spawn(async move {
                scheduler.run_job(job_id, steps, token).await;
            });
        }
        self.bump();
    }

    fn evaluate(&self, inner: &mut SchedulerInner) -> Vec<ReadyJob> {
        let state_of = |id: EntityId| self.cache.state_of(id);
        let mut ready = Vec::new();
        loop {
            let mut changed = false;
            let planned: Vec<JobId> = inner
                .jobs
                .values()
                .filter(|j| j.status == JobStatus::Planned)
                .map(|j| j.id)
                .collect();

            for job_id in planned {
                let Some(job) = inner.jobs.get(&job_id).cloned() else {
                    continue;
                };
                let waiting = job.wait_for.iter().any(|w| {
                    inner
                        .jobs
                        .get(w)
                        .map(|j| !j.is_terminal())
                        .unwrap_or(false)
                });
                if waiting {
                    continue;
                }

                if !planner::all_deps(&job, &self.cache).satisfied(&state_of) {
                    tracing::info!(job_id, job = %job.description, "Dependencies can no longer be satisfied, cancelling");
                    inner.finish_job(job_id, JobStatus::Cancelled, None);
                    changed = true;
                    continue;
                }

                match inner.locks.acquire(job_id, &job.locks, &state_of) {
                    Ok(_) => {}
                    Err(LockError::Conflict { item, holder }) => {
                        tracing::debug!(job_id, %item, holder, "Lock conflict, staying planned");
                        continue;
                    }
                    Err(e @ LockError::PreconditionViolated { .. }) => {
                        tracing::warn!(job_id, error = %e, "Transition precondition violated");
                        inner.finish_job(
                            job_id,
                            JobStatus::Failed,
                            Some(JobFailure {
                                kind: FailureKind::PreconditionViolated,
                                step: None,
                                message: e.to_string(),
                            }),
                        );
                        changed = true;
                        continue;
                    }
                }

                match kinds::build_steps(&job, &self.cache, &self.profiles, &self.settings.timeouts) {
                    Ok(steps) => {
                        let token = CancellationToken::new();
                        inner.tokens.insert(job_id, token.clone());
                        if let Some(job) = inner.jobs.get_mut(&job_id) {
                            job.set_status(JobStatus::Runnable);
                        }
                        ready.push((job_id, steps, token));
                    }
                    Err(e) => {
                        tracing::warn!(job_id, error = %e, "Cannot build steps");
                        inner.finish_job(
                            job_id,
                            JobStatus::Failed,
                            Some(JobFailure {
                                kind: FailureKind::InvalidSteps,
                                step: None,
                                message: e.to_string(),
                            }),
                        );
                        changed = true;
                    }
                }
            }

            if !changed {
                break;
            }
        }
        ready
    }

    async fn run_job(self: Arc<Self>, job_id: JobId, steps: Vec<Box<dyn Step>>, token: CancellationToken) {
        let permit = tokio::select! {
            biased;
            _ = token.cancelled() => {
                self.complete_job(job_id, ExecutionReport { outcome: JobOutcome::Cancelled, results: Vec::new() });
                return;
            }
            permit = Arc::clone(&self.workers).acquire_owned() => permit,
        };
        let _permit = match permit {
            Ok(permit) => permit,
            Err(e) => {
                self.complete_job(
                    job_id,
                    ExecutionReport {
                        outcome: JobOutcome::Failed(JobFailure {
                            kind: FailureKind::StepFailure,
                            step: None,
                            message: format!("worker pool closed: {e}"),
                        }),
                        results: Vec::new(),
                    },
                );
                return;
            }
        };

        {
            let mut inner = self.lock();
            match inner.jobs.get_mut(&job_id) {
                Some(job) if job.status == JobStatus::Runnable => {
                    job.set_status(JobStatus::Running);
                    tracing::info!(job_id, job = %job.description, "Job started");
                }
                _ => return,
            }
        }
        self.bump();

        let report = self.executor.run(job_id, steps, token).await;
        self.complete_job(job_id, report);
    }

    fn complete_job(self: &Arc<Self>, job_id: JobId, report: ExecutionReport) {
        let mut removed_host = None;
        {
            let mut inner = self.lock();
            let Some(job) = inner.jobs.get(&job_id).cloned() else {
                return;
            };
            if job.is_terminal() {
                return;
            }

            let (status, failure) = match report.outcome {
                JobOutcome::Succeeded => match self.apply_success(&inner, &job) {
                    Ok(()) => (JobStatus::Complete, None),
                    Err(e) => (
                        JobStatus::Failed,
                        Some(JobFailure {
                            kind: FailureKind::StepFailure,
                            step: None,
                            message: format!("failed to record new state: {e}"),
                        }),
                    ),
                },
                JobOutcome::Failed(failure) => (JobStatus::Failed, Some(failure)),
                JobOutcome::Cancelled => (JobStatus::Cancelled, None),
            };

            match status {
                JobStatus::Complete => tracing::info!(job_id, job = %job.description, "Job complete"),
                JobStatus::Failed => tracing::warn!(
                    job_id,
                    job = %job.description,
                    error = failure.as_ref().map(|f| f.message.as_str()).unwrap_or(""),
                    "Job failed"
                ),
                _ => tracing::info!(job_id, job = %job.description, "Job cancelled"),
            }

            if let Some(stored) = inner.jobs.get_mut(&job_id) {
                stored.step_results = report.results;
            }
            inner.finish_job(job_id, status, failure);

            if status == JobStatus::Complete {
                self.refresh_filesystems(&inner, &job);
                if matches!(job.job_type, kinds::JobType::RemoveHost | kinds::JobType::ForceRemoveHost) {
                    removed_host = job
                        .subject
                        .and_then(|id| self.cache.get(id).ok())
                        .and_then(|host| host.as_host().map(|h| h.fqdn.clone()));
                }
            }
        }

        if let Some(fqdn) = removed_host {
            let hooks = self
                .removal_hooks
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            for hook in hooks {
                hook.host_removed(&fqdn);
            }
        }
        self.advance();
    }

    /// 应用迁移与 Job 的附加效果；调用时 Job 仍持有写锁
    fn apply_success(&self, inner: &SchedulerInner, job: &Job) -> Result<(), StoreError> {
        if let Some(transition) = &job.transition {
            assert!(
                inner.locks.holds_write(job.id, transition.entity),
                "job {} completed without holding the write lock on {}",
                job.id,
                transition.entity
            );
            self.cache.invalidate(transition.entity);
            let mut entity = self.cache.get(transition.entity)?;
            entity.apply_transition(&transition.to_state);
            self.cache.save(&entity)?;
        }
        let touched = kinds::on_success(job, &self.cache)?;
        for id in touched {
            self.cache.invalidate(id);
        }
        Ok(())
    }

    /// Target 状态变化后重算所属文件系统的状态
    fn refresh_filesystems(&self, inner: &SchedulerInner, job: &Job) {
        let mut filesystems: Vec<EntityId> = Vec::new();
        let mut note_target = |target: EntityId| {
            let fs = self
                .cache
                .get(target)
                .ok()
                .and_then(|t| t.as_target().and_then(|t| t.filesystem));
            if let Some(fs) = fs {
                if !filesystems.contains(&fs) {
                    filesystems.push(fs);
                }
            }
        };
        match (&job.transition, job.job_type) {
            (Some(t), _) if t.entity.kind == EntityKind::Target => note_target(t.entity),
            (Some(t), kinds::JobType::ForceRemoveHost) => {
                for target in self.cache.query(EntityKind::Target, &|e| {
                    e.as_target().map(|r| r.primary_host == t.entity).unwrap_or(false)
                })
                .unwrap_or_default()
                {
                    note_target(target.id);
                }
            }
            _ => {}
        }

        for fs_id in filesystems {
            if inner.lock_cache.has_locks(fs_id) {
                continue;
            }
            let Ok(mut fs) = self.cache.get(fs_id) else {
                continue;
            };
            if !fs.not_deleted || fs.state == "removed" || fs.state == "forgotten" {
                continue;
            }
            let targets = self.cache.targets_of_filesystem(fs_id);
            if targets.is_empty() {
                continue;
            }
            let mounted = targets.iter().filter(|t| t.state == "mounted").count();
            let new_state = if mounted == targets.len() {
                "available"
            } else if mounted == 0 {
                "stopped"
            } else {
                "unavailable"
            };
            if fs.state != new_state {
                tracing::info!(filesystem = %fs.label(), from = %fs.state, to = new_state, "Filesystem state recomputed");
                fs.apply_transition(new_state);
                if let Err(e) = self.cache.save(&fs) {
                    tracing::warn!(filesystem = %fs_id, error = %e, "Failed to save filesystem state");
                }
            }
        }
    }

    /// 取消一个 Job；未开始的依赖方在下一轮评估中按谓词级联取消
    pub fn cancel_job(self: &Arc<Self>, job_id: JobId) -> Result<CancelOutcome, SchedulingError> {
        let outcome = {
            let mut inner = self.lock();
            let (status, cancellable) = inner
                .jobs
                .get(&job_id)
                .map(|j| (j.status, j.cancellable))
                .ok_or(SchedulingError::JobNotFound(job_id))?;
            match status {
                JobStatus::Pending | JobStatus::Planned => {
                    inner.finish_job(job_id, JobStatus::Cancelled, None);
                    tracing::info!(job_id, "Job cancelled before start");
                    CancelOutcome::Cancelled
                }
                JobStatus::Runnable => {
                    if let Some(token) = inner.tokens.get(&job_id) {
                        token.cancel();
                    }
                    CancelOutcome::Signalled
                }
                JobStatus::Running if cancellable => {
                    if let Some(token) = inner.tokens.get(&job_id) {
                        token.cancel();
                    }
                    tracing::info!(job_id, "Cancellation signalled to running job");
                    CancelOutcome::Signalled
                }
                JobStatus::Running => CancelOutcome::NotCancellable,
                _ => CancelOutcome::AlreadyFinished,
            }
        };
        if outcome == CancelOutcome::Cancelled {
            self.advance();
        }
        Ok(outcome)
    }

    pub fn cancel_command(
        self: &Arc<Self>,
        command_id: CommandId,
    ) -> Result<Vec<(JobId, CancelOutcome)>, SchedulingError> {
        let job_ids = self.get_command(command_id)?.job_ids;
        let mut outcomes = Vec::with_capacity(job_ids.len());
        for job_id in job_ids {
            outcomes.push((job_id, self.cancel_job(job_id)?));
        }
        Ok(outcomes)
    }

    pub fn get_job(&self, job_id: JobId) -> Result<Job, SchedulingError> {
        self.lock()
            .jobs
            .get(&job_id)
            .cloned()
            .ok_or(SchedulingError::JobNotFound(job_id))
    }

    pub fn get_command(&self, command_id: CommandId) -> Result<Command, SchedulingError> {
        self.lock()
            .commands
            .get(&command_id)
            .cloned()
            .ok_or(SchedulingError::CommandNotFound(command_id))
    }

    pub fn command_jobs(&self, command_id: CommandId) -> Result<Vec<Job>, SchedulingError> {
        let inner = self.lock();
        let command = inner
            .commands
            .get(&command_id)
            .ok_or(SchedulingError::CommandNotFound(command_id))?;
        Ok(command
            .job_ids
            .iter()
            .filter_map(|id| inner.jobs.get(id).cloned())
            .collect())
    }

    /// 等待命令完成；超时返回当前快照（`complete == false`）
    pub async fn wait_command(
        &self,
        command_id: CommandId,
        timeout: Duration,
    ) -> Result<Command, SchedulingError> {
        let mut changes = self.generation.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let command = self.get_command(command_id)?;
            if command.complete {
                return Ok(command);
            }
            match tokio::time::timeout_at(deadline, changes.changed()).await {
                Ok(Ok(())) => continue,
                _ => return self.get_command(command_id),
            }
        }
    }

    /// 等待 Job 到达指定状态
    pub async fn wait_job_status(
        &self,
        job_id: JobId,
        status: JobStatus,
        timeout: Duration,
    ) -> Result<Job, SchedulingError> {
        let mut changes = self.generation.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let job = self.get_job(job_id)?;
            if job.status == status {
                return Ok(job);
            }
            match tokio::time::timeout_at(deadline, changes.changed()).await {
                Ok(Ok(())) => continue,
                _ => return self.get_job(job_id),
            }
        }
    }

    /// 持久化用快照
    pub fn snapshot(&self) -> (Vec<Job>, Vec<Command>) {
        let inner = self.lock();
        (
            inner.jobs.values().cloned().collect(),
            inner.commands.values().cloned().collect(),
        )
    }

    /// 重启恢复：运行中的 Job 结果未知，标记失败；未开始的重新接纳
    pub fn restore(self: &Arc<Self>, jobs: Vec<Job>, commands: Vec<Command>) {
        {
            let mut inner = self.lock();
            for mut job in jobs {
                match job.status {
                    JobStatus::Running | JobStatus::Runnable => {
                        tracing::warn!(job_id = job.id, job = %job.description, "Job was running at restart, state unknown");
                        job.set_status(JobStatus::Failed);
                        job.failure = Some(JobFailure {
                            kind: FailureKind::ManagerRestarted,
                            step: None,
                            message: "manager restarted while the job was running; entity state unknown"
                                .into(),
                        });
                    }
                    JobStatus::Pending | JobStatus::Planned => {
                        job.set_status(JobStatus::Planned);
                        inner.lock_cache.add(&job.locks);
                    }
                    _ => {}
                }
                inner.next_job_id = inner.next_job_id.max(job.id + 1);
                inner.jobs.insert(job.id, job);
            }
            for command in commands {
                inner.next_command_id = inner.next_command_id.max(command.id + 1);
                inner.commands.insert(command.id, command);
            }
            self.cache.invalidate_all();
        }
        self.advance();
    }

    /// Agent 观察到的状态变化；实体被锁定或观察早于最近修改时忽略
    pub fn notify_state(self: &Arc<Self>, entity: EntityId, state: &str, observed_at: DateTime<Utc>) {
        {
            let inner = self.lock();
            if inner.lock_cache.has_locks(entity) || inner.locks.is_locked(entity) {
                tracing::debug!(%entity, state, "Ignoring state notification for locked entity");
                return;
            }
            let Ok(mut current) = self.cache.get(entity) else {
                tracing::warn!(%entity, "State notification for unknown entity");
                return;
            };
            if observed_at < current.state_modified_at {
                tracing::debug!(%entity, state, "Ignoring stale state notification");
                return;
            }
            if !catalog::states(entity.kind).contains(&state) {
                tracing::warn!(%entity, state, "State notification with unknown state");
                return;
            }
            if current.state == state {
                return;
            }
            tracing::info!(%entity, from = %current.state, to = state, "Entity state observed");
            current.apply_transition(state);
            if let Err(e) = self.cache.save(&current) {
                tracing::warn!(%entity, error = %e, "Failed to save observed state");
            }
        }
        self.advance();
    }

    /// 注册新主机（及其 LNet），并提交到 profile 初始状态的命令
    pub fn create_host(
        self: &Arc<Self>,
        fqdn: &str,
        nodename: &str,
        address: &str,
        profile_name: &str,
    ) -> Result<(EntityId, CommandId), SchedulingError> {
        let profile = self
            .profiles
            .get(profile_name)
            .cloned()
            .ok_or_else(|| SchedulingError::InvalidRequest(format!("unknown profile '{profile_name}'")))?;

        let record = HostRecord {
            fqdn: fqdn.to_string(),
            nodename: nodename.to_string(),
            address: address.to_string(),
            profile: profile.name.clone(),
            install_method: InstallMethod::Manual,
            immutable_state: !profile.managed,
        };

        let host = match self.cache.host_by_fqdn(fqdn) {
            // 预先创建但尚未部署的主机：沿用其编号
            Some(existing) if existing.state == "undeployed" => {
                let mut host = existing.with_state(catalog::initial_state(EntityKind::Host));
                host.payload = EntityPayload::Host(record);
                self.cache.save(&host)?;
                host
            }
            Some(existing) => {
                return Err(SchedulingError::InvalidRequest(format!(
                    "{} is already registered as {}",
                    fqdn, existing.id
                )))
            }
            None => self.cache.create(EntityPayload::Host(record))?,
        };
        if self.cache.lnet_of_host(host.id).is_none() {
            self.cache.create(EntityPayload::Lnet(LnetRecord { host: host.id }))?;
        }
        tracing::info!(fqdn, host_id = %host.id, profile = %profile.name, "Host created");

        let command_id = self.set_state(
            host.id,
            &profile.initial_state,
            &format!("Setting up host {fqdn}"),
            None,
        )?;
        Ok((host.id, command_id))
    }

    /// 当前调度中的迁移（供诊断）
    pub fn pending_transitions(&self) -> Vec<StateTransition> {
        self.lock()
            .jobs
            .values()
            .filter(|j| !j.is_terminal())
            .filter_map(|j| j.transition.clone())
            .collect()
    }
}
