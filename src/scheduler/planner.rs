//! 命令规划器
//!
//! 把“实体 X 到达状态 S”的请求展开成 Job 图：
//! 1. 从预期状态到目标状态的最短路径，每一跳一个迁移
//! 2. 每个迁移的 Job 依赖、新状态的静态依赖、以及会被新状态打破的反向依赖，
//!    递归规划为更多迁移
//! 3. 拓扑排序（依赖在前），有环则整个命令被拒绝
//! 4. 为每个 Job 生成锁集合，并从已声明锁推导 `wait_for`
//!
//! 规划在 `LockCache` 的副本上进行，失败时调度器状态不变。

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::core::error::SchedulingError;
use crate::jobs::dependency::{DependOn, Dependency};
use crate::jobs::job::{Job, JobId, JobSpec, JobStatus, StateLock, StateTransition};
use crate::jobs::kinds::{self, JobType};
use crate::state::catalog;
use crate::state::entity::{EntityId, ProfileRegistry};
use crate::state::store::EntityCache;

use super::lock_cache::LockCache;

/// 多个 Job 类型能完成同一迁移时的选择策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPreference {
    /// 优先不需要确认的类型（如优雅移除）
    #[default]
    Unconfirmed,
    /// 优先需要确认的类型（如强制移除）
    Confirmed,
}

impl JobPreference {
    pub fn choose(&self, candidates: &[JobType]) -> Option<JobType> {
        let wanted = matches!(self, Self::Confirmed);
        candidates
            .iter()
            .copied()
            .find(|t| t.requires_confirmation() == wanted)
            .or_else(|| candidates.first().copied())
    }
}

/// 试运行规划的结果条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobPreview {
    pub job_type: JobType,
    pub description: String,
    pub requires_confirmation: bool,
    pub entity: Option<EntityId>,
}

/// 规划结果：待提交的 Job、附加的已有 Job 与更新后的锁缓存
#[derive(Debug)]
pub struct Plan {
    pub jobs: Vec<Job>,
    pub attached: Vec<JobId>,
    pub lock_cache: LockCache,
}

/// Job 在运行前需要满足的全部依赖
///
/// 包括：被本迁移打破的依赖方的修复状态、Job 自身依赖、新状态的静态依赖、
/// 以及实体处于迁移起点。
pub fn all_deps(job: &Job, cache: &EntityCache) -> Dependency {
    let own = kinds::job_deps(job, cache);
    let Some(transition) = &job.transition else {
        return own;
    };
    let origin: Dependency = DependOn::new(transition.entity, &transition.from_state).into();
    let Ok(entity) = cache.get(transition.entity) else {
        return Dependency::all([own, origin]);
    };

    let mut dependent_deps = Vec::new();
    for dependent in catalog::dependents(&entity, cache) {
        let statics = catalog::static_deps(&dependent, &dependent.state, cache);
        for leaf in statics.leaves() {
            if leaf.entity == transition.entity && !leaf.accepts(&transition.to_state) {
                if let Some(fix) = leaf.fix_state_for(&transition.to_state) {
                    dependent_deps.push(DependOn::new(dependent.id, &fix).into());
                }
            }
        }
    }

    Dependency::all([
        Dependency::all(dependent_deps),
        own,
        catalog::static_deps(&entity, &transition.to_state, cache),
        origin,
    ])
}

pub struct CommandPlanner<'a> {
    cache: &'a EntityCache,
    profiles: &'a ProfileRegistry,
    lock_cache: &'a LockCache,
    preference: JobPreference,
    /// 按发现顺序排列的单步迁移
    deps: Vec<StateTransition>,
    dep_set: HashSet<StateTransition>,
    /// (依赖方, 被依赖方)
    edges: Vec<(StateTransition, StateTransition)>,
    edge_set: HashSet<(StateTransition, StateTransition)>,
    collected: HashSet<StateTransition>,
    explicit: Vec<Job>,
    attached: Vec<JobId>,
}

impl<'a> CommandPlanner<'a> {
    pub fn new(
        cache: &'a EntityCache,
        profiles: &'a ProfileRegistry,
        lock_cache: &'a LockCache,
        preference: JobPreference,
    ) -> Self {
        Self {
            cache,
            profiles,
            lock_cache,
            preference,
            deps: Vec::new(),
            dep_set: HashSet::new(),
            edges: Vec::new(),
            edge_set: HashSet::new(),
            collected: HashSet::new(),
            explicit: Vec::new(),
            attached: Vec::new(),
        }
    }

    /// 预期状态：最近待完成写锁的 end_state，否则为当前状态
    pub fn expected_state(&self, entity: EntityId) -> Option<String> {
        match self.lock_cache.expected_state(entity) {
            Some(state) => Some(state.to_string()),
            None => self.cache.state_of(entity),
        }
    }

    /// 规划实体到达 `state`
    pub fn plan_state(&mut self, entity: EntityId, state: &str) -> Result<(), SchedulingError> {
        let current = self
            .cache
            .get(entity)
            .map_err(|_| SchedulingError::EntityNotFound(entity))?;
        if !catalog::states(entity.kind).contains(&state) {
            return Err(SchedulingError::UnknownState {
                entity,
                state: state.to_string(),
            });
        }

        let expected = self
            .expected_state(entity)
            .unwrap_or_else(|| current.state.clone());
        if expected == state {
            // 已经（或将要）处于该状态：挂上正在进行的 Job，不新建
            if let Some(entry) = self.lock_cache.get_latest_write(entity, None) {
                self.attached.push(entry.lock.job);
            }
            return Ok(());
        }

        let projected = current.with_state(&expected);
        if !catalog::can_transition(&projected, state, self.profiles) {
            return Err(SchedulingError::InvalidState {
                entity,
                state: state.to_string(),
                available: catalog::available_states(&projected, self.profiles),
            });
        }

        self.emit_transition_deps(
            StateTransition::new(entity, &expected, state),
            &HashMap::new(),
        )?;
        Ok(())
    }

    /// 登记一个显式请求的维护类 Job
    pub fn plan_job(&mut self, spec: &JobSpec) -> Result<(), SchedulingError> {
        let job_type = spec.job_type();
        let job = match spec {
            JobSpec::RebootHost { host } | JobSpec::ShutdownHost { host } => {
                self.require_host(*host)?;
                Job::new(0, job_type).with_subject(*host)
            }
            JobSpec::UpdateDevices { hosts } | JobSpec::DetectTargets { hosts } => {
                if hosts.is_empty() {
                    return Err(SchedulingError::InvalidRequest(format!(
                        "{job_type} needs at least one host"
                    )));
                }
                for host in hosts {
                    self.require_host(*host)?;
                }
                Job::new(0, job_type).with_hosts(hosts.clone())
            }
            JobSpec::ForceRemoveHost { host } => {
                self.require_host(*host)?;
                let expected = self
                    .expected_state(*host)
                    .ok_or(SchedulingError::EntityNotFound(*host))?;
                if expected == "removed" {
                    return Err(SchedulingError::InvalidRequest(format!(
                        "{host} is already removed"
                    )));
                }
                Job::new(0, job_type).with_transition(StateTransition::new(
                    *host, &expected, "removed",
                ))
            }
        };
        self.explicit.push(job);
        Ok(())
    }

    fn require_host(&self, host: EntityId) -> Result<(), SchedulingError> {
        match self.cache.get(host) {
            Ok(entity) if entity.not_deleted && entity.as_host().is_some() => Ok(()),
            _ => Err(SchedulingError::EntityNotFound(host)),
        }
    }

    fn add_edge(&mut self, dependent: &StateTransition, dependency: StateTransition) {
        let edge = (dependent.clone(), dependency);
        if self.edge_set.insert(edge.clone()) {
            self.edges.push(edge);
        }
    }

    /// 展开一个（可能多跳的）迁移，返回最后一跳；起止相同则为 None
    fn emit_transition_deps(
        &mut self,
        transition: StateTransition,
        stack: &HashMap<EntityId, String>,
    ) -> Result<Option<StateTransition>, SchedulingError> {
        if self.dep_set.contains(&transition) {
            return Ok(Some(transition));
        }

        // 之后的依赖可以假设本实体已处于新状态
        let mut stack = stack.clone();
        stack.insert(transition.entity, transition.to_state.clone());

        let route = catalog::route(transition.entity, &transition.from_state, &transition.to_state)?;
        let mut prev: Option<StateTransition> = None;
        for hop in route.windows(2) {
            let step = StateTransition::new(transition.entity, &hop[0], &hop[1]);
            if self.dep_set.insert(step.clone()) {
                self.deps.push(step.clone());
            }
            self.collect_dependencies(&step, &stack)?;
            if let Some(prev) = prev {
                self.add_edge(&step, prev);
            }
            prev = Some(step);
        }
        Ok(prev)
    }

    fn stack_state(&self, entity: EntityId, stack: &HashMap<EntityId, String>) -> Option<String> {
        stack
            .get(&entity)
            .cloned()
            .or_else(|| self.expected_state(entity))
    }

    fn collect_dependencies(
        &mut self,
        root: &StateTransition,
        stack: &HashMap<EntityId, String>,
    ) -> Result<(), SchedulingError> {
        if !self.collected.insert(root.clone()) {
            return Ok(());
        }

        // 1. Job 自身依赖：与预期状态比较
        let candidate = self.transition_job(root)?;
        for dep in kinds::job_deps(&candidate, self.cache).leaves() {
            let Some(old_state) = self.stack_state(dep.entity, stack) else {
                return Err(SchedulingError::EntityNotFound(dep.entity));
            };
            if !dep.accepts(&old_state) {
                let target = StateTransition::new(dep.entity, &old_state, &dep.preferred_state);
                if let Some(dep_transition) = self.emit_transition_deps(target, stack)? {
                    self.add_edge(root, dep_transition);
                }
            }
        }

        let entity = self
            .cache
            .get(root.entity)
            .map_err(|_| SchedulingError::EntityNotFound(root.entity))?;

        // 2. 新状态的静态依赖
        let statics = catalog::static_deps(&entity, &root.to_state, self.cache);
        for dep in statics.leaves() {
            if stack.contains_key(&dep.entity) {
                continue;
            }
            let Some(old_state) = self.expected_state(dep.entity) else {
                continue;
            };
            if !dep.accepts(&old_state) {
                let target = StateTransition::new(dep.entity, &old_state, &dep.preferred_state);
                if let Some(dep_transition) = self.emit_transition_deps(target, stack)? {
                    self.add_edge(root, dep_transition);
                }
            }
        }

        // 3. 依赖本实体旧状态的对象
        for dependent in catalog::dependents(&entity, self.cache) {
            if stack.contains_key(&dependent.id) {
                continue;
            }
            let dependent_state = self
                .expected_state(dependent.id)
                .unwrap_or_else(|| dependent.state.clone());
            let statics = catalog::static_deps(&dependent, &dependent_state, self.cache);
            for dep in statics.leaves() {
                if dep.entity != root.entity || dep.accepts(&root.to_state) {
                    continue;
                }
                let Some(fix) = dep.fix_state_for(&root.to_state) else {
                    continue;
                };
                let target = StateTransition::new(dependent.id, &dependent_state, &fix);
                if let Some(dep_transition) = self.emit_transition_deps(target, stack)? {
                    self.add_edge(root, dep_transition);
                }
            }
        }
        Ok(())
    }

    /// 为单步迁移选择 Job 类型
    fn transition_job(&self, transition: &StateTransition) -> Result<Job, SchedulingError> {
        let candidates = catalog::transition_job_types(
            transition.entity.kind,
            &transition.from_state,
            &transition.to_state,
        );
        let job_type = self
            .preference
            .choose(&candidates)
            .ok_or_else(|| SchedulingError::NoRoute {
                entity: transition.entity,
                from: transition.from_state.clone(),
                to: transition.to_state.clone(),
            })?;
        Ok(Job::new(0, job_type).with_transition(transition.clone()))
    }

    /// 依赖在前的拓扑序；同层按发现顺序
    fn sorted_transitions(&self) -> Result<Vec<StateTransition>, SchedulingError> {
        let mut indegree: HashMap<&StateTransition, usize> =
            self.deps.iter().map(|d| (d, 0)).collect();
        for (dependent, _) in &self.edges {
            if let Some(count) = indegree.get_mut(dependent) {
                *count += 1;
            }
        }

        let mut done: HashSet<&StateTransition> = HashSet::new();
        let mut order = Vec::with_capacity(self.deps.len());
        while order.len() < self.deps.len() {
            let next = self
                .deps
                .iter()
                .find(|d| !done.contains(d) && indegree.get(d).copied() == Some(0));
            let Some(next) = next else {
                let remaining = self
                    .deps
                    .iter()
                    .filter(|d| !done.contains(d))
                    .map(|d| format!("{} {}->{}", d.entity, d.from_state, d.to_state))
                    .collect();
                return Err(SchedulingError::Cycle(remaining));
            };
            done.insert(next);
            for (dependent, dependency) in &self.edges {
                if dependency == next {
                    if let Some(count) = indegree.get_mut(dependent) {
                        *count = count.saturating_sub(1);
                    }
                }
            }
            order.push(next.clone());
        }
        Ok(order)
    }

    fn create_locks(&self, job: &Job) -> Vec<StateLock> {
        let mut locks: Vec<StateLock> = Vec::new();
        let mut read_items: BTreeSet<EntityId> = BTreeSet::new();
        let mut read = |locks: &mut Vec<StateLock>, item: EntityId| {
            if read_items.insert(item) {
                locks.push(StateLock::read(job.id, item));
            }
        };

        for dep in kinds::job_deps(job, self.cache).leaves() {
            read(&mut locks, dep.entity);
        }
        if let Some(transition) = &job.transition {
            if let Ok(entity) = self.cache.get(transition.entity) {
                for state in [&transition.to_state, &transition.from_state] {
                    for dep in catalog::static_deps(&entity, state, self.cache).leaves() {
                        read(&mut locks, dep.entity);
                    }
                }
            }
            locks.push(StateLock::write(
                job.id,
                transition.entity,
                Some(&transition.from_state),
                Some(&transition.to_state),
            ));
        }
        locks.extend(kinds::extra_locks(job, self.cache));
        locks
    }

    /// 从已声明锁推导 `wait_for`
    fn create_dependencies(
        job: &Job,
        locks: &[StateLock],
        lock_cache: &LockCache,
    ) -> Result<Vec<JobId>, SchedulingError> {
        let mut wait_for = BTreeSet::new();
        for lock in locks {
            let prior_write = lock_cache.get_latest_write(lock.locked_item, Some(job.id));
            if lock.write {
                let barrier = match prior_write {
                    Some(prior) => {
                        if let (Some(begin), Some(end)) = (&lock.begin_state, &prior.lock.end_state) {
                            if begin != end {
                                return Err(SchedulingError::InconsistentLocks {
                                    item: lock.locked_item,
                                    expected: end.clone(),
                                    found: begin.clone(),
                                });
                            }
                        }
                        wait_for.insert(prior.lock.job);
                        prior.seq
                    }
                    None => 0,
                };
                for reader in lock_cache.get_read_locks(lock.locked_item, barrier, Some(job.id)) {
                    wait_for.insert(reader.lock.job);
                }
            } else if let Some(prior) = prior_write {
                wait_for.insert(prior.lock.job);
            }
        }
        Ok(wait_for.into_iter().collect())
    }

    /// 生成最终的 Job 列表，编号从 `first_id` 开始连续分配
    pub fn finish(self, first_id: JobId) -> Result<Plan, SchedulingError> {
        let mut templates = Vec::new();
        for transition in self.sorted_transitions()? {
            templates.push(self.transition_job(&transition)?);
        }
        templates.extend(self.explicit.iter().cloned());

        let mut lock_cache = self.lock_cache.clone();
        let mut jobs = Vec::with_capacity(templates.len());
        for (offset, mut job) in templates.into_iter().enumerate() {
            job.id = first_id + offset as JobId;
            job.description = kinds::describe(&job, self.cache);
            let locks = self.create_locks(&job);
            job.wait_for = Self::create_dependencies(&job, &locks, &lock_cache)?;
            lock_cache.add(&locks);
            job.locks = locks;
            job.set_status(JobStatus::Planned);
            jobs.push(job);
        }

        Ok(Plan {
            jobs,
            attached: self.attached,
            lock_cache,
        })
    }
}
