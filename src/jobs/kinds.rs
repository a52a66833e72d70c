//! Job 类型目录
//!
//! 每个 `JobType` 声明：能完成的状态迁移（`TRANSITIONS`）、自身依赖、额外锁、
//! 步骤列表与成功后的附加效果。移除类 Job 只有一个类型，起点状态作为数据
//! 放在 `StateTransition::from_state` 中。

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::core::error::StoreError;
use crate::state::entity::{EntityId, EntityKind, ProfileRegistry, TargetRole};
use crate::state::store::EntityCache;

use super::dependency::{DependOn, Dependency};
use super::job::{Job, StateLock};
use super::step::{AgentActionStep, AwaitSessionStep, RebootIfNeededStep, RebootStep, Step, StepTimeouts};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    DeployHost,
    InstallHostPackages,
    SetupHost,
    SetupMonitoredHost,
    SetupWorker,
    RemoveHost,
    ForceRemoveHost,
    RebootHost,
    ShutdownHost,
    UpdateDevices,
    DetectTargets,
    EnableLnet,
    LoadLnet,
    StartLnet,
    StopLnet,
    UnloadLnet,
    UnconfigureLnet,
    StartFilesystem,
    StopFilesystem,
    RemoveFilesystem,
    ForgetFilesystem,
    FormatTarget,
    RegisterTarget,
    ConfigureTarget,
    StartTarget,
    StopTarget,
    RemoveTarget,
    ForgetTarget,
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}Job", self)
    }
}

/// 迁移表的一条边：`job_type` 能把 `kind` 的实体从 `from` 中任一状态迁到 `to`
#[derive(Debug, Clone, Copy)]
pub struct TransitionRule {
    pub job_type: JobType,
    pub kind: EntityKind,
    pub from: &'static [&'static str],
    pub to: &'static str,
}

const fn rule(
    job_type: JobType,
    kind: EntityKind,
    from: &'static [&'static str],
    to: &'static str,
) -> TransitionRule {
    TransitionRule {
        job_type,
        kind,
        from,
        to,
    }
}

pub static TRANSITIONS: &[TransitionRule] = &[
    // 主机
    rule(JobType::DeployHost, EntityKind::Host, &["undeployed"], "unconfigured"),
    rule(
        JobType::InstallHostPackages,
        EntityKind::Host,
        &["unconfigured"],
        "packages_installed",
    ),
    rule(JobType::SetupHost, EntityKind::Host, &["packages_installed"], "managed"),
    rule(
        JobType::SetupMonitoredHost,
        EntityKind::Host,
        &["packages_installed"],
        "monitored",
    ),
    rule(JobType::SetupWorker, EntityKind::Host, &["packages_installed"], "working"),
    rule(
        JobType::RemoveHost,
        EntityKind::Host,
        &["unconfigured", "packages_installed", "managed", "monitored", "working"],
        "removed",
    ),
    rule(
        JobType::ForceRemoveHost,
        EntityKind::Host,
        &[
            "undeployed",
            "unconfigured",
            "packages_installed",
            "managed",
            "monitored",
            "working",
        ],
        "removed",
    ),
    // LNet
    rule(JobType::EnableLnet, EntityKind::Lnet, &["unconfigured"], "lnet_unloaded"),
    rule(JobType::LoadLnet, EntityKind::Lnet, &["lnet_unloaded"], "lnet_down"),
    rule(JobType::StartLnet, EntityKind::Lnet, &["lnet_down"], "lnet_up"),
    rule(JobType::StopLnet, EntityKind::Lnet, &["lnet_up"], "lnet_down"),
    rule(JobType::UnloadLnet, EntityKind::Lnet, &["lnet_down"], "lnet_unloaded"),
    rule(JobType::UnconfigureLnet, EntityKind::Lnet, &["lnet_unloaded"], "unconfigured"),
    // 文件系统
    rule(
        JobType::StartFilesystem,
        EntityKind::Filesystem,
        &["stopped", "unavailable"],
        "available",
    ),
    rule(
        JobType::StopFilesystem,
        EntityKind::Filesystem,
        &["available", "unavailable"],
        "stopped",
    ),
    rule(
        JobType::RemoveFilesystem,
        EntityKind::Filesystem,
        &["unavailable", "stopped", "available"],
        "removed",
    ),
    rule(
        JobType::ForgetFilesystem,
        EntityKind::Filesystem,
        &["unavailable", "stopped", "available"],
        "forgotten",
    ),
    // Target
    rule(JobType::FormatTarget, EntityKind::Target, &["unformatted"], "formatted"),
    rule(JobType::RegisterTarget, EntityKind::Target, &["formatted"], "registered"),
    rule(JobType::ConfigureTarget, EntityKind::Target, &["registered"], "unmounted"),
    rule(JobType::StartTarget, EntityKind::Target, &["unmounted"], "mounted"),
    rule(JobType::StopTarget, EntityKind::Target, &["mounted"], "unmounted"),
    rule(
        JobType::RemoveTarget,
        EntityKind::Target,
        &["unformatted", "formatted", "registered", "unmounted"],
        "removed",
    ),
    rule(
        JobType::ForgetTarget,
        EntityKind::Target,
        &["unmounted", "mounted"],
        "forgotten",
    ),
];

impl JobType {
    pub fn requires_confirmation(&self) -> bool {
        matches!(
            self,
            Self::ForceRemoveHost
                | Self::RebootHost
                | Self::ShutdownHost
                | Self::ForgetFilesystem
                | Self::ForgetTarget
        )
    }

    /// 运行中能否被协作式取消
    pub fn cancellable(&self) -> bool {
        !matches!(self, Self::DeployHost | Self::ForceRemoveHost)
    }

    /// 是否是状态迁移类 Job
    pub fn is_transition(&self) -> bool {
        TRANSITIONS.iter().any(|r| r.job_type == *self)
    }
}

fn label(cache: &EntityCache, id: EntityId) -> String {
    cache
        .get(id)
        .map(|e| e.label())
        .unwrap_or_else(|_| id.to_string())
}

/// LNet 所在主机的标签
fn lnet_host_label(cache: &EntityCache, lnet: EntityId) -> String {
    cache
        .get(lnet)
        .ok()
        .and_then(|e| e.as_lnet().map(|l| l.host))
        .map(|host| label(cache, host))
        .unwrap_or_else(|| lnet.to_string())
}

pub fn describe(job: &Job, cache: &EntityCache) -> String {
    let subject = job.subject.map(|id| label(cache, id)).unwrap_or_default();
    let host_list = || {
        job.hosts
            .iter()
            .map(|h| label(cache, *h))
            .collect::<Vec<_>>()
            .join(", ")
    };
    let on_host = || job.subject.map(|id| lnet_host_label(cache, id)).unwrap_or_default();

    match job.job_type {
        JobType::DeployHost => format!("Deploy agent to {subject}"),
        JobType::InstallHostPackages => format!("Install packages on server {subject}"),
        JobType::SetupHost => format!("Setup managed server {subject}"),
        JobType::SetupMonitoredHost => format!("Setup monitored server {subject}"),
        JobType::SetupWorker => format!("Setup worker node {subject}"),
        JobType::RemoveHost => format!("Remove server {subject}"),
        JobType::ForceRemoveHost => format!("Force remove server {subject}"),
        JobType::RebootHost => format!("Reboot server {subject}"),
        JobType::ShutdownHost => format!("Shutdown server {subject}"),
        JobType::UpdateDevices => format!("Update device info on {}", host_list()),
        JobType::DetectTargets => format!("Scan for targets on {}", host_list()),
        JobType::EnableLnet => format!("Enable LNet on {}", on_host()),
        JobType::LoadLnet => format!("Load LNet module on {}", on_host()),
        JobType::StartLnet => format!("Start LNet on {}", on_host()),
        JobType::StopLnet => format!("Stop LNet on {}", on_host()),
        JobType::UnloadLnet => format!("Unload LNet module on {}", on_host()),
        JobType::UnconfigureLnet => format!("Unconfigure LNet on {}", on_host()),
        JobType::StartFilesystem => format!("Start file system {subject}"),
        JobType::StopFilesystem => format!("Stop file system {subject}"),
        JobType::RemoveFilesystem => format!("Remove file system {subject}"),
        JobType::ForgetFilesystem => format!("Forget file system {subject}"),
        JobType::FormatTarget => format!("Format {subject}"),
        JobType::RegisterTarget => format!("Register {subject}"),
        JobType::ConfigureTarget => format!("Configure {subject} mount points"),
        JobType::StartTarget => format!("Start target {subject}"),
        JobType::StopTarget => format!("Stop target {subject}"),
        JobType::RemoveTarget => format!("Remove target {subject}"),
        JobType::ForgetTarget => format!("Forget target {subject}"),
    }
}

/// LNet 实体所属主机
fn lnet_host(cache: &EntityCache, lnet: EntityId) -> Option<EntityId> {
    cache
        .get(lnet)
        .ok()
        .and_then(|e| e.as_lnet().map(|l| l.host))
}

/// Target 主服务器上的 LNet
fn target_lnet(cache: &EntityCache, target: EntityId) -> Option<EntityId> {
    cache
        .get(target)
        .ok()
        .and_then(|e| e.as_target().map(|t| t.primary_host))
        .and_then(|host| cache.lnet_of_host(host))
}

fn lnet_dep(cache: &EntityCache, host: EntityId, build: impl Fn(EntityId) -> DependOn) -> Dependency {
    match cache.lnet_of_host(host) {
        Some(lnet) => build(lnet).into(),
        None => Dependency::none(),
    }
}

/// Job 自身声明的依赖（不含实体静态依赖与迁移起点）
pub fn job_deps(job: &Job, cache: &EntityCache) -> Dependency {
    let Some(subject) = job.subject else {
        return host_list_deps(job, cache);
    };

    match job.job_type {
        JobType::SetupHost | JobType::SetupWorker => {
            lnet_dep(cache, subject, |lnet| DependOn::new(lnet, "lnet_up"))
        }
        JobType::SetupMonitoredHost => lnet_dep(cache, subject, |lnet| {
            DependOn::new(lnet, "lnet_unloaded").unacceptable(&["unconfigured"])
        }),
        JobType::RemoveHost => lnet_dep(cache, subject, |lnet| DependOn::new(lnet, "unconfigured")),
        JobType::RebootHost | JobType::ShutdownHost => DependOn::new(subject, "managed")
            .unacceptable(&["undeployed", "removed"])
            .into(),
        JobType::EnableLnet => match lnet_host(cache, subject) {
            Some(host) => DependOn::new(host, "packages_installed")
                .acceptable(&["managed", "monitored", "working"])
                .into(),
            None => Dependency::none(),
        },
        JobType::StartFilesystem => Dependency::all(
            cache
                .targets_of_filesystem(subject)
                .into_iter()
                .map(|t| DependOn::new(t.id, "mounted").into()),
        ),
        JobType::StopFilesystem => Dependency::all(
            cache
                .targets_of_filesystem(subject)
                .into_iter()
                .map(|t| {
                    DependOn::new(t.id, "unmounted")
                        .acceptable(&["unformatted", "formatted", "registered"])
                        .into()
                }),
        ),
        JobType::FormatTarget | JobType::ConfigureTarget | JobType::StartTarget => {
            match target_lnet(cache, subject) {
                Some(lnet) => DependOn::new(lnet, "lnet_up").into(),
                None => Dependency::none(),
            }
        }
        JobType::RegisterTarget => {
            let mut deps = Vec::new();
            if let Some(lnet) = target_lnet(cache, subject) {
                deps.push(DependOn::new(lnet, "lnet_up").into());
            }
            if let Ok(target) = cache.get(subject) {
                let mgs = target
                    .as_target()
                    .filter(|t| t.role != TargetRole::Mgs)
                    .and_then(|t| t.filesystem)
                    .and_then(|fs| cache.get(fs).ok())
                    .and_then(|fs| fs.as_filesystem().and_then(|f| f.mgs));
                if let Some(mgs) = mgs {
                    deps.push(DependOn::new(mgs, "mounted").into());
                }
            }
            Dependency::all(deps)
        }
        _ => Dependency::none(),
    }
}

fn host_list_deps(job: &Job, cache: &EntityCache) -> Dependency {
    match job.job_type {
        JobType::UpdateDevices => Dependency::all(
            job.hosts
                .iter()
                .map(|h| lnet_dep(cache, *h, |lnet| DependOn::new(lnet, "lnet_up"))),
        ),
        JobType::DetectTargets => Dependency::all(job.hosts.iter().map(|h| {
            lnet_dep(cache, *h, |lnet| {
                DependOn::new(lnet, "lnet_up").unacceptable(&["unconfigured"])
            })
        })),
        _ => Dependency::none(),
    }
}

/// 迁移写锁与依赖读锁之外的额外锁
pub fn extra_locks(job: &Job, cache: &EntityCache) -> Vec<StateLock> {
    match (job.job_type, job.subject) {
        (JobType::ForceRemoveHost, Some(host)) => {
            let mut locks = Vec::new();
            if let Some(lnet) = cache.lnet_of_host(host) {
                locks.push(StateLock::write(job.id, lnet, None, Some("unconfigured")));
            }
            for target in cache.targets_on_host(host) {
                locks.push(StateLock::write(job.id, target.id, None, Some("removed")));
            }
            locks
        }
        (_, None) => job
            .hosts
            .iter()
            .map(|h| StateLock::read(job.id, *h))
            .collect(),
        _ => Vec::new(),
    }
}

fn target_args(cache: &EntityCache, target: EntityId) -> Result<(String, serde_json::Value), StoreError> {
    let entity = cache.get(target)?;
    let record = entity.as_target().ok_or(StoreError::NotFound(target))?;
    let fqdn = cache.fqdn_of(record.primary_host)?;
    let fsname = match record.filesystem {
        Some(fs) => cache.get(fs)?.label(),
        None => String::new(),
    };
    let args = json!({
        "device": record.device,
        "target_name": record.name,
        "role": record.role,
        "fsname": fsname,
        "ha_label": format!("{}_{}", record.name, target.id),
    });
    Ok((fqdn, args))
}

fn lnet_action(cache: &EntityCache, lnet: EntityId, action: &'static str) -> Result<Vec<Box<dyn Step>>, StoreError> {
    let host = lnet_host(cache, lnet).ok_or(StoreError::NotFound(lnet))?;
    let fqdn = cache.fqdn_of(host)?;
    Ok(vec![Box::new(AgentActionStep::new(fqdn, action, json!({})).idempotent())])
}

/// 生成 Job 的有序步骤；引用的实体缺失时返回错误，Job 以 InvalidSteps 失败
pub fn build_steps(
    job: &Job,
    cache: &EntityCache,
    profiles: &ProfileRegistry,
    timeouts: &StepTimeouts,
) -> Result<Vec<Box<dyn Step>>, StoreError> {
    let subject = match job.subject {
        Some(subject) => subject,
        None => {
            let mut steps: Vec<Box<dyn Step>> = Vec::new();
            for host in &job.hosts {
                let fqdn = cache.fqdn_of(*host)?;
                let step = match job.job_type {
                    JobType::DetectTargets => {
                        AgentActionStep::new(fqdn, "detect_scan", json!({})).expect_result()
                    }
                    _ => AgentActionStep::new(fqdn, "device_plugin", json!({"plugin": null})),
                };
                steps.push(Box::new(step.idempotent()));
            }
            return Ok(steps);
        }
    };

    let steps: Vec<Box<dyn Step>> = match job.job_type {
        JobType::DeployHost => vec![Box::new(AwaitSessionStep::new(
            cache.fqdn_of(subject)?,
            timeouts.deploy,
        ))],
        JobType::InstallHostPackages => {
            let host = cache.get(subject)?;
            let record = host.as_host().ok_or(StoreError::NotFound(subject))?;
            let profile = profiles.get(&record.profile);
            let fqdn = record.fqdn.clone();
            let profile_args = json!({
                "profile": record.profile,
                "managed": profile.map(|p| p.managed).unwrap_or(false),
                "worker": profile.map(|p| p.worker).unwrap_or(false),
            });
            let package_args = json!({
                "bundles": profile.map(|p| p.bundles.clone()).unwrap_or_default(),
                "packages": profile.map(|p| p.packages.clone()).unwrap_or_default(),
            });
            vec![
                Box::new(AgentActionStep::new(fqdn.clone(), "update_profile", profile_args).idempotent()),
                Box::new(
                    AgentActionStep::new(fqdn.clone(), "install_packages", package_args)
                        .expect_result()
                        .database(),
                ),
                Box::new(RebootIfNeededStep::new(fqdn, timeouts.restart)),
            ]
        }
        JobType::SetupHost | JobType::SetupWorker => vec![Box::new(
            AgentActionStep::new(
                cache.fqdn_of(subject)?,
                "initialise_block_device_drivers",
                json!({}),
            )
            .expect_result()
            .idempotent(),
        )],
        JobType::RemoveHost => vec![Box::new(AgentActionStep::new(
            cache.fqdn_of(subject)?,
            "deregister_server",
            json!({}),
        ))],
        JobType::RebootHost => vec![Box::new(RebootStep::new(
            cache.fqdn_of(subject)?,
            timeouts.restart,
        ))],
        JobType::ShutdownHost => vec![Box::new(AgentActionStep::new(
            cache.fqdn_of(subject)?,
            "shutdown_server",
            json!({}),
        ))],
        JobType::EnableLnet => lnet_action(cache, subject, "configure_lnet")?,
        JobType::LoadLnet => lnet_action(cache, subject, "load_lnet")?,
        JobType::StartLnet => lnet_action(cache, subject, "start_lnet")?,
        JobType::StopLnet => lnet_action(cache, subject, "stop_lnet")?,
        JobType::UnloadLnet => lnet_action(cache, subject, "unload_lnet")?,
        JobType::UnconfigureLnet => lnet_action(cache, subject, "unconfigure_lnet")?,
        JobType::FormatTarget => {
            let (fqdn, args) = target_args(cache, subject)?;
            vec![Box::new(AgentActionStep::new(fqdn, "format_target", args).database())]
        }
        JobType::RegisterTarget => {
            let (fqdn, args) = target_args(cache, subject)?;
            vec![Box::new(AgentActionStep::new(fqdn, "register_target", args).expect_result())]
        }
        JobType::ConfigureTarget => {
            let (fqdn, args) = target_args(cache, subject)?;
            vec![Box::new(AgentActionStep::new(fqdn, "configure_target_ha", args).idempotent())]
        }
        JobType::StartTarget => {
            let (fqdn, args) = target_args(cache, subject)?;
            vec![Box::new(AgentActionStep::new(fqdn, "mount_target", args).idempotent())]
        }
        JobType::StopTarget => {
            let (fqdn, args) = target_args(cache, subject)?;
            vec![Box::new(AgentActionStep::new(fqdn, "unmount_target", args).idempotent())]
        }
        JobType::RemoveTarget => {
            // 只有注册过的 target 在主机上留有 HA 配置
            let configured = job
                .transition
                .as_ref()
                .map(|t| t.from_state == "registered" || t.from_state == "unmounted")
                .unwrap_or(false);
            if configured {
                let (fqdn, args) = target_args(cache, subject)?;
                vec![Box::new(AgentActionStep::new(fqdn, "unconfigure_target_ha", args))]
            } else {
                Vec::new()
            }
        }
        JobType::SetupMonitoredHost
        | JobType::ForceRemoveHost
        | JobType::StartFilesystem
        | JobType::StopFilesystem
        | JobType::RemoveFilesystem
        | JobType::ForgetFilesystem
        | JobType::ForgetTarget
        | JobType::UpdateDevices
        | JobType::DetectTargets => Vec::new(),
    };
    Ok(steps)
}

/// 成功后的附加效果（迁移本身已由调度器应用），返回被修改的实体
pub fn on_success(job: &Job, cache: &EntityCache) -> Result<Vec<EntityId>, StoreError> {
    let Some(subject) = job.subject else {
        return Ok(Vec::new());
    };
    let mut touched = Vec::new();

    match job.job_type {
        JobType::RemoveHost | JobType::ForceRemoveHost => {
            let mut host = cache.get(subject)?;
            host.mark_deleted();
            cache.save(&host)?;
            touched.push(subject);

            if let Some(lnet_id) = cache.lnet_of_host(subject) {
                let mut lnet = cache.get(lnet_id)?;
                if job.job_type == JobType::ForceRemoveHost {
                    lnet.apply_transition("unconfigured");
                }
                lnet.mark_deleted();
                cache.save(&lnet)?;
                touched.push(lnet_id);
            }
            if job.job_type == JobType::ForceRemoveHost {
                for mut target in cache.targets_on_host(subject) {
                    target.apply_transition("removed");
                    target.mark_deleted();
                    cache.save(&target)?;
                    touched.push(target.id);
                }
            }
        }
        JobType::RemoveTarget
        | JobType::ForgetTarget
        | JobType::RemoveFilesystem
        | JobType::ForgetFilesystem => {
            let mut entity = cache.get(subject)?;
            entity.mark_deleted();
            cache.save(&entity)?;
            touched.push(subject);
        }
        _ => {}
    }
    Ok(touched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::job::StateTransition;
    use crate::state::entity::{EntityPayload, HostRecord, InstallMethod, LnetRecord, ServerProfile};
    use crate::state::store::MemoryStore;
    use std::sync::Arc;
    use std::time::Duration;

    fn fixture() -> (EntityCache, EntityId, EntityId) {
        let cache = EntityCache::new(Arc::new(MemoryStore::new()));
        let host = cache
            .create(EntityPayload::Host(HostRecord {
                fqdn: "mds1.example.com".into(),
                nodename: "mds1".into(),
                address: "mds1".into(),
                profile: "storage_server".into(),
                install_method: InstallMethod::Manual,
                immutable_state: false,
            }))
            .unwrap();
        let lnet = cache
            .create(EntityPayload::Lnet(LnetRecord { host: host.id }))
            .unwrap();
        (cache, host.id, lnet.id)
    }

    fn timeouts() -> StepTimeouts {
        StepTimeouts {
            deploy: Duration::from_secs(1),
            restart: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_every_job_type_has_description() {
        let (cache, host, _) = fixture();
        let job = Job::new(1, JobType::SetupHost)
            .with_transition(StateTransition::new(host, "packages_installed", "managed"));
        assert_eq!(describe(&job, &cache), "Setup managed server mds1.example.com");
    }

    #[test]
    fn test_setup_depends_on_lnet_up() {
        let (cache, host, lnet) = fixture();
        let job = Job::new(1, JobType::SetupHost)
            .with_transition(StateTransition::new(host, "packages_installed", "managed"));
        let deps = job_deps(&job, &cache);
        let leaves = deps.leaves();
        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].entity, lnet);
        assert_eq!(leaves[0].preferred_state, "lnet_up");
    }

    #[test]
    fn test_install_packages_steps() {
        let (cache, host, _) = fixture();
        let profiles = ProfileRegistry::new(ServerProfile::builtin());
        let job = Job::new(1, JobType::InstallHostPackages)
            .with_transition(StateTransition::new(host, "unconfigured", "packages_installed"));
        let steps = build_steps(&job, &cache, &profiles, &timeouts()).unwrap();
        assert_eq!(steps.len(), 3);
        assert!(steps[1].database());
        assert!(steps[0].idempotent());
    }

    #[test]
    fn test_remove_target_steps_depend_on_origin() {
        let (cache, _, _) = fixture();
        let profiles = ProfileRegistry::new(ServerProfile::builtin());
        let target = EntityId::new(EntityKind::Target, 9);
        let job = Job::new(1, JobType::RemoveTarget)
            .with_transition(StateTransition::new(target, "formatted", "removed"));
        assert!(build_steps(&job, &cache, &profiles, &timeouts())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_force_remove_locks_dependents() {
        let (cache, host, lnet) = fixture();
        let job = Job::new(4, JobType::ForceRemoveHost)
            .with_transition(StateTransition::new(host, "managed", "removed"));
        let locks = extra_locks(&job, &cache);
        assert_eq!(locks.len(), 1);
        assert!(locks[0].write);
        assert_eq!(locks[0].locked_item, lnet);
        assert!(JobType::ForceRemoveHost.requires_confirmation());
        assert!(!JobType::RemoveHost.requires_confirmation());
    }

    #[test]
    fn test_steps_for_missing_host_fail() {
        let (cache, _, _) = fixture();
        let profiles = ProfileRegistry::new(ServerProfile::builtin());
        let job = Job::new(1, JobType::UpdateDevices).with_hosts(vec![EntityId::host(42)]);
        assert!(build_steps(&job, &cache, &profiles, &timeouts()).is_err());
    }
}
