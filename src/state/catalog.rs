//! 各实体种类的状态机
//!
//! 状态列表与初始状态在此声明；迁移边来自 `jobs::kinds::TRANSITIONS`（每条边对应
//! 能完成该单步迁移的 Job 类型）。另提供静态依赖、反向依赖与实例级可用状态。

use std::collections::{HashMap, VecDeque};

use crate::core::error::SchedulingError;
use crate::jobs::dependency::{DependOn, Dependency, FixState};
use crate::jobs::kinds::{JobType, TRANSITIONS};

use super::entity::{Entity, EntityId, EntityKind, ProfileRegistry};
use super::store::EntityCache;

const HOST_STATES: &[&str] = &[
    "undeployed",
    "unconfigured",
    "packages_installed",
    "managed",
    "monitored",
    "working",
    "removed",
];

const LNET_STATES: &[&str] = &["unconfigured", "lnet_unloaded", "lnet_down", "lnet_up"];

const FILESYSTEM_STATES: &[&str] = &["unavailable", "stopped", "available", "removed", "forgotten"];

const TARGET_STATES: &[&str] = &[
    "unformatted",
    "formatted",
    "registered",
    "unmounted",
    "mounted",
    "removed",
    "forgotten",
];

/// 主机的三种终态配置，由 profile 决定可达哪一个
const HOST_SETUP_STATES: &[&str] = &["managed", "monitored", "working"];

pub fn states(kind: EntityKind) -> &'static [&'static str] {
    match kind {
        EntityKind::Host => HOST_STATES,
        EntityKind::Lnet => LNET_STATES,
        EntityKind::Filesystem => FILESYSTEM_STATES,
        EntityKind::Target => TARGET_STATES,
    }
}

pub fn initial_state(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Host => "unconfigured",
        EntityKind::Lnet => "unconfigured",
        EntityKind::Filesystem => "stopped",
        EntityKind::Target => "unformatted",
    }
}

/// 能完成 from→to 单步迁移的 Job 类型（按声明顺序）
pub fn transition_job_types(kind: EntityKind, from: &str, to: &str) -> Vec<JobType> {
    TRANSITIONS
        .iter()
        .filter(|rule| rule.kind == kind && rule.to == to && rule.from.contains(&from))
        .map(|rule| rule.job_type)
        .collect()
}

fn successors(kind: EntityKind, from: &str) -> Vec<&'static str> {
    let mut out: Vec<&'static str> = Vec::new();
    for rule in TRANSITIONS
        .iter()
        .filter(|rule| rule.kind == kind && rule.from.contains(&from))
    {
        if !out.contains(&rule.to) {
            out.push(rule.to);
        }
    }
    out
}

/// 广度优先求最短状态路径，结果包含起点与终点
pub fn route(entity: EntityId, from: &str, to: &str) -> Result<Vec<String>, SchedulingError> {
    let known = states(entity.kind);
    for state in [from, to] {
        if !known.contains(&state) {
            return Err(SchedulingError::UnknownState {
                entity,
                state: state.to_string(),
            });
        }
    }
    if from == to {
        return Ok(vec![from.to_string()]);
    }

    let mut previous: HashMap<&str, &str> = HashMap::new();
    let mut queue = VecDeque::from([from]);
    while let Some(state) = queue.pop_front() {
        for next in successors(entity.kind, state) {
            if next == from || previous.contains_key(next) {
                continue;
            }
            previous.insert(next, state);
            if next == to {
                let mut path = vec![to.to_string()];
                let mut cursor = to;
                while let Some(&prev) = previous.get(cursor) {
                    path.push(prev.to_string());
                    cursor = prev;
                }
                path.reverse();
                return Ok(path);
            }
            queue.push_back(next);
        }
    }

    Err(SchedulingError::NoRoute {
        entity,
        from: from.to_string(),
        to: to.to_string(),
    })
}

/// 实体处于 `state` 时对其它实体的静态依赖
pub fn static_deps(entity: &Entity, state: &str, cache: &EntityCache) -> Dependency {
    let Some(target) = entity.as_target() else {
        return Dependency::none();
    };

    let mut deps = Vec::new();
    let lnet = cache.lnet_of_host(target.primary_host);

    if state == "mounted" && !target.immutable_state {
        if let Some(lnet) = lnet {
            deps.push(
                DependOn::new(lnet, "lnet_up")
                    .fix(FixState::To("unmounted".into()))
                    .into(),
            );
        }
    }

    if state != "removed" && state != "forgotten" {
        if let Some(fs) = target.filesystem {
            deps.push(
                DependOn::new(fs, "available")
                    .unacceptable(&["removed", "forgotten"])
                    .fix(FixState::Follow)
                    .into(),
            );
        }
        if let Some(lnet) = lnet {
            let fix = if target.immutable_state { "forgotten" } else { "removed" };
            deps.push(
                DependOn::new(lnet, "lnet_up")
                    .unacceptable(&["unconfigured"])
                    .fix(FixState::To(fix.into()))
                    .into(),
            );
        }
    }

    Dependency::all(deps)
}

/// 可能依赖 `entity` 的实体（反向依赖）
pub fn dependents(entity: &Entity, cache: &EntityCache) -> Vec<Entity> {
    match entity.kind() {
        EntityKind::Host => cache.targets_on_host(entity.id),
        EntityKind::Lnet => entity
            .as_lnet()
            .map(|l| cache.targets_on_host(l.host))
            .unwrap_or_default(),
        EntityKind::Filesystem => cache.targets_of_filesystem(entity.id),
        EntityKind::Target => Vec::new(),
    }
}

/// 实例级可用目标状态（不含当前状态）
pub fn available_states(entity: &Entity, profiles: &ProfileRegistry) -> Vec<String> {
    if !entity.not_deleted {
        return Vec::new();
    }

    let candidates: Vec<&str> = match entity.kind() {
        EntityKind::Host => {
            let setup_state = entity
                .as_host()
                .and_then(|h| profiles.get(&h.profile))
                .map(|p| p.setup_state());
            HOST_STATES
                .iter()
                .copied()
                .filter(|s| *s != "undeployed")
                .filter(|s| !HOST_SETUP_STATES.contains(s) || Some(*s) == setup_state)
                .collect()
        }
        EntityKind::Target if entity.immutable_state() => vec!["forgotten"],
        EntityKind::Target => TARGET_STATES
            .iter()
            .copied()
            .filter(|s| *s != "forgotten")
            .collect(),
        kind => states(kind).to_vec(),
    };

    candidates
        .into_iter()
        .filter(|s| *s != entity.state)
        .filter(|s| route(entity.id, &entity.state, s).is_ok())
        .map(str::to_string)
        .collect()
}

pub fn can_transition(entity: &Entity, to_state: &str, profiles: &ProfileRegistry) -> bool {
    available_states(entity, profiles)
        .iter()
        .any(|s| s == to_state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::entity::{
        EntityPayload, HostRecord, InstallMethod, LnetRecord, ServerProfile, TargetRecord,
        TargetRole,
    };
    use crate::state::store::MemoryStore;
    use std::sync::Arc;

    fn host(profile: &str) -> Entity {
        Entity::new(
            EntityId::host(1),
            EntityPayload::Host(HostRecord {
                fqdn: "oss1.example.com".into(),
                nodename: "oss1".into(),
                address: "oss1".into(),
                profile: profile.into(),
                install_method: InstallMethod::Manual,
                immutable_state: false,
            }),
        )
    }

    #[test]
    fn test_every_declared_state_is_known() {
        for rule in TRANSITIONS {
            let known = states(rule.kind);
            assert!(known.contains(&rule.to), "{:?} -> {}", rule.job_type, rule.to);
            for from in rule.from {
                assert!(known.contains(from), "{:?} from {}", rule.job_type, from);
            }
        }
    }

    #[test]
    fn test_route_is_shortest_path() {
        let id = EntityId::host(1);
        assert_eq!(
            route(id, "undeployed", "managed").unwrap(),
            vec!["undeployed", "unconfigured", "packages_installed", "managed"]
        );
        assert_eq!(route(id, "managed", "removed").unwrap(), vec!["managed", "removed"]);
        assert_eq!(route(id, "managed", "managed").unwrap(), vec!["managed"]);
    }

    #[test]
    fn test_route_terminates_for_every_pair() {
        // 任意两状态之间要么有有限路径，要么报错
        for kind in [
            EntityKind::Host,
            EntityKind::Lnet,
            EntityKind::Filesystem,
            EntityKind::Target,
        ] {
            let id = EntityId::new(kind, 1);
            for from in states(kind) {
                for to in states(kind) {
                    match route(id, from, to) {
                        Ok(path) => {
                            assert_eq!(path.first().map(String::as_str), Some(*from));
                            assert_eq!(path.last().map(String::as_str), Some(*to));
                            assert!(path.len() <= states(kind).len());
                            for hop in path.windows(2) {
                                assert!(!transition_job_types(kind, &hop[0], &hop[1]).is_empty());
                            }
                        }
                        Err(SchedulingError::NoRoute { .. }) => {}
                        Err(e) => panic!("unexpected error {e}"),
                    }
                }
            }
        }
    }

    #[test]
    fn test_unknown_state_rejected() {
        let err = route(EntityId::host(1), "managed", "mounted").unwrap_err();
        assert!(matches!(err, SchedulingError::UnknownState { .. }));
    }

    #[test]
    fn test_removed_host_has_no_route_back() {
        let err = route(EntityId::host(1), "removed", "managed").unwrap_err();
        assert!(matches!(err, SchedulingError::NoRoute { .. }));
    }

    #[test]
    fn test_graceful_and_forced_removal_share_an_edge() {
        let types = transition_job_types(EntityKind::Host, "managed", "removed");
        assert!(types.contains(&JobType::RemoveHost));
        assert!(types.contains(&JobType::ForceRemoveHost));
    }

    #[test]
    fn test_profile_limits_host_states() {
        let profiles = ProfileRegistry::new(ServerProfile::builtin());
        let storage = host("storage_server");
        let available = available_states(&storage, &profiles);
        assert!(available.contains(&"managed".to_string()));
        assert!(!available.contains(&"monitored".to_string()));
        assert!(!available.contains(&"working".to_string()));
        assert!(can_transition(&storage, "removed", &profiles));

        let monitor = host("monitor_server");
        assert!(can_transition(&monitor, "monitored", &profiles));
        assert!(!can_transition(&monitor, "managed", &profiles));
    }

    #[test]
    fn test_target_static_deps_and_dependents() {
        let cache = EntityCache::new(Arc::new(MemoryStore::new()));
        let host = cache.create(host("storage_server").payload).unwrap();
        let lnet = cache
            .create(EntityPayload::Lnet(LnetRecord { host: host.id }))
            .unwrap();
        let target = cache
            .create(EntityPayload::Target(TargetRecord {
                name: "MGS".into(),
                role: TargetRole::Mgs,
                filesystem: None,
                primary_host: host.id,
                device: "/dev/sdb".into(),
                immutable_state: false,
            }))
            .unwrap();

        let mounted = static_deps(&target, "mounted", &cache);
        let leaves = mounted.leaves();
        assert_eq!(leaves.len(), 2);
        assert!(leaves.iter().all(|d| d.entity == lnet.id));
        assert!(!leaves[0].accepts("lnet_down"));

        assert!(static_deps(&target, "removed", &cache).is_empty());
        assert_eq!(
            dependents(&lnet, &cache).iter().map(|e| e.id).collect::<Vec<_>>(),
            vec![target.id]
        );
    }
}
