//! 受管实体
//!
//! 实体用 `EntityKind` 判别 + `EntityPayload` 负载表示，加载时即确定具体种类，
//! 不做运行时类型查找。删除是软删除（`not_deleted = false`）。

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::catalog;

/// 实体种类；派生的 `Ord` 决定全局锁顺序（先种类后编号）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Host,
    Lnet,
    Filesystem,
    Target,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Lnet => "lnet",
            Self::Filesystem => "filesystem",
            Self::Target => "target",
        }
    }
}

/// 实体标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId {
    pub kind: EntityKind,
    pub id: u64,
}

impl EntityId {
    pub fn new(kind: EntityKind, id: u64) -> Self {
        Self { kind, id }
    }

    pub fn host(id: u64) -> Self {
        Self::new(EntityKind::Host, id)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

/// 主机的安装方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InstallMethod {
    /// Agent 自行下载引导脚本并注册
    #[default]
    Manual,
    Ssh,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRecord {
    pub fqdn: String,
    pub nodename: String,
    pub address: String,
    /// 服务器 profile 名
    pub profile: String,
    #[serde(default)]
    pub install_method: InstallMethod,
    /// 只监控、不管理
    #[serde(default)]
    pub immutable_state: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LnetRecord {
    pub host: EntityId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemRecord {
    pub name: String,
    pub mgs: Option<EntityId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TargetRole {
    Mgs,
    Mdt,
    Ost,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetRecord {
    pub name: String,
    pub role: TargetRole,
    pub filesystem: Option<EntityId>,
    pub primary_host: EntityId,
    pub device: String,
    #[serde(default)]
    pub immutable_state: bool,
}

/// 按种类区分的负载
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntityPayload {
    Host(HostRecord),
    Lnet(LnetRecord),
    Filesystem(FilesystemRecord),
    Target(TargetRecord),
}

impl EntityPayload {
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Host(_) => EntityKind::Host,
            Self::Lnet(_) => EntityKind::Lnet,
            Self::Filesystem(_) => EntityKind::Filesystem,
            Self::Target(_) => EntityKind::Target,
        }
    }
}

/// 有状态实体
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub state: String,
    pub not_deleted: bool,
    pub state_modified_at: DateTime<Utc>,
    pub payload: EntityPayload,
}

impl Entity {
    /// 以该种类的初始状态创建实体
    pub fn new(id: EntityId, payload: EntityPayload) -> Self {
        debug_assert_eq!(id.kind, payload.kind());
        Self {
            id,
            state: catalog::initial_state(id.kind).to_string(),
            not_deleted: true,
            state_modified_at: Utc::now(),
            payload,
        }
    }

    pub fn with_state(mut self, state: &str) -> Self {
        self.state = state.to_string();
        self
    }

    pub fn kind(&self) -> EntityKind {
        self.id.kind
    }

    pub fn as_host(&self) -> Option<&HostRecord> {
        match &self.payload {
            EntityPayload::Host(h) => Some(h),
            _ => None,
        }
    }

    pub fn as_lnet(&self) -> Option<&LnetRecord> {
        match &self.payload {
            EntityPayload::Lnet(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_filesystem(&self) -> Option<&FilesystemRecord> {
        match &self.payload {
            EntityPayload::Filesystem(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_target(&self) -> Option<&TargetRecord> {
        match &self.payload {
            EntityPayload::Target(t) => Some(t),
            _ => None,
        }
    }

    /// 是否只能观察不能变更（除移除 / 遗忘外）
    pub fn immutable_state(&self) -> bool {
        match &self.payload {
            EntityPayload::Host(h) => h.immutable_state,
            EntityPayload::Target(t) => t.immutable_state,
            _ => false,
        }
    }

    /// 用于日志与 Job 描述的人类可读标签
    pub fn label(&self) -> String {
        match &self.payload {
            EntityPayload::Host(h) => h.fqdn.clone(),
            EntityPayload::Lnet(l) => format!("LNet on {}", l.host),
            EntityPayload::Filesystem(f) => f.name.clone(),
            EntityPayload::Target(t) => t.name.clone(),
        }
    }

    /// 由持有写锁的 Job 在完成时调用，其它调用路径均为编程错误
    pub(crate) fn apply_transition(&mut self, to_state: &str) {
        assert!(
            catalog::states(self.kind()).contains(&to_state),
            "{} has no state '{}'",
            self.id,
            to_state
        );
        self.state = to_state.to_string();
        self.state_modified_at = Utc::now();
    }

    pub(crate) fn mark_deleted(&mut self) {
        self.not_deleted = false;
    }
}

/// 服务器 profile：决定主机能到达哪种配置状态以及安装哪些软件包
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerProfile {
    pub name: String,
    #[serde(default)]
    pub ui_name: String,
    /// 受管（否则只监控）
    #[serde(default = "default_true")]
    pub managed: bool,
    #[serde(default)]
    pub worker: bool,
    /// 注册后主机的目标状态
    pub initial_state: String,
    #[serde(default)]
    pub packages: Vec<String>,
    #[serde(default)]
    pub bundles: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl ServerProfile {
    /// profile 允许的终态配置
    pub fn setup_state(&self) -> &'static str {
        match (self.managed, self.worker) {
            (true, true) => "working",
            (true, false) => "managed",
            (false, _) => "monitored",
        }
    }

    pub fn builtin() -> Vec<ServerProfile> {
        vec![
            ServerProfile {
                name: "storage_server".into(),
                ui_name: "Managed Storage Server".into(),
                managed: true,
                worker: false,
                initial_state: "managed".into(),
                packages: vec!["lustre".into(), "lustre-modules".into()],
                bundles: vec!["lustre".into(), "agent".into()],
            },
            ServerProfile {
                name: "monitor_server".into(),
                ui_name: "Monitored Storage Server".into(),
                managed: false,
                worker: false,
                initial_state: "monitored".into(),
                packages: vec![],
                bundles: vec!["agent".into()],
            },
            ServerProfile {
                name: "worker_server".into(),
                ui_name: "Worker Node".into(),
                managed: true,
                worker: true,
                initial_state: "working".into(),
                packages: vec!["lustre-client".into()],
                bundles: vec!["lustre-client".into(), "agent".into()],
            },
        ]
    }
}

/// 按名称索引的 profile 集合
#[derive(Debug, Clone, Default)]
pub struct ProfileRegistry {
    profiles: HashMap<String, ServerProfile>,
}

impl ProfileRegistry {
    pub fn new(profiles: impl IntoIterator<Item = ServerProfile>) -> Self {
        Self {
            profiles: profiles.into_iter().map(|p| (p.name.clone(), p)).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ServerProfile> {
        self.profiles.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.profiles.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_id_order_is_kind_then_id() {
        let mut ids = vec![
            EntityId::new(EntityKind::Target, 1),
            EntityId::host(9),
            EntityId::new(EntityKind::Lnet, 2),
            EntityId::host(3),
        ];
        ids.sort();
        assert_eq!(
            ids,
            vec![
                EntityId::host(3),
                EntityId::host(9),
                EntityId::new(EntityKind::Lnet, 2),
                EntityId::new(EntityKind::Target, 1),
            ]
        );
        assert_eq!(EntityId::host(3).to_string(), "host:3");
    }

    #[test]
    fn test_new_entity_starts_in_initial_state() {
        let host = Entity::new(
            EntityId::host(1),
            EntityPayload::Host(HostRecord {
                fqdn: "oss1.example.com".into(),
                nodename: "oss1".into(),
                address: "10.0.0.1".into(),
                profile: "storage_server".into(),
                install_method: InstallMethod::Manual,
                immutable_state: false,
            }),
        );
        assert_eq!(host.state, "unconfigured");
        assert!(host.not_deleted);
        assert_eq!(host.label(), "oss1.example.com");
    }

    #[test]
    #[should_panic]
    fn test_apply_unknown_state_panics() {
        let mut lnet = Entity::new(
            EntityId::new(EntityKind::Lnet, 1),
            EntityPayload::Lnet(LnetRecord {
                host: EntityId::host(1),
            }),
        );
        lnet.apply_transition("mounted");
    }

    #[test]
    fn test_profile_setup_state() {
        let profiles = ServerProfile::builtin();
        let states: Vec<_> = profiles.iter().map(|p| p.setup_state()).collect();
        assert_eq!(states, vec!["managed", "monitored", "working"]);
    }
}
