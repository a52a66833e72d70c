//! 实体模型：实体定义、状态机目录、持久化与缓存

pub mod catalog;
pub mod entity;
pub mod store;

pub use entity::{
    Entity, EntityId, EntityKind, EntityPayload, FilesystemRecord, HostRecord, InstallMethod,
    LnetRecord, ProfileRegistry, ServerProfile, TargetRecord, TargetRole,
};
pub use store::{EntityCache, EntityStore, MemoryStore};
