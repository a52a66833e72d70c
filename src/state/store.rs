//! 实体持久化协作者与读穿缓存
//!
//! - `EntityStore`：外部持久化接口（get / save / query），由数据库层实现
//! - `MemoryStore`：进程内实现，供测试与单机运行
//! - `EntityCache`：显式传入的读穿缓存；Job 修改实体后由调度器调用 `invalidate`

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use crate::core::error::StoreError;

use super::entity::{Entity, EntityId, EntityKind, EntityPayload};

/// 持久化接口。实现需保证读取至少是快照一致的
pub trait EntityStore: Send + Sync {
    fn get(&self, id: EntityId) -> Result<Entity, StoreError>;

    fn save(&self, entity: &Entity) -> Result<(), StoreError>;

    fn query(
        &self,
        kind: EntityKind,
        predicate: &dyn Fn(&Entity) -> bool,
    ) -> Result<Vec<Entity>, StoreError>;

    /// 为新实体分配编号
    fn allocate_id(&self, kind: EntityKind) -> Result<EntityId, StoreError>;
}

/// 内存版存储
#[derive(Default)]
pub struct MemoryStore {
    entities: RwLock<BTreeMap<EntityId, Entity>>,
    next_ids: RwLock<HashMap<EntityKind, u64>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EntityStore for MemoryStore {
    fn get(&self, id: EntityId) -> Result<Entity, StoreError> {
        self.entities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    fn save(&self, entity: &Entity) -> Result<(), StoreError> {
        self.entities
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entity.id, entity.clone());
        Ok(())
    }

    fn query(
        &self,
        kind: EntityKind,
        predicate: &dyn Fn(&Entity) -> bool,
    ) -> Result<Vec<Entity>, StoreError> {
        let entities = self.entities.read().unwrap_or_else(PoisonError::into_inner);
        Ok(entities
            .values()
            .filter(|e| e.kind() == kind && predicate(e))
            .cloned()
            .collect())
    }

    fn allocate_id(&self, kind: EntityKind) -> Result<EntityId, StoreError> {
        let mut next = self.next_ids.write().unwrap_or_else(PoisonError::into_inner);
        let counter = next.entry(kind).or_insert(0);
        *counter += 1;
        Ok(EntityId::new(kind, *counter))
    }
}

/// 读穿缓存：读取未命中时回源，写入直写存储并刷新缓存
pub struct EntityCache {
    store: Arc<dyn EntityStore>,
    cached: RwLock<HashMap<EntityId, Entity>>,
}

impl EntityCache {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self {
            store,
            cached: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, id: EntityId) -> Result<Entity, StoreError> {
        if let Some(entity) = self
            .cached
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
        {
            return Ok(entity.clone());
        }
        let entity = self.store.get(id)?;
        self.cached
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, entity.clone());
        Ok(entity)
    }

    /// 当前状态；实体不存在时为 None
    pub fn state_of(&self, id: EntityId) -> Option<String> {
        self.get(id).ok().map(|e| e.state)
    }

    pub fn save(&self, entity: &Entity) -> Result<(), StoreError> {
        self.store.save(entity)?;
        self.cached
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entity.id, entity.clone());
        Ok(())
    }

    /// 分配编号、以初始状态创建并保存
    pub fn create(&self, payload: EntityPayload) -> Result<Entity, StoreError> {
        let id = self.store.allocate_id(payload.kind())?;
        let entity = Entity::new(id, payload);
        self.save(&entity)?;
        Ok(entity)
    }

    /// 丢弃缓存项，下次读取回源
    pub fn invalidate(&self, id: EntityId) {
        self.cached
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    pub fn invalidate_all(&self) {
        self.cached
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn query(
        &self,
        kind: EntityKind,
        predicate: &dyn Fn(&Entity) -> bool,
    ) -> Result<Vec<Entity>, StoreError> {
        let found = self.store.query(kind, predicate)?;
        let mut cached = self.cached.write().unwrap_or_else(PoisonError::into_inner);
        for entity in &found {
            cached.insert(entity.id, entity.clone());
        }
        Ok(found)
    }

    pub fn host_by_fqdn(&self, fqdn: &str) -> Option<Entity> {
        self.query(EntityKind::Host, &|e| {
            e.not_deleted && e.as_host().map(|h| h.fqdn == fqdn).unwrap_or(false)
        })
        .ok()
        .and_then(|mut hosts| hosts.pop())
    }

    pub fn lnet_of_host(&self, host: EntityId) -> Option<EntityId> {
        self.query(EntityKind::Lnet, &|e| {
            e.not_deleted && e.as_lnet().map(|l| l.host == host).unwrap_or(false)
        })
        .ok()
        .and_then(|lnets| lnets.first().map(|l| l.id))
    }

    pub fn targets_on_host(&self, host: EntityId) -> Vec<Entity> {
        self.query(EntityKind::Target, &|e| {
            e.not_deleted
                && e.as_target()
                    .map(|t| t.primary_host == host)
                    .unwrap_or(false)
        })
        .unwrap_or_default()
    }

    pub fn targets_of_filesystem(&self, filesystem: EntityId) -> Vec<Entity> {
        self.query(EntityKind::Target, &|e| {
            e.not_deleted
                && e.as_target()
                    .map(|t| t.filesystem == Some(filesystem))
                    .unwrap_or(false)
        })
        .unwrap_or_default()
    }

    /// 主机 FQDN；用于把 Job 步骤路由到对应 Agent
    pub fn fqdn_of(&self, host: EntityId) -> Result<String, StoreError> {
        let entity = self.get(host)?;
        entity
            .as_host()
            .map(|h| h.fqdn.clone())
            .ok_or(StoreError::NotFound(host))
    }
}
