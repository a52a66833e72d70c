//! 运行期锁管理
//!
//! `acquire` 全有或全无：先按 `locked_item` 的全局顺序检查全部锁，全部可授予
//! 才一次性授予。同一 Job 对同一实体同时声明读写时按写锁处理。

use std::collections::{BTreeMap, BTreeSet};

use crate::core::error::LockError;
use crate::jobs::job::{JobId, StateLock};
use crate::state::entity::EntityId;

#[derive(Debug, Default)]
struct Holders {
    writer: Option<JobId>,
    readers: BTreeSet<JobId>,
}

impl Holders {
    fn is_free(&self) -> bool {
        self.writer.is_none() && self.readers.is_empty()
    }
}

/// 单个实体上合并后的请求
struct Request<'a> {
    write: bool,
    begin_state: Option<&'a str>,
}

#[derive(Debug, Default)]
pub struct LockManager {
    held: BTreeMap<EntityId, Holders>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 授予 `job` 的全部锁，返回授予顺序
    pub fn acquire(
        &mut self,
        job: JobId,
        locks: &[StateLock],
        state_of: &dyn Fn(EntityId) -> Option<String>,
    ) -> Result<Vec<EntityId>, LockError> {
        let mut requests: BTreeMap<EntityId, Request<'_>> = BTreeMap::new();
        for lock in locks {
            let request = requests.entry(lock.locked_item).or_insert(Request {
                write: false,
                begin_state: None,
            });
            if lock.write {
                request.write = true;
                if lock.begin_state.is_some() {
                    request.begin_state = lock.begin_state.as_deref();
                }
            }
        }

        for (item, request) in &requests {
            let Some(holders) = self.held.get(item) else {
                continue;
            };
            if let Some(writer) = holders.writer.filter(|w| *w != job) {
                return Err(LockError::Conflict {
                    item: *item,
                    holder: writer,
                });
            }
            if request.write {
                if let Some(reader) = holders.readers.iter().find(|r| **r != job) {
                    return Err(LockError::Conflict {
                        item: *item,
                        holder: *reader,
                    });
                }
            }
        }

        for (item, request) in &requests {
            let Some(expected) = request.begin_state else {
                continue;
            };
            let actual = state_of(*item);
            if actual.as_deref() != Some(expected) {
                return Err(LockError::PreconditionViolated {
                    item: *item,
                    expected: expected.to_string(),
                    actual: actual.unwrap_or_else(|| "<missing>".to_string()),
                });
            }
        }

        let mut granted = Vec::with_capacity(requests.len());
        for (item, request) in requests {
            let holders = self.held.entry(item).or_default();
            if request.write {
                holders.writer = Some(job);
            } else {
                holders.readers.insert(job);
            }
            granted.push(item);
        }
        tracing::debug!(job_id = job, items = granted.len(), "Locks granted");
        Ok(granted)
    }

    pub fn release(&mut self, job: JobId) {
        self.held.retain(|_, holders| {
            if holders.writer == Some(job) {
                holders.writer = None;
            }
            holders.readers.remove(&job);
            !holders.is_free()
        });
    }

    pub fn holds_write(&self, job: JobId, item: EntityId) -> bool {
        self.held
            .get(&item)
            .map(|h| h.writer == Some(job))
            .unwrap_or(false)
    }

    pub fn is_locked(&self, item: EntityId) -> bool {
        self.held.contains_key(&item)
    }

    /// 持有任何锁的 Job
    pub fn holders(&self) -> BTreeSet<JobId> {
        self.held
            .values()
            .flat_map(|h| h.writer.iter().chain(h.readers.iter()).copied())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::entity::EntityKind;
    use std::collections::HashMap;

    fn states(pairs: &[(EntityId, &str)]) -> impl Fn(EntityId) -> Option<String> {
        let map: HashMap<EntityId, String> =
            pairs.iter().map(|(id, s)| (*id, s.to_string())).collect();
        move |id| map.get(&id).cloned()
    }

    #[test]
    fn test_write_excludes_write_and_read() {
        let host = EntityId::host(1);
        let state_of = states(&[(host, "managed")]);
        let mut manager = LockManager::new();

        manager
            .acquire(1, &[StateLock::write(1, host, None, None)], &state_of)
            .unwrap();
        assert_eq!(
            manager.acquire(2, &[StateLock::write(2, host, None, None)], &state_of),
            Err(LockError::Conflict { item: host, holder: 1 })
        );
        assert!(manager
            .acquire(3, &[StateLock::read(3, host)], &state_of)
            .is_err());

        manager.release(1);
        assert!(!manager.is_locked(host));
        manager
            .acquire(3, &[StateLock::read(3, host)], &state_of)
            .unwrap();
        manager
            .acquire(4, &[StateLock::read(4, host)], &state_of)
            .unwrap();
        assert!(manager
            .acquire(5, &[StateLock::write(5, host, None, None)], &state_of)
            .is_err());
    }

    #[test]
    fn test_all_or_nothing() {
        let host = EntityId::host(1);
        let lnet = EntityId::new(EntityKind::Lnet, 1);
        let state_of = states(&[(host, "managed"), (lnet, "lnet_up")]);
        let mut manager = LockManager::new();

        manager
            .acquire(1, &[StateLock::write(1, lnet, None, None)], &state_of)
            .unwrap();
        let result = manager.acquire(
            2,
            &[StateLock::write(2, host, None, None), StateLock::read(2, lnet)],
            &state_of,
        );
        assert!(result.is_err());
        // 冲突时 host 上的锁也不能被授予
        assert!(!manager.is_locked(host));
        assert_eq!(manager.holders(), BTreeSet::from([1]));
    }

    #[test]
    fn test_grant_order_is_global() {
        let target = EntityId::new(EntityKind::Target, 1);
        let host = EntityId::host(2);
        let lnet = EntityId::new(EntityKind::Lnet, 2);
        let state_of = states(&[]);
        let mut manager = LockManager::new();
        let order = manager
            .acquire(
                1,
                &[
                    StateLock::read(1, target),
                    StateLock::write(1, lnet, None, None),
                    StateLock::read(1, host),
                    StateLock::read(1, lnet),
                ],
                &state_of,
            )
            .unwrap();
        assert_eq!(order, vec![host, lnet, target]);
        assert!(manager.holds_write(1, lnet));
    }

    #[test]
    fn test_begin_state_precondition() {
        let host = EntityId::host(1);
        let state_of = states(&[(host, "unconfigured")]);
        let mut manager = LockManager::new();
        let err = manager
            .acquire(
                1,
                &[StateLock::write(1, host, Some("packages_installed"), Some("managed"))],
                &state_of,
            )
            .unwrap_err();
        assert!(matches!(err, LockError::PreconditionViolated { .. }));
        assert!(!manager.is_locked(host));
    }
}
