//! 已声明锁缓存
//!
//! 记录所有未结束 Job 在规划时声明的锁（按声明顺序编号），用于：
//! - 计算实体的预期状态（最近一次待完成写锁的 end_state）
//! - 为新 Job 推导 `wait_for`
//!
//! 与运行期的 `LockManager` 不同，这里不做互斥，只描述顺序。

use crate::jobs::job::{JobId, StateLock};
use crate::state::entity::EntityId;

/// 带声明序号的锁
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockEntry {
    pub seq: u64,
    pub lock: StateLock,
}

#[derive(Debug, Clone, Default)]
pub struct LockCache {
    entries: Vec<LockEntry>,
    next_seq: u64,
}

impl LockCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, locks: &[StateLock]) {
        for lock in locks {
            self.next_seq += 1;
            self.entries.push(LockEntry {
                seq: self.next_seq,
                lock: lock.clone(),
            });
        }
    }

    pub fn remove_job(&mut self, job: JobId) {
        self.entries.retain(|e| e.lock.job != job);
    }

    /// `item` 上最近声明的写锁（排除 `not_job` 自己的锁）
    pub fn get_latest_write(&self, item: EntityId, not_job: Option<JobId>) -> Option<&LockEntry> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.lock.write && e.lock.locked_item == item && Some(e.lock.job) != not_job)
    }

    /// `item` 上序号大于 `after` 的读锁
    pub fn get_read_locks(
        &self,
        item: EntityId,
        after: u64,
        not_job: Option<JobId>,
    ) -> Vec<&LockEntry> {
        self.entries
            .iter()
            .filter(|e| {
                !e.lock.write
                    && e.lock.locked_item == item
                    && e.seq > after
                    && Some(e.lock.job) != not_job
            })
            .collect()
    }

    /// 实体的预期状态；没有带 end_state 的待完成写锁时为 None
    pub fn expected_state(&self, item: EntityId) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .filter(|e| e.lock.write && e.lock.locked_item == item)
            .find_map(|e| e.lock.end_state.as_deref())
    }

    pub fn has_locks(&self, item: EntityId) -> bool {
        self.entries.iter().any(|e| e.lock.locked_item == item)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::entity::EntityKind;

    #[test]
    fn test_expected_state_follows_latest_write() {
        let host = EntityId::host(1);
        let mut cache = LockCache::new();
        assert_eq!(cache.expected_state(host), None);

        cache.add(&[StateLock::write(1, host, Some("unconfigured"), Some("packages_installed"))]);
        cache.add(&[StateLock::write(2, host, Some("packages_installed"), Some("managed"))]);
        assert_eq!(cache.expected_state(host), Some("managed"));

        cache.remove_job(2);
        assert_eq!(cache.expected_state(host), Some("packages_installed"));
        cache.remove_job(1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_reads_after_barrier() {
        let lnet = EntityId::new(EntityKind::Lnet, 1);
        let mut cache = LockCache::new();
        cache.add(&[StateLock::read(1, lnet)]);
        cache.add(&[StateLock::write(2, lnet, Some("lnet_down"), Some("lnet_up"))]);
        cache.add(&[StateLock::read(3, lnet)]);
        cache.add(&[StateLock::read(4, lnet)]);

        let write = cache.get_latest_write(lnet, None).unwrap();
        assert_eq!(write.lock.job, 2);
        let readers: Vec<JobId> = cache
            .get_read_locks(lnet, write.seq, Some(4))
            .iter()
            .map(|e| e.lock.job)
            .collect();
        assert_eq!(readers, vec![3]);
        assert!(cache.get_latest_write(lnet, Some(2)).is_none());
    }
}
