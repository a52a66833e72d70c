//! 调度层：锁、命令规划与 Job 生命周期

pub mod command;
pub mod job_scheduler;
pub mod lock_cache;
pub mod lock_manager;
pub mod planner;

pub use command::{Command, CommandFailure, CommandId};
pub use job_scheduler::{CancelOutcome, HostRemovalHook, JobScheduler, SchedulerSettings};
pub use lock_cache::LockCache;
pub use lock_manager::LockManager;
pub use planner::{CommandPlanner, JobPreference, JobPreview};
