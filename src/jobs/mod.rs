//! Job 层：依赖谓词、Job 数据、Job 类型目录、步骤与执行器

pub mod dependency;
pub mod job;
pub mod kinds;
pub mod step;

pub use dependency::{DependOn, Dependency, FixState};
pub use job::{FailureKind, Job, JobFailure, JobId, JobSpec, JobStatus, StateLock, StateTransition, StepResult};
pub use kinds::JobType;
pub use step::{AgentInvoker, ExecutionReport, JobOutcome, Step, StepContext, StepExecutor, StepTimeouts};
