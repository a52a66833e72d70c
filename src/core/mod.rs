//! 核心：错误类型与优雅关闭

pub mod error;
pub mod shutdown;

pub use error::{
    AgentError, LockError, ProtocolViolation, RegistrationError, SchedulingError, StepError,
    StoreError,
};
pub use shutdown::{ShutdownCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason};
