//! Hive - 存储集群主机管理核心
//!
//! 模块划分：
//! - **state**: 有状态实体、各类实体的状态机、持久化接口与实体缓存
//! - **jobs**: 依赖表达式、Job 模型、Job 类型目录、步骤与步骤执行器
//! - **scheduler**: 命令规划、锁、Job 生命周期与工作池
//! - **agent**: 与主机 Agent 的会话协议（消息队列、会话、屏障、RPC、注册）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型与优雅关闭
//! - **observability**: 日志初始化

pub mod agent;
pub mod config;
pub mod core;
pub mod jobs;
pub mod observability;
pub mod scheduler;
pub mod state;

pub use scheduler::{CommandId, JobScheduler};
pub use state::entity::{EntityId, EntityKind};
