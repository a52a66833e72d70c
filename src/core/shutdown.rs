//! 优雅关闭
//!
//! 统一的关闭信号监听与清理：
//! - 停止接受新的长轮询与调度
//! - 让等待中的动作调用以不可达结束
//! - 记录尚未完成的 Job，重启后由调度器恢复

use std::future::Future;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::agent::AgentRpc;
use crate::jobs::job::JobStatus;
use crate::scheduler::JobScheduler;

/// 关闭信号管理器
#[derive(Clone)]
pub struct ShutdownManager {
    shutdown_token: CancellationToken,
    reason_tx: broadcast::Sender<ShutdownReason>,
}

/// 关闭原因
#[derive(Debug, Clone)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM 信号
    Signal,
    /// 致命错误（如 HTTP 服务退出）
    FatalError(String),
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (reason_tx, _) = broadcast::channel(1);
        Self {
            shutdown_token: CancellationToken::new(),
            reason_tx,
        }
    }

    /// 获取关闭 token（用于取消后台任务）
    pub fn token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn shutdown(&self, reason: ShutdownReason) {
        let _ = self.reason_tx.send(reason);
        self.shutdown_token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.reason_tx.subscribe()
    }

    pub async fn wait_for_shutdown(&self) {
        self.shutdown_token.cancelled().await;
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, initiating graceful shutdown...");
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 关闭时需要执行的清理任务
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    /// 清理任务名称（用于日志）
    fn name(&self) -> &'static str;
}

/// 关闭协调器：按注册顺序执行清理任务
pub struct ShutdownCoordinator {
    manager: Arc<ShutdownManager>,
    cleanup_tasks: Vec<Arc<dyn ShutdownCleanup>>,
    /// 单个清理任务的超时（秒）
    timeout_secs: u64,
}

impl ShutdownCoordinator {
    pub fn new(manager: Arc<ShutdownManager>) -> Self {
        Self {
            manager,
            cleanup_tasks: Vec::new(),
            timeout_secs: 5,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, task: T) {
        self.cleanup_tasks.push(Arc::new(task));
    }

    pub async fn run_cleanup(&self) {
        tracing::info!("Running {} cleanup tasks...", self.cleanup_tasks.len());

        let timeout = tokio::time::Duration::from_secs(self.timeout_secs);

        for task in &self.cleanup_tasks {
            let name = task.name();
            match tokio::time::timeout(timeout, task.cleanup()).await {
                Ok(Ok(())) => {
                    tracing::info!("Cleanup task '{}' completed successfully", name);
                }
                Ok(Err(e)) => {
                    tracing::warn!("Cleanup task '{}' failed: {}", name, e);
                }
                Err(_) => {
                    tracing::warn!("Cleanup task '{}' timed out after {}s", name, self.timeout_secs);
                }
            }
        }

        tracing::info!("All cleanup tasks finished");
    }

    pub fn manager(&self) -> &Arc<ShutdownManager> {
        &self.manager
    }
}

/// 结束所有在途动作调用（调用方得到不可达）
pub struct AgentRpcCleanup {
    rpc: Arc<AgentRpc>,
}

impl AgentRpcCleanup {
    pub fn new(rpc: Arc<AgentRpc>) -> Self {
        Self { rpc }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for AgentRpcCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        let in_flight = self.rpc.in_flight();
        if in_flight > 0 {
            tracing::warn!(in_flight, "Completing in-flight agent RPCs as unreachable");
        }
        self.rpc.complete_all();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "AgentRpc"
    }
}

/// 记录关闭时仍未结束的 Job
pub struct SchedulerCleanup {
    scheduler: Arc<JobScheduler>,
}

impl SchedulerCleanup {
    pub fn new(scheduler: Arc<JobScheduler>) -> Self {
        Self { scheduler }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for SchedulerCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        let (jobs, _) = self.scheduler.snapshot();
        let running = jobs
            .iter()
            .filter(|j| matches!(j.status, JobStatus::Running | JobStatus::Runnable))
            .count();
        let waiting = jobs.iter().filter(|j| !j.is_terminal()).count() - running;
        tracing::info!(running, waiting, "Scheduler state at shutdown");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Scheduler"
    }
}

/// 运行主应用直到收到关闭信号，然后执行清理
pub async fn run_with_graceful_shutdown<F, Fut>(
    shutdown_manager: Arc<ShutdownManager>,
    app: F,
    cleanup: impl FnOnce() -> Fut,
) where
    F: Future<Output = ()>,
    Fut: Future<Output = ()>,
{
    shutdown_manager.install_signal_handlers();

    tokio::select! {
        _ = app => {
            tracing::info!("Application finished normally");
        }
        _ = shutdown_manager.wait_for_shutdown() => {
            tracing::info!("Shutdown signal received");
        }
    }

    cleanup().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_shutdown_manager_token() {
        let manager = ShutdownManager::new();
        let token = manager.token();
        assert!(!manager.is_shutdown());
        manager.shutdown(ShutdownReason::FatalError("bind".into()));
        assert!(token.is_cancelled());
        assert!(manager.is_shutdown());
    }

    struct MockCleanup {
        called: Arc<AtomicBool>,
    }

    #[async_trait::async_trait]
    impl ShutdownCleanup for MockCleanup {
        async fn cleanup(&self) -> anyhow::Result<()> {
            self.called.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &'static str {
            "MockCleanup"
        }
    }

    struct SlowCleanup;

    #[async_trait::async_trait]
    impl ShutdownCleanup for SlowCleanup {
        async fn cleanup(&self) -> anyhow::Result<()> {
            tokio::time::sleep(tokio::time::Duration::from_secs(60)).await;
            Ok(())
        }

        fn name(&self) -> &'static str {
            "Slow"
        }
    }

    #[tokio::test]
    async fn test_coordinator_runs_all_tasks_despite_timeout() {
        let manager = Arc::new(ShutdownManager::new());
        let mut coordinator = ShutdownCoordinator::new(manager).with_timeout(1);

        let called = Arc::new(AtomicBool::new(false));
        coordinator.register(SlowCleanup);
        coordinator.register(MockCleanup { called: called.clone() });

        coordinator.run_cleanup().await;
        assert!(called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_run_with_graceful_shutdown_runs_cleanup() {
        let manager = Arc::new(ShutdownManager::new());
        let cleaned = Arc::new(AtomicBool::new(false));
        let flag = cleaned.clone();
        let trigger = manager.clone();

        run_with_graceful_shutdown(
            manager,
            async move {
                trigger.shutdown(ShutdownReason::UserInitiated);
                std::future::pending::<()>().await;
            },
            || async move { flag.store(true, Ordering::SeqCst) },
        )
        .await;
        assert!(cleaned.load(Ordering::SeqCst));
    }
}
