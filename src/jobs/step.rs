//! 步骤与步骤执行器
//!
//! 一个 Job 的步骤严格顺序执行；步骤之间检查取消信号。需要持久化事务的步骤
//! （`database() == true`）先从连接配额信号量取得许可。
//!
//! `invoke_agent` 超时映射为 `AgentError::Unreachable`，与 Agent 报告的失败
//! （`AgentError::Failure`）区分开。

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::core::error::{AgentError, StepError};

use super::job::{FailureKind, JobFailure, JobId, StepResult};

/// 向主机 Agent 发送命令的接口（由 `agent::rpc::AgentRpc` 实现）
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    /// 发送动作并等待对应回复；`cancel` 触发时通知 Agent 取消
    async fn invoke(
        &self,
        fqdn: &str,
        action: &str,
        args: Value,
        cancel: CancellationToken,
    ) -> Result<Value, AgentError>;

    /// 等待主机建立会话
    async fn await_session(&self, fqdn: &str, timeout: Duration) -> Result<(), AgentError>;

    /// 主机当前的会话 ID
    fn session_id(&self, fqdn: &str) -> Option<String>;

    /// 等待主机以不同于 `previous` 的会话重新连接
    async fn await_restart(
        &self,
        fqdn: &str,
        previous: Option<String>,
        timeout: Duration,
    ) -> Result<(), AgentError>;
}

/// 部署 / 重启类步骤的等待时限
#[derive(Debug, Clone, Copy)]
pub struct StepTimeouts {
    pub deploy: Duration,
    pub restart: Duration,
}

/// 步骤运行时上下文
pub struct StepContext {
    pub job_id: JobId,
    agent: Arc<dyn AgentInvoker>,
    cancel: CancellationToken,
    rpc_timeout: Duration,
}

impl StepContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn agent(&self) -> &Arc<dyn AgentInvoker> {
        &self.agent
    }

    /// 调用 Agent 动作，阻塞本步骤直到回复或超时
    pub async fn invoke_agent(&self, fqdn: &str, action: &str, args: Value) -> Result<Value, StepError> {
        if self.cancel.is_cancelled() {
            return Err(StepError::Cancelled);
        }
        let call = self.agent.invoke(fqdn, action, args, self.cancel.clone());
        match tokio::time::timeout(self.rpc_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(AgentError::Cancelled)) => Err(StepError::Cancelled),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(AgentError::Unreachable {
                fqdn: fqdn.to_string(),
                detail: format!("no reply to '{}' within {}s", action, self.rpc_timeout.as_secs()),
            }
            .into()),
        }
    }

    /// 结果必须是含 `result` 或 `error` 的对象；`error` 视为 Agent 报告失败
    pub async fn invoke_agent_expect_result(
        &self,
        fqdn: &str,
        action: &str,
        args: Value,
    ) -> Result<Value, StepError> {
        let value = self.invoke_agent(fqdn, action, args).await?;
        if let Some(error) = value.get("error").filter(|e| !e.is_null()) {
            let message = error
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            return Err(AgentError::Failure {
                fqdn: fqdn.to_string(),
                action: action.to_string(),
                message,
            }
            .into());
        }
        match value.get("result") {
            Some(result) => Ok(result.clone()),
            None => Err(StepError::Failed(format!(
                "'{}' on {} returned neither result nor error: {}",
                action, fqdn, value
            ))),
        }
    }
}

/// 一个工作单元
#[async_trait]
pub trait Step: Send + Sync + fmt::Debug {
    fn description(&self) -> String;

    /// 幂等步骤可由管理员重跑 Job 安全重试；引擎本身从不自动重试
    fn idempotent(&self) -> bool {
        false
    }

    /// 需要持久化事务访问
    fn database(&self) -> bool {
        false
    }

    async fn run(&self, ctx: &StepContext) -> Result<Value, StepError>;
}

/// 调用单个 Agent 动作
#[derive(Debug, Clone)]
pub struct AgentActionStep {
    fqdn: String,
    action: String,
    args: Value,
    idempotent: bool,
    database: bool,
    expect_result: bool,
}

impl AgentActionStep {
    pub fn new(fqdn: impl Into<String>, action: &str, args: Value) -> Self {
        Self {
            fqdn: fqdn.into(),
            action: action.to_string(),
            args,
            idempotent: false,
            database: false,
            expect_result: false,
        }
    }

    pub fn idempotent(mut self) -> Self {
        self.idempotent = true;
        self
    }

    pub fn database(mut self) -> Self {
        self.database = true;
        self
    }

    pub fn expect_result(mut self) -> Self {
        self.expect_result = true;
        self
    }
}

#[async_trait]
impl Step for AgentActionStep {
    fn description(&self) -> String {
        format!("{} on {}", self.action, self.fqdn)
    }

    fn idempotent(&self) -> bool {
        self.idempotent
    }

    fn database(&self) -> bool {
        self.database
    }

    async fn run(&self, ctx: &StepContext) -> Result<Value, StepError> {
        if self.expect_result {
            ctx.invoke_agent_expect_result(&self.fqdn, &self.action, self.args.clone())
                .await
        } else {
            ctx.invoke_agent(&self.fqdn, &self.action, self.args.clone())
                .await
        }
    }
}

/// 等待新部署的 Agent 建立会话
#[derive(Debug, Clone)]
pub struct AwaitSessionStep {
    fqdn: String,
    timeout: Duration,
}

impl AwaitSessionStep {
    pub fn new(fqdn: impl Into<String>, timeout: Duration) -> Self {
        Self {
            fqdn: fqdn.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Step for AwaitSessionStep {
    fn description(&self) -> String {
        format!("Wait for agent on {}", self.fqdn)
    }

    fn idempotent(&self) -> bool {
        true
    }

    async fn run(&self, ctx: &StepContext) -> Result<Value, StepError> {
        ctx.agent().await_session(&self.fqdn, self.timeout).await?;
        Ok(Value::Null)
    }
}

async fn reboot_and_wait(ctx: &StepContext, fqdn: &str, timeout: Duration) -> Result<(), StepError> {
    let previous = ctx.agent().session_id(fqdn);
    ctx.invoke_agent(fqdn, "reboot_server", json!({})).await?;
    ctx.agent().await_restart(fqdn, previous, timeout).await?;
    Ok(())
}

/// 重启主机并等待 Agent 以新会话回来
#[derive(Debug, Clone)]
pub struct RebootStep {
    fqdn: String,
    timeout: Duration,
}

impl RebootStep {
    pub fn new(fqdn: impl Into<String>, timeout: Duration) -> Self {
        Self {
            fqdn: fqdn.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Step for RebootStep {
    fn description(&self) -> String {
        format!("Reboot {}", self.fqdn)
    }

    async fn run(&self, ctx: &StepContext) -> Result<Value, StepError> {
        reboot_and_wait(ctx, &self.fqdn, self.timeout).await?;
        Ok(Value::Null)
    }
}

/// 安装软件包后若运行内核与所需内核不同则重启
#[derive(Debug, Clone)]
pub struct RebootIfNeededStep {
    fqdn: String,
    timeout: Duration,
}

impl RebootIfNeededStep {
    pub fn new(fqdn: impl Into<String>, timeout: Duration) -> Self {
        Self {
            fqdn: fqdn.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Step for RebootIfNeededStep {
    fn description(&self) -> String {
        format!("Reboot {} if a new kernel was installed", self.fqdn)
    }

    fn idempotent(&self) -> bool {
        true
    }

    async fn run(&self, ctx: &StepContext) -> Result<Value, StepError> {
        let status = ctx
            .invoke_agent(&self.fqdn, "kernel_status", json!({}))
            .await?;
        let running = status.get("running").and_then(Value::as_str);
        let required = status.get("required").and_then(Value::as_str);
        if required.is_some() && running != required {
            tracing::info!(fqdn = %self.fqdn, ?running, ?required, "Kernel changed, rebooting");
            reboot_and_wait(ctx, &self.fqdn, self.timeout).await?;
            return Ok(json!({"rebooted": true}));
        }
        Ok(json!({"rebooted": false}))
    }
}

/// 一次执行的结局
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Succeeded,
    Failed(JobFailure),
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub outcome: JobOutcome,
    pub results: Vec<StepResult>,
}

fn failure_kind(error: &StepError) -> FailureKind {
    match error {
        StepError::Agent(AgentError::Unreachable { .. }) => FailureKind::AgentUnreachable,
        StepError::Agent(AgentError::Failure { .. }) => FailureKind::AgentFailure,
        _ => FailureKind::StepFailure,
    }
}

/// 步骤执行器：顺序运行一个 Job 的全部步骤
#[derive(Clone)]
pub struct StepExecutor {
    agent: Arc<dyn AgentInvoker>,
    db_quota: Arc<Semaphore>,
    rpc_timeout: Duration,
}

impl StepExecutor {
    pub fn new(agent: Arc<dyn AgentInvoker>, max_db_connections: usize, rpc_timeout: Duration) -> Self {
        Self {
            agent,
            db_quota: Arc::new(Semaphore::new(max_db_connections.max(1))),
            rpc_timeout,
        }
    }

    pub async fn run(
        &self,
        job_id: JobId,
        steps: Vec<Box<dyn Step>>,
        cancel: CancellationToken,
    ) -> ExecutionReport {
        let ctx = StepContext {
            job_id,
            agent: Arc::clone(&self.agent),
            cancel: cancel.clone(),
            rpc_timeout: self.rpc_timeout,
        };
        let mut results = Vec::with_capacity(steps.len());

        for (index, step) in steps.iter().enumerate() {
            if cancel.is_cancelled() {
                tracing::info!(job_id, index, "Job cancelled between steps");
                return ExecutionReport {
                    outcome: JobOutcome::Cancelled,
                    results,
                };
            }

            let description = step.description();
            let _permit = if step.database() {
                match Arc::clone(&self.db_quota).acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(e) => {
                        return ExecutionReport {
                            outcome: JobOutcome::Failed(JobFailure {
                                kind: FailureKind::StepFailure,
                                step: Some(description),
                                message: format!("connection quota closed: {e}"),
                            }),
                            results,
                        };
                    }
                }
            } else {
                None
            };

            tracing::info!(job_id, index, step = %description, "Running step");
            let started_at = chrono::Utc::now().timestamp_millis();
            let outcome = step.run(&ctx).await;
            let finished_at = chrono::Utc::now().timestamp_millis();

            match outcome {
                Ok(value) => results.push(StepResult {
                    step: description,
                    success: true,
                    result: Some(value),
                    error: None,
                    started_at,
                    finished_at,
                }),
                Err(StepError::Cancelled) => {
                    results.push(StepResult {
                        step: description,
                        success: false,
                        result: None,
                        error: Some("cancelled".into()),
                        started_at,
                        finished_at,
                    });
                    return ExecutionReport {
                        outcome: JobOutcome::Cancelled,
                        results,
                    };
                }
                Err(e) => {
                    tracing::warn!(
                        job_id,
                        step = %description,
                        retryable = step.idempotent(),
                        error = %e,
                        "Step failed"
                    );
                    results.push(StepResult {
                        step: description.clone(),
                        success: false,
                        result: None,
                        error: Some(e.to_string()),
                        started_at,
                        finished_at,
                    });
                    return ExecutionReport {
                        outcome: JobOutcome::Failed(JobFailure {
                            kind: failure_kind(&e),
                            step: Some(description),
                            message: e.to_string(),
                        }),
                        results,
                    };
                }
            }
        }

        ExecutionReport {
            outcome: JobOutcome::Succeeded,
            results,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// 按动作名返回预设结果的 Agent
    #[derive(Default)]
    struct ScriptedAgent {
        replies: Mutex<HashMap<String, Result<Value, AgentError>>>,
        calls: Mutex<Vec<String>>,
        hang: bool,
    }

    impl ScriptedAgent {
        fn reply(self, action: &str, reply: Result<Value, AgentError>) -> Self {
            self.replies.lock().unwrap().insert(action.to_string(), reply);
            self
        }
    }

    #[async_trait]
    impl AgentInvoker for ScriptedAgent {
        async fn invoke(
            &self,
            _fqdn: &str,
            action: &str,
            _args: Value,
            cancel: CancellationToken,
        ) -> Result<Value, AgentError> {
            self.calls.lock().unwrap().push(action.to_string());
            if self.hang {
                cancel.cancelled().await;
                return Err(AgentError::Cancelled);
            }
            self.replies
                .lock()
                .unwrap()
                .get(action)
                .cloned()
                .unwrap_or(Ok(json!({"result": null})))
        }

        async fn await_session(&self, _fqdn: &str, _timeout: Duration) -> Result<(), AgentError> {
            Ok(())
        }

        fn session_id(&self, _fqdn: &str) -> Option<String> {
            Some("s1".into())
        }

        async fn await_restart(
            &self,
            _fqdn: &str,
            _previous: Option<String>,
            _timeout: Duration,
        ) -> Result<(), AgentError> {
            self.calls.lock().unwrap().push("await_restart".into());
            Ok(())
        }
    }

    fn executor(agent: Arc<ScriptedAgent>) -> StepExecutor {
        StepExecutor::new(agent, 2, Duration::from_millis(200))
    }

    #[tokio::test]
    async fn test_steps_run_in_order() {
        let agent = Arc::new(ScriptedAgent::default());
        let steps: Vec<Box<dyn Step>> = vec![
            Box::new(AgentActionStep::new("oss1", "load_lnet", json!({}))),
            Box::new(AgentActionStep::new("oss1", "start_lnet", json!({}))),
        ];
        let report = executor(agent.clone())
            .run(1, steps, CancellationToken::new())
            .await;
        assert_eq!(report.outcome, JobOutcome::Succeeded);
        assert_eq!(report.results.len(), 2);
        assert_eq!(*agent.calls.lock().unwrap(), vec!["load_lnet", "start_lnet"]);
    }

    #[tokio::test]
    async fn test_failure_stops_remaining_steps() {
        let agent = Arc::new(ScriptedAgent::default().reply(
            "format_target",
            Err(AgentError::Failure {
                fqdn: "oss1".into(),
                action: "format_target".into(),
                message: "mkfs failed".into(),
            }),
        ));
        let steps: Vec<Box<dyn Step>> = vec![
            Box::new(AgentActionStep::new("oss1", "format_target", json!({}))),
            Box::new(AgentActionStep::new("oss1", "register_target", json!({}))),
        ];
        let report = executor(agent.clone())
            .run(1, steps, CancellationToken::new())
            .await;
        match report.outcome {
            JobOutcome::Failed(failure) => {
                assert_eq!(failure.kind, FailureKind::AgentFailure);
                assert_eq!(failure.step.as_deref(), Some("format_target on oss1"));
                assert!(failure.message.contains("mkfs failed"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(agent.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_is_unreachable() {
        let agent = Arc::new(ScriptedAgent {
            hang: true,
            ..Default::default()
        });
        let steps: Vec<Box<dyn Step>> =
            vec![Box::new(AgentActionStep::new("oss1", "start_lnet", json!({})))];
        let report = executor(agent).run(1, steps, CancellationToken::new()).await;
        match report.outcome {
            JobOutcome::Failed(failure) => assert_eq!(failure.kind, FailureKind::AgentUnreachable),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_expect_result_error_is_agent_failure() {
        let agent = Arc::new(
            ScriptedAgent::default().reply("detect_scan", Ok(json!({"error": "no devices"}))),
        );
        let steps: Vec<Box<dyn Step>> = vec![Box::new(
            AgentActionStep::new("oss1", "detect_scan", json!({})).expect_result(),
        )];
        let report = executor(agent).run(1, steps, CancellationToken::new()).await;
        assert!(matches!(
            report.outcome,
            JobOutcome::Failed(JobFailure {
                kind: FailureKind::AgentFailure,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_cancelled_before_first_step() {
        let agent = Arc::new(ScriptedAgent::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let steps: Vec<Box<dyn Step>> =
            vec![Box::new(AgentActionStep::new("oss1", "stop_lnet", json!({})))];
        let report = executor(agent.clone()).run(1, steps, cancel).await;
        assert_eq!(report.outcome, JobOutcome::Cancelled);
        assert!(agent.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reboot_if_needed() {
        let agent = Arc::new(ScriptedAgent::default().reply(
            "kernel_status",
            Ok(json!({"running": "4.18.0-1", "required": "4.18.0-2"})),
        ));
        let steps: Vec<Box<dyn Step>> = vec![Box::new(RebootIfNeededStep::new(
            "oss1",
            Duration::from_secs(1),
        ))];
        let report = executor(agent.clone())
            .run(1, steps, CancellationToken::new())
            .await;
        assert_eq!(report.outcome, JobOutcome::Succeeded);
        assert_eq!(
            *agent.calls.lock().unwrap(),
            vec!["kernel_status", "reboot_server", "await_restart"]
        );
    }

    /// 数据库步骤受配额限制
    #[tokio::test]
    async fn test_database_steps_respect_quota() {
        #[derive(Debug)]
        struct Counting {
            active: Arc<AtomicUsize>,
            peak: Arc<AtomicUsize>,
        }

        #[async_trait]
        impl Step for Counting {
            fn description(&self) -> String {
                "count".into()
            }
            fn database(&self) -> bool {
                true
            }
            async fn run(&self, _ctx: &StepContext) -> Result<Value, StepError> {
                let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                self.active.fetch_sub(1, Ordering::SeqCst);
                Ok(Value::Null)
            }
        }

        let agent = Arc::new(ScriptedAgent::default());
        let exec = StepExecutor::new(agent, 1, Duration::from_secs(1));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for job_id in 0..3 {
            let exec = exec.clone();
            let steps: Vec<Box<dyn Step>> = vec![Box::new(Counting {
                active: active.clone(),
                peak: peak.clone(),
            })];
            handles.push(tokio::spawn(async move {
                exec.run(job_id, steps, CancellationToken::new()).await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().outcome, JobOutcome::Succeeded);
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }
}
