//! 命令：一次用户请求产生的一组 Job

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::jobs::job::{Job, JobId, JobStatus};

pub type CommandId = u64;

/// 首个失败，原样呈现给运维人员
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandFailure {
    pub job_id: JobId,
    pub job_description: String,
    pub step: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: CommandId,
    pub message: String,
    pub job_ids: Vec<JobId>,
    /// 全部 Job 到达终态
    pub complete: bool,
    pub errored: bool,
    pub cancelled: bool,
    pub failure: Option<CommandFailure>,
    pub created_at: i64,
}

impl Command {
    pub fn new(id: CommandId, message: impl Into<String>, job_ids: Vec<JobId>) -> Self {
        Self {
            id,
            message: message.into(),
            job_ids,
            complete: false,
            errored: false,
            cancelled: false,
            failure: None,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// 成功当且仅当全部 Job 完成
    pub fn succeeded(&self) -> bool {
        self.complete && !self.errored && !self.cancelled
    }

    /// 根据 Job 状态重新汇总；首个失败一经记录不再覆盖
    pub fn refresh(&mut self, jobs: &BTreeMap<JobId, Job>) {
        let mut all_terminal = true;
        for job_id in &self.job_ids {
            let Some(job) = jobs.get(job_id) else {
                continue;
            };
            match job.status {
                JobStatus::Failed => {
                    self.errored = true;
                    if self.failure.is_none() {
                        let (step, message) = job
                            .failure
                            .as_ref()
                            .map(|f| (f.step.clone(), f.message.clone()))
                            .unwrap_or_default();
                        self.failure = Some(CommandFailure {
                            job_id: job.id,
                            job_description: job.description.clone(),
                            step,
                            message,
                        });
                    }
                }
                JobStatus::Cancelled => self.cancelled = true,
                JobStatus::Complete => {}
                _ => all_terminal = false,
            }
        }
        self.complete = all_terminal;
    }
}
