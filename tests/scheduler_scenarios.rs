//! 调度器端到端场景：路径展开、写锁串行、级联取消、失败保持实体状态

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use hive::core::error::AgentError;
    use hive::jobs::{AgentInvoker, FailureKind, Job, JobStatus, JobType};
    use hive::scheduler::{CancelOutcome, CommandId, JobScheduler, SchedulerSettings};
    use hive::state::{
        EntityCache, EntityId, EntityPayload, FilesystemRecord, HostRecord, InstallMethod,
        LnetRecord, MemoryStore, ProfileRegistry, ServerProfile, TargetRecord, TargetRole,
    };
    use serde_json::{json, Value};
    use tokio::sync::Semaphore;
    use tokio_util::sync::CancellationToken;

    const WAIT: Duration = Duration::from_secs(10);

    /// 记录调用顺序的 Agent；被“闸住”的动作在放行前一直阻塞
    #[derive(Default)]
    struct FleetAgent {
        calls: Mutex<Vec<String>>,
        gates: Mutex<HashMap<String, Arc<Semaphore>>>,
        replies: Mutex<HashMap<String, Value>>,
    }

    impl FleetAgent {
        fn gate(&self, action: &str) -> Arc<Semaphore> {
            self.gates
                .lock()
                .unwrap()
                .entry(action.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(0)))
                .clone()
        }

        fn reply(&self, action: &str, value: Value) {
            self.replies
                .lock()
                .unwrap()
                .insert(action.to_string(), value);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn position(&self, action: &str) -> usize {
            self.calls()
                .iter()
                .position(|c| c == action)
                .unwrap_or_else(|| panic!("'{action}' was never called: {:?}", self.calls()))
        }

        async fn pass(&self, action: &str, cancel: &CancellationToken) -> Result<(), AgentError> {
            self.calls.lock().unwrap().push(action.to_string());
            let gate = self.gates.lock().unwrap().get(action).cloned();
            if let Some(gate) = gate {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                    permit = gate.acquire() => permit.unwrap().forget(),
                }
            }
            Ok(())
        }
    }

    #[async_trait]
    impl AgentInvoker for FleetAgent {
        async fn invoke(
            &self,
            _fqdn: &str,
            action: &str,
            _args: Value,
            cancel: CancellationToken,
        ) -> Result<Value, AgentError> {
            self.pass(action, &cancel).await?;
            let reply = self.replies.lock().unwrap().get(action).cloned();
            Ok(reply.unwrap_or_else(|| json!({ "result": null })))
        }

        async fn await_session(&self, _fqdn: &str, _timeout: Duration) -> Result<(), AgentError> {
            self.pass("await_session", &CancellationToken::new()).await
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
            Ok(())
        }
    }

    struct Fleet {
        scheduler: Arc<JobScheduler>,
        agent: Arc<FleetAgent>,
        host: EntityId,
        lnet: EntityId,
    }

    fn fleet(host_state: &str) -> Fleet {
        let cache = Arc::new(EntityCache::new(Arc::new(MemoryStore::new())));
        let host = cache
            .create(EntityPayload::Host(HostRecord {
                fqdn: "oss1.example.com".into(),
                nodename: "oss1".into(),
                address: "10.0.0.1".into(),
                profile: "storage_server".into(),
                install_method: InstallMethod::Manual,
                immutable_state: false,
            }))
            .unwrap()
            .with_state(host_state);
        cache.save(&host).unwrap();
        let lnet = cache
            .create(EntityPayload::Lnet(LnetRecord { host: host.id }))
            .unwrap();

        let agent = Arc::new(FleetAgent::default());
        let profiles = Arc::new(ProfileRegistry::new(ServerProfile::builtin()));
        let scheduler = JobScheduler::new(
            cache,
            profiles,
            agent.clone(),
            SchedulerSettings::default(),
        );
        Fleet {
            scheduler,
            agent,
            host: host.id,
            lnet: lnet.id,
        }
    }

    fn job_of(jobs: &[Job], job_type: JobType) -> Job {
        jobs.iter()
            .find(|j| j.job_type == job_type)
            .cloned()
            .unwrap_or_else(|| panic!("no {job_type} in {:?}", jobs.iter().map(|j| j.job_type).collect::<Vec<_>>()))
    }

    async fn finish(fleet: &Fleet, command_id: CommandId) -> Vec<Job> {
        let command = fleet
            .scheduler
            .wait_command(command_id, WAIT)
            .await
            .unwrap();
        assert!(command.complete, "command {command_id} did not finish: {command:?}");
        fleet.scheduler.command_jobs(command_id).unwrap()
    }

    #[tokio::test]
    async fn test_undeployed_host_reaches_managed_in_sequence() {
        let fleet = fleet("undeployed");
        let command_id = fleet
            .scheduler
            .set_state(fleet.host, "managed", "Set up oss1", None)
            .unwrap();
        let jobs = finish(&fleet, command_id).await;

        let deploy = job_of(&jobs, JobType::DeployHost);
        let install = job_of(&jobs, JobType::InstallHostPackages);
        let setup = job_of(&jobs, JobType::SetupHost);
        assert!(install.wait_for.contains(&deploy.id));
        assert!(setup.wait_for.contains(&install.id));
        for job_type in [JobType::EnableLnet, JobType::LoadLnet, JobType::StartLnet] {
            assert_eq!(job_of(&jobs, job_type).status, JobStatus::Complete);
        }
        assert!(jobs.iter().all(|j| j.status == JobStatus::Complete));

        let agent = &fleet.agent;
        assert!(agent.position("await_session") < agent.position("install_packages"));
        assert!(agent.position("kernel_status") < agent.position("configure_lnet"));
        assert!(agent.position("start_lnet") < agent.position("initialise_block_device_drivers"));

        let cache = fleet.scheduler.cache();
        assert_eq!(cache.state_of(fleet.host).as_deref(), Some("managed"));
        assert_eq!(cache.state_of(fleet.lnet).as_deref(), Some("lnet_up"));
        assert!(fleet.scheduler.pending_transitions().is_empty());
    }

    #[tokio::test]
    async fn test_second_writer_waits_for_running_job() {
        let fleet = fleet("unconfigured");
        let install_gate = fleet.agent.gate("install_packages");
        let remove_gate = fleet.agent.gate("deregister_server");

        let first = fleet
            .scheduler
            .set_state(fleet.host, "packages_installed", "Install packages", None)
            .unwrap();
        let a = fleet.scheduler.command_jobs(first).unwrap()[0].clone();
        assert_eq!(a.job_type, JobType::InstallHostPackages);
        let a = fleet
            .scheduler
            .wait_job_status(a.id, JobStatus::Running, WAIT)
            .await
            .unwrap();
        assert_eq!(a.status, JobStatus::Running);

        let second = fleet
            .scheduler
            .set_state(fleet.host, "removed", "Remove oss1", None)
            .unwrap();
        let b = job_of(&fleet.scheduler.command_jobs(second).unwrap(), JobType::RemoveHost);
        assert!(b.wait_for.contains(&a.id));
        assert_eq!(b.transition.as_ref().unwrap().from_state, "packages_installed");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fleet.scheduler.get_job(b.id).unwrap().status, JobStatus::Planned);

        install_gate.add_permits(1);
        let b_running = fleet
            .scheduler
            .wait_job_status(b.id, JobStatus::Running, WAIT)
            .await
            .unwrap();
        assert_eq!(b_running.status, JobStatus::Running);
        assert_eq!(fleet.scheduler.get_job(a.id).unwrap().status, JobStatus::Complete);

        remove_gate.add_permits(1);
        finish(&fleet, second).await;
        let host = fleet.scheduler.cache().get(fleet.host).unwrap();
        assert_eq!(host.state, "removed");
        assert!(!host.not_deleted);
    }

    #[tokio::test]
    async fn test_cancelling_job_cascades_to_dependents() {
        let fleet = fleet("undeployed");
        let deploy_gate = fleet.agent.gate("await_session");
        let command_id = fleet
            .scheduler
            .set_state(fleet.host, "managed", "Set up oss1", None)
            .unwrap();
        let jobs = fleet.scheduler.command_jobs(command_id).unwrap();
        let deploy = job_of(&jobs, JobType::DeployHost);
        let install = job_of(&jobs, JobType::InstallHostPackages);

        fleet
            .scheduler
            .wait_job_status(deploy.id, JobStatus::Running, WAIT)
            .await
            .unwrap();
        assert_eq!(
            fleet.scheduler.cancel_job(install.id).unwrap(),
            CancelOutcome::Cancelled
        );
        deploy_gate.add_permits(1);

        let jobs = finish(&fleet, command_id).await;
        for job in &jobs {
            let expected = if job.id == deploy.id {
                JobStatus::Complete
            } else {
                JobStatus::Cancelled
            };
            assert_eq!(job.status, expected, "{} ({})", job.description, job.job_type);
        }

        let command = fleet.scheduler.get_command(command_id).unwrap();
        assert!(command.cancelled);
        assert!(!command.errored);
        let cache = fleet.scheduler.cache();
        assert_eq!(cache.state_of(fleet.host).as_deref(), Some("unconfigured"));
        assert_eq!(cache.state_of(fleet.lnet).as_deref(), Some("unconfigured"));
        assert!(!fleet.agent.calls().contains(&"install_packages".to_string()));
    }

    #[tokio::test]
    async fn test_failed_job_leaves_entity_and_cancels_dependents() {
        let fleet = fleet("unconfigured");
        fleet
            .agent
            .reply("install_packages", json!({ "error": "repository unavailable" }));
        let command_id = fleet
            .scheduler
            .set_state(fleet.host, "managed", "Set up oss1", None)
            .unwrap();
        let jobs = finish(&fleet, command_id).await;

        let install = job_of(&jobs, JobType::InstallHostPackages);
        assert_eq!(install.status, JobStatus::Failed);
        let failure = install.failure.unwrap();
        assert_eq!(failure.kind, FailureKind::AgentFailure);
        assert!(failure.message.contains("repository unavailable"));
        assert_eq!(job_of(&jobs, JobType::SetupHost).status, JobStatus::Cancelled);
        assert_eq!(job_of(&jobs, JobType::EnableLnet).status, JobStatus::Cancelled);

        let command = fleet.scheduler.get_command(command_id).unwrap();
        assert!(command.errored);
        assert_eq!(command.failure.unwrap().job_id, install.id);
        assert_eq!(
            fleet.scheduler.cache().state_of(fleet.host).as_deref(),
            Some("unconfigured")
        );
    }

    #[tokio::test]
    async fn test_running_cancellable_job_is_signalled() {
        let fleet = fleet("unconfigured");
        let _gate = fleet.agent.gate("install_packages");
        let command_id = fleet
            .scheduler
            .set_state(fleet.host, "packages_installed", "Install packages", None)
            .unwrap();
        let job = fleet.scheduler.command_jobs(command_id).unwrap()[0].clone();
        assert!(job.cancellable);
        fleet
            .scheduler
            .wait_job_status(job.id, JobStatus::Running, WAIT)
            .await
            .unwrap();

        assert_eq!(
            fleet.scheduler.cancel_job(job.id).unwrap(),
            CancelOutcome::Signalled
        );
        finish(&fleet, command_id).await;
        assert_eq!(
            fleet.scheduler.get_job(job.id).unwrap().status,
            JobStatus::Cancelled
        );
        assert_eq!(
            fleet.scheduler.cache().state_of(fleet.host).as_deref(),
            Some("unconfigured")
        );
        assert_eq!(
            fleet.scheduler.cancel_job(job.id).unwrap(),
            CancelOutcome::AlreadyFinished
        );
    }

    #[tokio::test]
    async fn test_running_deploy_is_not_cancellable() {
        let fleet = fleet("undeployed");
        let gate = fleet.agent.gate("await_session");
        let command_id = fleet
            .scheduler
            .set_state(fleet.host, "unconfigured", "Deploy oss1", None)
            .unwrap();
        let job = fleet.scheduler.command_jobs(command_id).unwrap()[0].clone();
        assert_eq!(job.job_type, JobType::DeployHost);
        fleet
            .scheduler
            .wait_job_status(job.id, JobStatus::Running, WAIT)
            .await
            .unwrap();

        assert_eq!(
            fleet.scheduler.cancel_job(job.id).unwrap(),
            CancelOutcome::NotCancellable
        );
        gate.add_permits(1);
        finish(&fleet, command_id).await;
        assert_eq!(
            fleet.scheduler.get_job(job.id).unwrap().status,
            JobStatus::Complete
        );
        assert_eq!(
            fleet.scheduler.cache().state_of(fleet.host).as_deref(),
            Some("unconfigured")
        );
    }

    struct Lustre {
        fs: EntityId,
        mdt: EntityId,
        osts: [EntityId; 2],
    }

    /// 在 oss1 上搭一个已挂载的文件系统：一个 MDT、两个 OST
    fn lustre(fleet: &Fleet) -> Lustre {
        let cache = fleet.scheduler.cache();
        let lnet = cache.get(fleet.lnet).unwrap().with_state("lnet_up");
        cache.save(&lnet).unwrap();
        let fs = cache
            .create(EntityPayload::Filesystem(FilesystemRecord {
                name: "lustre".into(),
                mgs: None,
            }))
            .unwrap()
            .with_state("available");
        cache.save(&fs).unwrap();

        let target = |name: &str, role: TargetRole, device: &str| {
            let target = cache
                .create(EntityPayload::Target(TargetRecord {
                    name: name.into(),
                    role,
                    filesystem: Some(fs.id),
                    primary_host: fleet.host,
                    device: device.into(),
                    immutable_state: false,
                }))
                .unwrap()
                .with_state("mounted");
            cache.save(&target).unwrap();
            target.id
        };
        Lustre {
            fs: fs.id,
            mdt: target("lustre-MDT0000", TargetRole::Mdt, "/dev/sdb"),
            osts: [
                target("lustre-OST0000", TargetRole::Ost, "/dev/sdc"),
                target("lustre-OST0001", TargetRole::Ost, "/dev/sdd"),
            ],
        }
    }

    #[tokio::test]
    async fn test_stopping_one_target_makes_filesystem_unavailable() {
        let fleet = fleet("managed");
        let lustre = lustre(&fleet);
        let cache = fleet.scheduler.cache();

        let command_id = fleet
            .scheduler
            .set_state(lustre.osts[0], "unmounted", "Stop OST0000", None)
            .unwrap();
        let jobs = finish(&fleet, command_id).await;
        assert_eq!(job_of(&jobs, JobType::StopTarget).status, JobStatus::Complete);
        assert_eq!(cache.state_of(lustre.osts[0]).as_deref(), Some("unmounted"));
        assert_eq!(cache.state_of(lustre.fs).as_deref(), Some("unavailable"));

        let command_id = fleet
            .scheduler
            .set_states(
                &[
                    (lustre.mdt, "unmounted".to_string()),
                    (lustre.osts[1], "unmounted".to_string()),
                ],
                "Stop remaining targets",
                None,
            )
            .unwrap();
        finish(&fleet, command_id).await;
        assert_eq!(cache.state_of(lustre.fs).as_deref(), Some("stopped"));
    }

    #[tokio::test]
    async fn test_filesystem_state_waits_while_locked() {
        let fleet = fleet("managed");
        let lustre = lustre(&fleet);
        let cache = fleet.scheduler.cache();
        let gate = fleet.agent.gate("unmount_target");

        let command_id = fleet
            .scheduler
            .set_states(
                &[
                    (lustre.mdt, "unmounted".to_string()),
                    (lustre.osts[0], "unmounted".to_string()),
                ],
                "Stop MDT and OST0000",
                None,
            )
            .unwrap();
        let jobs = fleet.scheduler.command_jobs(command_id).unwrap();
        assert_eq!(jobs.len(), 2);

        // 放行一个卸载；另一个仍持有文件系统上的读锁，文件系统状态不重算
        gate.add_permits(1);
        let mut done = None;
        for _ in 0..500 {
            done = jobs
                .iter()
                .map(|j| fleet.scheduler.get_job(j.id).unwrap())
                .find(|j| j.status == JobStatus::Complete);
            if done.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let done = done.expect("one unmount should complete");
        let stopped = done.transition.as_ref().unwrap().entity;
        assert_eq!(cache.state_of(stopped).as_deref(), Some("unmounted"));
        assert_eq!(cache.state_of(lustre.fs).as_deref(), Some("available"));

        gate.add_permits(1);
        finish(&fleet, command_id).await;
        assert_eq!(cache.state_of(lustre.fs).as_deref(), Some("unavailable"));
    }
}
