//! Agent 会话层
//!
//! 主机上的 Agent 通过 HTTPS 与管理端通信：POST 上送消息，GET 长轮询取回消息。
//! 本模块维护每台主机的消息队列、每个插件的会话、主机联络状态，并以
//! `action_runner` 插件实现 Job 步骤使用的 `AgentInvoker`。

pub mod host_state;
#[cfg(feature = "http")]
pub mod http;
pub mod message;
pub mod queues;
pub mod registration;
pub mod rpc;
pub mod session;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::scheduler::HostRemovalHook;
use crate::state::entity::EntityKind;
use crate::state::store::EntityCache;

pub use host_state::{ContactUpdate, HostStateCollection, HostStatePoller};
pub use message::{Message, MessageBatch, MessageType};
pub use queues::{Drain, HostQueueCollection, RxHandler};
pub use registration::{
    certificate_serial, csr_common_name, CertificateAuthority, CertificateRegistry,
    ClientIdentity, LocalAuthority, Registrar, RegisterRequest, RegisterResponse,
    ReregisterRequest, TokenStore,
};
pub use rpc::{AgentRpc, ACTION_RUNNER};
pub use session::SessionCollection;
pub use transport::AgentTransport;

/// 会话层运行参数
#[derive(Debug, Clone)]
pub struct TransportSettings {
    /// GET 长轮询时长
    pub long_poll: Duration,
    /// 超过该时长未联络视为失联
    pub contact_timeout: Duration,
    pub poll_interval: Duration,
    pub startup_delay: Duration,
    /// 调用动作前等待会话建立的时长
    pub session_wait_timeout: Duration,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            long_poll: Duration::from_secs(30),
            contact_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(10),
            startup_delay: Duration::from_secs(30),
            session_wait_timeout: Duration::from_secs(30),
        }
    }
}

/// 会话层各组件的组合
pub struct AgentService {
    pub queues: Arc<HostQueueCollection>,
    pub sessions: Arc<SessionCollection>,
    pub hosts: Arc<HostStateCollection>,
    pub certificates: Arc<CertificateRegistry>,
    pub rpc: Arc<AgentRpc>,
    pub transport: Arc<AgentTransport>,
    settings: TransportSettings,
}

impl AgentService {
    pub fn new(cache: Arc<EntityCache>, settings: TransportSettings) -> Self {
        let queues = Arc::new(HostQueueCollection::new());
        let sessions = Arc::new(SessionCollection::new(queues.clone()));
        let hosts = Arc::new(HostStateCollection::new(settings.contact_timeout));
        let certificates = Arc::new(CertificateRegistry::new());
        let rpc = AgentRpc::new(queues.clone(), sessions.clone(), settings.session_wait_timeout);

        if let Ok(known) = cache.query(EntityKind::Host, &|e| e.not_deleted) {
            for host in known {
                if let Some(record) = host.as_host() {
                    hosts.seed(&record.fqdn, None);
                }
            }
        }

        let transport = Arc::new(AgentTransport::new(
            queues.clone(),
            sessions.clone(),
            hosts.clone(),
            certificates.clone(),
            cache,
            settings.long_poll,
        ));

        Self {
            queues,
            sessions,
            hosts,
            certificates,
            rpc,
            transport,
            settings,
        }
    }

    /// 启动 RPC 入站处理与联络检查
    pub fn start(&self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let rpc = self.rpc.start(cancel.child_token());
        let poller = HostStatePoller::new(
            self.hosts.clone(),
            self.sessions.clone(),
            self.settings.poll_interval,
            self.settings.startup_delay,
        );
        let poller = tokio::spawn(poller.run(cancel.child_token()));
        vec![rpc, poller]
    }

    /// 主机被删除：丢弃其会话、队列与联络状态，吊销证书
    pub fn remove_host(&self, fqdn: &str) {
        tracing::info!(fqdn, "Removing host from agent service");
        self.sessions.remove_host(fqdn);
        self.queues.remove_host(fqdn);
        self.hosts.remove_host(fqdn);
        self.rpc.remove(fqdn);
        self.certificates.revoke_host(fqdn);
    }
}

impl HostRemovalHook for AgentService {
    fn host_removed(&self, fqdn: &str) {
        self.remove_host(fqdn);
    }
}
