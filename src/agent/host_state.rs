//! 主机联络状态
//!
//! 每次长轮询开始时更新：记录最近联络时间、启动时间与 Agent 启动时间。
//! Agent 启动时间变化（包括管理端重启后的首次联络）意味着需要向其发送
//! SESSION_TERMINATE_ALL。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::session::SessionCollection;

#[derive(Debug, Clone)]
pub struct HostState {
    pub fqdn: String,
    pub boot_time: Option<DateTime<Utc>>,
    pub client_start_time: Option<DateTime<Utc>>,
    last_contact: Option<Instant>,
    healthy: bool,
}

/// 一次联络的结论
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContactUpdate {
    pub require_reset: bool,
    pub rebooted: bool,
}

impl HostState {
    fn new(fqdn: &str, boot_time: Option<DateTime<Utc>>) -> Self {
        Self {
            fqdn: fqdn.to_string(),
            boot_time,
            client_start_time: None,
            last_contact: None,
            healthy: false,
        }
    }

    fn update(
        &mut self,
        boot_time: Option<DateTime<Utc>>,
        client_start_time: Option<DateTime<Utc>>,
    ) -> ContactUpdate {
        let mut update = ContactUpdate::default();
        self.last_contact = Some(Instant::now());

        if let Some(boot_time) = boot_time.filter(|t| Some(*t) != self.boot_time) {
            if self.boot_time.is_some() {
                tracing::warn!(fqdn = %self.fqdn, %boot_time, "Server rebooted");
                update.rebooted = true;
            }
            self.boot_time = Some(boot_time);
        }

        if let Some(start) = client_start_time.filter(|t| Some(*t) != self.client_start_time) {
            if self.client_start_time.is_some() {
                tracing::warn!(fqdn = %self.fqdn, client_start_time = %start, "Agent restarted");
            }
            self.client_start_time = Some(start);
            update.require_reset = true;
        }

        if !self.healthy {
            tracing::info!(fqdn = %self.fqdn, "Host contact established");
            self.healthy = true;
        }
        update
    }

    fn poll(&mut self, contact_timeout: Duration) -> bool {
        if self.healthy {
            let lost = self
                .last_contact
                .map_or(true, |at| at.elapsed() > contact_timeout);
            if lost {
                tracing::warn!(fqdn = %self.fqdn, "Lost contact with host");
                self.healthy = false;
            }
        }
        self.healthy
    }
}

pub struct HostStateCollection {
    hosts: Mutex<HashMap<String, HostState>>,
    contact_timeout: Duration,
}

impl HostStateCollection {
    pub fn new(contact_timeout: Duration) -> Self {
        Self {
            hosts: Mutex::new(HashMap::new()),
            contact_timeout,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, HostState>> {
        self.hosts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 登记已知主机（启动时），尚无联络
    pub fn seed(&self, fqdn: &str, boot_time: Option<DateTime<Utc>>) {
        self.lock()
            .entry(fqdn.to_string())
            .or_insert_with(|| HostState::new(fqdn, boot_time));
    }

    pub fn update(
        &self,
        fqdn: &str,
        boot_time: Option<DateTime<Utc>>,
        client_start_time: Option<DateTime<Utc>>,
    ) -> ContactUpdate {
        self.lock()
            .entry(fqdn.to_string())
            .or_insert_with(|| HostState::new(fqdn, None))
            .update(boot_time, client_start_time)
    }

    /// 检查超时，返回当前失联的主机
    pub fn poll(&self) -> Vec<String> {
        let timeout = self.contact_timeout;
        self.lock()
            .values_mut()
            .filter_map(|state| (!state.poll(timeout)).then(|| state.fqdn.clone()))
            .collect()
    }

    pub fn is_healthy(&self, fqdn: &str) -> bool {
        self.lock().get(fqdn).is_some_and(|s| s.healthy)
    }

    pub fn get(&self, fqdn: &str) -> Option<HostState> {
        self.lock().get(fqdn).cloned()
    }

    pub fn remove_host(&self, fqdn: &str) {
        self.lock().remove(fqdn);
    }
}

/// 周期检查联络超时，并重置失联主机的全部会话
pub struct HostStatePoller {
    hosts: Arc<HostStateCollection>,
    sessions: Arc<SessionCollection>,
    poll_interval: Duration,
    startup_delay: Duration,
}

impl HostStatePoller {
    pub fn new(
        hosts: Arc<HostStateCollection>,
        sessions: Arc<SessionCollection>,
        poll_interval: Duration,
        startup_delay: Duration,
    ) -> Self {
        Self {
            hosts,
            sessions,
            poll_interval,
            startup_delay,
        }
    }

    pub fn poll_once(&self) {
        for fqdn in self.hosts.poll() {
            self.sessions.reset_fqdn_sessions(&fqdn);
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        // 启动延迟避免管理端重启后立即判定所有主机失联
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(self.startup_delay) => {}
        }

        let mut interval = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => self.poll_once(),
            }
        }
        tracing::info!("Host state poller stopped");
    }
}
