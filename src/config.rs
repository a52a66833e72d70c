//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__SCHEDULER__MAX_WORKERS=16`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::agent::TransportSettings;
use crate::jobs::step::StepTimeouts;
use crate::scheduler::{JobPreference, SchedulerSettings};
use crate::state::entity::ServerProfile;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub transport: TransportSection,
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub registration: RegistrationSection,
    /// 服务器 profile；为空时使用内置 profile
    #[serde(default)]
    pub profiles: Vec<ServerProfile>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerSection::default(),
            transport: TransportSection::default(),
            scheduler: SchedulerSection::default(),
            registration: RegistrationSection::default(),
            profiles: Vec::new(),
        }
    }
}

/// [server] 段：监听地址、管理端版本、对外 URL
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// 与 Agent 版本比较（主版本相同且次版本不低于 Agent）
    #[serde(default = "default_version")]
    pub version: String,
    /// 引导脚本中的注册与软件源地址
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// 本地签发方名称（根证书的 CN）
    #[serde(default = "default_authority_name")]
    pub authority_name: String,
    /// 根证书与密钥所在目录；未设置时每次启动重新生成
    #[serde(default)]
    pub crypto_dir: Option<PathBuf>,
}

fn default_bind_addr() -> String {
    "127.0.0.1:8000".to_string()
}

fn default_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_base_url() -> String {
    "https://localhost:8000".to_string()
}

fn default_authority_name() -> String {
    "hive".to_string()
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            version: default_version(),
            base_url: default_base_url(),
            authority_name: default_authority_name(),
            crypto_dir: None,
        }
    }
}

/// [transport] 段：长轮询与主机联络检查（秒）
#[derive(Debug, Clone, Deserialize)]
pub struct TransportSection {
    #[serde(default = "default_long_poll_secs")]
    pub long_poll_secs: u64,
    /// 失联判定 = 长轮询时长 × 该系数
    #[serde(default = "default_contact_timeout_factor")]
    pub contact_timeout_factor: u32,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_startup_delay_secs")]
    pub startup_delay_secs: u64,
}

fn default_long_poll_secs() -> u64 {
    30
}

fn default_contact_timeout_factor() -> u32 {
    2
}

fn default_poll_interval_secs() -> u64 {
    10
}

fn default_startup_delay_secs() -> u64 {
    30
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            long_poll_secs: default_long_poll_secs(),
            contact_timeout_factor: default_contact_timeout_factor(),
            poll_interval_secs: default_poll_interval_secs(),
            startup_delay_secs: default_startup_delay_secs(),
        }
    }
}

/// [scheduler] 段：工作槽位、连接配额、迁移选择策略与超时（秒）
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerSection {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_max_db_connections")]
    pub max_db_connections: usize,
    #[serde(default)]
    pub job_preference: JobPreference,
    #[serde(default = "default_rpc_timeout_secs")]
    pub rpc_timeout_secs: u64,
    #[serde(default = "default_session_wait_timeout_secs")]
    pub session_wait_timeout_secs: u64,
    #[serde(default = "default_deploy_timeout_secs")]
    pub deploy_timeout_secs: u64,
    #[serde(default = "default_restart_timeout_secs")]
    pub restart_timeout_secs: u64,
    #[serde(default = "default_retained_commands")]
    pub retained_commands: usize,
}

fn default_max_workers() -> usize {
    8
}

fn default_max_db_connections() -> usize {
    10
}

fn default_rpc_timeout_secs() -> u64 {
    300
}

fn default_session_wait_timeout_secs() -> u64 {
    30
}

fn default_deploy_timeout_secs() -> u64 {
    600
}

fn default_restart_timeout_secs() -> u64 {
    300
}

fn default_retained_commands() -> usize {
    1000
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            max_db_connections: default_max_db_connections(),
            job_preference: JobPreference::default(),
            rpc_timeout_secs: default_rpc_timeout_secs(),
            session_wait_timeout_secs: default_session_wait_timeout_secs(),
            deploy_timeout_secs: default_deploy_timeout_secs(),
            restart_timeout_secs: default_restart_timeout_secs(),
            retained_commands: default_retained_commands(),
        }
    }
}

/// [registration] 段：启动时签发的注册令牌
#[derive(Debug, Clone, Deserialize)]
pub struct RegistrationSection {
    /// 设置后启动时为该 profile 签发一个令牌并写入日志
    #[serde(default)]
    pub bootstrap_profile: Option<String>,
    #[serde(default = "default_token_credits")]
    pub token_credits: u32,
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: i64,
}

fn default_token_credits() -> u32 {
    1
}

fn default_token_ttl_secs() -> i64 {
    3600
}

impl Default for RegistrationSection {
    fn default() -> Self {
        Self {
            bootstrap_profile: None,
            token_credits: default_token_credits(),
            token_ttl_secs: default_token_ttl_secs(),
        }
    }
}

impl AppConfig {
    pub fn scheduler_settings(&self) -> SchedulerSettings {
        let s = &self.scheduler;
        SchedulerSettings {
            max_workers: s.max_workers.max(1),
            max_db_connections: s.max_db_connections.max(1),
            preference: s.job_preference,
            rpc_timeout: Duration::from_secs(s.rpc_timeout_secs),
            timeouts: StepTimeouts {
                deploy: Duration::from_secs(s.deploy_timeout_secs),
                restart: Duration::from_secs(s.restart_timeout_secs),
            },
            retained_commands: s.retained_commands.max(1),
        }
    }

    pub fn transport_settings(&self) -> TransportSettings {
        let t = &self.transport;
        let long_poll = Duration::from_secs(t.long_poll_secs);
        TransportSettings {
            long_poll,
            contact_timeout: long_poll * t.contact_timeout_factor,
            poll_interval: Duration::from_secs(t.poll_interval_secs),
            startup_delay: Duration::from_secs(t.startup_delay_secs),
            session_wait_timeout: Duration::from_secs(self.scheduler.session_wait_timeout_secs),
        }
    }

    /// 配置中的 profile，未配置时为内置 profile
    pub fn server_profiles(&self) -> Vec<ServerProfile> {
        if self.profiles.is_empty() {
            ServerProfile::builtin()
        } else {
            self.profiles.clone()
        }
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
