//! Hive 管理端
//!
//! 入口：加载配置、初始化日志，组装实体缓存、调度器与 Agent 会话层，
//! 启动 HTTP 服务并在收到关闭信号后清理。

use std::sync::Arc;

use anyhow::Context;
use hive::agent::http::{create_router, AgentHttpState};
use hive::agent::{AgentService, LocalAuthority, Registrar, TokenStore};
use hive::config::load_config;
use hive::core::shutdown::{
    AgentRpcCleanup, SchedulerCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason,
};
use hive::jobs::AgentInvoker;
use hive::observability;
use hive::scheduler::JobScheduler;
use hive::state::{EntityCache, MemoryStore, ProfileRegistry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1).map(std::path::PathBuf::from);
    let config = load_config(config_path).context("Failed to load configuration")?;

    observability::init();

    let store = Arc::new(MemoryStore::new());
    let cache = Arc::new(EntityCache::new(store));
    let profiles = Arc::new(ProfileRegistry::new(config.server_profiles()));

    let agent = Arc::new(AgentService::new(cache.clone(), config.transport_settings()));
    let invoker: Arc<dyn AgentInvoker> = agent.rpc.clone();
    let scheduler = JobScheduler::new(
        cache.clone(),
        profiles.clone(),
        invoker,
        config.scheduler_settings(),
    );
    scheduler.on_host_removed(agent.clone());

    let tokens = Arc::new(TokenStore::new());
    if let Some(profile) = config.registration.bootstrap_profile.as_deref() {
        anyhow::ensure!(
            profiles.get(profile).is_some(),
            "Unknown bootstrap profile '{}'",
            profile
        );
        let token = tokens.issue(
            profile,
            config.registration.token_credits,
            chrono::Duration::seconds(config.registration.token_ttl_secs),
        );
        tracing::info!(
            profile,
            secret = %token.secret,
            credits = token.credits,
            expiry = %token.expiry,
            "Issued registration token"
        );
    }

    let authority = match config.server.crypto_dir.as_deref() {
        Some(dir) => LocalAuthority::load_or_create(&config.server.authority_name, dir),
        None => {
            tracing::warn!("crypto_dir not set, certificates issued now will not survive a restart");
            LocalAuthority::generate(&config.server.authority_name)
        }
    }
    .context("Failed to initialise certificate authority")?;

    let registrar = Arc::new(Registrar::new(
        tokens,
        Arc::new(authority),
        agent.certificates.clone(),
        scheduler.clone(),
        config.server.version.clone(),
        config.server.base_url.clone(),
    ));

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();
    let background = agent.start(shutdown.token());

    let router = create_router(Arc::new(AgentHttpState {
        transport: agent.transport.clone(),
        registrar,
    }));
    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind_addr))?;
    tracing::info!(addr = %config.server.bind_addr, version = %config.server.version, "Hive manager listening");

    let token = shutdown.token();
    let served = axum::serve(listener, router)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await;
    if let Err(e) = &served {
        shutdown.shutdown(ShutdownReason::FatalError(e.to_string()));
    }

    let mut coordinator = ShutdownCoordinator::new(shutdown.clone());
    coordinator.register(AgentRpcCleanup::new(agent.rpc.clone()));
    coordinator.register(SchedulerCleanup::new(scheduler));
    coordinator.run_cleanup().await;

    for handle in background {
        let _ = handle.await;
    }

    served.context("HTTP server failed")?;
    Ok(())
}
