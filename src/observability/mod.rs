//! 可观测性：tracing 订阅器初始化

use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*, EnvFilter};

/// 默认 info 级别，`RUST_LOG` 可覆盖（如 `RUST_LOG=hive::agent=debug`）
pub fn init() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();
}
