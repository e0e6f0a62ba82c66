//! 订单服务进程入口
//!
//! 装配订单引擎，启动事件消费者、过期关闭与众筹结算后台任务，
//! 收到关闭信号后退出。

use anyhow::Result;
use shop_shared::{
    config::AppConfig,
    database::Database,
    delay_queue::DelayQueue,
    observability::{self, ObservabilityConfig},
};
use tracing::{error, info, warn};

use order_engine::{GatewayRegistry, OrderEngine};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. 加载配置：config/default.toml -> config/{env}.toml -> config/order-service.toml -> SHOP_ 环境变量，并校验
    let config = AppConfig::load("order-service")?;

    // 2. 日志与指标
    let _guard = observability::init(&ObservabilityConfig::from_app_config(&config)).await?;

    info!(
        environment = %config.environment,
        "Starting order-service..."
    );

    // 3. 数据库
    let db = Database::connect(&config.database).await?;
    if config.database.run_migrations {
        db.run_migrations().await?;
    }
    info!("Database connection established");

    // 4. 延迟队列：Redis 不可用时只依赖数据库兜底扫描
    let queue = match DelayQueue::new(&config.redis) {
        Ok(queue) => match queue.health_check().await {
            Ok(()) => {
                let pending = queue.pending_count().await.unwrap_or_default();
                info!(key = queue.key(), pending, "Redis delay queue connected");
                Some(queue)
            }
            Err(e) => {
                warn!(error = %e, "Redis unavailable, order expiry falls back to database sweep");
                None
            }
        },
        Err(e) => {
            warn!(error = %e, "Invalid Redis configuration, order expiry falls back to database sweep");
            None
        }
    };

    // 5. 支付网关
    let gateways = GatewayRegistry::with_config(&config.gateways)?;

    // 6. 装配服务
    let (engine, listener) = OrderEngine::build(&config, db.pool().clone(), gateways, queue);
    let crowdfunding_worker = engine.crowdfunding_worker(&config)?;
    let expiry_worker = engine.expiry_worker(&config);

    // 7. 后台任务
    tokio::spawn(listener.run());

    tokio::spawn(async move {
        expiry_worker.run().await;
    });

    tokio::spawn(async move {
        crowdfunding_worker.run().await;
    });

    info!("order-service started");

    shutdown_signal().await;

    drop(engine);
    db.close().await;
    info!("order-service shutdown complete");

    Ok(())
}

/// 监听关闭信号
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating graceful shutdown..."),
        _ = terminate => info!("Received SIGTERM, initiating graceful shutdown..."),
    }
}
