//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 指标通过独立的 HTTP 端口暴露，供 Prometheus 抓取。

use anyhow::Result;
use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::ObservabilityConfig;

/// Metrics 资源守卫
pub struct MetricsHandle {
    _server_handle: tokio::task::JoinHandle<()>,
}

/// 初始化 Prometheus 指标导出
///
/// 启动一个独立的 HTTP 服务器在指定端口暴露 `/metrics` 端点。
pub async fn init(config: &ObservabilityConfig) -> Result<MetricsHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    register_common_metrics(&config.service_name);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    let server_handle = start_metrics_server(addr, handle).await?;

    Ok(MetricsHandle {
        _server_handle: server_handle,
    })
}

/// 注册业务指标描述，出现在 /metrics 端点的 HELP 注释中
fn register_common_metrics(service_name: &str) {
    metrics::describe_counter!("orders_created_total", "Total number of orders created");
    metrics::describe_histogram!(
        "order_create_duration_seconds",
        "Order creation duration in seconds"
    );

    metrics::describe_counter!(
        "payments_reconciled_total",
        "Total number of payment callbacks reconciled"
    );
    metrics::describe_counter!("webhooks_total", "Total number of gateway webhooks handled");

    metrics::describe_counter!("refunds_total", "Total number of refund transitions");

    metrics::describe_counter!("orders_expired_total", "Total number of orders closed by expiry");

    metrics::describe_counter!(
        "crowdfunding_settlements_total",
        "Total number of crowdfunding campaigns settled"
    );

    metrics::describe_gauge!(
        "worker_last_run_timestamp",
        "Unix timestamp of the last completed worker iteration"
    );

    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

/// 启动指标 HTTP 服务器
async fn start_metrics_server(
    addr: SocketAddr,
    handle: PrometheusHandle,
) -> Result<tokio::task::JoinHandle<()>> {
    let app = Router::new()
        .route("/metrics", get(move || std::future::ready(handle.render())))
        .route("/health", get(|| async { "OK" }));

    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Metrics server error: {}", e);
        }
    });

    Ok(server_handle)
}

// ============================================================================
// 指标记录函数
// ============================================================================

/// 记录订单创建
#[inline]
pub fn record_order_created(order_type: &str, status: &str, duration_secs: f64) {
    metrics::counter!(
        "orders_created_total",
        "type" => order_type.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    metrics::histogram!(
        "order_create_duration_seconds",
        "type" => order_type.to_string()
    )
    .record(duration_secs);
}

/// 记录支付回调对账结果（applied / duplicate / failed）
#[inline]
pub fn record_payment(method: &str, outcome: &str) {
    metrics::counter!(
        "payments_reconciled_total",
        "method" => method.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// 记录网关回调应答
#[inline]
pub fn record_webhook(kind: &str, method: &str, ack: &str) {
    metrics::counter!(
        "webhooks_total",
        "kind" => kind.to_string(),
        "method" => method.to_string(),
        "ack" => ack.to_string()
    )
    .increment(1);
}

/// 记录退款状态迁移
#[inline]
pub fn record_refund(method: &str, status: &str) {
    metrics::counter!(
        "refunds_total",
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// 记录订单过期关闭（source: queue / sweep）
#[inline]
pub fn record_order_expired(source: &str) {
    metrics::counter!("orders_expired_total", "source" => source.to_string()).increment(1);
}

/// 记录众筹结算
#[inline]
pub fn record_settlement(outcome: &str, count: u64) {
    metrics::counter!(
        "crowdfunding_settlements_total",
        "outcome" => outcome.to_string()
    )
    .increment(count);
}

/// 记录 worker 最近一次完成轮询的时间
#[inline]
pub fn set_worker_last_run(worker: &str) {
    let now = chrono::Utc::now().timestamp() as f64;
    metrics::gauge!("worker_last_run_timestamp", "worker" => worker.to_string()).set(now);
}
