//! 订单过期关闭 Worker
//!
//! 两条路径关闭超时未支付的订单：
//! 1. Redis 延迟队列：下单时按过期时间入队，到期后通过 `ZREM` 认领，只有认领成功的实例执行关闭
//! 2. 数据库兜底扫描：以较低频率扫描 `expires_at <= now` 的未支付订单，
//!    使用 `FOR UPDATE SKIP LOCKED` 保证多实例部署时不会重复处理
//!
//! 关闭在一个事务内完成：条件关闭订单、逐项回补库存、释放优惠券名额。
//! 执行时重新校验订单状态，已支付或已关闭的订单不做任何修改。

use std::time::Duration;

use chrono::Utc;
use shop_shared::config::WorkerConfig;
use shop_shared::delay_queue::{DelayQueue, parse_order_member};
use shop_shared::observability::metrics;
use sqlx::{PgConnection, PgPool};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::models::Order;
use crate::repository::{CouponRepository, OrderRepository, ProductRepository};

/// 在事务内关闭未支付订单并回补库存与优惠券
///
/// 订单已支付或已关闭时返回 None
pub async fn close_unpaid_in_tx(tx: &mut PgConnection, order_id: i64) -> Result<Option<Order>> {
    let Some(order) = OrderRepository::close_if_unpaid_in_tx(tx, order_id).await? else {
        return Ok(None);
    };

    for item in OrderRepository::list_items_in_tx(tx, order.id).await? {
        ProductRepository::increase_stock_in_tx(tx, item.product_sku_id, item.amount).await?;
    }
    if let Some(coupon_id) = order.coupon_code_id {
        CouponRepository::release_in_tx(tx, coupon_id).await?;
    }

    Ok(Some(order))
}

/// 关闭单个订单，返回是否发生了关闭
pub async fn close_order(pool: &PgPool, order_id: i64) -> Result<bool> {
    let mut tx = pool.begin().await?;
    match close_unpaid_in_tx(&mut tx, order_id).await? {
        Some(order) => {
            tx.commit().await?;
            info!(order_id, order_no = %order.no, "未支付订单已过期关闭");
            Ok(true)
        }
        None => {
            tx.rollback().await?;
            debug!(order_id, "订单已支付或已关闭，跳过");
            Ok(false)
        }
    }
}

/// 订单过期关闭 Worker
pub struct ExpiryWorker {
    pool: PgPool,
    queue: Option<DelayQueue>,
    poll_interval: Duration,
    batch_size: i64,
    /// 关闭失败后重新入队的延迟
    retry_delay: chrono::Duration,
    sweep_interval: Duration,
}

impl ExpiryWorker {
    pub fn new(pool: PgPool, queue: Option<DelayQueue>, config: &WorkerConfig) -> Self {
        Self {
            pool,
            queue,
            poll_interval: Duration::from_millis(config.expiry_poll_ms),
            batch_size: config.expiry_batch_size,
            retry_delay: chrono::Duration::seconds(config.expiry_retry_delay_seconds),
            sweep_interval: Duration::from_secs(config.expiry_sweep_interval_seconds),
        }
    }

    pub fn with_defaults(pool: PgPool, queue: Option<DelayQueue>) -> Self {
        Self::new(pool, queue, &WorkerConfig::default())
    }

    /// 主循环：持续处理到期订单直到进程退出
    pub async fn run(&self) {
        info!(
            poll_interval = ?self.poll_interval,
            sweep_interval = ?self.sweep_interval,
            batch_size = self.batch_size,
            queue_enabled = self.queue.is_some(),
            "ExpiryWorker 已启动"
        );

        let mut last_sweep: Option<Instant> = None;
        loop {
            if let Some(queue) = &self.queue {
                if let Err(e) = self.process_queue(queue).await {
                    error!(error = %e, "处理过期队列出错");
                }
            }

            if last_sweep.is_none_or(|t| t.elapsed() >= self.sweep_interval) {
                if let Err(e) = self.sweep().await {
                    error!(error = %e, "兜底扫描过期订单出错");
                }
                last_sweep = Some(Instant::now());
            }

            metrics::set_worker_last_run("expiry_worker");

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// 处理延迟队列中已到期的任务，返回关闭的订单数
    pub async fn process_queue(&self, queue: &DelayQueue) -> Result<usize> {
        let now = Utc::now();
        let members = queue.due(now, self.batch_size.max(1) as usize).await?;
        if members.is_empty() {
            return Ok(0);
        }

        let mut closed = 0;
        for member in members {
            // 其他实例已认领
            if !queue.claim(&member).await? {
                continue;
            }

            let Some(order_id) = parse_order_member(&member) else {
                warn!(member = %member, "无法识别的过期任务，已丢弃");
                continue;
            };

            match close_order(&self.pool, order_id).await {
                Ok(true) => {
                    metrics::record_order_expired("queue");
                    closed += 1;
                }
                Ok(false) => {}
                Err(e) => {
                    error!(order_id, error = %e, "关闭过期订单失败，重新入队");
                    if let Err(e) = queue.schedule_at(&member, now + self.retry_delay).await {
                        error!(order_id, error = %e, "过期任务重新入队失败，将由兜底扫描关闭");
                    }
                }
            }
        }

        if closed > 0 {
            info!(closed, "过期队列处理完成");
        }
        Ok(closed)
    }

    /// 兜底扫描：关闭一批已过期但未被队列处理的订单
    pub async fn sweep(&self) -> Result<usize> {
        let mut tx = self.pool.begin().await?;

        let order_ids =
            OrderRepository::lock_expired_unpaid_in_tx(&mut tx, Utc::now(), self.batch_size).await?;
        if order_ids.is_empty() {
            tx.rollback().await?;
            return Ok(0);
        }

        let mut closed = 0;
        for order_id in &order_ids {
            if close_unpaid_in_tx(&mut tx, *order_id).await?.is_some() {
                closed += 1;
            }
        }
        tx.commit().await?;

        for _ in 0..closed {
            metrics::record_order_expired("sweep");
        }
        info!(closed, scanned = order_ids.len(), "兜底扫描关闭过期订单");
        Ok(closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_new_reads_worker_config() {
        let pool = PgPool::connect_lazy("postgres://localhost/test").unwrap();
        let config = WorkerConfig {
            expiry_poll_ms: 250,
            expiry_batch_size: 20,
            expiry_retry_delay_seconds: 5,
            expiry_sweep_interval_seconds: 60,
            ..WorkerConfig::default()
        };

        let worker = ExpiryWorker::new(pool, None, &config);
        assert_eq!(worker.poll_interval, Duration::from_millis(250));
        assert_eq!(worker.batch_size, 20);
        assert_eq!(worker.retry_delay, chrono::Duration::seconds(5));
        assert_eq!(worker.sweep_interval, Duration::from_secs(60));
        assert!(worker.queue.is_none());
    }

    #[tokio::test]
    async fn test_with_defaults() {
        let pool = PgPool::connect_lazy("postgres://localhost/test").unwrap();
        let worker = ExpiryWorker::with_defaults(pool, None);
        assert_eq!(worker.poll_interval, Duration::from_secs(1));
        assert_eq!(worker.sweep_interval, Duration::from_secs(300));
    }
}
