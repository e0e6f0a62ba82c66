//! 众筹结算 Worker
//!
//! 按 cron 表达式触发，锁定已到截止时间仍在众筹中的活动并结算：
//! - 已支付订单合计达到目标金额 -> success，订单可以发货
//! - 否则 -> fail，并为该活动启动后台批量退款任务
//!
//! 已筹金额在结算事务内按已支付订单重新汇总，`total_amount` 缓存列只用于展示。
//! 每一轮还会为仍有未退款订单的已失败活动重新分派退款（结算后才到达的支付回调、
//! 网关网络错误、进程中途退出），退款状态的条件更新保证重复分派不会重复退款。
//!
//! 使用 `FOR UPDATE SKIP LOCKED` 保证多实例部署时每个活动只结算一次。

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use parking_lot::Mutex;
use shop_shared::observability::metrics;
use sqlx::PgPool;
use tracing::{debug, error, info, warn};

use crate::error::{OrderError, Result};
use crate::models::CrowdfundingStatus;
use crate::models::product::settle_outcome;
use crate::repository::{InstallmentRepositoryTrait, OrderRepositoryTrait, ProductRepository};
use crate::service::RefundService;
use crate::service::dto::SettlementReport;

/// 众筹结算 Worker
pub struct CrowdfundingWorker<OR, IR>
where
    OR: OrderRepositoryTrait + 'static,
    IR: InstallmentRepositoryTrait + 'static,
{
    pool: PgPool,
    refunds: Arc<RefundService<OR, IR>>,
    schedule: Schedule,
    batch_size: i64,
    /// 批量退款仍在执行中的活动
    in_flight: Arc<Mutex<HashSet<i64>>>,
}

impl<OR, IR> CrowdfundingWorker<OR, IR>
where
    OR: OrderRepositoryTrait + 'static,
    IR: InstallmentRepositoryTrait + 'static,
{
    /// 创建 Worker，cron 表达式无效时返回错误
    pub fn new(
        pool: PgPool,
        refunds: Arc<RefundService<OR, IR>>,
        cron_expression: &str,
        batch_size: i64,
    ) -> Result<Self> {
        let schedule = Schedule::from_str(cron_expression).map_err(|e| {
            OrderError::Validation(format!("无效的 cron 表达式 '{}': {}", cron_expression, e))
        })?;

        Ok(Self {
            pool,
            refunds,
            schedule,
            batch_size,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    /// 主循环：按 cron 计划结算直到进程退出
    pub async fn run(&self) {
        info!(batch_size = self.batch_size, "CrowdfundingWorker 已启动");

        loop {
            let Some(delay) = next_delay(&self.schedule, Utc::now()) else {
                warn!("cron 表达式没有后续触发时间，CrowdfundingWorker 退出");
                return;
            };
            tokio::time::sleep(delay).await;

            match self.settle_due().await {
                Ok(report) if !report.is_empty() => {
                    info!(
                        succeeded = report.succeeded.len(),
                        failed = report.failed.len(),
                        "众筹结算完成"
                    );
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "众筹结算出错"),
            }

            metrics::set_worker_last_run("crowdfunding_worker");
        }
    }

    /// 结算一批已到期的众筹活动，报告中为商品 ID
    ///
    /// 退款在事务提交后以后台任务执行，不阻塞本次结算
    pub async fn settle_due(&self) -> Result<SettlementReport> {
        let mut tx = self.pool.begin().await?;

        let campaigns = ProductRepository::lock_due_crowdfunding_in_tx(&mut tx, self.batch_size).await?;

        let mut report = SettlementReport::default();
        for campaign in &campaigns {
            let raised =
                ProductRepository::refresh_crowdfunding_progress_in_tx(&mut tx, campaign.product_id)
                    .await?
                    .map(|(total_amount, _)| total_amount)
                    .unwrap_or_default();
            let outcome = settle_outcome(raised, campaign.target_amount);
            if !ProductRepository::finish_crowdfunding_in_tx(&mut tx, campaign.id, outcome).await? {
                continue;
            }

            info!(
                product_id = campaign.product_id,
                raised,
                target_amount = campaign.target_amount,
                outcome = ?outcome,
                "众筹活动已结算"
            );
            match outcome {
                CrowdfundingStatus::Success => report.succeeded.push(campaign.product_id),
                _ => report.failed.push(campaign.product_id),
            }
        }

        let unrefunded =
            ProductRepository::list_failed_with_pending_refunds_in_tx(&mut tx, self.batch_size).await?;

        tx.commit().await?;

        for product_id in report.failed.iter().copied() {
            self.dispatch_refund(product_id);
        }
        for product_id in unrefunded {
            if !report.failed.contains(&product_id) && self.dispatch_refund(product_id) {
                report.retried.push(product_id);
            }
        }

        metrics::record_settlement("success", report.succeeded.len() as u64);
        metrics::record_settlement("fail", report.failed.len() as u64);
        metrics::record_settlement("refund_retry", report.retried.len() as u64);

        Ok(report)
    }

    /// 为失败活动启动后台批量退款，同一活动已有任务在执行时跳过
    fn dispatch_refund(&self, product_id: i64) -> bool {
        if !self.in_flight.lock().insert(product_id) {
            debug!(product_id, "该活动的批量退款仍在执行，跳过");
            return false;
        }

        let refunds = self.refunds.clone();
        let in_flight = self.in_flight.clone();
        tokio::spawn(async move {
            match refunds.refund_crowdfunding_orders(product_id).await {
                Ok(report) if !report.failed.is_empty() => {
                    warn!(
                        product_id,
                        failed = ?report.failed,
                        "部分众筹订单退款失败，下一轮结算时重试"
                    );
                }
                Ok(_) => {}
                Err(e) => error!(product_id, error = %e, "众筹失败批量退款出错"),
            }
            in_flight.lock().remove(&product_id);
        });
        true
    }
}

/// 距离下一次触发的等待时间
fn next_delay(schedule: &Schedule, now: DateTime<Utc>) -> Option<Duration> {
    let next = schedule.after(&now).next()?;
    Some((next - now).to_std().unwrap_or(Duration::ZERO))
}
