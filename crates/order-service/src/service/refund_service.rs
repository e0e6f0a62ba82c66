//! 退款服务
//!
//! 退款状态机：
//!
//! ```text
//! pending --申请--> applied --拒绝--> pending
//!                   applied --同意--> processing | success | failed
//!                processing --回调--> success | failed
//! ```
//!
//! 同意退款后按支付方式分派：
//! - 同步网关（alipay）：网关直接返回结果，订单进入 success 或 failed
//! - 异步网关（wechat）：网关受理后订单进入 processing，等待退款回调
//! - 分期：订单进入 processing，每个已支付还款项通过各自网关退款，
//!   退款单号为 `{订单退款单号}_{期序号}`，全部完成后汇总为订单状态
//!
//! 众筹失败的批量退款跳过申请环节，直接从 pending 分派。
//! 网关调用失败（网络错误）时订单状态保持不变，可重试；
//! 退款单号一经分配即复用，保证重试在网关侧幂等。

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use shop_shared::observability::metrics;
use tracing::{error, info, instrument, warn};

use crate::error::{OrderError, Result};
use crate::gateway::{GatewayRegistry, PaymentGateway, RefundNotification, RefundRequest, RefundResponse};
use crate::models::installment::{aggregate_refund_status, item_trade_no};
use crate::models::order::generate_refund_no;
use crate::models::{
    Installment, InstallmentItem, ItemRefundStatus, Order, OrderExtra, PaymentMethod, RefundMode,
    RefundStatus,
};
use crate::repository::{InstallmentRepositoryTrait, OrderRepositoryTrait};
use crate::service::dto::{BulkRefundReport, RefundDecision};

/// 分期还款项退款失败时写入订单的失败码
pub const INSTALLMENT_REFUND_FAILED: &str = "INSTALLMENT_ITEM_REFUND_FAILED";

/// 众筹批量退款的并发度
const BULK_REFUND_CONCURRENCY: usize = 8;

/// 网关退款结果对应的状态迁移
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundTransition {
    pub status: RefundStatus,
    pub failed_code: Option<String>,
}

/// 调用网关退款并映射为订单应迁移到的状态
///
/// 网络或协议错误原样返回，调用方不做任何状态迁移
pub async fn request_gateway_refund(
    gateway: &dyn PaymentGateway,
    request: RefundRequest,
) -> Result<RefundTransition> {
    let transition = match gateway.refund(request).await? {
        RefundResponse::Succeeded => RefundTransition {
            status: RefundStatus::Success,
            failed_code: None,
        },
        RefundResponse::Failed { code } => RefundTransition {
            status: RefundStatus::Failed,
            failed_code: Some(code),
        },
        RefundResponse::Accepted => RefundTransition {
            status: RefundStatus::Processing,
            failed_code: None,
        },
    };
    Ok(transition)
}

/// 退款回调中的退款单号
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefundRef<'a> {
    Order(&'a str),
    InstallmentItem { refund_no: &'a str, sequence: i32 },
}

impl<'a> RefundRef<'a> {
    pub fn parse(refund_no: &'a str) -> Self {
        if let Some((order_refund_no, sequence)) = refund_no.rsplit_once('_') {
            if let Ok(sequence) = sequence.parse::<i32>() {
                if !order_refund_no.is_empty() && sequence >= 0 {
                    return Self::InstallmentItem {
                        refund_no: order_refund_no,
                        sequence,
                    };
                }
            }
        }
        Self::Order(refund_no)
    }
}

fn item_status(status: RefundStatus) -> ItemRefundStatus {
    match status {
        RefundStatus::Success => ItemRefundStatus::Success,
        RefundStatus::Failed => ItemRefundStatus::Failed,
        RefundStatus::Processing | RefundStatus::Applied => ItemRefundStatus::Processing,
        RefundStatus::Pending => ItemRefundStatus::Pending,
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// 退款服务
pub struct RefundService<OR, IR>
where
    OR: OrderRepositoryTrait,
    IR: InstallmentRepositoryTrait,
{
    order_repo: Arc<OR>,
    installment_repo: Arc<IR>,
    gateways: Arc<GatewayRegistry>,
    notify_url: String,
}

impl<OR, IR> RefundService<OR, IR>
where
    OR: OrderRepositoryTrait,
    IR: InstallmentRepositoryTrait,
{
    pub fn new(
        order_repo: Arc<OR>,
        installment_repo: Arc<IR>,
        gateways: Arc<GatewayRegistry>,
        notify_url: impl Into<String>,
    ) -> Self {
        Self {
            order_repo,
            installment_repo,
            gateways,
            notify_url: notify_url.into(),
        }
    }

    async fn load_order(&self, order_id: i64) -> Result<Order> {
        self.order_repo
            .find_by_id(order_id)
            .await?
            .ok_or_else(|| OrderError::OrderNotFound(order_id.to_string()))
    }

    fn refund_request(
        &self,
        gateway: &dyn PaymentGateway,
        out_trade_no: String,
        refund_no: String,
        amount: i64,
    ) -> RefundRequest {
        let notify_url = match gateway.refund_mode() {
            RefundMode::Asynchronous => Some(format!(
                "{}/{}",
                self.notify_url.trim_end_matches('/'),
                gateway.method()
            )),
            RefundMode::Synchronous => None,
        };
        RefundRequest {
            out_trade_no,
            refund_no,
            total_amount: amount,
            refund_amount: amount,
            notify_url,
        }
    }

    // ==================== 申请与审核 ====================

    /// 买家申请退款
    #[instrument(skip(self, reason))]
    pub async fn apply_refund(&self, user_id: i64, order_id: i64, reason: &str) -> Result<()> {
        let reason = non_empty(Some(reason))
            .ok_or_else(|| OrderError::Validation("退款理由不能为空".to_string()))?;

        let order = self.load_order(order_id).await?;
        order.ensure_owned_by(user_id)?;
        order.ensure_refund_applicable()?;

        let mut extra = order.extra.0.clone();
        extra.refund_reason = Some(reason);

        if !self
            .order_repo
            .update_refund(order.id, RefundStatus::Pending, RefundStatus::Applied, &extra)
            .await?
        {
            return Err(OrderError::invalid_state(order.id, "该订单已经申请过退款"));
        }

        info!(order_no = %order.no, "买家已申请退款");
        Ok(())
    }

    /// 运营处理退款申请，返回处理后的退款状态
    #[instrument(skip(self, decision), fields(agree = decision.agree))]
    pub async fn handle_refund_decision(
        &self,
        order_id: i64,
        decision: RefundDecision,
    ) -> Result<RefundStatus> {
        let order = self.load_order(order_id).await?;
        if order.refund_status != RefundStatus::Applied {
            return Err(OrderError::invalid_state(order.id, "订单退款状态不正确"));
        }

        let mut extra = order.extra.0.clone();
        extra.refund_disagree_reason = None;

        if !decision.agree {
            let reason = non_empty(decision.reason.as_deref())
                .ok_or_else(|| OrderError::Validation("拒绝退款理由不能为空".to_string()))?;
            extra.refund_disagree_reason = Some(reason);

            if !self
                .order_repo
                .update_refund(order.id, RefundStatus::Applied, RefundStatus::Pending, &extra)
                .await?
            {
                return Err(OrderError::ConcurrencyConflict);
            }

            let method = order.payment_method.map(|m| m.as_str()).unwrap_or("unknown");
            metrics::record_refund(method, "rejected");
            info!(order_no = %order.no, "退款申请已拒绝");
            return Ok(RefundStatus::Pending);
        }

        self.refund_order(order, extra, RefundStatus::Applied).await
    }

    // ==================== 退款分派 ====================

    /// 按支付方式分派退款，`expected` 为订单当前的退款状态
    async fn refund_order(
        &self,
        order: Order,
        mut extra: OrderExtra,
        expected: RefundStatus,
    ) -> Result<RefundStatus> {
        let method = order
            .payment_method
            .ok_or(OrderError::UnknownPaymentMethod(order.id))?;
        let refund_no = self
            .order_repo
            .assign_refund_no(order.id, &generate_refund_no())
            .await?;

        if method == PaymentMethod::Installment {
            return self
                .refund_installment(&order, &refund_no, extra, expected)
                .await;
        }

        let gateway = self.gateways.resolve(method)?;
        let request = self.refund_request(
            gateway.as_ref(),
            order.no.clone(),
            refund_no.clone(),
            order.total_amount,
        );

        // 网络错误直接返回，订单保持当前状态以便重试
        let transition = request_gateway_refund(gateway.as_ref(), request).await?;

        extra.refund_failed_code = transition.failed_code.clone();
        if !self
            .order_repo
            .update_refund(order.id, expected, transition.status, &extra)
            .await?
        {
            warn!(order_no = %order.no, refund_no = %refund_no, "退款状态已被并发修改");
            return Err(OrderError::ConcurrencyConflict);
        }

        metrics::record_refund(method.as_str(), transition.status.as_str());
        info!(
            order_no = %order.no,
            refund_no = %refund_no,
            status = transition.status.as_str(),
            failed_code = ?transition.failed_code,
            "退款已分派"
        );
        Ok(transition.status)
    }

    async fn refund_installment(
        &self,
        order: &Order,
        refund_no: &str,
        extra: OrderExtra,
        expected: RefundStatus,
    ) -> Result<RefundStatus> {
        let installment = self
            .installment_repo
            .find_active_by_order(order.id)
            .await?
            .ok_or_else(|| OrderError::InstallmentNotFound(order.no.clone()))?;

        // 1. 订单进入退款中
        if !self
            .order_repo
            .update_refund(order.id, expected, RefundStatus::Processing, &extra)
            .await?
        {
            return Err(OrderError::ConcurrencyConflict);
        }

        // 2. 逐期退款
        let items = self.installment_repo.list_items(installment.id).await?;
        for item in items.iter().filter(|i| {
            i.is_paid()
                && matches!(
                    i.refund_status,
                    ItemRefundStatus::Pending | ItemRefundStatus::Failed
                )
        }) {
            let next = match self.refund_installment_item(&installment, refund_no, item).await {
                Ok(status) => status,
                Err(e) => {
                    error!(
                        order_no = %order.no,
                        sequence = item.sequence,
                        error = %e,
                        "分期还款项退款失败"
                    );
                    ItemRefundStatus::Failed
                }
            };

            self.installment_repo
                .update_item_refund_status(
                    item.id,
                    &[ItemRefundStatus::Pending, ItemRefundStatus::Failed],
                    next,
                )
                .await?;
        }

        // 3. 汇总
        self.sync_installment_refund(order.id, installment.id).await
    }

    async fn refund_installment_item(
        &self,
        installment: &Installment,
        refund_no: &str,
        item: &InstallmentItem,
    ) -> Result<ItemRefundStatus> {
        let method = item
            .payment_method
            .ok_or(OrderError::UnknownPaymentMethod(installment.order_id))?;
        let gateway = self.gateways.resolve(method)?;
        let request = self.refund_request(
            gateway.as_ref(),
            item_trade_no(&installment.no, item.sequence),
            item_trade_no(refund_no, item.sequence),
            item.total(),
        );
        let transition = request_gateway_refund(gateway.as_ref(), request).await?;
        Ok(item_status(transition.status))
    }

    /// 根据还款项退款状态汇总订单退款状态
    async fn sync_installment_refund(
        &self,
        order_id: i64,
        installment_id: i64,
    ) -> Result<RefundStatus> {
        let items = self.installment_repo.list_items(installment_id).await?;
        let Some(status) = aggregate_refund_status(&items) else {
            return Ok(RefundStatus::Processing);
        };

        let order = self.load_order(order_id).await?;
        let mut extra = order.extra.0.clone();
        if status == RefundStatus::Failed {
            extra.refund_failed_code = Some(INSTALLMENT_REFUND_FAILED.to_string());
        }

        if self
            .order_repo
            .update_refund(order_id, RefundStatus::Processing, status, &extra)
            .await?
        {
            metrics::record_refund(PaymentMethod::Installment.as_str(), status.as_str());
            info!(order_no = %order.no, status = status.as_str(), "分期订单退款已完成");
        }
        Ok(status)
    }

    // ==================== 退款回调 ====================

    /// 应用异步网关的退款结果，返回是否发生了状态迁移
    #[instrument(skip(self, notification), fields(refund_no = %notification.refund_no, success = notification.success))]
    pub async fn complete_refund(&self, notification: &RefundNotification) -> Result<bool> {
        match RefundRef::parse(&notification.refund_no) {
            RefundRef::InstallmentItem {
                refund_no,
                sequence,
            } => {
                let (order_id, item) = self
                    .installment_repo
                    .find_item_by_refund_ref(refund_no, sequence)
                    .await?
                    .ok_or_else(|| OrderError::OrderNotFound(notification.refund_no.clone()))?;

                let next = if notification.success {
                    ItemRefundStatus::Success
                } else {
                    ItemRefundStatus::Failed
                };
                if !self
                    .installment_repo
                    .update_item_refund_status(item.id, &[ItemRefundStatus::Processing], next)
                    .await?
                {
                    info!("重复的分期退款回调");
                    return Ok(false);
                }

                self.sync_installment_refund(order_id, item.installment_id)
                    .await?;
                Ok(true)
            }
            RefundRef::Order(refund_no) => {
                let order = self
                    .order_repo
                    .find_by_refund_no(refund_no)
                    .await?
                    .ok_or_else(|| OrderError::OrderNotFound(refund_no.to_string()))?;

                if order.refund_status != RefundStatus::Processing {
                    info!(order_no = %order.no, status = order.refund_status.as_str(), "重复的退款回调");
                    return Ok(false);
                }

                let mut extra = order.extra.0.clone();
                let next = if notification.success {
                    RefundStatus::Success
                } else {
                    extra.refund_failed_code = notification.failure_code.clone();
                    RefundStatus::Failed
                };

                let changed = self
                    .order_repo
                    .update_refund(order.id, RefundStatus::Processing, next, &extra)
                    .await?;
                if changed {
                    let method = order.payment_method.map(|m| m.as_str()).unwrap_or("unknown");
                    metrics::record_refund(method, next.as_str());
                    info!(order_no = %order.no, status = next.as_str(), "退款回调已处理");
                }
                Ok(changed)
            }
        }
    }

    // ==================== 众筹批量退款 ====================

    /// 退款众筹活动下所有已支付且未退款的订单，单笔失败不影响其他订单
    #[instrument(skip(self))]
    pub async fn refund_crowdfunding_orders(&self, product_id: i64) -> Result<BulkRefundReport> {
        let orders = self
            .order_repo
            .list_paid_pending_refund_by_product(product_id)
            .await?;
        let dispatched = orders.len();

        let results: Vec<(i64, Result<RefundStatus>)> = stream::iter(orders)
            .map(|order| async move {
                let order_id = order.id;
                let extra = order.extra.0.clone();
                (
                    order_id,
                    self.refund_order(order, extra, RefundStatus::Pending).await,
                )
            })
            .buffer_unordered(BULK_REFUND_CONCURRENCY)
            .collect()
            .await;

        let mut failed = Vec::new();
        for (order_id, result) in results {
            if let Err(e) = result {
                error!(order_id, error = %e, "众筹订单退款失败");
                failed.push(order_id);
            }
        }
        failed.sort_unstable();

        info!(
            product_id,
            dispatched,
            failed = failed.len(),
            "众筹失败订单退款已分派"
        );
        Ok(BulkRefundReport { dispatched, failed })
    }
}
