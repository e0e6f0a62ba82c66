//! 支付网关回调处理
//!
//! 回调投递语义为至少一次：网关在收到成功应答前会重复投递。
//! 处理流程：验签 -> 对账（数据库瞬时故障按退避策略重试）-> 提交后发布事件 -> 应答。
//!
//! 只有在事务提交之后才应答成功；验签失败或对账失败应答失败，由网关重投。

use std::sync::Arc;

use shop_shared::observability::metrics;
use shop_shared::retry::{RetryPolicy, retry_with_policy};
use tracing::{error, info, instrument, warn};

use crate::error::{OrderError, Result};
use crate::events::{EventBus, OrderEvent};
use crate::gateway::{GatewayRegistry, WebhookAck};
use crate::models::PaymentMethod;
use crate::repository::{InstallmentRepositoryTrait, OrderRepositoryTrait};
use crate::service::{PaymentService, RefundService};

/// 回调应答
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookResponse {
    pub ack: WebhookAck,
    /// 按网关协议格式化的应答报文
    pub body: String,
}

/// 支付与退款回调处理器
pub struct WebhookHandler<OR, IR>
where
    OR: OrderRepositoryTrait,
    IR: InstallmentRepositoryTrait,
{
    payments: Arc<PaymentService<OR, IR>>,
    refunds: Arc<RefundService<OR, IR>>,
    gateways: Arc<GatewayRegistry>,
    events: EventBus,
    retry_policy: RetryPolicy,
}

impl<OR, IR> WebhookHandler<OR, IR>
where
    OR: OrderRepositoryTrait,
    IR: InstallmentRepositoryTrait,
{
    pub fn new(
        payments: Arc<PaymentService<OR, IR>>,
        refunds: Arc<RefundService<OR, IR>>,
        gateways: Arc<GatewayRegistry>,
        events: EventBus,
    ) -> Self {
        Self {
            payments,
            refunds,
            gateways,
            events,
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// 处理支付回调
    ///
    /// 未注册的支付方式无法生成应答报文，返回错误
    #[instrument(skip(self, body), fields(method = %method))]
    pub async fn payment_notify(&self, method: PaymentMethod, body: &str) -> Result<WebhookResponse> {
        let gateway = self.gateways.resolve(method)?;

        let ack = match gateway.verify_payment(body) {
            Err(e) => {
                warn!(error = %e, "支付回调验签失败");
                WebhookAck::Fail
            }
            Ok(notification) if !notification.trade_status.is_paid() => {
                info!(
                    out_trade_no = %notification.out_trade_no,
                    trade_status = ?notification.trade_status,
                    "非支付成功状态的回调，忽略"
                );
                WebhookAck::Success
            }
            Ok(notification) => {
                let outcome = retry_with_policy(
                    &self.retry_policy,
                    "reconcile_payment",
                    OrderError::is_retryable,
                    || {
                        self.payments.reconcile(
                            &notification.out_trade_no,
                            method,
                            &notification.trade_no,
                        )
                    },
                )
                .await;

                match outcome {
                    Ok(outcome) => {
                        if let Some(paid) = outcome.paid_event() {
                            self.events.publish(OrderEvent::Paid(paid.clone()));
                        }
                        WebhookAck::Success
                    }
                    Err(e) => {
                        error!(
                            out_trade_no = %notification.out_trade_no,
                            error = %e,
                            code = e.error_code(),
                            "支付回调对账失败"
                        );
                        WebhookAck::Fail
                    }
                }
            }
        };

        metrics::record_webhook("payment", method.as_str(), ack.as_str());
        Ok(WebhookResponse {
            ack,
            body: gateway.ack_body(ack),
        })
    }

    /// 处理退款回调
    #[instrument(skip(self, body), fields(method = %method))]
    pub async fn refund_notify(&self, method: PaymentMethod, body: &str) -> Result<WebhookResponse> {
        let gateway = self.gateways.resolve(method)?;

        let ack = match gateway.verify_refund(body) {
            Err(e) => {
                warn!(error = %e, "退款回调验签失败");
                WebhookAck::Fail
            }
            Ok(notification) => {
                let result = retry_with_policy(
                    &self.retry_policy,
                    "complete_refund",
                    OrderError::is_retryable,
                    || self.refunds.complete_refund(&notification),
                )
                .await;

                match result {
                    Ok(_) => WebhookAck::Success,
                    Err(e) => {
                        error!(
                            refund_no = %notification.refund_no,
                            error = %e,
                            code = e.error_code(),
                            "退款回调处理失败"
                        );
                        WebhookAck::Fail
                    }
                }
            }
        };

        metrics::record_webhook("refund", method.as_str(), ack.as_str());
        Ok(WebhookResponse {
            ack,
            body: gateway.ack_body(ack),
        })
    }
}
