//! 支付服务
//!
//! - 发起支付：订单整单支付、分期计划的下一期支付
//! - 支付对账：幂等地把网关确认回调应用到订单或分期还款项
//!
//! ## 对账的幂等性
//!
//! 所有"已支付"迁移都是 `WHERE paid_at IS NULL ... RETURNING` 条件更新，
//! 由数据库裁决并发回调：同一笔支付无论投递多少次，只有一次返回行，
//! 其余均得到 [`ReconcileOutcome::AlreadyApplied`] 且不做任何修改。
//!
//! ## 分期还款项
//!
//! 商户订单号 `{分期流水号}_{期序号}` 走分期路径：
//! - 首期（序号 0）支付：计划 pending -> repaying，同一事务内以 `installment`
//!   方式标记父订单已支付，`payment_no` 为分期流水号
//! - 所有还款项均已支付：计划 repaying -> finished
//! - 非首期先于首期到达时只记录还款项，不会标记父订单

use std::sync::Arc;

use chrono::Utc;
use shop_shared::observability::metrics;
use sqlx::PgPool;
use tracing::{info, instrument, warn};

use crate::error::{OrderError, Result};
use crate::events::OrderPaid;
use crate::gateway::{ChargeRequest, ChargeResponse, GatewayRegistry};
use crate::models::installment::item_trade_no;
use crate::models::{InstallmentStatus, PaymentMethod};
use crate::repository::{
    InstallmentRepository, InstallmentRepositoryTrait, OrderRepository, OrderRepositoryTrait,
};
use crate::service::dto::ReconcileOutcome;

/// 商户订单号指向的支付对象
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentTarget<'a> {
    /// 订单整单支付，值为订单流水号
    Order(&'a str),
    /// 分期还款项
    InstallmentItem { installment_no: &'a str, sequence: i32 },
}

impl<'a> PaymentTarget<'a> {
    /// 解析商户订单号；订单流水号只含数字，带 `_{期序号}` 后缀的为分期还款项
    pub fn parse(out_trade_no: &'a str) -> Self {
        if let Some((installment_no, sequence)) = out_trade_no.rsplit_once('_') {
            if let Ok(sequence) = sequence.parse::<i32>() {
                if !installment_no.is_empty() && sequence >= 0 {
                    return Self::InstallmentItem {
                        installment_no,
                        sequence,
                    };
                }
            }
        }
        Self::Order(out_trade_no)
    }
}

/// 支付服务
pub struct PaymentService<OR, IR>
where
    OR: OrderRepositoryTrait,
    IR: InstallmentRepositoryTrait,
{
    order_repo: Arc<OR>,
    installment_repo: Arc<IR>,
    gateways: Arc<GatewayRegistry>,
    pool: PgPool,
    notify_url: String,
}

impl<OR, IR> PaymentService<OR, IR>
where
    OR: OrderRepositoryTrait,
    IR: InstallmentRepositoryTrait,
{
    pub fn new(
        order_repo: Arc<OR>,
        installment_repo: Arc<IR>,
        gateways: Arc<GatewayRegistry>,
        pool: PgPool,
        notify_url: impl Into<String>,
    ) -> Self {
        Self {
            order_repo,
            installment_repo,
            gateways,
            pool,
            notify_url: notify_url.into(),
        }
    }

    fn notify_url_for(&self, method: PaymentMethod) -> String {
        format!("{}/{}", self.notify_url.trim_end_matches('/'), method)
    }

    // ==================== 发起支付 ====================

    /// 发起订单整单支付
    #[instrument(skip(self))]
    pub async fn pay(
        &self,
        user_id: i64,
        order_id: i64,
        method: PaymentMethod,
    ) -> Result<ChargeResponse> {
        if !method.is_gateway() {
            return Err(OrderError::Validation(format!("不支持的支付方式: {}", method)));
        }

        let order = self
            .order_repo
            .find_by_id(order_id)
            .await?
            .ok_or_else(|| OrderError::OrderNotFound(order_id.to_string()))?;
        order.ensure_owned_by(user_id)?;
        order.ensure_payable()?;

        let gateway = self.gateways.resolve(method)?;
        let response = gateway
            .initiate(ChargeRequest {
                out_trade_no: order.no.clone(),
                total_amount: order.total_amount,
                subject: format!("支付订单：{}", order.no),
                notify_url: self.notify_url_for(method),
            })
            .await?;

        info!(order_no = %order.no, amount = order.total_amount, "已发起订单支付");
        Ok(response)
    }

    /// 发起分期计划下一期的支付
    #[instrument(skip(self))]
    pub async fn pay_installment(
        &self,
        user_id: i64,
        installment_no: &str,
        method: PaymentMethod,
    ) -> Result<ChargeResponse> {
        if !method.is_gateway() {
            return Err(OrderError::Validation(format!("不支持的支付方式: {}", method)));
        }

        let installment = self
            .installment_repo
            .find_by_no(installment_no)
            .await?
            .ok_or_else(|| OrderError::InstallmentNotFound(installment_no.to_string()))?;
        if installment.user_id != user_id {
            return Err(OrderError::NotOwner(installment.order_id));
        }

        let order = self
            .order_repo
            .find_by_id(installment.order_id)
            .await?
            .ok_or_else(|| OrderError::OrderNotFound(installment.order_id.to_string()))?;
        if order.closed {
            return Err(OrderError::invalid_state(order.id, "订单已关闭"));
        }
        if installment.status == InstallmentStatus::Finished {
            return Err(OrderError::invalid_state(order.id, "该分期订单已结清"));
        }
        if installment.status == InstallmentStatus::Pending && order.is_paid() {
            return Err(OrderError::invalid_state(order.id, "订单已支付"));
        }

        let items = self.installment_repo.list_items(installment.id).await?;
        let next = items
            .iter()
            .find(|item| !item.is_paid())
            .ok_or_else(|| OrderError::invalid_state(order.id, "该分期订单已结清"))?;

        let gateway = self.gateways.resolve(method)?;
        let out_trade_no = item_trade_no(&installment.no, next.sequence);
        let response = gateway
            .initiate(ChargeRequest {
                out_trade_no: out_trade_no.clone(),
                total_amount: next.total(),
                subject: format!("支付分期订单：{} 第 {} 期", installment.no, next.sequence + 1),
                notify_url: self.notify_url_for(method),
            })
            .await?;

        info!(out_trade_no = %out_trade_no, amount = next.total(), "已发起分期还款");
        Ok(response)
    }

    // ==================== 支付对账 ====================

    /// 应用网关的支付确认
    #[instrument(skip(self), fields(method = %method))]
    pub async fn reconcile(
        &self,
        out_trade_no: &str,
        method: PaymentMethod,
        trade_no: &str,
    ) -> Result<ReconcileOutcome> {
        let result = match PaymentTarget::parse(out_trade_no) {
            PaymentTarget::Order(no) => self.reconcile_order(no, method, trade_no).await,
            PaymentTarget::InstallmentItem {
                installment_no,
                sequence,
            } => {
                self.reconcile_installment_item(installment_no, sequence, method, trade_no)
                    .await
            }
        };

        match &result {
            Ok(outcome) => metrics::record_payment(method.as_str(), outcome.as_str()),
            Err(_) => metrics::record_payment(method.as_str(), "failed"),
        }
        result
    }

    async fn reconcile_order(
        &self,
        order_no: &str,
        method: PaymentMethod,
        trade_no: &str,
    ) -> Result<ReconcileOutcome> {
        let order = self
            .order_repo
            .find_by_no(order_no)
            .await?
            .ok_or_else(|| OrderError::OrderNotFound(order_no.to_string()))?;

        if order.is_paid() {
            info!(order_no, "重复的支付回调，订单已支付");
            return Ok(ReconcileOutcome::AlreadyApplied);
        }

        let mut tx = self.pool.begin().await?;
        let Some(paid) =
            OrderRepository::mark_paid_in_tx(&mut tx, order.id, method, trade_no, Utc::now())
                .await?
        else {
            info!(order_no, "并发回调已完成支付标记");
            return Ok(ReconcileOutcome::AlreadyApplied);
        };
        tx.commit().await?;

        if paid.closed {
            warn!(
                order_no,
                trade_no, "已关闭的订单收到支付，已记录支付信息，需人工处理"
            );
        }
        info!(order_no, trade_no, amount = paid.total_amount, "订单支付成功");

        Ok(ReconcileOutcome::Applied(OrderPaid::from_order(
            &paid, method, trade_no,
        )))
    }

    async fn reconcile_installment_item(
        &self,
        installment_no: &str,
        sequence: i32,
        method: PaymentMethod,
        trade_no: &str,
    ) -> Result<ReconcileOutcome> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        // 1. 锁定计划，同一计划的回调串行处理
        let installment = InstallmentRepository::find_by_no_for_update_in_tx(&mut tx, installment_no)
            .await?
            .ok_or_else(|| OrderError::InstallmentNotFound(installment_no.to_string()))?;

        // 2. 标记还款项
        let marked = InstallmentRepository::mark_item_paid_in_tx(
            &mut tx,
            installment.id,
            sequence,
            method,
            trade_no,
            now,
        )
        .await?;
        if marked.is_none() {
            if !InstallmentRepository::item_exists_in_tx(&mut tx, installment.id, sequence).await? {
                return Err(OrderError::InstallmentNotFound(item_trade_no(
                    installment_no,
                    sequence,
                )));
            }
            info!(installment_no, sequence, "重复的分期还款回调");
            return Ok(ReconcileOutcome::AlreadyApplied);
        }

        // 3. 首期支付：计划进入还款中，父订单以分期方式完成支付
        let mut paid_event = None;
        if sequence == 0 {
            InstallmentRepository::advance_status_in_tx(
                &mut tx,
                installment.id,
                InstallmentStatus::Pending,
                InstallmentStatus::Repaying,
            )
            .await?;

            match OrderRepository::mark_paid_in_tx(
                &mut tx,
                installment.order_id,
                PaymentMethod::Installment,
                &installment.no,
                now,
            )
            .await?
            {
                Some(order) => {
                    if order.closed {
                        warn!(order_id = order.id, "已关闭的订单收到分期首期支付，需人工处理");
                    }
                    paid_event = Some(OrderPaid::from_order(
                        &order,
                        PaymentMethod::Installment,
                        &installment.no,
                    ));
                }
                None => warn!(
                    order_id = installment.order_id,
                    "订单已通过其他方式支付，分期首期只记录在还款项"
                ),
            }
        }

        // 4. 全部还款项已支付则结清
        let unpaid = InstallmentRepository::count_unpaid_items_in_tx(&mut tx, installment.id).await?;
        let finished = unpaid == 0
            && InstallmentRepository::advance_status_in_tx(
                &mut tx,
                installment.id,
                InstallmentStatus::Repaying,
                InstallmentStatus::Finished,
            )
            .await?;

        tx.commit().await?;

        info!(installment_no, sequence, unpaid, finished, "分期还款成功");

        Ok(match paid_event {
            Some(event) => ReconcileOutcome::Applied(event),
            None => ReconcileOutcome::InstallmentItemPaid {
                installment_id: installment.id,
                sequence,
                finished,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{MockPaymentGateway, PaymentGateway};
    use crate::models::order::tests::sample_order;
    use crate::models::{Installment, InstallmentItem, ItemRefundStatus};
    use crate::repository::{MockInstallmentRepositoryTrait, MockOrderRepositoryTrait};
    use chrono::Duration;

    fn registry_with(gateway: MockPaymentGateway) -> Arc<GatewayRegistry> {
        let mut registry = GatewayRegistry::new();
        registry.register(Arc::new(gateway) as Arc<dyn PaymentGateway>);
        Arc::new(registry)
    }

    fn alipay_gateway() -> MockPaymentGateway {
        let mut gateway = MockPaymentGateway::new();
        gateway.expect_method().return_const(PaymentMethod::Alipay);
        gateway
    }

    fn service(
        order_repo: MockOrderRepositoryTrait,
        installment_repo: MockInstallmentRepositoryTrait,
        gateway: MockPaymentGateway,
    ) -> PaymentService<MockOrderRepositoryTrait, MockInstallmentRepositoryTrait> {
        let pool = PgPool::connect_lazy("postgres://localhost/test").unwrap();
        PaymentService::new(
            Arc::new(order_repo),
            Arc::new(installment_repo),
            registry_with(gateway),
            pool,
            "https://shop.example.com/payment/notify/",
        )
    }

    fn sample_installment(status: InstallmentStatus) -> Installment {
        let now = Utc::now();
        Installment {
            id: 11,
            no: "INS20260101".to_string(),
            user_id: 7,
            order_id: 1,
            base_amount: 300_00,
            count: 3,
            fee_rate: 150,
            status,
            created_at: now,
            updated_at: now,
        }
    }

    fn item(sequence: i32, paid: bool) -> InstallmentItem {
        let now = Utc::now();
        InstallmentItem {
            id: 100 + sequence as i64,
            installment_id: 11,
            sequence,
            base: 100_00,
            fee: 1_50,
            due_date: now + Duration::days(30 * sequence as i64),
            paid_at: paid.then_some(now),
            payment_method: paid.then_some(PaymentMethod::Alipay),
            payment_no: paid.then(|| format!("T{}", sequence)),
            refund_status: ItemRefundStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_payment_target_parse() {
        assert_eq!(
            PaymentTarget::parse("20260101120000123456"),
            PaymentTarget::Order("20260101120000123456")
        );
        assert_eq!(
            PaymentTarget::parse("INS20260101_2"),
            PaymentTarget::InstallmentItem {
                installment_no: "INS20260101",
                sequence: 2
            }
        );
        assert_eq!(PaymentTarget::parse("abc_x"), PaymentTarget::Order("abc_x"));
        assert_eq!(PaymentTarget::parse("_1"), PaymentTarget::Order("_1"));
    }

    #[tokio::test]
    async fn test_pay_initiates_gateway_charge() {
        let mut order_repo = MockOrderRepositoryTrait::new();
        order_repo
            .expect_find_by_id()
            .returning(|_| Ok(Some(sample_order())));

        let mut gateway = alipay_gateway();
        gateway
            .expect_initiate()
            .withf(|req| {
                req.out_trade_no == "20260101120000000001"
                    && req.total_amount == 100_00
                    && req.notify_url == "https://shop.example.com/payment/notify/alipay"
            })
            .times(1)
            .returning(|req| {
                Ok(ChargeResponse {
                    method: PaymentMethod::Alipay,
                    out_trade_no: req.out_trade_no,
                    payload: serde_json::json!({"payUrl": "https://pay.example.com"}),
                })
            });

        let svc = service(order_repo, MockInstallmentRepositoryTrait::new(), gateway);
        let response = svc.pay(7, 1, PaymentMethod::Alipay).await.unwrap();
        assert_eq!(response.out_trade_no, "20260101120000000001");
    }

    #[tokio::test]
    async fn test_pay_rejects_other_users_order() {
        let mut order_repo = MockOrderRepositoryTrait::new();
        order_repo
            .expect_find_by_id()
            .returning(|_| Ok(Some(sample_order())));

        let svc = service(order_repo, MockInstallmentRepositoryTrait::new(), alipay_gateway());
        let err = svc.pay(8, 1, PaymentMethod::Alipay).await.unwrap_err();
        assert!(matches!(err, OrderError::NotOwner(1)));
    }

    #[tokio::test]
    async fn test_pay_rejects_paid_or_closed_order() {
        let mut order_repo = MockOrderRepositoryTrait::new();
        order_repo.expect_find_by_id().returning(|id| {
            let mut order = sample_order();
            if id == 1 {
                order.paid_at = Some(Utc::now());
            } else {
                order.closed = true;
            }
            Ok(Some(order))
        });

        let svc = service(order_repo, MockInstallmentRepositoryTrait::new(), alipay_gateway());
        for order_id in [1, 2] {
            let err = svc.pay(7, order_id, PaymentMethod::Alipay).await.unwrap_err();
            assert_eq!(err.error_code(), "INVALID_ORDER_STATE");
        }
    }

    #[tokio::test]
    async fn test_pay_rejects_installment_method() {
        let svc = service(
            MockOrderRepositoryTrait::new(),
            MockInstallmentRepositoryTrait::new(),
            alipay_gateway(),
        );
        let err = svc.pay(7, 1, PaymentMethod::Installment).await.unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_pay_installment_charges_next_unpaid_item() {
        let mut installment_repo = MockInstallmentRepositoryTrait::new();
        installment_repo
            .expect_find_by_no()
            .returning(|_| Ok(Some(sample_installment(InstallmentStatus::Repaying))));
        installment_repo
            .expect_list_items()
            .returning(|_| Ok(vec![item(0, true), item(1, false), item(2, false)]));

        let mut order_repo = MockOrderRepositoryTrait::new();
        order_repo.expect_find_by_id().returning(|_| {
            let mut order = sample_order();
            order.paid_at = Some(Utc::now());
            Ok(Some(order))
        });

        let mut gateway = alipay_gateway();
        gateway
            .expect_initiate()
            .withf(|req| req.out_trade_no == "INS20260101_1" && req.total_amount == 101_50)
            .times(1)
            .returning(|req| {
                Ok(ChargeResponse {
                    method: PaymentMethod::Alipay,
                    out_trade_no: req.out_trade_no,
                    payload: serde_json::Value::Null,
                })
            });

        let svc = service(order_repo, installment_repo, gateway);
        let response = svc
            .pay_installment(7, "INS20260101", PaymentMethod::Alipay)
            .await
            .unwrap();
        assert_eq!(response.out_trade_no, "INS20260101_1");
    }

    #[tokio::test]
    async fn test_pay_installment_rejects_finished_plan() {
        let mut installment_repo = MockInstallmentRepositoryTrait::new();
        installment_repo
            .expect_find_by_no()
            .returning(|_| Ok(Some(sample_installment(InstallmentStatus::Finished))));

        let mut order_repo = MockOrderRepositoryTrait::new();
        order_repo
            .expect_find_by_id()
            .returning(|_| Ok(Some(sample_order())));

        let svc = service(order_repo, installment_repo, alipay_gateway());
        let err = svc
            .pay_installment(7, "INS20260101", PaymentMethod::Alipay)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "INVALID_ORDER_STATE");
    }

    #[tokio::test]
    async fn test_pay_installment_rejects_closed_order() {
        let mut installment_repo = MockInstallmentRepositoryTrait::new();
        installment_repo
            .expect_find_by_no()
            .returning(|_| Ok(Some(sample_installment(InstallmentStatus::Pending))));

        let mut order_repo = MockOrderRepositoryTrait::new();
        order_repo.expect_find_by_id().returning(|_| {
            let mut order = sample_order();
            order.closed = true;
            Ok(Some(order))
        });

        let svc = service(order_repo, installment_repo, alipay_gateway());
        let err = svc
            .pay_installment(7, "INS20260101", PaymentMethod::Wechat)
            .await
            .unwrap_err();
        // wechat 未注册前先校验订单状态
        assert_eq!(err.error_code(), "INVALID_ORDER_STATE");
    }

    #[tokio::test]
    async fn test_reconcile_unknown_order() {
        let mut order_repo = MockOrderRepositoryTrait::new();
        order_repo.expect_find_by_no().returning(|_| Ok(None));

        let svc = service(order_repo, MockInstallmentRepositoryTrait::new(), alipay_gateway());
        let err = svc
            .reconcile("20260101120000999999", PaymentMethod::Alipay, "T1")
            .await
            .unwrap_err();
        assert!(matches!(err, OrderError::OrderNotFound(_)));
    }

    #[tokio::test]
    async fn test_reconcile_already_paid_order_is_noop() {
        let mut order_repo = MockOrderRepositoryTrait::new();
        order_repo.expect_find_by_no().returning(|_| {
            let mut order = sample_order();
            order.paid_at = Some(Utc::now());
            Ok(Some(order))
        });

        let svc = service(order_repo, MockInstallmentRepositoryTrait::new(), alipay_gateway());
        let outcome = svc
            .reconcile("20260101120000000001", PaymentMethod::Alipay, "T1")
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::AlreadyApplied);
    }
}
