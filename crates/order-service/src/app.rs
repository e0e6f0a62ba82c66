//! 服务装配
//!
//! 按配置创建仓储、支付网关、各业务服务与后台任务，
//! 供进程入口与上层接入（HTTP/RPC 适配层）共用。

use std::sync::Arc;

use shop_shared::config::AppConfig;
use shop_shared::delay_queue::DelayQueue;
use sqlx::PgPool;
use tracing::info;

use crate::error::Result;
use crate::events::{EventBus, EventListener};
use crate::gateway::GatewayRegistry;
use crate::repository::{CouponRepository, InstallmentRepository, OrderRepository, ProductRepository};
use crate::service::{
    FulfillmentService, InstallmentService, OrderService, PaymentService, RefundService,
};
use crate::webhook::WebhookHandler;
use crate::worker::{CrowdfundingWorker, ExpiryWorker};

pub type Payments = PaymentService<OrderRepository, InstallmentRepository>;
pub type Refunds = RefundService<OrderRepository, InstallmentRepository>;
pub type Webhooks = WebhookHandler<OrderRepository, InstallmentRepository>;

/// 订单引擎的全部服务
pub struct OrderEngine {
    pub orders: Arc<OrderService<CouponRepository>>,
    pub payments: Arc<Payments>,
    pub refunds: Arc<Refunds>,
    pub installments: Arc<InstallmentService<OrderRepository>>,
    pub fulfillment: Arc<FulfillmentService>,
    pub webhooks: Arc<Webhooks>,
    pub events: EventBus,
    pool: PgPool,
    queue: Option<DelayQueue>,
    order_repo: Arc<OrderRepository>,
    product_repo: Arc<ProductRepository>,
}

impl OrderEngine {
    /// 装配所有服务
    ///
    /// 返回的 [`EventListener`] 需要由调用方在独立任务中运行
    pub fn build(
        config: &AppConfig,
        pool: PgPool,
        gateways: GatewayRegistry,
        queue: Option<DelayQueue>,
    ) -> (Self, EventListener) {
        let gateways = Arc::new(gateways);

        let order_repo = Arc::new(OrderRepository::new(pool.clone()));
        let product_repo = Arc::new(ProductRepository::new(pool.clone()));
        let coupon_repo = Arc::new(CouponRepository::new(pool.clone()));
        let installment_repo = Arc::new(InstallmentRepository::new(pool.clone()));

        let (events, receiver) = EventBus::channel();
        let listener = EventListener::new(receiver, order_repo.clone(), product_repo.clone());

        let mut orders = OrderService::new(coupon_repo, pool.clone(), config.order.clone());
        if let Some(queue) = &queue {
            orders = orders.with_expiry_queue(queue.clone());
        }

        let payments = Arc::new(PaymentService::new(
            order_repo.clone(),
            installment_repo.clone(),
            gateways.clone(),
            pool.clone(),
            config.gateways.payment_notify_url.clone(),
        ));
        let refunds = Arc::new(RefundService::new(
            order_repo.clone(),
            installment_repo,
            gateways.clone(),
            config.gateways.refund_notify_url.clone(),
        ));
        let webhooks = Arc::new(WebhookHandler::new(
            payments.clone(),
            refunds.clone(),
            gateways,
            events.clone(),
        ));
        let installments = Arc::new(InstallmentService::new(
            order_repo.clone(),
            pool.clone(),
            config.order.clone(),
        ));
        let fulfillment = Arc::new(FulfillmentService::new(
            order_repo.clone(),
            product_repo.clone(),
            pool.clone(),
            events.clone(),
        ));

        info!("订单引擎服务装配完成");

        let engine = Self {
            orders: Arc::new(orders),
            payments,
            refunds,
            installments,
            fulfillment,
            webhooks,
            events,
            pool,
            queue,
            order_repo,
            product_repo,
        };
        (engine, listener)
    }

    /// 订单过期关闭 Worker
    pub fn expiry_worker(&self, config: &AppConfig) -> ExpiryWorker {
        ExpiryWorker::new(self.pool.clone(), self.queue.clone(), &config.workers)
    }

    /// 众筹结算 Worker，cron 表达式无效时返回错误
    pub fn crowdfunding_worker(
        &self,
        config: &AppConfig,
    ) -> Result<CrowdfundingWorker<OrderRepository, InstallmentRepository>> {
        CrowdfundingWorker::new(
            self.pool.clone(),
            self.refunds.clone(),
            &config.workers.settlement_cron,
            config.workers.settlement_batch_size,
        )
    }

    pub fn order_repo(&self) -> &Arc<OrderRepository> {
        &self.order_repo
    }

    pub fn product_repo(&self) -> &Arc<ProductRepository> {
        &self.product_repo
    }
}
