//! 订单领域事件
//!
//! 进程内事件总线：对账与评价在事务提交后发布 [`OrderEvent`]，
//! [`EventListener`] 在独立任务中消费，负责众筹进度统计与通知交接。
//! 发布方不等待消费结果，消费失败只记录日志。

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::models::{Order, OrderType, PaymentMethod};
use crate::repository::{OrderRepository, ProductRepository};

/// 订单已支付
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderPaid {
    pub order_id: i64,
    pub order_no: String,
    pub user_id: i64,
    pub order_type: OrderType,
    pub payment_method: PaymentMethod,
    pub payment_no: String,
    pub total_amount: i64,
    pub paid_at: DateTime<Utc>,
}

impl OrderPaid {
    /// 从刚完成支付标记的订单构造事件
    pub fn from_order(order: &Order, payment_method: PaymentMethod, payment_no: &str) -> Self {
        Self {
            order_id: order.id,
            order_no: order.no.clone(),
            user_id: order.user_id,
            order_type: order.order_type,
            payment_method,
            payment_no: payment_no.to_string(),
            total_amount: order.total_amount,
            paid_at: order.paid_at.unwrap_or_else(Utc::now),
        }
    }
}

/// 订单已评价
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderReviewed {
    pub order_id: i64,
    pub user_id: i64,
    pub product_ids: Vec<i64>,
    pub reviewed_at: DateTime<Utc>,
}

/// 订单事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderEvent {
    Paid(OrderPaid),
    Reviewed(OrderReviewed),
}

impl OrderEvent {
    pub fn order_id(&self) -> i64 {
        match self {
            Self::Paid(e) => e.order_id,
            Self::Reviewed(e) => e.order_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Paid(_) => "order_paid",
            Self::Reviewed(_) => "order_reviewed",
        }
    }
}

/// 事件发布端，可廉价克隆
#[derive(Clone)]
pub struct EventBus {
    sender: mpsc::UnboundedSender<OrderEvent>,
}

impl EventBus {
    /// 创建总线与对应的接收端
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<OrderEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    /// 发布事件；接收端已关闭时只记录告警
    pub fn publish(&self, event: OrderEvent) {
        let order_id = event.order_id();
        let kind = event.kind();
        if self.sender.send(event).is_err() {
            warn!(order_id, kind, "事件总线已关闭，事件被丢弃");
        }
    }
}

/// 事件消费者
pub struct EventListener {
    receiver: mpsc::UnboundedReceiver<OrderEvent>,
    order_repo: Arc<OrderRepository>,
    product_repo: Arc<ProductRepository>,
}

impl EventListener {
    pub fn new(
        receiver: mpsc::UnboundedReceiver<OrderEvent>,
        order_repo: Arc<OrderRepository>,
        product_repo: Arc<ProductRepository>,
    ) -> Self {
        Self {
            receiver,
            order_repo,
            product_repo,
        }
    }

    /// 消费循环，所有发布端释放后退出
    pub async fn run(mut self) {
        info!("订单事件消费者已启动");

        while let Some(event) = self.receiver.recv().await {
            let order_id = event.order_id();
            let kind = event.kind();
            if let Err(e) = self.handle(event).await {
                error!(order_id, kind, error = %e, "处理订单事件失败");
            }
        }

        info!("订单事件消费者已停止");
    }

    async fn handle(&self, event: OrderEvent) -> Result<()> {
        match event {
            OrderEvent::Paid(paid) => {
                if paid.order_type == OrderType::Crowdfunding {
                    self.refresh_crowdfunding(paid.order_id).await?;
                }
                info!(
                    order_id = paid.order_id,
                    user_id = paid.user_id,
                    payment_method = %paid.payment_method,
                    "订单支付通知已交付"
                );
            }
            OrderEvent::Reviewed(reviewed) => {
                info!(
                    order_id = reviewed.order_id,
                    products = ?reviewed.product_ids,
                    "订单评价通知已交付"
                );
            }
        }
        Ok(())
    }

    /// 重算订单所属众筹活动的已筹金额与参与人数
    async fn refresh_crowdfunding(&self, order_id: i64) -> Result<()> {
        let items = self.order_repo.list_items(order_id).await?;
        let product_ids: BTreeSet<i64> = items.iter().map(|i| i.product_id).collect();

        for product_id in product_ids {
            if let Some((total_amount, user_count)) = self
                .product_repo
                .refresh_crowdfunding_progress(product_id)
                .await?
            {
                info!(product_id, total_amount, user_count, "众筹进度已更新");
            }
        }
        Ok(())
    }
}
