//! 仓储 Trait 定义
//!
//! 服务层通过这些接口读取聚合，便于在单元测试中替换为 mock。
//! 事务内的写操作仍直接调用各仓储的 `*_in_tx` 关联函数。

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{
    CouponCode, Installment, InstallmentItem, ItemRefundStatus, Order, OrderExtra, OrderItem,
    RefundStatus,
};

/// 订单仓储接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrderRepositoryTrait: Send + Sync {
    async fn find_by_id(&self, id: i64) -> Result<Option<Order>>;
    async fn find_by_no(&self, no: &str) -> Result<Option<Order>>;
    async fn find_by_refund_no(&self, refund_no: &str) -> Result<Option<Order>>;
    async fn list_items(&self, order_id: i64) -> Result<Vec<OrderItem>>;
    /// 条件更新退款状态，当前状态不等于 `expected` 时返回 false
    async fn update_refund(
        &self,
        order_id: i64,
        expected: RefundStatus,
        next: RefundStatus,
        extra: &OrderExtra,
    ) -> Result<bool>;
    /// 分配退款单号，已有单号时原样返回
    async fn assign_refund_no(&self, order_id: i64, candidate: &str) -> Result<String>;
    async fn list_paid_pending_refund_by_product(&self, product_id: i64) -> Result<Vec<Order>>;
}

/// 优惠券仓储接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CouponRepositoryTrait: Send + Sync {
    async fn find_by_code(&self, code: &str) -> Result<Option<CouponCode>>;
    async fn user_has_used(&self, user_id: i64, coupon_id: i64) -> Result<bool>;
}

/// 分期仓储接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InstallmentRepositoryTrait: Send + Sync {
    async fn find_by_no(&self, no: &str) -> Result<Option<Installment>>;
    async fn find_active_by_order(&self, order_id: i64) -> Result<Option<Installment>>;
    async fn list_items(&self, installment_id: i64) -> Result<Vec<InstallmentItem>>;
    async fn update_item_refund_status(
        &self,
        item_id: i64,
        expected: &[ItemRefundStatus],
        next: ItemRefundStatus,
    ) -> Result<bool>;
    /// 通过 `{订单退款单号}_{期序号}` 定位还款项，返回 (订单 ID, 还款项)
    async fn find_item_by_refund_ref(
        &self,
        order_refund_no: &str,
        sequence: i32,
    ) -> Result<Option<(i64, InstallmentItem)>>;
}
