//! 订单仓储
//!
//! 订单与订单项的数据访问。所有状态迁移都使用带前置条件的 UPDATE，
//! 以 `rows_affected` / `RETURNING` 判断是否真正发生迁移，保证并发下只生效一次。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool};

use super::traits::OrderRepositoryTrait;
use crate::error::Result;
use crate::models::{
    AddressSnapshot, NewOrderItem, Order, OrderExtra, OrderItem, OrderType, PaymentMethod,
    RefundStatus, ShipData, ShipStatus,
};

/// 待写入的订单
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub no: String,
    pub user_id: i64,
    pub address: AddressSnapshot,
    pub remark: Option<String>,
    pub total_amount: i64,
    pub order_type: OrderType,
    pub coupon_code_id: Option<i64>,
    pub expires_at: DateTime<Utc>,
}

/// 订单仓储
pub struct OrderRepository {
    pool: PgPool,
}

impl OrderRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    // ==================== 查询 ====================

    pub async fn find_by_id(&self, id: i64) -> Result<Option<Order>> {
        let order = sqlx::query_as::<_, Order>("SELECT * FROM orders WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(order)
    }

    /// 按订单流水号查询（支付回调使用）
    pub async fn find_by_no(&self, no: &str) -> Result<Option<Order>> {
        let order = sqlx::query_as::<_, Order>("SELECT * FROM orders WHERE no = $1")
            .bind(no)
            .fetch_optional(&self.pool)
            .await?;

        Ok(order)
    }

    /// 按退款单号查询（异步退款回调使用）
    pub async fn find_by_refund_no(&self, refund_no: &str) -> Result<Option<Order>> {
        let order = sqlx::query_as::<_, Order>("SELECT * FROM orders WHERE refund_no = $1")
            .bind(refund_no)
            .fetch_optional(&self.pool)
            .await?;

        Ok(order)
    }

    /// 在事务中锁定订单
    pub async fn find_by_id_for_update_in_tx(
        tx: &mut PgConnection,
        id: i64,
    ) -> Result<Option<Order>> {
        let order = sqlx::query_as::<_, Order>("SELECT * FROM orders WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(tx)
            .await?;

        Ok(order)
    }

    pub async fn list_items(&self, order_id: i64) -> Result<Vec<OrderItem>> {
        let mut conn = self.pool.acquire().await?;
        Self::list_items_in_tx(&mut conn, order_id).await
    }

    pub async fn list_items_in_tx(tx: &mut PgConnection, order_id: i64) -> Result<Vec<OrderItem>> {
        let items = sqlx::query_as::<_, OrderItem>(
            r#"
            SELECT id, order_id, product_id, product_sku_id, amount, price,
                   rating, review, reviewed_at
            FROM order_items
            WHERE order_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(order_id)
        .fetch_all(tx)
        .await?;

        Ok(items)
    }

    /// 订单号是否已存在
    pub async fn no_exists_in_tx(tx: &mut PgConnection, no: &str) -> Result<bool> {
        let exists: (bool,) = sqlx::query_as("SELECT EXISTS(SELECT 1 FROM orders WHERE no = $1)")
            .bind(no)
            .fetch_one(tx)
            .await?;

        Ok(exists.0)
    }

    // ==================== 创建 ====================

    /// 在事务中写入订单
    ///
    /// 订单号冲突时返回 None，由调用方换号重试
    pub async fn insert_in_tx(tx: &mut PgConnection, order: &NewOrder) -> Result<Option<Order>> {
        let created = sqlx::query_as::<_, Order>(
            r#"
            INSERT INTO orders (no, user_id, address, remark, total_amount, type,
                                coupon_code_id, expires_at, extra)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, '{}'::jsonb)
            ON CONFLICT (no) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(&order.no)
        .bind(order.user_id)
        .bind(Json(&order.address))
        .bind(&order.remark)
        .bind(order.total_amount)
        .bind(order.order_type)
        .bind(order.coupon_code_id)
        .bind(order.expires_at)
        .fetch_optional(tx)
        .await?;

        Ok(created)
    }

    pub async fn insert_item_in_tx(
        tx: &mut PgConnection,
        order_id: i64,
        item: &NewOrderItem,
    ) -> Result<i64> {
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO order_items (order_id, product_id, product_sku_id, amount, price)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(order_id)
        .bind(item.product_id)
        .bind(item.product_sku_id)
        .bind(item.amount)
        .bind(item.price)
        .fetch_one(tx)
        .await?;

        Ok(id)
    }

    // ==================== 支付 ====================

    /// 标记订单已支付
    ///
    /// 仅当 `paid_at IS NULL` 时生效；重复回调返回 None
    pub async fn mark_paid_in_tx(
        tx: &mut PgConnection,
        order_id: i64,
        method: PaymentMethod,
        payment_no: &str,
        paid_at: DateTime<Utc>,
    ) -> Result<Option<Order>> {
        let order = sqlx::query_as::<_, Order>(
            r#"
            UPDATE orders
            SET paid_at = $2, payment_method = $3, payment_no = $4, updated_at = NOW()
            WHERE id = $1 AND paid_at IS NULL
            RETURNING *
            "#,
        )
        .bind(order_id)
        .bind(paid_at)
        .bind(method)
        .bind(payment_no)
        .fetch_optional(tx)
        .await?;

        Ok(order)
    }

    // ==================== 过期关闭 ====================

    /// 关闭未支付订单；已支付或已关闭的订单返回 None
    pub async fn close_if_unpaid_in_tx(tx: &mut PgConnection, order_id: i64) -> Result<Option<Order>> {
        let order = sqlx::query_as::<_, Order>(
            r#"
            UPDATE orders
            SET closed = true, updated_at = NOW()
            WHERE id = $1 AND paid_at IS NULL AND closed = false
            RETURNING *
            "#,
        )
        .bind(order_id)
        .fetch_optional(tx)
        .await?;

        Ok(order)
    }

    /// 锁定一批已过期的未支付订单 ID（多实例下跳过已被锁定的行）
    pub async fn lock_expired_unpaid_in_tx(
        tx: &mut PgConnection,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<i64>> {
        let ids: Vec<(i64,)> = sqlx::query_as(
            r#"
            SELECT id FROM orders
            WHERE paid_at IS NULL
              AND closed = false
              AND expires_at IS NOT NULL
              AND expires_at <= $1
            ORDER BY expires_at ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(tx)
        .await?;

        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    // ==================== 退款 ====================

    /// 条件更新退款状态与扩展数据
    ///
    /// 只有当前状态等于 `expected` 时才会更新，返回是否生效
    pub async fn update_refund_in_tx(
        tx: &mut PgConnection,
        order_id: i64,
        expected: RefundStatus,
        next: RefundStatus,
        extra: &OrderExtra,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE orders
            SET refund_status = $3, extra = $4, updated_at = NOW()
            WHERE id = $1 AND refund_status = $2
            "#,
        )
        .bind(order_id)
        .bind(expected)
        .bind(next)
        .bind(Json(extra))
        .execute(tx)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn update_refund(
        &self,
        order_id: i64,
        expected: RefundStatus,
        next: RefundStatus,
        extra: &OrderExtra,
    ) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        Self::update_refund_in_tx(&mut conn, order_id, expected, next, extra).await
    }

    /// 分配退款单号；已分配过则保留原单号，保证重试时网关侧幂等
    pub async fn assign_refund_no_in_tx(
        tx: &mut PgConnection,
        order_id: i64,
        candidate: &str,
    ) -> Result<String> {
        let (refund_no,): (String,) = sqlx::query_as(
            r#"
            UPDATE orders
            SET refund_no = COALESCE(refund_no, $2), updated_at = NOW()
            WHERE id = $1
            RETURNING refund_no
            "#,
        )
        .bind(order_id)
        .bind(candidate)
        .fetch_one(tx)
        .await?;

        Ok(refund_no)
    }

    pub async fn assign_refund_no(&self, order_id: i64, candidate: &str) -> Result<String> {
        let mut conn = self.pool.acquire().await?;
        Self::assign_refund_no_in_tx(&mut conn, order_id, candidate).await
    }

    /// 众筹失败后待退款的已支付订单
    pub async fn list_paid_pending_refund_by_product(&self, product_id: i64) -> Result<Vec<Order>> {
        let orders = sqlx::query_as::<_, Order>(
            r#"
            SELECT o.* FROM orders o
            WHERE o.type = 'crowdfunding'
              AND o.paid_at IS NOT NULL
              AND o.refund_status = 'pending'
              AND EXISTS (
                  SELECT 1 FROM order_items i
                  WHERE i.order_id = o.id AND i.product_id = $1
              )
            ORDER BY o.id ASC
            "#,
        )
        .bind(product_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(orders)
    }

    // ==================== 物流与评价 ====================

    /// 发货：仅对未发货的已支付订单生效
    pub async fn mark_shipped(&self, order_id: i64, ship_data: &ShipData) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE orders
            SET ship_status = $2, ship_data = $3, updated_at = NOW()
            WHERE id = $1 AND paid_at IS NOT NULL AND ship_status = 'pending'
            "#,
        )
        .bind(order_id)
        .bind(ShipStatus::Delivered)
        .bind(Json(ship_data))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// 确认收货
    pub async fn mark_received(&self, order_id: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE orders
            SET ship_status = $2, updated_at = NOW()
            WHERE id = $1 AND ship_status = 'delivered'
            "#,
        )
        .bind(order_id)
        .bind(ShipStatus::Received)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// 标记订单已评价；已评价返回 false
    pub async fn mark_reviewed_in_tx(tx: &mut PgConnection, order_id: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE orders
            SET reviewed = true, updated_at = NOW()
            WHERE id = $1 AND reviewed = false
            "#,
        )
        .bind(order_id)
        .execute(tx)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn update_item_review_in_tx(
        tx: &mut PgConnection,
        order_id: i64,
        item_id: i64,
        rating: i16,
        review: &str,
        reviewed_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE order_items
            SET rating = $3, review = $4, reviewed_at = $5
            WHERE id = $2 AND order_id = $1
            "#,
        )
        .bind(order_id)
        .bind(item_id)
        .bind(rating)
        .bind(review)
        .bind(reviewed_at)
        .execute(tx)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl OrderRepositoryTrait for OrderRepository {
    async fn find_by_id(&self, id: i64) -> Result<Option<Order>> {
        OrderRepository::find_by_id(self, id).await
    }

    async fn find_by_no(&self, no: &str) -> Result<Option<Order>> {
        OrderRepository::find_by_no(self, no).await
    }

    async fn find_by_refund_no(&self, refund_no: &str) -> Result<Option<Order>> {
        OrderRepository::find_by_refund_no(self, refund_no).await
    }

    async fn list_items(&self, order_id: i64) -> Result<Vec<OrderItem>> {
        OrderRepository::list_items(self, order_id).await
    }

    async fn update_refund(
        &self,
        order_id: i64,
        expected: RefundStatus,
        next: RefundStatus,
        extra: &OrderExtra,
    ) -> Result<bool> {
        OrderRepository::update_refund(self, order_id, expected, next, extra).await
    }

    async fn assign_refund_no(&self, order_id: i64, candidate: &str) -> Result<String> {
        OrderRepository::assign_refund_no(self, order_id, candidate).await
    }

    async fn list_paid_pending_refund_by_product(&self, product_id: i64) -> Result<Vec<Order>> {
        OrderRepository::list_paid_pending_refund_by_product(self, product_id).await
    }
}
