//! 商品与库存仓储
//!
//! 库存扣减使用 `stock >= n` 条件更新，数据库 CHECK 约束兜底，库存永不为负

use sqlx::{PgConnection, PgPool};

use crate::error::Result;
use crate::models::{CrowdfundingProduct, CrowdfundingStatus, SkuWithProduct};

/// 商品仓储
pub struct ProductRepository {
    pool: PgPool,
}

impl ProductRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    // ==================== SKU 与库存 ====================

    /// 查询 SKU 及所属商品
    pub async fn get_sku_in_tx(tx: &mut PgConnection, sku_id: i64) -> Result<Option<SkuWithProduct>> {
        let sku = sqlx::query_as::<_, SkuWithProduct>(
            r#"
            SELECT s.id AS sku_id, s.product_id, s.price, s.stock,
                   p.type AS product_type, p.on_sale
            FROM product_skus s
            JOIN products p ON p.id = s.product_id
            WHERE s.id = $1
            "#,
        )
        .bind(sku_id)
        .fetch_optional(tx)
        .await?;

        Ok(sku)
    }

    /// 扣减库存，库存不足时返回 false
    pub async fn decrease_stock_in_tx(tx: &mut PgConnection, sku_id: i64, amount: i32) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE product_skus
            SET stock = stock - $2, updated_at = NOW()
            WHERE id = $1 AND stock >= $2
            "#,
        )
        .bind(sku_id)
        .bind(amount)
        .execute(tx)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// 恢复库存
    pub async fn increase_stock_in_tx(tx: &mut PgConnection, sku_id: i64, amount: i32) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE product_skus
            SET stock = stock + $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(sku_id)
        .bind(amount)
        .execute(tx)
        .await?;

        Ok(())
    }

    // ==================== 众筹 ====================

    pub async fn get_crowdfunding(&self, product_id: i64) -> Result<Option<CrowdfundingProduct>> {
        let campaign = sqlx::query_as::<_, CrowdfundingProduct>(
            "SELECT * FROM crowdfunding_products WHERE product_id = $1",
        )
        .bind(product_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(campaign)
    }

    pub async fn get_crowdfunding_in_tx(
        tx: &mut PgConnection,
        product_id: i64,
    ) -> Result<Option<CrowdfundingProduct>> {
        let campaign = sqlx::query_as::<_, CrowdfundingProduct>(
            "SELECT * FROM crowdfunding_products WHERE product_id = $1",
        )
        .bind(product_id)
        .fetch_optional(tx)
        .await?;

        Ok(campaign)
    }

    /// 锁定已到截止时间仍在众筹中的活动
    pub async fn lock_due_crowdfunding_in_tx(
        tx: &mut PgConnection,
        limit: i64,
    ) -> Result<Vec<CrowdfundingProduct>> {
        let campaigns = sqlx::query_as::<_, CrowdfundingProduct>(
            r#"
            SELECT * FROM crowdfunding_products
            WHERE status = 'funding' AND end_at <= NOW()
            ORDER BY end_at ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(limit)
        .fetch_all(tx)
        .await?;

        Ok(campaigns)
    }

    /// 结束众筹：只有仍处于 funding 的活动会被更新
    pub async fn finish_crowdfunding_in_tx(
        tx: &mut PgConnection,
        campaign_id: i64,
        status: CrowdfundingStatus,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE crowdfunding_products
            SET status = $2, updated_at = NOW()
            WHERE id = $1 AND status = 'funding'
            "#,
        )
        .bind(campaign_id)
        .bind(status)
        .execute(tx)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// 按已支付的众筹订单重算已筹金额与参与人数
    pub async fn refresh_crowdfunding_progress(&self, product_id: i64) -> Result<Option<(i64, i32)>> {
        let row: Option<(i64, i32)> = sqlx::query_as(REFRESH_PROGRESS_SQL)
            .bind(product_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row)
    }

    /// 在结算事务内重算已筹金额，返回 (已筹金额, 参与人数)
    pub async fn refresh_crowdfunding_progress_in_tx(
        tx: &mut PgConnection,
        product_id: i64,
    ) -> Result<Option<(i64, i32)>> {
        let row: Option<(i64, i32)> = sqlx::query_as(REFRESH_PROGRESS_SQL)
            .bind(product_id)
            .fetch_optional(tx)
            .await?;

        Ok(row)
    }

    /// 已失败但仍有已支付、未退款订单的众筹活动（商品 ID）
    pub async fn list_failed_with_pending_refunds_in_tx(
        tx: &mut PgConnection,
        limit: i64,
    ) -> Result<Vec<i64>> {
        let ids: Vec<(i64,)> = sqlx::query_as(
            r#"
            SELECT c.product_id FROM crowdfunding_products c
            WHERE c.status = 'fail'
              AND EXISTS (
                  SELECT 1 FROM orders o
                  JOIN order_items i ON i.order_id = o.id
                  WHERE i.product_id = c.product_id
                    AND o.type = 'crowdfunding'
                    AND o.paid_at IS NOT NULL
                    AND o.refund_status = 'pending'
              )
            ORDER BY c.product_id ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(tx)
        .await?;

        Ok(ids.into_iter().map(|(id,)| id).collect())
    }
}

const REFRESH_PROGRESS_SQL: &str = r#"
    WITH paid AS (
        SELECT o.user_id, o.total_amount
        FROM orders o
        WHERE o.type = 'crowdfunding'
          AND o.paid_at IS NOT NULL
          AND EXISTS (
              SELECT 1 FROM order_items i
              WHERE i.order_id = o.id AND i.product_id = $1
          )
    )
    UPDATE crowdfunding_products
    SET total_amount = (SELECT COALESCE(SUM(total_amount), 0)::BIGINT FROM paid),
        user_count = (SELECT COUNT(DISTINCT user_id)::INTEGER FROM paid),
        updated_at = NOW()
    WHERE product_id = $1
    RETURNING total_amount, user_count
"#;
