//! 优惠券仓储
//!
//! 使用次数通过 `used < total` 条件更新原子递增，不会超发

use async_trait::async_trait;
use sqlx::{PgConnection, PgPool};

use super::traits::CouponRepositoryTrait;
use crate::error::Result;
use crate::models::CouponCode;

/// 未关闭的未支付订单，或已支付且未退款成功的订单，均视为已使用
const USER_HAS_USED_SQL: &str = r#"
    SELECT EXISTS(
        SELECT 1 FROM orders
        WHERE user_id = $1
          AND coupon_code_id = $2
          AND (
              (paid_at IS NULL AND closed = false)
              OR (paid_at IS NOT NULL AND refund_status <> 'success')
          )
    )
"#;

/// 优惠券仓储
pub struct CouponRepository {
    pool: PgPool,
}

impl CouponRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn find_by_code(&self, code: &str) -> Result<Option<CouponCode>> {
        let coupon = sqlx::query_as::<_, CouponCode>("SELECT * FROM coupon_codes WHERE code = $1")
            .bind(code)
            .fetch_optional(&self.pool)
            .await?;

        Ok(coupon)
    }

    /// 在事务中锁定并重新读取优惠券
    ///
    /// 行锁持有到事务结束，同一张券的并发下单在此排队
    pub async fn lock_by_id_in_tx(tx: &mut PgConnection, id: i64) -> Result<Option<CouponCode>> {
        let coupon = sqlx::query_as::<_, CouponCode>(
            "SELECT * FROM coupon_codes WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(tx)
        .await?;

        Ok(coupon)
    }

    /// 用户是否已经用过该优惠券
    pub async fn user_has_used(&self, user_id: i64, coupon_id: i64) -> Result<bool> {
        let used: (bool,) = sqlx::query_as(USER_HAS_USED_SQL)
            .bind(user_id)
            .bind(coupon_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(used.0)
    }

    /// 事务内复检，需先通过 `lock_by_id_in_tx` 持有优惠券行锁
    pub async fn user_has_used_in_tx(
        tx: &mut PgConnection,
        user_id: i64,
        coupon_id: i64,
    ) -> Result<bool> {
        let used: (bool,) = sqlx::query_as(USER_HAS_USED_SQL)
            .bind(user_id)
            .bind(coupon_id)
            .fetch_one(tx)
            .await?;

        Ok(used.0)
    }

    /// 占用一次使用名额，名额已满返回 false
    pub async fn consume_in_tx(tx: &mut PgConnection, coupon_id: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE coupon_codes
            SET used = used + 1, updated_at = NOW()
            WHERE id = $1 AND used < total
            "#,
        )
        .bind(coupon_id)
        .execute(tx)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// 释放一次使用名额（订单关闭时）
    pub async fn release_in_tx(tx: &mut PgConnection, coupon_id: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE coupon_codes
            SET used = used - 1, updated_at = NOW()
            WHERE id = $1 AND used > 0
            "#,
        )
        .bind(coupon_id)
        .execute(tx)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl CouponRepositoryTrait for CouponRepository {
    async fn find_by_code(&self, code: &str) -> Result<Option<CouponCode>> {
        CouponRepository::find_by_code(self, code).await
    }

    async fn user_has_used(&self, user_id: i64, coupon_id: i64) -> Result<bool> {
        CouponRepository::user_has_used(self, user_id, coupon_id).await
    }
}
