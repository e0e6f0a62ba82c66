//! 购物车仓储

use sqlx::PgConnection;

use crate::error::Result;

/// 购物车仓储（只在下单事务中使用）
pub struct CartRepository;

impl CartRepository {
    /// 移除用户购物车中已下单的 SKU，返回删除的行数
    pub async fn remove_skus_in_tx(
        tx: &mut PgConnection,
        user_id: i64,
        sku_ids: &[i64],
    ) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM cart_items WHERE user_id = $1 AND product_sku_id = ANY($2)",
        )
        .bind(user_id)
        .bind(sku_ids)
        .execute(tx)
        .await?;

        Ok(result.rows_affected())
    }
}
