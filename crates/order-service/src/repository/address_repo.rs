//! 收货地址仓储

use sqlx::PgConnection;

use crate::error::Result;
use crate::models::UserAddress;

/// 收货地址仓储（只在下单事务中使用）
pub struct AddressRepository;

impl AddressRepository {
    /// 查询属于指定用户的地址
    pub async fn find_owned_in_tx(
        tx: &mut PgConnection,
        address_id: i64,
        user_id: i64,
    ) -> Result<Option<UserAddress>> {
        let address = sqlx::query_as::<_, UserAddress>(
            "SELECT * FROM user_addresses WHERE id = $1 AND user_id = $2",
        )
        .bind(address_id)
        .bind(user_id)
        .fetch_optional(tx)
        .await?;

        Ok(address)
    }

    /// 更新地址最后使用时间
    pub async fn touch_in_tx(tx: &mut PgConnection, address_id: i64) -> Result<()> {
        sqlx::query("UPDATE user_addresses SET last_used_at = NOW() WHERE id = $1")
            .bind(address_id)
            .execute(tx)
            .await?;

        Ok(())
    }
}
