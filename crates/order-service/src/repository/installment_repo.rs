//! 分期仓储
//!
//! 分期计划与还款项的数据访问

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};

use super::traits::InstallmentRepositoryTrait;
use crate::error::Result;
use crate::models::{
    Installment, InstallmentItem, InstallmentStatus, ItemRefundStatus, NewInstallmentItem,
    PaymentMethod,
};

/// 分期仓储
pub struct InstallmentRepository {
    pool: PgPool,
}

impl InstallmentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    // ==================== 分期计划 ====================

    pub async fn find_by_no(&self, no: &str) -> Result<Option<Installment>> {
        let installment = sqlx::query_as::<_, Installment>("SELECT * FROM installments WHERE no = $1")
            .bind(no)
            .fetch_optional(&self.pool)
            .await?;

        Ok(installment)
    }

    /// 在事务中按流水号锁定分期计划
    pub async fn find_by_no_for_update_in_tx(
        tx: &mut PgConnection,
        no: &str,
    ) -> Result<Option<Installment>> {
        let installment = sqlx::query_as::<_, Installment>(
            "SELECT * FROM installments WHERE no = $1 FOR UPDATE",
        )
        .bind(no)
        .fetch_optional(tx)
        .await?;

        Ok(installment)
    }

    /// 订单对应的最新一笔非 pending 分期计划（退款时使用）
    pub async fn find_active_by_order(&self, order_id: i64) -> Result<Option<Installment>> {
        let installment = sqlx::query_as::<_, Installment>(
            r#"
            SELECT * FROM installments
            WHERE order_id = $1 AND status <> 'pending'
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(installment)
    }

    /// 删除订单上尚未开始还款的旧计划
    pub async fn delete_pending_by_order_in_tx(tx: &mut PgConnection, order_id: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM installments WHERE order_id = $1 AND status = 'pending'")
            .bind(order_id)
            .execute(tx)
            .await?;

        Ok(result.rows_affected())
    }

    /// 写入分期计划，流水号冲突时返回 None
    pub async fn insert_in_tx(
        tx: &mut PgConnection,
        no: &str,
        user_id: i64,
        order_id: i64,
        base_amount: i64,
        count: i32,
        fee_rate: i64,
    ) -> Result<Option<Installment>> {
        let installment = sqlx::query_as::<_, Installment>(
            r#"
            INSERT INTO installments (no, user_id, order_id, base_amount, count, fee_rate, status)
            VALUES ($1, $2, $3, $4, $5, $6, 'pending')
            ON CONFLICT (no) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(no)
        .bind(user_id)
        .bind(order_id)
        .bind(base_amount)
        .bind(count)
        .bind(fee_rate)
        .fetch_optional(tx)
        .await?;

        Ok(installment)
    }

    pub async fn insert_item_in_tx(
        tx: &mut PgConnection,
        installment_id: i64,
        item: &NewInstallmentItem,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO installment_items (installment_id, sequence, base, fee, due_date)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(installment_id)
        .bind(item.sequence)
        .bind(item.base)
        .bind(item.fee)
        .bind(item.due_date)
        .execute(tx)
        .await?;

        Ok(())
    }

    /// 计划状态前进（pending -> repaying -> finished），不会回退
    pub async fn advance_status_in_tx(
        tx: &mut PgConnection,
        installment_id: i64,
        from: InstallmentStatus,
        to: InstallmentStatus,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE installments
            SET status = $3, updated_at = NOW()
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(installment_id)
        .bind(from)
        .bind(to)
        .execute(tx)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    // ==================== 还款项 ====================

    pub async fn list_items(&self, installment_id: i64) -> Result<Vec<InstallmentItem>> {
        let mut conn = self.pool.acquire().await?;
        Self::list_items_in_tx(&mut conn, installment_id).await
    }

    pub async fn list_items_in_tx(
        tx: &mut PgConnection,
        installment_id: i64,
    ) -> Result<Vec<InstallmentItem>> {
        let items = sqlx::query_as::<_, InstallmentItem>(
            r#"
            SELECT * FROM installment_items
            WHERE installment_id = $1
            ORDER BY sequence ASC
            "#,
        )
        .bind(installment_id)
        .fetch_all(tx)
        .await?;

        Ok(items)
    }

    /// 标记还款项已支付，仅当 `paid_at IS NULL` 时生效
    pub async fn mark_item_paid_in_tx(
        tx: &mut PgConnection,
        installment_id: i64,
        sequence: i32,
        method: PaymentMethod,
        payment_no: &str,
        paid_at: DateTime<Utc>,
    ) -> Result<Option<InstallmentItem>> {
        let item = sqlx::query_as::<_, InstallmentItem>(
            r#"
            UPDATE installment_items
            SET paid_at = $3, payment_method = $4, payment_no = $5, updated_at = NOW()
            WHERE installment_id = $1 AND sequence = $2 AND paid_at IS NULL
            RETURNING *
            "#,
        )
        .bind(installment_id)
        .bind(sequence)
        .bind(paid_at)
        .bind(method)
        .bind(payment_no)
        .fetch_optional(tx)
        .await?;

        Ok(item)
    }

    pub async fn item_exists_in_tx(
        tx: &mut PgConnection,
        installment_id: i64,
        sequence: i32,
    ) -> Result<bool> {
        let exists: (bool,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM installment_items WHERE installment_id = $1 AND sequence = $2)",
        )
        .bind(installment_id)
        .bind(sequence)
        .fetch_one(tx)
        .await?;

        Ok(exists.0)
    }

    /// 计划中尚未支付的还款项数量
    pub async fn count_unpaid_items_in_tx(tx: &mut PgConnection, installment_id: i64) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM installment_items WHERE installment_id = $1 AND paid_at IS NULL",
        )
        .bind(installment_id)
        .fetch_one(tx)
        .await?;

        Ok(count)
    }

    /// 条件更新还款项退款状态，返回是否生效
    pub async fn update_item_refund_status(
        &self,
        item_id: i64,
        expected: &[ItemRefundStatus],
        next: ItemRefundStatus,
    ) -> Result<bool> {
        let expected: Vec<String> = expected.iter().map(|s| item_refund_str(*s).to_string()).collect();
        let result = sqlx::query(
            r#"
            UPDATE installment_items
            SET refund_status = $3, updated_at = NOW()
            WHERE id = $1 AND refund_status = ANY($2)
            "#,
        )
        .bind(item_id)
        .bind(&expected)
        .bind(next)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// 通过退款单号与期序号定位还款项（`{订单退款单号}_{期序号}`）
    pub async fn find_item_by_refund_ref(
        &self,
        order_refund_no: &str,
        sequence: i32,
    ) -> Result<Option<(i64, InstallmentItem)>> {
        let row = sqlx::query_as::<_, RefundItemRow>(
            r#"
            SELECT o.id AS order_id, ii.*
            FROM orders o
            JOIN installments inst ON inst.order_id = o.id
            JOIN installment_items ii ON ii.installment_id = inst.id
            WHERE o.refund_no = $1 AND ii.sequence = $2 AND inst.status <> 'pending'
            ORDER BY inst.id DESC
            LIMIT 1
            "#,
        )
        .bind(order_refund_no)
        .bind(sequence)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| (r.order_id, r.item)))
    }
}

#[derive(sqlx::FromRow)]
struct RefundItemRow {
    order_id: i64,
    #[sqlx(flatten)]
    item: InstallmentItem,
}

fn item_refund_str(status: ItemRefundStatus) -> &'static str {
    match status {
        ItemRefundStatus::Pending => "pending",
        ItemRefundStatus::Processing => "processing",
        ItemRefundStatus::Success => "success",
        ItemRefundStatus::Failed => "failed",
    }
}

#[async_trait]
impl InstallmentRepositoryTrait for InstallmentRepository {
    async fn find_by_no(&self, no: &str) -> Result<Option<Installment>> {
        InstallmentRepository::find_by_no(self, no).await
    }

    async fn find_active_by_order(&self, order_id: i64) -> Result<Option<Installment>> {
        InstallmentRepository::find_active_by_order(self, order_id).await
    }

    async fn list_items(&self, installment_id: i64) -> Result<Vec<InstallmentItem>> {
        InstallmentRepository::list_items(self, installment_id).await
    }

    async fn update_item_refund_status(
        &self,
        item_id: i64,
        expected: &[ItemRefundStatus],
        next: ItemRefundStatus,
    ) -> Result<bool> {
        InstallmentRepository::update_item_refund_status(self, item_id, expected, next).await
    }

    async fn find_item_by_refund_ref(
        &self,
        order_refund_no: &str,
        sequence: i32,
    ) -> Result<Option<(i64, InstallmentItem)>> {
        InstallmentRepository::find_item_by_refund_ref(self, order_refund_no, sequence).await
    }
}
