//! 分期计划服务
//!
//! 为未支付的普通订单生成还款计划。同一订单重复创建时，
//! 尚未开始还款的旧计划会被替换。

use std::sync::Arc;

use chrono::Utc;
use shop_shared::config::OrderConfig;
use sqlx::{PgConnection, PgPool};
use tracing::{info, instrument};

use crate::error::{OrderError, Result};
use crate::models::installment::plan_items;
use crate::models::order::generate_order_no;
use crate::models::{Installment, Order, OrderType};
use crate::repository::{InstallmentRepository, OrderRepositoryTrait};

const MAX_INSTALLMENT_NO_ATTEMPTS: usize = 10;

/// 分期计划服务
pub struct InstallmentService<OR>
where
    OR: OrderRepositoryTrait,
{
    order_repo: Arc<OR>,
    pool: PgPool,
    config: OrderConfig,
}

impl<OR> InstallmentService<OR>
where
    OR: OrderRepositoryTrait,
{
    pub fn new(order_repo: Arc<OR>, pool: PgPool, config: OrderConfig) -> Self {
        Self {
            order_repo,
            pool,
            config,
        }
    }

    /// 为订单创建分期计划
    #[instrument(skip(self))]
    pub async fn create_plan(&self, user_id: i64, order_id: i64, count: i32) -> Result<Installment> {
        let order = self
            .order_repo
            .find_by_id(order_id)
            .await?
            .ok_or_else(|| OrderError::OrderNotFound(order_id.to_string()))?;

        let fee_rate = self.check_eligible(&order, user_id, count)?;
        let now = Utc::now();
        let items = plan_items(order.total_amount, count, fee_rate, now);

        let mut tx = self.pool.begin().await?;

        // 1. 替换未开始还款的旧计划
        let removed = InstallmentRepository::delete_pending_by_order_in_tx(&mut tx, order.id).await?;

        // 2. 写入计划
        let installment = insert_installment(&mut tx, &order, count, fee_rate).await?;

        // 3. 写入还款项
        for item in &items {
            InstallmentRepository::insert_item_in_tx(&mut tx, installment.id, item).await?;
        }

        tx.commit().await?;

        info!(
            order_no = %order.no,
            installment_no = %installment.no,
            count,
            fee_rate,
            replaced = removed,
            "分期计划已创建"
        );
        Ok(installment)
    }

    /// 校验订单可分期，返回对应期数的费率
    fn check_eligible(&self, order: &Order, user_id: i64, count: i32) -> Result<i64> {
        order.ensure_owned_by(user_id)?;
        if order.order_type != OrderType::Normal {
            return Err(OrderError::invalid_state(order.id, "众筹订单不支持分期"));
        }
        order.ensure_payable()?;
        if order.total_amount < self.config.min_installment_amount {
            return Err(OrderError::Validation(format!(
                "订单金额低于分期最低金额 {} 分",
                self.config.min_installment_amount
            )));
        }
        self.config
            .fee_rate_for(count)
            .ok_or_else(|| OrderError::Validation(format!("不支持的分期期数: {}", count)))
    }
}

async fn insert_installment(
    tx: &mut PgConnection,
    order: &Order,
    count: i32,
    fee_rate: i64,
) -> Result<Installment> {
    for _ in 0..MAX_INSTALLMENT_NO_ATTEMPTS {
        let no = generate_order_no(Utc::now());
        if let Some(installment) = InstallmentRepository::insert_in_tx(
            tx,
            &no,
            order.user_id,
            order.id,
            order.total_amount,
            count,
            fee_rate,
        )
        .await?
        {
            return Ok(installment);
        }
    }
    Err(OrderError::Internal("生成分期流水号失败".to_string()))
}
