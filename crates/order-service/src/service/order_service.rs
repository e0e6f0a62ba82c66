//! 下单服务
//!
//! 在一个数据库事务内完成订单聚合的创建：
//!
//! 1. 优惠券预检（事务外）-> 2. 校验收货地址 -> 3. 逐个 SKU 校验并扣减库存
//!    -> 4. 按小计复检并占用优惠券 -> 5. 写入订单与订单项 -> 6. 清理购物车（保存点）
//!    -> 7. 提交 -> 8. 投递过期关闭任务（失败只告警）
//!
//! 任一步骤失败都会丢弃事务，库存与优惠券占用一并回滚。

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use shop_shared::config::OrderConfig;
use shop_shared::delay_queue::{DelayQueue, order_member};
use shop_shared::observability::metrics;
use sqlx::{Connection, PgConnection, PgPool};
use tracing::{info, instrument, warn};

use crate::error::{OrderError, Result};
use crate::models::order::generate_order_no;
use crate::models::{CouponCode, NewOrderItem, Order, OrderType, SkuWithProduct};
use crate::repository::{
    AddressRepository, CartRepository, CouponRepository, CouponRepositoryTrait, NewOrder,
    OrderRepository, ProductRepository,
};
use crate::service::dto::{CreateOrderRequest, CrowdfundingOrderRequest};

/// 订单号冲突时的最大重试次数
const MAX_ORDER_NO_ATTEMPTS: usize = 10;

/// 下单服务
pub struct OrderService<CR>
where
    CR: CouponRepositoryTrait,
{
    coupon_repo: Arc<CR>,
    pool: PgPool,
    config: OrderConfig,
    expiry_queue: Option<DelayQueue>,
}

impl<CR> OrderService<CR>
where
    CR: CouponRepositoryTrait,
{
    pub fn new(coupon_repo: Arc<CR>, pool: PgPool, config: OrderConfig) -> Self {
        Self {
            coupon_repo,
            pool,
            config,
            expiry_queue: None,
        }
    }

    /// 注入过期关闭队列；未注入时只依赖数据库兜底扫描
    pub fn with_expiry_queue(mut self, queue: DelayQueue) -> Self {
        self.expiry_queue = Some(queue);
        self
    }

    /// 查询优惠券并检查是否可用
    ///
    /// `order_amount` 为 None 时跳过最低金额检查（下单前预检）
    #[instrument(skip(self))]
    pub async fn check_coupon(
        &self,
        user_id: i64,
        code: &str,
        order_amount: Option<i64>,
    ) -> Result<CouponCode> {
        let coupon = self
            .coupon_repo
            .find_by_code(code)
            .await?
            .ok_or_else(|| OrderError::CouponNotFound(code.to_string()))?;

        coupon.check_available(Utc::now(), order_amount)?;

        if self.coupon_repo.user_has_used(user_id, coupon.id).await? {
            return Err(OrderError::CouponUnavailable(
                "你已经使用过这张优惠券了".to_string(),
            ));
        }

        Ok(coupon)
    }

    /// 创建普通商品订单
    #[instrument(skip(self, request), fields(items = request.items.len()))]
    pub async fn store(&self, user_id: i64, request: CreateOrderRequest) -> Result<Order> {
        let started = Instant::now();

        if request.items.is_empty() {
            return Err(OrderError::Validation("订单商品不能为空".to_string()));
        }
        for item in &request.items {
            validate_amount(item.amount)?;
        }

        // 1. 优惠券预检，失败时无需开启事务
        let coupon = match request.coupon_code.as_deref() {
            Some(code) => Some(self.check_coupon(user_id, code, None).await?),
            None => None,
        };

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        // 2. 收货地址快照
        let address = AddressRepository::find_owned_in_tx(&mut tx, request.address_id, user_id)
            .await?
            .ok_or(OrderError::AddressNotFound(request.address_id))?;
        AddressRepository::touch_in_tx(&mut tx, address.id).await?;

        // 3. 校验 SKU 并扣减库存
        let mut items = Vec::with_capacity(request.items.len());
        let mut total_amount = 0i64;
        for item in &request.items {
            let sku = ProductRepository::get_sku_in_tx(&mut tx, item.sku_id)
                .await?
                .ok_or(OrderError::SkuNotFound(item.sku_id))?;
            ensure_sku_orderable(&sku, OrderType::Normal)?;

            if !ProductRepository::decrease_stock_in_tx(&mut tx, sku.sku_id, item.amount).await? {
                return Err(OrderError::InsufficientStock { sku_id: sku.sku_id });
            }

            let new_item = NewOrderItem {
                product_id: sku.product_id,
                product_sku_id: sku.sku_id,
                amount: item.amount,
                price: sku.price,
            };
            total_amount += new_item.subtotal();
            items.push(new_item);
        }

        // 4. 锁定优惠券，按小计复检并占用名额
        let mut coupon_code_id = None;
        if let Some(coupon) = coupon {
            let fresh = CouponRepository::lock_by_id_in_tx(&mut tx, coupon.id)
                .await?
                .ok_or_else(|| OrderError::CouponNotFound(coupon.code.clone()))?;
            fresh.check_available(now, Some(total_amount))?;

            // 预检之后可能已有同一用户的并发订单提交
            if CouponRepository::user_has_used_in_tx(&mut tx, user_id, fresh.id).await? {
                return Err(OrderError::CouponUnavailable(
                    "你已经使用过这张优惠券了".to_string(),
                ));
            }

            if !CouponRepository::consume_in_tx(&mut tx, fresh.id).await? {
                return Err(OrderError::CouponUnavailable("该优惠券已被兑完".to_string()));
            }
            total_amount = fresh.adjusted_price(total_amount);
            coupon_code_id = Some(fresh.id);
        }

        // 5. 写入订单与订单项
        let expires_at = now + Duration::seconds(self.config.ttl_seconds);
        let order = insert_order(
            &mut tx,
            NewOrder {
                no: String::new(),
                user_id,
                address: address.snapshot(),
                remark: request.remark,
                total_amount,
                order_type: OrderType::Normal,
                coupon_code_id,
                expires_at,
            },
            now,
        )
        .await?;
        for item in &items {
            OrderRepository::insert_item_in_tx(&mut tx, order.id, item).await?;
        }

        // 6. 清理购物车，失败不影响下单
        let sku_ids: Vec<i64> = items.iter().map(|i| i.product_sku_id).collect();
        if let Err(e) = clear_cart(&mut tx, user_id, &sku_ids).await {
            warn!(order_id = order.id, error = %e, "清理购物车失败");
        }

        tx.commit().await?;

        // 7. 过期关闭任务
        self.schedule_expiry(order.id, expires_at).await;

        metrics::record_order_created(
            OrderType::Normal.as_str(),
            "success",
            started.elapsed().as_secs_f64(),
        );
        info!(
            order_id = order.id,
            order_no = %order.no,
            total_amount = order.total_amount,
            coupon = ?order.coupon_code_id,
            "订单已创建"
        );

        Ok(order)
    }

    /// 创建众筹订单，过期时间不晚于众筹截止时间
    #[instrument(skip(self, request), fields(sku_id = request.sku_id))]
    pub async fn crowdfunding(
        &self,
        user_id: i64,
        request: CrowdfundingOrderRequest,
    ) -> Result<Order> {
        let started = Instant::now();
        validate_amount(request.amount)?;

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let address = AddressRepository::find_owned_in_tx(&mut tx, request.address_id, user_id)
            .await?
            .ok_or(OrderError::AddressNotFound(request.address_id))?;
        AddressRepository::touch_in_tx(&mut tx, address.id).await?;

        let sku = ProductRepository::get_sku_in_tx(&mut tx, request.sku_id)
            .await?
            .ok_or(OrderError::SkuNotFound(request.sku_id))?;
        ensure_sku_orderable(&sku, OrderType::Crowdfunding)?;

        let campaign = ProductRepository::get_crowdfunding_in_tx(&mut tx, sku.product_id)
            .await?
            .ok_or(OrderError::CampaignNotFound(sku.product_id))?;
        if !campaign.is_open(now) {
            return Err(OrderError::Validation("该商品众筹已结束".to_string()));
        }

        if !ProductRepository::decrease_stock_in_tx(&mut tx, sku.sku_id, request.amount).await? {
            return Err(OrderError::InsufficientStock { sku_id: sku.sku_id });
        }

        let item = NewOrderItem {
            product_id: sku.product_id,
            product_sku_id: sku.sku_id,
            amount: request.amount,
            price: sku.price,
        };

        let expires_at = crowdfunding_expires_at(now, self.config.ttl_seconds, campaign.end_at);
        let order = insert_order(
            &mut tx,
            NewOrder {
                no: String::new(),
                user_id,
                address: address.snapshot(),
                remark: None,
                total_amount: item.subtotal(),
                order_type: OrderType::Crowdfunding,
                coupon_code_id: None,
                expires_at,
            },
            now,
        )
        .await?;
        OrderRepository::insert_item_in_tx(&mut tx, order.id, &item).await?;

        tx.commit().await?;

        self.schedule_expiry(order.id, expires_at).await;

        metrics::record_order_created(
            OrderType::Crowdfunding.as_str(),
            "success",
            started.elapsed().as_secs_f64(),
        );
        info!(
            order_id = order.id,
            order_no = %order.no,
            product_id = sku.product_id,
            expires_at = %expires_at,
            "众筹订单已创建"
        );

        Ok(order)
    }

    async fn schedule_expiry(&self, order_id: i64, expires_at: DateTime<Utc>) {
        let Some(queue) = &self.expiry_queue else {
            return;
        };
        if let Err(e) = queue.schedule_at(&order_member(order_id), expires_at).await {
            warn!(order_id, error = %e, "投递订单过期任务失败，将由兜底扫描关闭");
        }
    }
}

fn validate_amount(amount: i32) -> Result<()> {
    if amount < 1 {
        return Err(OrderError::Validation("购买数量不能小于 1".to_string()));
    }
    Ok(())
}

/// 校验 SKU 可按指定订单类型购买
fn ensure_sku_orderable(sku: &SkuWithProduct, order_type: OrderType) -> Result<()> {
    if !sku.on_sale {
        return Err(OrderError::Validation(format!("商品未上架: sku_id={}", sku.sku_id)));
    }
    match (order_type, sku.product_type) {
        (OrderType::Normal, OrderType::Crowdfunding) => Err(OrderError::Validation(
            "众筹商品只能通过众筹下单".to_string(),
        )),
        (OrderType::Crowdfunding, OrderType::Normal) => {
            Err(OrderError::Validation("该商品不是众筹商品".to_string()))
        }
        _ => Ok(()),
    }
}

/// 众筹订单过期时间：默认 TTL 与众筹截止时间取较早者
fn crowdfunding_expires_at(
    now: DateTime<Utc>,
    ttl_seconds: i64,
    end_at: DateTime<Utc>,
) -> DateTime<Utc> {
    (now + Duration::seconds(ttl_seconds)).min(end_at)
}

/// 生成订单号并写入，冲突时换号重试
async fn insert_order(
    tx: &mut PgConnection,
    mut order: NewOrder,
    now: DateTime<Utc>,
) -> Result<Order> {
    for _ in 0..MAX_ORDER_NO_ATTEMPTS {
        order.no = generate_order_no(now);
        if OrderRepository::no_exists_in_tx(tx, &order.no).await? {
            continue;
        }
        if let Some(created) = OrderRepository::insert_in_tx(tx, &order).await? {
            return Ok(created);
        }
    }
    Err(OrderError::Internal("生成订单流水号失败".to_string()))
}

/// 在保存点内清理购物车，失败只回滚保存点
async fn clear_cart(tx: &mut PgConnection, user_id: i64, sku_ids: &[i64]) -> Result<u64> {
    let mut savepoint = tx.begin().await?;
    let removed = CartRepository::remove_skus_in_tx(&mut savepoint, user_id, sku_ids).await?;
    savepoint.commit().await?;
    Ok(removed)
}
