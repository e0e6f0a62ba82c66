//! 履约服务：发货、确认收货与评价

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use sqlx::PgPool;
use tracing::{info, instrument};

use crate::error::{OrderError, Result};
use crate::events::{EventBus, OrderEvent, OrderReviewed};
use crate::models::{CrowdfundingStatus, ShipData};
use crate::repository::{OrderRepository, ProductRepository};
use crate::service::dto::{ReviewRequest, ShipRequest};

pub struct FulfillmentService {
    order_repo: Arc<OrderRepository>,
    product_repo: Arc<ProductRepository>,
    pool: PgPool,
    events: EventBus,
}

impl FulfillmentService {
    pub fn new(
        order_repo: Arc<OrderRepository>,
        product_repo: Arc<ProductRepository>,
        pool: PgPool,
        events: EventBus,
    ) -> Self {
        Self {
            order_repo,
            product_repo,
            pool,
            events,
        }
    }

    /// 发货
    ///
    /// 众筹订单只有在众筹成功后才能发货
    #[instrument(skip(self, request))]
    pub async fn ship(&self, order_id: i64, request: ShipRequest) -> Result<()> {
        let ship_data = validate_ship_request(request)?;

        let order = self
            .order_repo
            .find_by_id(order_id)
            .await?
            .ok_or_else(|| OrderError::OrderNotFound(order_id.to_string()))?;
        order.ensure_shippable()?;

        if order.is_crowdfunding() {
            for product_id in self.product_ids(order.id).await? {
                let campaign = self
                    .product_repo
                    .get_crowdfunding(product_id)
                    .await?
                    .ok_or(OrderError::CampaignNotFound(product_id))?;
                if campaign.status != CrowdfundingStatus::Success {
                    return Err(OrderError::invalid_state(order.id, "众筹订单只能在众筹成功之后发货"));
                }
            }
        }

        if !self.order_repo.mark_shipped(order.id, &ship_data).await? {
            return Err(OrderError::invalid_state(order.id, "订单已发货"));
        }

        info!(
            order_no = %order.no,
            express_company = %ship_data.express_company,
            express_no = %ship_data.express_no,
            "订单已发货"
        );
        Ok(())
    }

    /// 买家确认收货
    #[instrument(skip(self))]
    pub async fn confirm_received(&self, user_id: i64, order_id: i64) -> Result<()> {
        let order = self
            .order_repo
            .find_by_id(order_id)
            .await?
            .ok_or_else(|| OrderError::OrderNotFound(order_id.to_string()))?;
        order.ensure_owned_by(user_id)?;
        order.ensure_receivable()?;

        if !self.order_repo.mark_received(order.id).await? {
            return Err(OrderError::invalid_state(order.id, "发货状态不正确"));
        }

        info!(order_no = %order.no, "买家已确认收货");
        Ok(())
    }

    /// 提交评价，所有订单项的评价在一个事务中写入
    #[instrument(skip(self, reviews), fields(reviews = reviews.len()))]
    pub async fn submit_review(
        &self,
        user_id: i64,
        order_id: i64,
        reviews: Vec<ReviewRequest>,
    ) -> Result<()> {
        validate_reviews(&reviews)?;

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let order = OrderRepository::find_by_id_for_update_in_tx(&mut tx, order_id)
            .await?
            .ok_or_else(|| OrderError::OrderNotFound(order_id.to_string()))?;
        order.ensure_owned_by(user_id)?;
        order.ensure_reviewable()?;

        let products: HashMap<i64, i64> = OrderRepository::list_items_in_tx(&mut tx, order.id)
            .await?
            .into_iter()
            .map(|item| (item.id, item.product_id))
            .collect();

        let mut product_ids = BTreeSet::new();
        for review in &reviews {
            let product_id = products.get(&review.item_id).ok_or_else(|| {
                OrderError::Validation(format!("订单项不属于该订单: item_id={}", review.item_id))
            })?;
            OrderRepository::update_item_review_in_tx(
                &mut tx,
                order.id,
                review.item_id,
                review.rating,
                review.review.trim(),
                now,
            )
            .await?;
            product_ids.insert(*product_id);
        }

        if !OrderRepository::mark_reviewed_in_tx(&mut tx, order.id).await? {
            return Err(OrderError::invalid_state(order.id, "该订单已评价，不可重复提交"));
        }

        tx.commit().await?;

        self.events.publish(OrderEvent::Reviewed(OrderReviewed {
            order_id: order.id,
            user_id,
            product_ids: product_ids.into_iter().collect(),
            reviewed_at: now,
        }));

        info!(order_no = %order.no, "订单评价已提交");
        Ok(())
    }

    async fn product_ids(&self, order_id: i64) -> Result<BTreeSet<i64>> {
        let items = self.order_repo.list_items(order_id).await?;
        Ok(items.into_iter().map(|i| i.product_id).collect())
    }
}

fn validate_ship_request(request: ShipRequest) -> Result<ShipData> {
    let express_company = request.express_company.trim();
    let express_no = request.express_no.trim();
    if express_company.is_empty() || express_no.is_empty() {
        return Err(OrderError::Validation("物流公司与物流单号不能为空".to_string()));
    }
    Ok(ShipData {
        express_company: express_company.to_string(),
        express_no: express_no.to_string(),
    })
}

fn validate_reviews(reviews: &[ReviewRequest]) -> Result<()> {
    if reviews.is_empty() {
        return Err(OrderError::Validation("评价内容不能为空".to_string()));
    }

    let mut seen = BTreeSet::new();
    for review in reviews {
        if !(1..=5).contains(&review.rating) {
            return Err(OrderError::Validation(format!(
                "评分必须在 1 到 5 之间: item_id={}",
                review.item_id
            )));
        }
        if review.review.trim().is_empty() {
            return Err(OrderError::Validation("评价内容不能为空".to_string()));
        }
        if !seen.insert(review.item_id) {
            return Err(OrderError::Validation(format!(
                "订单项重复评价: item_id={}",
                review.item_id
            )));
        }
    }
    Ok(())
}
