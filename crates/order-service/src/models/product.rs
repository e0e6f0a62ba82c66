//! 商品、SKU 与众筹活动实体

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::enums::{CrowdfundingStatus, OrderType};

/// 商品
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: i64,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub product_type: OrderType,
    pub title: String,
    pub on_sale: bool,
    pub price: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 商品 SKU，库存在数据库层约束为非负
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ProductSku {
    pub id: i64,
    pub product_id: i64,
    pub title: String,
    pub price: i64,
    pub stock: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 下单时需要的 SKU 与所属商品信息
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SkuWithProduct {
    pub sku_id: i64,
    pub product_id: i64,
    pub price: i64,
    pub stock: i32,
    pub product_type: OrderType,
    pub on_sale: bool,
}

/// 众筹活动
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct CrowdfundingProduct {
    pub id: i64,
    pub product_id: i64,
    /// 目标金额（分）
    pub target_amount: i64,
    /// 已筹金额（分），由支付事件监听器按已支付订单重算
    pub total_amount: i64,
    pub user_count: i32,
    pub end_at: DateTime<Utc>,
    pub status: CrowdfundingStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CrowdfundingProduct {
    /// 是否仍可下单
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        self.status == CrowdfundingStatus::Funding && self.end_at > now
    }

    /// 截止时的结算结果：达到目标金额即成功
    pub fn settle_outcome(&self) -> CrowdfundingStatus {
        settle_outcome(self.total_amount, self.target_amount)
    }

    /// 众筹进度百分比（向下取整，最多 100）
    pub fn percent(&self) -> i64 {
        if self.target_amount <= 0 {
            return 0;
        }
        (self.total_amount * 100 / self.target_amount).min(100)
    }
}

/// 根据已筹金额与目标金额决定结算结果
pub fn settle_outcome(total_amount: i64, target_amount: i64) -> CrowdfundingStatus {
    if total_amount >= target_amount {
        CrowdfundingStatus::Success
    } else {
        CrowdfundingStatus::Fail
    }
}
