//! 订单聚合实体定义
//!
//! 包含订单、订单项、收货地址快照、物流信息和订单扩展数据

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;

use super::enums::{OrderType, PaymentMethod, RefundStatus, ShipStatus};
use crate::error::{OrderError, Result};

/// 下单时的收货地址快照，后续修改地址不影响已有订单
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressSnapshot {
    pub address: String,
    pub zip: String,
    pub contact_name: String,
    pub contact_phone: String,
}

/// 物流信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShipData {
    pub express_company: String,
    pub express_no: String,
}

/// 订单扩展数据（退款原因等）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderExtra {
    /// 用户申请退款的理由
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refund_reason: Option<String>,
    /// 运营拒绝退款的理由
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refund_disagree_reason: Option<String>,
    /// 网关返回的退款失败码
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refund_failed_code: Option<String>,
}

/// 订单
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: i64,
    /// 订单流水号，同时作为支付网关的商户订单号
    pub no: String,
    pub user_id: i64,
    pub address: Json<AddressSnapshot>,
    #[sqlx(default)]
    pub remark: Option<String>,
    /// 订单总金额（分），支付后不可变
    pub total_amount: i64,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub order_type: OrderType,
    #[sqlx(default)]
    pub paid_at: Option<DateTime<Utc>>,
    #[sqlx(default)]
    pub payment_method: Option<PaymentMethod>,
    /// 网关交易号；分期订单为分期流水号
    #[sqlx(default)]
    pub payment_no: Option<String>,
    pub closed: bool,
    pub ship_status: ShipStatus,
    #[sqlx(default)]
    pub ship_data: Option<Json<ShipData>>,
    pub refund_status: RefundStatus,
    #[sqlx(default)]
    pub refund_no: Option<String>,
    pub reviewed: bool,
    pub extra: Json<OrderExtra>,
    #[sqlx(default)]
    pub coupon_code_id: Option<i64>,
    #[sqlx(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn is_paid(&self) -> bool {
        self.paid_at.is_some()
    }

    pub fn is_crowdfunding(&self) -> bool {
        self.order_type == OrderType::Crowdfunding
    }

    /// 校验订单归属
    pub fn ensure_owned_by(&self, user_id: i64) -> Result<()> {
        if self.user_id != user_id {
            return Err(OrderError::NotOwner(self.id));
        }
        Ok(())
    }

    /// 发起支付前的状态校验：未支付且未关闭
    pub fn ensure_payable(&self) -> Result<()> {
        if self.is_paid() {
            return Err(OrderError::invalid_state(self.id, "订单已支付"));
        }
        if self.closed {
            return Err(OrderError::invalid_state(self.id, "订单已关闭"));
        }
        Ok(())
    }

    /// 用户申请退款前的状态校验
    pub fn ensure_refund_applicable(&self) -> Result<()> {
        if !self.is_paid() {
            return Err(OrderError::invalid_state(self.id, "订单未支付，不可退款"));
        }
        if self.is_crowdfunding() {
            return Err(OrderError::invalid_state(self.id, "众筹订单不支持申请退款"));
        }
        if self.refund_status != RefundStatus::Pending {
            return Err(OrderError::invalid_state(self.id, "该订单已经申请过退款"));
        }
        Ok(())
    }

    /// 发货前的状态校验（众筹活动状态由调用方另行检查）
    pub fn ensure_shippable(&self) -> Result<()> {
        if !self.is_paid() {
            return Err(OrderError::invalid_state(self.id, "订单未支付"));
        }
        if self.ship_status != ShipStatus::Pending {
            return Err(OrderError::invalid_state(self.id, "订单已发货"));
        }
        Ok(())
    }

    /// 确认收货前的状态校验
    pub fn ensure_receivable(&self) -> Result<()> {
        if self.ship_status != ShipStatus::Delivered {
            return Err(OrderError::invalid_state(self.id, "发货状态不正确"));
        }
        Ok(())
    }

    /// 评价前的状态校验
    pub fn ensure_reviewable(&self) -> Result<()> {
        if !self.is_paid() {
            return Err(OrderError::invalid_state(self.id, "该订单未支付，不可评价"));
        }
        if self.reviewed {
            return Err(OrderError::invalid_state(self.id, "该订单已评价，不可重复提交"));
        }
        Ok(())
    }
}

/// 订单项
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    pub id: i64,
    pub order_id: i64,
    pub product_id: i64,
    pub product_sku_id: i64,
    /// 购买数量
    pub amount: i32,
    /// 下单时的单价快照（分）
    pub price: i64,
    #[sqlx(default)]
    pub rating: Option<i16>,
    #[sqlx(default)]
    pub review: Option<String>,
    #[sqlx(default)]
    pub reviewed_at: Option<DateTime<Utc>>,
}

/// 待写入的订单项
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOrderItem {
    pub product_id: i64,
    pub product_sku_id: i64,
    pub amount: i32,
    pub price: i64,
}

impl NewOrderItem {
    /// 小计金额（分）
    pub fn subtotal(&self) -> i64 {
        self.price * self.amount as i64
    }
}

/// 生成订单流水号
///
/// 格式: {yyyyMMddHHmmss}{6位随机数}，唯一性由数据库唯一索引兜底
pub fn generate_order_no(now: DateTime<Utc>) -> String {
    let random: u32 = rand::random_range(0..1_000_000);
    format!("{}{:06}", now.format("%Y%m%d%H%M%S"), random)
}

/// 生成退款单号（32 位十六进制）
pub fn generate_refund_no() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_order() -> Order {
        let now = Utc::now();
        Order {
            id: 1,
            no: "20260101120000000001".to_string(),
            user_id: 7,
            address: Json(AddressSnapshot {
                address: "上海市浦东新区世纪大道 1 号".to_string(),
                zip: "200120".to_string(),
                contact_name: "张三".to_string(),
                contact_phone: "13800000000".to_string(),
            }),
            remark: None,
            total_amount: 100_00,
            order_type: OrderType::Normal,
            paid_at: None,
            payment_method: None,
            payment_no: None,
            closed: false,
            ship_status: ShipStatus::Pending,
            ship_data: None,
            refund_status: RefundStatus::Pending,
            refund_no: None,
            reviewed: false,
            extra: Json(OrderExtra::default()),
            coupon_code_id: None,
            expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_generate_order_no_format() {
        let now = Utc::now();
        let no = generate_order_no(now);
        assert_eq!(no.len(), 20);
        assert!(no.chars().all(|c| c.is_ascii_digit()));
        assert!(no.starts_with(&now.format("%Y%m%d%H%M%S").to_string()));
    }

    #[test]
    fn test_generate_refund_no_unique() {
        let a = generate_refund_no();
        let b = generate_refund_no();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }

    #[test]
    fn test_ensure_payable() {
        let mut order = sample_order();
        assert!(order.ensure_payable().is_ok());

        order.closed = true;
        assert!(matches!(
            order.ensure_payable(),
            Err(OrderError::InvalidOrderState { .. })
        ));

        order.closed = false;
        order.paid_at = Some(Utc::now());
        assert!(order.ensure_payable().is_err());
    }

    #[test]
    fn test_ensure_refund_applicable() {
        let mut order = sample_order();
        // 未支付
        assert!(order.ensure_refund_applicable().is_err());

        order.paid_at = Some(Utc::now());
        assert!(order.ensure_refund_applicable().is_ok());

        order.order_type = OrderType::Crowdfunding;
        assert!(order.ensure_refund_applicable().is_err());

        order.order_type = OrderType::Normal;
        order.refund_status = RefundStatus::Applied;
        assert!(order.ensure_refund_applicable().is_err());
    }

    #[test]
    fn test_ship_and_review_guards() {
        let mut order = sample_order();
        assert!(order.ensure_shippable().is_err());
        assert!(order.ensure_reviewable().is_err());
        assert!(order.ensure_receivable().is_err());

        order.paid_at = Some(Utc::now());
        assert!(order.ensure_shippable().is_ok());
        assert!(order.ensure_reviewable().is_ok());

        order.ship_status = ShipStatus::Delivered;
        assert!(order.ensure_shippable().is_err());
        assert!(order.ensure_receivable().is_ok());

        order.reviewed = true;
        assert!(order.ensure_reviewable().is_err());
    }

    #[test]
    fn test_ensure_owned_by() {
        let order = sample_order();
        assert!(order.ensure_owned_by(7).is_ok());
        assert!(matches!(order.ensure_owned_by(8), Err(OrderError::NotOwner(1))));
    }

    #[test]
    fn test_order_extra_skips_empty_fields() {
        let extra = OrderExtra {
            refund_reason: Some("不想要了".to_string()),
            ..Default::default()
        };
        let json = serde_json::to_value(&extra).unwrap();
        assert_eq!(json, serde_json::json!({"refundReason": "不想要了"}));

        let parsed: OrderExtra = serde_json::from_str("{}").unwrap();
        assert_eq!(parsed, OrderExtra::default());
    }

    #[test]
    fn test_new_order_item_subtotal() {
        let item = NewOrderItem {
            product_id: 1,
            product_sku_id: 2,
            amount: 3,
            price: 19_99,
        };
        assert_eq!(item.subtotal(), 59_97);
    }
}
