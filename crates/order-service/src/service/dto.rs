//! 服务层数据传输对象

use serde::{Deserialize, Serialize};

use crate::events::OrderPaid;

/// 下单商品
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItemRequest {
    pub sku_id: i64,
    pub amount: i32,
}

/// 普通商品下单请求
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    pub address_id: i64,
    #[serde(default)]
    pub remark: Option<String>,
    pub items: Vec<OrderItemRequest>,
    #[serde(default)]
    pub coupon_code: Option<String>,
}

/// 众筹商品下单请求
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrowdfundingOrderRequest {
    pub address_id: i64,
    pub sku_id: i64,
    pub amount: i32,
}

/// 单个订单项的评价
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewRequest {
    pub item_id: i64,
    pub rating: i16,
    pub review: String,
}

/// 发货请求
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShipRequest {
    pub express_company: String,
    pub express_no: String,
}

/// 运营对退款申请的处理
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundDecision {
    pub agree: bool,
    /// 拒绝理由，拒绝时必填
    #[serde(default)]
    pub reason: Option<String>,
}

/// 支付回调对账结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// 本次回调完成了订单支付
    Applied(OrderPaid),
    /// 分期还款项已支付（非首期，或订单已通过其他途径支付）
    InstallmentItemPaid {
        installment_id: i64,
        sequence: i32,
        /// 本次支付后计划是否已结清
        finished: bool,
    },
    /// 已处理过的重复回调，未做任何修改
    AlreadyApplied,
}

impl ReconcileOutcome {
    pub fn is_applied(&self) -> bool {
        !matches!(self, Self::AlreadyApplied)
    }

    /// 需要发布的订单支付事件
    pub fn paid_event(&self) -> Option<&OrderPaid> {
        match self {
            Self::Applied(event) => Some(event),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applied(_) | Self::InstallmentItemPaid { .. } => "applied",
            Self::AlreadyApplied => "duplicate",
        }
    }
}

/// 众筹结算汇总
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementReport {
    pub succeeded: Vec<i64>,
    pub failed: Vec<i64>,
    /// 早已失败、本轮重新分派退款的活动
    pub retried: Vec<i64>,
}

impl SettlementReport {
    pub fn is_empty(&self) -> bool {
        self.succeeded.is_empty() && self.failed.is_empty() && self.retried.is_empty()
    }

    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }
}

/// 批量退款汇总
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkRefundReport {
    pub dispatched: usize,
    pub failed: Vec<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_order_request_deserialize() {
        let json = r#"{"addressId":3,"items":[{"skuId":9,"amount":2}],"couponCode":"SAVE10"}"#;
        let request: CreateOrderRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.address_id, 3);
        assert_eq!(request.items, vec![OrderItemRequest { sku_id: 9, amount: 2 }]);
        assert_eq!(request.coupon_code.as_deref(), Some("SAVE10"));
        assert!(request.remark.is_none());
    }

    #[test]
    fn test_settlement_report() {
        let mut report = SettlementReport::default();
        assert!(report.is_empty());
        report.succeeded.push(1);
        report.failed.push(2);
        assert_eq!(report.total(), 2);

        let retried_only = SettlementReport {
            retried: vec![3],
            ..SettlementReport::default()
        };
        assert!(!retried_only.is_empty());
        assert_eq!(retried_only.total(), 0);
    }

    #[test]
    fn test_reconcile_outcome() {
        assert!(!ReconcileOutcome::AlreadyApplied.is_applied());
        assert_eq!(ReconcileOutcome::AlreadyApplied.as_str(), "duplicate");

        let item_paid = ReconcileOutcome::InstallmentItemPaid {
            installment_id: 1,
            sequence: 2,
            finished: false,
        };
        assert!(item_paid.is_applied());
        assert!(item_paid.paid_event().is_none());
    }
}
