//! 订单服务枚举类型定义
//!
//! 所有枚举都支持数据库（sqlx）和 JSON（serde）序列化，数据库中以小写字符串存储

use std::fmt;

use serde::{Deserialize, Serialize};

/// 订单类型
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
pub enum OrderType {
    /// 普通商品订单
    #[default]
    Normal,
    /// 众筹订单 - 活动失败时整体退款
    Crowdfunding,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Crowdfunding => "crowdfunding",
        }
    }
}

/// 物流状态
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
pub enum ShipStatus {
    /// 未发货
    #[default]
    Pending,
    /// 已发货
    Delivered,
    /// 已收货
    Received,
}

/// 订单退款状态
///
/// 状态迁移：
/// - pending -> applied（用户申请）
/// - applied -> pending（运营拒绝）
/// - applied -> processing | success | failed（运营同意后按网关分派）
/// - processing -> success | failed（异步退款回调）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
pub enum RefundStatus {
    /// 未退款
    #[default]
    Pending,
    /// 已申请，等待处理
    Applied,
    /// 退款中
    Processing,
    /// 退款成功
    Success,
    /// 退款失败
    Failed,
}

impl RefundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Applied => "applied",
            Self::Processing => "processing",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    /// 检查状态迁移是否合法
    pub fn can_transition_to(&self, next: RefundStatus) -> bool {
        use RefundStatus::*;
        matches!(
            (self, next),
            (Pending, Applied)
                | (Applied, Pending)
                | (Applied, Processing)
                | (Applied, Success)
                | (Applied, Failed)
                | (Processing, Success)
                | (Processing, Failed)
        )
    }
}

/// 支付方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
pub enum PaymentMethod {
    Alipay,
    Wechat,
    /// 分期付款，各期通过真实网关支付
    Installment,
}

/// 退款模式
///
/// 同步网关在退款接口中直接返回最终结果；异步网关只受理请求，结果通过回调通知
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefundMode {
    Synchronous,
    Asynchronous,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Alipay => "alipay",
            Self::Wechat => "wechat",
            Self::Installment => "installment",
        }
    }

    /// 网关退款模式；分期没有自己的网关，返回 None
    pub fn refund_mode(&self) -> Option<RefundMode> {
        match self {
            Self::Alipay => Some(RefundMode::Synchronous),
            Self::Wechat => Some(RefundMode::Asynchronous),
            Self::Installment => None,
        }
    }

    /// 是否为可直接调用的支付网关
    pub fn is_gateway(&self) -> bool {
        self.refund_mode().is_some()
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PaymentMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "alipay" => Ok(Self::Alipay),
            "wechat" => Ok(Self::Wechat),
            "installment" => Ok(Self::Installment),
            other => Err(format!("未知的支付方式: {}", other)),
        }
    }
}

/// 分期计划状态
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
pub enum InstallmentStatus {
    /// 未开始还款
    #[default]
    Pending,
    /// 还款中（首期已支付）
    Repaying,
    /// 已结清
    Finished,
}

/// 分期还款项的退款状态
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
pub enum ItemRefundStatus {
    /// 未退款
    #[default]
    Pending,
    Processing,
    Success,
    Failed,
}

/// 众筹活动状态，只会离开 funding 一次
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
pub enum CrowdfundingStatus {
    /// 众筹中
    #[default]
    Funding,
    /// 众筹成功
    Success,
    /// 众筹失败
    Fail,
}

/// 优惠券类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
pub enum CouponType {
    /// 固定金额减免
    Fixed,
    /// 按百分比折扣
    Percent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refund_status_transitions() {
        use RefundStatus::*;
        assert!(Pending.can_transition_to(Applied));
        assert!(Applied.can_transition_to(Pending));
        assert!(Applied.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Success));
        assert!(Processing.can_transition_to(Failed));

        assert!(!Pending.can_transition_to(Success));
        assert!(!Success.can_transition_to(Applied));
        assert!(!Failed.can_transition_to(Processing));
        assert!(!Processing.can_transition_to(Pending));
    }

    #[test]
    fn test_payment_method_refund_mode() {
        assert_eq!(
            PaymentMethod::Alipay.refund_mode(),
            Some(RefundMode::Synchronous)
        );
        assert_eq!(
            PaymentMethod::Wechat.refund_mode(),
            Some(RefundMode::Asynchronous)
        );
        assert_eq!(PaymentMethod::Installment.refund_mode(), None);
        assert!(!PaymentMethod::Installment.is_gateway());
    }

    #[test]
    fn test_payment_method_parse() {
        assert_eq!("alipay".parse::<PaymentMethod>(), Ok(PaymentMethod::Alipay));
        assert_eq!("WECHAT".parse::<PaymentMethod>(), Ok(PaymentMethod::Wechat));
        assert!("paypal".parse::<PaymentMethod>().is_err());
    }

    #[test]
    fn test_enum_serialization() {
        let json = serde_json::to_string(&RefundStatus::Processing).unwrap();
        assert_eq!(json, "\"PROCESSING\"");

        let parsed: CrowdfundingStatus = serde_json::from_str("\"FAIL\"").unwrap();
        assert_eq!(parsed, CrowdfundingStatus::Fail);
    }
}
