//! 订单服务错误类型
//!
//! 定义服务层的业务错误和系统错误

use thiserror::Error;

use crate::models::PaymentMethod;

/// 订单服务错误类型
#[derive(Debug, Error)]
pub enum OrderError {
    // === 请求与状态错误 ===
    #[error("参数校验失败: {0}")]
    Validation(String),

    #[error("订单状态不允许此操作: order_id={order_id}, {reason}")]
    InvalidOrderState { order_id: i64, reason: String },

    #[error("商品库存不足: sku_id={sku_id}")]
    InsufficientStock { sku_id: i64 },

    #[error("优惠券不可用: {0}")]
    CouponUnavailable(String),

    #[error("无权操作该订单: order_id={0}")]
    NotOwner(i64),

    // === 资源不存在 ===
    #[error("订单不存在: {0}")]
    OrderNotFound(String),

    #[error("商品 SKU 不存在: {0}")]
    SkuNotFound(i64),

    #[error("优惠券不存在: {0}")]
    CouponNotFound(String),

    #[error("收货地址不存在: {0}")]
    AddressNotFound(i64),

    #[error("分期计划不存在: {0}")]
    InstallmentNotFound(String),

    #[error("众筹活动不存在: product_id={0}")]
    CampaignNotFound(i64),

    // === 支付网关错误 ===
    #[error("未知的支付方式: order_id={0}")]
    UnknownPaymentMethod(i64),

    #[error("支付网关调用失败: {method}, {message}")]
    Gateway {
        method: PaymentMethod,
        message: String,
    },

    #[error("回调签名校验失败: {0}")]
    InvalidSignature(String),

    // === 系统错误 ===
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON 序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("基础设施错误: {0}")]
    Infrastructure(#[from] shop_shared::error::ShopError),

    #[error("内部错误: {0}")]
    Internal(String),

    #[error("并发冲突，请重试")]
    ConcurrencyConflict,
}

/// 订单服务 Result 类型别名
pub type Result<T> = std::result::Result<T, OrderError>;

impl OrderError {
    /// 便捷构造：订单状态不符
    pub fn invalid_state(order_id: i64, reason: impl Into<String>) -> Self {
        Self::InvalidOrderState {
            order_id,
            reason: reason.into(),
        }
    }

    /// 检查是否为可重试的错误
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Database(_) | Self::ConcurrencyConflict => true,
            Self::Infrastructure(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// 检查是否为业务错误（非系统错误）
    pub fn is_business_error(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::InvalidOrderState { .. }
                | Self::InsufficientStock { .. }
                | Self::CouponUnavailable(_)
                | Self::NotOwner(_)
        )
    }

    /// 检查是否为资源不存在错误
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::OrderNotFound(_)
                | Self::SkuNotFound(_)
                | Self::CouponNotFound(_)
                | Self::AddressNotFound(_)
                | Self::InstallmentNotFound(_)
                | Self::CampaignNotFound(_)
        )
    }

    /// 获取错误码（用于 API 响应）
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::InvalidOrderState { .. } => "INVALID_ORDER_STATE",
            Self::InsufficientStock { .. } => "INSUFFICIENT_STOCK",
            Self::CouponUnavailable(_) => "COUPON_UNAVAILABLE",
            Self::NotOwner(_) => "NOT_OWNER",
            Self::OrderNotFound(_) => "ORDER_NOT_FOUND",
            Self::SkuNotFound(_) => "SKU_NOT_FOUND",
            Self::CouponNotFound(_) => "COUPON_NOT_FOUND",
            Self::AddressNotFound(_) => "ADDRESS_NOT_FOUND",
            Self::InstallmentNotFound(_) => "INSTALLMENT_NOT_FOUND",
            Self::CampaignNotFound(_) => "CAMPAIGN_NOT_FOUND",
            Self::UnknownPaymentMethod(_) => "UNKNOWN_PAYMENT_METHOD",
            Self::Gateway { .. } => "GATEWAY_ERROR",
            Self::InvalidSignature(_) => "INVALID_SIGNATURE",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Infrastructure(e) => e.code(),
            Self::Internal(_) => "INTERNAL_ERROR",
            Self::ConcurrencyConflict => "CONCURRENCY_CONFLICT",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_is_retryable() {
        assert!(OrderError::ConcurrencyConflict.is_retryable());
        assert!(OrderError::Database(sqlx::Error::PoolTimedOut).is_retryable());
        assert!(!OrderError::OrderNotFound("20260101000000123456".to_string()).is_retryable());
        assert!(!OrderError::InsufficientStock { sku_id: 1 }.is_retryable());
    }

    #[test]
    fn test_error_is_business_error() {
        assert!(OrderError::InsufficientStock { sku_id: 1 }.is_business_error());
        assert!(OrderError::invalid_state(1, "订单已支付").is_business_error());
        assert!(!OrderError::Internal("panic".to_string()).is_business_error());
        assert!(!OrderError::UnknownPaymentMethod(1).is_business_error());
        assert!(!OrderError::ConcurrencyConflict.is_business_error());
    }

    #[test]
    fn test_error_is_not_found() {
        assert!(OrderError::SkuNotFound(9).is_not_found());
        assert!(OrderError::CampaignNotFound(3).is_not_found());
        assert!(!OrderError::NotOwner(1).is_not_found());
    }

    #[test]
    fn test_error_code() {
        assert_eq!(
            OrderError::InsufficientStock { sku_id: 1 }.error_code(),
            "INSUFFICIENT_STOCK"
        );
        assert_eq!(
            OrderError::Gateway {
                method: PaymentMethod::Wechat,
                message: "timeout".to_string()
            }
            .error_code(),
            "GATEWAY_ERROR"
        );
        assert_eq!(
            OrderError::ConcurrencyConflict.error_code(),
            "CONCURRENCY_CONFLICT"
        );
    }

    #[test]
    fn test_error_display() {
        let err = OrderError::invalid_state(42, "订单已关闭");
        assert_eq!(err.to_string(), "订单状态不允许此操作: order_id=42, 订单已关闭");
    }
}
