//! 支付网关抽象
//!
//! 将第三方支付渠道建模为不透明的外部服务：发起支付、校验回调、发起退款。
//! 业务层只依赖 [`PaymentGateway`] trait，通过 [`GatewayRegistry`] 按支付方式路由。
//!
//! ## 退款模式
//!
//! - 同步网关（alipay）：退款接口直接返回最终结果
//! - 异步网关（wechat）：退款接口只受理，结果通过退款回调通知

mod http;
mod registry;

pub use http::{HttpPaymentGateway, sign_params};
pub use registry::GatewayRegistry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::{PaymentMethod, RefundMode};

/// 发起支付请求
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargeRequest {
    /// 商户订单号：订单流水号或 `{分期流水号}_{期序号}`
    pub out_trade_no: String,
    /// 支付金额（分）
    pub total_amount: i64,
    pub subject: String,
    pub notify_url: String,
}

/// 发起支付结果，payload 原样交给客户端拉起支付
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargeResponse {
    pub method: PaymentMethod,
    pub out_trade_no: String,
    pub payload: serde_json::Value,
}

/// 网关回调中的交易状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeStatus {
    /// 支付成功（终态）
    Success,
    /// 交易完结，不可再退款（终态，同样表示已付款）
    Finished,
    /// 等待付款等中间状态
    Pending,
    /// 交易关闭
    Closed,
}

impl TradeStatus {
    /// 是否表示买家已经付款
    pub fn is_paid(&self) -> bool {
        matches!(self, Self::Success | Self::Finished)
    }
}

/// 已验签的支付回调
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentNotification {
    pub out_trade_no: String,
    /// 网关交易号
    pub trade_no: String,
    pub trade_status: TradeStatus,
}

/// 发起退款请求
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundRequest {
    /// 原支付的商户订单号
    pub out_trade_no: String,
    /// 退款单号，同一单号重复提交网关侧幂等
    pub refund_no: String,
    /// 原支付金额（分）
    pub total_amount: i64,
    /// 退款金额（分）
    pub refund_amount: i64,
    /// 异步网关的退款结果回调地址
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notify_url: Option<String>,
}

/// 网关对退款请求的答复
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefundResponse {
    /// 退款已完成
    Succeeded,
    /// 网关拒绝退款
    Failed { code: String },
    /// 已受理，结果稍后回调
    Accepted,
}

/// 已验签的退款回调
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundNotification {
    /// 退款单号：订单退款单号或 `{订单退款单号}_{期序号}`
    pub refund_no: String,
    pub success: bool,
    pub failure_code: Option<String>,
}

/// 回调应答
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookAck {
    /// 已处理（或无需处理），网关停止重推
    Success,
    /// 处理失败，网关稍后重推
    Fail,
}

impl WebhookAck {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Fail => "fail",
        }
    }
}

/// 支付网关 Trait
///
/// 每种支付方式（除分期外）提供一个实现，由 [`GatewayRegistry`] 统一管理。
/// 实现需要保证：同一 `out_trade_no` / `refund_no` 重复请求在网关侧幂等。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// 此网关对应的支付方式
    fn method(&self) -> PaymentMethod;

    /// 退款模式，默认由支付方式决定
    fn refund_mode(&self) -> RefundMode {
        self.method()
            .refund_mode()
            .unwrap_or(RefundMode::Asynchronous)
    }

    /// 发起支付
    async fn initiate(&self, request: ChargeRequest) -> Result<ChargeResponse>;

    /// 校验支付回调并解析，签名不合法返回 `InvalidSignature`
    fn verify_payment(&self, body: &str) -> Result<PaymentNotification>;

    /// 校验退款回调并解析
    fn verify_refund(&self, body: &str) -> Result<RefundNotification>;

    /// 发起退款；网络或协议错误返回 `Err`，业务拒绝返回 `RefundResponse::Failed`
    async fn refund(&self, request: RefundRequest) -> Result<RefundResponse>;

    /// 回调应答报文
    fn ack_body(&self, ack: WebhookAck) -> String;
}
