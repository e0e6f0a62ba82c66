//! 基于 HTTP JSON 的支付网关适配器
//!
//! 请求与回调报文均为扁平的字符串键值对，附带 `sign` 字段：
//! 对除 `sign` 外的非空字段按键名排序拼接为 `k1=v1&k2=v2&key={secret}`，
//! 取 SHA-256 后 base64 编码。

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use shop_shared::config::GatewayEndpointConfig;
use tracing::{debug, instrument, warn};

use super::{
    ChargeRequest, ChargeResponse, PaymentGateway, PaymentNotification, RefundNotification,
    RefundRequest, RefundResponse, TradeStatus, WebhookAck,
};
use crate::error::{OrderError, Result};
use crate::models::PaymentMethod;

const SIGN_FIELD: &str = "sign";

/// 计算报文签名
pub fn sign_params(params: &BTreeMap<String, String>, secret: &str) -> String {
    let mut payload = params
        .iter()
        .filter(|(k, v)| k.as_str() != SIGN_FIELD && !v.is_empty())
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");
    if !payload.is_empty() {
        payload.push('&');
    }
    payload.push_str("key=");
    payload.push_str(secret);

    let mut hasher = Sha256::new();
    hasher.update(payload.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// 网关接口的统一应答
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GatewayReply {
    code: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    sub_code: Option<String>,
    #[serde(default)]
    refund_status: Option<String>,
    #[serde(default)]
    data: Option<serde_json::Value>,
}

impl GatewayReply {
    fn is_success(&self) -> bool {
        self.code.eq_ignore_ascii_case("SUCCESS")
    }
}

/// 将退款接口应答映射为 [`RefundResponse`]
fn map_refund_reply(reply: &GatewayReply) -> RefundResponse {
    if !reply.is_success() {
        return RefundResponse::Failed {
            code: reply.sub_code.clone().unwrap_or_else(|| reply.code.clone()),
        };
    }

    match reply.refund_status.as_deref().map(str::to_ascii_uppercase) {
        Some(s) if s == "SUCCESS" => RefundResponse::Succeeded,
        Some(s) if s == "FAILED" || s == "CLOSED" || s == "ABNORMAL" => RefundResponse::Failed {
            code: reply.sub_code.clone().unwrap_or(s),
        },
        _ => RefundResponse::Accepted,
    }
}

fn parse_trade_status(value: &str) -> TradeStatus {
    match value.to_ascii_uppercase().as_str() {
        "SUCCESS" | "TRADE_SUCCESS" => TradeStatus::Success,
        "FINISHED" | "TRADE_FINISHED" => TradeStatus::Finished,
        "CLOSED" | "TRADE_CLOSED" => TradeStatus::Closed,
        _ => TradeStatus::Pending,
    }
}

/// HTTP 支付网关
pub struct HttpPaymentGateway {
    method: PaymentMethod,
    client: reqwest::Client,
    base_url: String,
    app_id: String,
    secret: String,
}

impl HttpPaymentGateway {
    pub fn new(method: PaymentMethod, config: &GatewayEndpointConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| OrderError::Gateway {
                method,
                message: format!("创建 HTTP 客户端失败: {}", e),
            })?;

        Ok(Self {
            method,
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            app_id: config.app_id.clone(),
            secret: config.secret.clone(),
        })
    }

    fn gateway_error(&self, message: impl Into<String>) -> OrderError {
        OrderError::Gateway {
            method: self.method,
            message: message.into(),
        }
    }

    /// 解析回调报文并校验签名
    fn verified_params(&self, body: &str) -> Result<BTreeMap<String, String>> {
        let params: BTreeMap<String, String> = serde_json::from_str(body)
            .map_err(|e| OrderError::InvalidSignature(format!("回调报文格式错误: {}", e)))?;

        let provided = params
            .get(SIGN_FIELD)
            .ok_or_else(|| OrderError::InvalidSignature("缺少签名字段".to_string()))?;

        if !signatures_match(provided, &sign_params(&params, &self.secret)) {
            warn!(method = %self.method, "回调签名不匹配");
            return Err(OrderError::InvalidSignature(format!(
                "{} 回调签名不匹配",
                self.method
            )));
        }

        Ok(params)
    }

    fn signed(&self, mut params: BTreeMap<String, String>) -> BTreeMap<String, String> {
        params.insert("app_id".to_string(), self.app_id.clone());
        let sign = sign_params(&params, &self.secret);
        params.insert(SIGN_FIELD.to_string(), sign);
        params
    }

    async fn post(&self, path: &str, params: BTreeMap<String, String>) -> Result<GatewayReply> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .json(&self.signed(params))
            .send()
            .await
            .map_err(|e| self.gateway_error(format!("请求失败: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(self.gateway_error(format!("HTTP {}", status)));
        }

        response
            .json::<GatewayReply>()
            .await
            .map_err(|e| self.gateway_error(format!("应答解析失败: {}", e)))
    }
}

fn required(params: &BTreeMap<String, String>, key: &str) -> Result<String> {
    params
        .get(key)
        .filter(|v| !v.is_empty())
        .cloned()
        .ok_or_else(|| OrderError::Validation(format!("回调缺少字段: {}", key)))
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    fn method(&self) -> PaymentMethod {
        self.method
    }

    #[instrument(skip(self, request), fields(method = %self.method, out_trade_no = %request.out_trade_no))]
    async fn initiate(&self, request: ChargeRequest) -> Result<ChargeResponse> {
        let params = BTreeMap::from([
            ("out_trade_no".to_string(), request.out_trade_no.clone()),
            ("total_amount".to_string(), request.total_amount.to_string()),
            ("subject".to_string(), request.subject),
            ("notify_url".to_string(), request.notify_url),
        ]);

        let reply = self.post("/trade/create", params).await?;
        if !reply.is_success() {
            return Err(self.gateway_error(
                reply.message.unwrap_or_else(|| reply.code.clone()),
            ));
        }

        debug!("支付单已创建");
        Ok(ChargeResponse {
            method: self.method,
            out_trade_no: request.out_trade_no,
            payload: reply.data.unwrap_or(serde_json::Value::Null),
        })
    }

    fn verify_payment(&self, body: &str) -> Result<PaymentNotification> {
        let params = self.verified_params(body)?;
        Ok(PaymentNotification {
            out_trade_no: required(&params, "out_trade_no")?,
            trade_no: required(&params, "trade_no")?,
            trade_status: parse_trade_status(&required(&params, "trade_status")?),
        })
    }

    fn verify_refund(&self, body: &str) -> Result<RefundNotification> {
        let params = self.verified_params(body)?;
        let status = required(&params, "refund_status")?;
        Ok(RefundNotification {
            refund_no: required(&params, "out_refund_no")?,
            success: status.eq_ignore_ascii_case("SUCCESS"),
            failure_code: params
                .get("failure_code")
                .filter(|v| !v.is_empty())
                .cloned()
                .or(Some(status))
                .filter(|c| !c.eq_ignore_ascii_case("SUCCESS")),
        })
    }

    #[instrument(skip(self, request), fields(method = %self.method, refund_no = %request.refund_no))]
    async fn refund(&self, request: RefundRequest) -> Result<RefundResponse> {
        let mut params = BTreeMap::from([
            ("out_trade_no".to_string(), request.out_trade_no),
            ("out_refund_no".to_string(), request.refund_no),
            ("total_amount".to_string(), request.total_amount.to_string()),
            ("refund_amount".to_string(), request.refund_amount.to_string()),
        ]);
        if let Some(notify_url) = request.notify_url {
            params.insert("notify_url".to_string(), notify_url);
        }

        let reply = self.post("/trade/refund", params).await?;
        let response = map_refund_reply(&reply);
        debug!(response = ?response, "网关退款应答");
        Ok(response)
    }

    fn ack_body(&self, ack: WebhookAck) -> String {
        match self.method {
            PaymentMethod::Wechat => {
                let (code, message) = match ack {
                    WebhookAck::Success => ("SUCCESS", "成功"),
                    WebhookAck::Fail => ("FAIL", "失败"),
                };
                serde_json::json!({ "code": code, "message": message }).to_string()
            }
            _ => ack.as_str().to_string(),
        }
    }
}

/// 比较两个签名的 SHA-256 摘要，耗时与首个不同字节的位置无关
fn signatures_match(provided: &str, expected: &str) -> bool {
    let provided = Sha256::digest(provided.as_bytes());
    let expected = Sha256::digest(expected.as_bytes());
    provided
        .iter()
        .zip(expected.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}
