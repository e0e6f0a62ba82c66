//! 支付网关注册表
//!
//! 按支付方式索引 [`PaymentGateway`] 实例。分期付款没有独立网关，
//! 其每一期通过真实网关（alipay / wechat）支付与退款。
//!
//! ```ignore
//! let mut registry = GatewayRegistry::new();
//! registry.register(Arc::new(HttpPaymentGateway::new(PaymentMethod::Alipay, &config)?));
//! let gateway = registry.resolve(PaymentMethod::Alipay)?;
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use shop_shared::config::GatewaysConfig;
use tracing::{debug, info};

use super::{HttpPaymentGateway, PaymentGateway};
use crate::error::{OrderError, Result};
use crate::models::PaymentMethod;

/// 支付网关注册表
pub struct GatewayRegistry {
    gateways: HashMap<PaymentMethod, Arc<dyn PaymentGateway>>,
}

impl GatewayRegistry {
    /// 创建空的注册表
    pub fn new() -> Self {
        Self {
            gateways: HashMap::new(),
        }
    }

    /// 注册一个网关，相同支付方式的旧网关会被替换
    pub fn register(&mut self, gateway: Arc<dyn PaymentGateway>) -> &mut Self {
        let method = gateway.method();
        debug!(method = %method, "注册支付网关");
        self.gateways.insert(method, gateway);
        self
    }

    pub fn get(&self, method: PaymentMethod) -> Option<Arc<dyn PaymentGateway>> {
        self.gateways.get(&method).cloned()
    }

    /// 获取网关，未注册时返回 `Gateway` 错误
    pub fn resolve(&self, method: PaymentMethod) -> Result<Arc<dyn PaymentGateway>> {
        self.get(method).ok_or_else(|| OrderError::Gateway {
            method,
            message: "支付网关未注册".to_string(),
        })
    }

    pub fn contains(&self, method: PaymentMethod) -> bool {
        self.gateways.contains_key(&method)
    }

    pub fn registered_methods(&self) -> Vec<PaymentMethod> {
        self.gateways.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.gateways.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gateways.is_empty()
    }

    /// 按配置注册 alipay 与 wechat 两个 HTTP 网关
    pub fn with_config(config: &GatewaysConfig) -> Result<Self> {
        let mut registry = Self::new();

        info!("使用配置初始化支付网关");

        registry.register(Arc::new(HttpPaymentGateway::new(
            PaymentMethod::Alipay,
            &config.alipay,
        )?));
        registry.register(Arc::new(HttpPaymentGateway::new(
            PaymentMethod::Wechat,
            &config.wechat,
        )?));

        info!(
            gateway_count = registry.len(),
            methods = ?registry.registered_methods(),
            "支付网关初始化完成"
        );

        Ok(registry)
    }
}

impl Default for GatewayRegistry {
    fn default() -> Self {
        Self::new()
    }
}
