//! 服务层
//!
//! 实现订单生命周期的业务逻辑，协调仓储层、支付网关与事件总线。
//!
//! ## 模块结构
//!
//! - `dto`: 数据传输对象定义
//! - `order_service`: 下单（普通订单、众筹订单）
//! - `payment_service`: 发起支付与支付对账
//! - `refund_service`: 退款申请、审核、分派与回调
//! - `installment_service`: 分期计划创建
//! - `fulfillment_service`: 发货、收货与评价

pub mod dto;
pub mod fulfillment_service;
pub mod installment_service;
pub mod order_service;
pub mod payment_service;
pub mod refund_service;

pub use dto::*;
pub use fulfillment_service::FulfillmentService;
pub use installment_service::InstallmentService;
pub use order_service::OrderService;
pub use payment_service::{PaymentService, PaymentTarget};
pub use refund_service::{RefundRef, RefundService, RefundTransition, request_gateway_refund};
