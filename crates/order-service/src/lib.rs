//! 订单与支付生命周期引擎
//!
//! 负责订单从创建到完结的全部状态流转。
//!
//! ## 核心功能
//!
//! - **下单**：普通订单与众筹订单，事务内扣减库存、占用优惠券
//! - **支付对账**：幂等处理网关回调，支持整单支付与分期还款
//! - **退款**：申请、审核、按支付方式分派退款，处理异步退款回调
//! - **分期**：生成还款计划，按期序号推进计划状态
//! - **众筹结算**：到期活动按已筹金额结算，失败活动批量退款
//! - **过期关闭**：延迟队列与数据库兜底扫描关闭超时未支付订单
//! - **履约**：发货、确认收货、评价
//!
//! ## 模块结构
//!
//! - `models`: 领域模型定义
//! - `error`: 错误类型定义
//! - `repository`: 数据库仓储层
//! - `gateway`: 支付网关抽象与 HTTP 实现
//! - `service`: 业务服务层
//! - `webhook`: 网关回调处理
//! - `events`: 进程内事件总线
//! - `worker`: 后台任务
//! - `app`: 服务装配

pub mod app;
pub mod error;
pub mod events;
pub mod gateway;
pub mod models;
pub mod repository;
pub mod service;
pub mod webhook;
pub mod worker;

pub use app::OrderEngine;
pub use error::{OrderError, Result};
pub use events::{EventBus, EventListener, OrderEvent, OrderPaid, OrderReviewed};
pub use gateway::{GatewayRegistry, HttpPaymentGateway, PaymentGateway, WebhookAck};
pub use models::*;
pub use service::{
    FulfillmentService, InstallmentService, OrderService, PaymentService, RefundService, dto,
};
pub use webhook::{WebhookHandler, WebhookResponse};
pub use worker::{CrowdfundingWorker, ExpiryWorker};
