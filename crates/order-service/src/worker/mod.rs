//! 后台任务
//!
//! - `expiry_worker`: 超时未支付订单的关闭
//! - `crowdfunding_worker`: 到期众筹活动的结算

pub mod crowdfunding_worker;
pub mod expiry_worker;

pub use crowdfunding_worker::CrowdfundingWorker;
pub use expiry_worker::{ExpiryWorker, close_order};
