//! 共享库
//!
//! 包含订单服务使用的配置、错误处理、数据库连接、延迟队列、重试与可观测性等基础设施代码。

pub mod config;
pub mod database;
pub mod delay_queue;
pub mod error;
pub mod observability;
pub mod retry;
