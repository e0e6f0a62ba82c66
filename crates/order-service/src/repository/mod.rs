//! 数据库仓储层
//!
//! 提供所有实体的数据访问接口，封装 SQL 操作细节。
//!
//! ## 设计原则
//!
//! - 仓储只负责数据持久化，不包含业务逻辑
//! - 状态迁移使用条件更新，由数据库裁决并发
//! - 事务控制由调用方（服务层）决定，事务内操作以 `*_in_tx` 命名
//! - 定义 trait 接口以支持 mock 测试

mod address_repo;
mod cart_repo;
mod coupon_repo;
mod installment_repo;
mod order_repo;
mod product_repo;
mod traits;

pub use address_repo::AddressRepository;
pub use cart_repo::CartRepository;
pub use coupon_repo::CouponRepository;
pub use installment_repo::InstallmentRepository;
pub use order_repo::{NewOrder, OrderRepository};
pub use product_repo::ProductRepository;
pub use traits::*;
