//! 订单服务领域模型
//!
//! 包含订单、商品、优惠券、分期与众筹的核心实体定义

pub mod address;
pub mod coupon;
pub mod enums;
pub mod installment;
pub mod order;
pub mod product;

// 重新导出常用类型
pub use address::UserAddress;
pub use coupon::CouponCode;
pub use enums::{
    CouponType, CrowdfundingStatus, InstallmentStatus, ItemRefundStatus, OrderType,
    PaymentMethod, RefundMode, RefundStatus, ShipStatus,
};
pub use installment::{Installment, InstallmentItem, NewInstallmentItem};
pub use order::{AddressSnapshot, NewOrderItem, Order, OrderExtra, OrderItem, ShipData};
pub use product::{CrowdfundingProduct, Product, ProductSku, SkuWithProduct};
