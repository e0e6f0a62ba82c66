//! 集成测试公共辅助
//!
//! 需要真实 PostgreSQL，通过 `DATABASE_URL` 指定。
//! 每个测试插入自己的商品、地址与优惠券（自增 ID），互不干扰。

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use order_engine::error::Result;
use order_engine::gateway::{
    ChargeRequest, ChargeResponse, PaymentNotification, RefundNotification, RefundRequest,
    RefundResponse, WebhookAck,
};
use order_engine::{
    GatewayRegistry, InstallmentService, OrderService, PaymentGateway, PaymentMethod,
    PaymentService, RefundService,
};
use order_engine::repository::{CouponRepository, InstallmentRepository, OrderRepository};
use shop_shared::config::OrderConfig;
use shop_shared::database::MIGRATOR;
use sqlx::PgPool;
use uuid::Uuid;

pub type Payments = PaymentService<OrderRepository, InstallmentRepository>;
pub type Refunds = RefundService<OrderRepository, InstallmentRepository>;

pub fn database_url() -> String {
    std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for integration tests")
}

/// 连接数据库并执行迁移
pub async fn setup_pool() -> PgPool {
    let pool = PgPool::connect(&database_url())
        .await
        .expect("连接测试数据库失败");
    MIGRATOR.run(&pool).await.expect("执行迁移失败");
    pool
}

/// 生成不重复的测试用户 ID
pub fn unique_user_id() -> i64 {
    (Uuid::new_v4().as_u128() % 1_000_000_000) as i64 + 1_000_000
}

pub async fn seed_address(pool: &PgPool, user_id: i64) -> i64 {
    sqlx::query_scalar(
        r#"
        INSERT INTO user_addresses (user_id, province, city, district, address, zip,
                                    contact_name, contact_phone)
        VALUES ($1, '上海市', '上海市', '浦东新区', '世纪大道 1 号', '200120', '测试用户', '13800000000')
        RETURNING id
        "#,
    )
    .bind(user_id)
    .fetch_one(pool)
    .await
    .expect("插入测试地址失败")
}

/// 插入商品与单个 SKU，返回 (product_id, sku_id)
pub async fn seed_sku(pool: &PgPool, product_type: &str, price: i64, stock: i32) -> (i64, i64) {
    let product_id: i64 = sqlx::query_scalar(
        "INSERT INTO products (type, title, on_sale, price) VALUES ($1, '集成测试商品', true, $2) RETURNING id",
    )
    .bind(product_type)
    .bind(price)
    .fetch_one(pool)
    .await
    .expect("插入测试商品失败");

    let sku_id: i64 = sqlx::query_scalar(
        "INSERT INTO product_skus (product_id, title, price, stock) VALUES ($1, '默认规格', $2, $3) RETURNING id",
    )
    .bind(product_id)
    .bind(price)
    .bind(stock)
    .fetch_one(pool)
    .await
    .expect("插入测试 SKU 失败");

    (product_id, sku_id)
}

/// 插入众筹活动，截止时间为一小时后
pub async fn seed_campaign(pool: &PgPool, product_id: i64, target_amount: i64) -> i64 {
    sqlx::query_scalar(
        r#"
        INSERT INTO crowdfunding_products (product_id, target_amount, end_at, status)
        VALUES ($1, $2, NOW() + INTERVAL '1 hour', 'funding')
        RETURNING id
        "#,
    )
    .bind(product_id)
    .bind(target_amount)
    .fetch_one(pool)
    .await
    .expect("插入众筹活动失败")
}

/// 插入固定金额优惠券，返回券码
pub async fn seed_coupon(pool: &PgPool, value: i64, total: i32, min_amount: i64) -> String {
    let code = format!("IT{}", &Uuid::new_v4().simple().to_string()[..16]).to_uppercase();
    sqlx::query(
        r#"
        INSERT INTO coupon_codes (name, code, type, value, total, used, min_amount, enabled)
        VALUES ('集成测试券', $1, 'fixed', $2, $3, 0, $4, true)
        "#,
    )
    .bind(&code)
    .bind(value)
    .bind(total)
    .bind(min_amount)
    .execute(pool)
    .await
    .expect("插入测试优惠券失败");
    code
}

pub async fn stock_of(pool: &PgPool, sku_id: i64) -> i32 {
    sqlx::query_scalar("SELECT stock FROM product_skus WHERE id = $1")
        .bind(sku_id)
        .fetch_one(pool)
        .await
        .expect("查询库存失败")
}

pub async fn coupon_used(pool: &PgPool, code: &str) -> i32 {
    sqlx::query_scalar("SELECT used FROM coupon_codes WHERE code = $1")
        .bind(code)
        .fetch_one(pool)
        .await
        .expect("查询优惠券失败")
}

/// 同步返回固定结果的测试网关
pub struct StubGateway {
    method: PaymentMethod,
    refund: RefundResponse,
    refund_calls: AtomicUsize,
}

impl StubGateway {
    pub fn new(method: PaymentMethod, refund: RefundResponse) -> Self {
        Self {
            method,
            refund,
            refund_calls: AtomicUsize::new(0),
        }
    }

    pub fn refund_calls(&self) -> usize {
        self.refund_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentGateway for StubGateway {
    fn method(&self) -> PaymentMethod {
        self.method
    }

    async fn initiate(&self, request: ChargeRequest) -> Result<ChargeResponse> {
        Ok(ChargeResponse {
            method: self.method,
            out_trade_no: request.out_trade_no,
            payload: serde_json::json!({ "amount": request.total_amount }),
        })
    }

    fn verify_payment(&self, body: &str) -> Result<PaymentNotification> {
        Err(order_engine::OrderError::InvalidSignature(body.to_string()))
    }

    fn verify_refund(&self, body: &str) -> Result<RefundNotification> {
        Err(order_engine::OrderError::InvalidSignature(body.to_string()))
    }

    async fn refund(&self, _request: RefundRequest) -> Result<RefundResponse> {
        self.refund_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.refund.clone())
    }

    fn ack_body(&self, ack: WebhookAck) -> String {
        ack.as_str().to_string()
    }
}

pub fn registry_with(gateway: Arc<StubGateway>) -> Arc<GatewayRegistry> {
    let mut registry = GatewayRegistry::new();
    registry.register(gateway);
    Arc::new(registry)
}

pub fn order_service(pool: &PgPool) -> OrderService<CouponRepository> {
    OrderService::new(
        Arc::new(CouponRepository::new(pool.clone())),
        pool.clone(),
        OrderConfig::default(),
    )
}

pub fn payment_service(pool: &PgPool, gateways: Arc<GatewayRegistry>) -> Payments {
    PaymentService::new(
        Arc::new(OrderRepository::new(pool.clone())),
        Arc::new(InstallmentRepository::new(pool.clone())),
        gateways,
        pool.clone(),
        "https://shop.example.com/payment/notify",
    )
}

pub fn refund_service(pool: &PgPool, gateways: Arc<GatewayRegistry>) -> Refunds {
    RefundService::new(
        Arc::new(OrderRepository::new(pool.clone())),
        Arc::new(InstallmentRepository::new(pool.clone())),
        gateways,
        "https://shop.example.com/refund/notify",
    )
}

pub fn installment_service(pool: &PgPool) -> InstallmentService<OrderRepository> {
    InstallmentService::new(
        Arc::new(OrderRepository::new(pool.clone())),
        pool.clone(),
        OrderConfig::default(),
    )
}
