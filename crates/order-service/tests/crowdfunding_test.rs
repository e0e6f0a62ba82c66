//! 众筹结算集成测试
//!
//! 测试中不运行事件消费者，`total_amount` 缓存列保持初始值，
//! 结算结果完全取决于已支付订单的实时汇总。
//!
//! ## 运行方式
//!
//! ```bash
//! DATABASE_URL=postgres://... cargo test -p order-service --test crowdfunding_test -- --ignored
//! ```

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use order_engine::dto::CrowdfundingOrderRequest;
use order_engine::gateway::RefundResponse;
use order_engine::repository::{InstallmentRepository, OrderRepository, ProductRepository};
use order_engine::worker::CrowdfundingWorker;
use order_engine::{CrowdfundingStatus, Order, PaymentMethod, RefundStatus};
use sqlx::PgPool;
use tokio::sync::Mutex;

/// 结算会处理所有到期活动，同一文件内的测试串行执行
static SETTLEMENT: Mutex<()> = Mutex::const_new(());

const TARGET: i64 = 1000_00;
const PRICE: i64 = 100_00;

/// 创建目标金额为 1000 元、单价 100 元的众筹活动，返回 (商品 ID, SKU ID)
async fn campaign(pool: &PgPool) -> (i64, i64) {
    let (product_id, sku_id) = seed_sku(pool, "crowdfunding", PRICE, 100).await;
    seed_campaign(pool, product_id, TARGET).await;
    (product_id, sku_id)
}

async fn place_order(pool: &PgPool, sku_id: i64, amount: i32) -> Order {
    let user_id = unique_user_id();
    let address_id = seed_address(pool, user_id).await;
    order_service(pool)
        .crowdfunding(
            user_id,
            CrowdfundingOrderRequest {
                address_id,
                sku_id,
                amount,
            },
        )
        .await
        .unwrap()
}

async fn pay(pool: &PgPool, stub: Arc<StubGateway>, order: &Order) {
    payment_service(pool, registry_with(stub))
        .reconcile(&order.no, PaymentMethod::Alipay, &format!("CF-{}", order.id))
        .await
        .unwrap();
}

async fn end_campaign(pool: &PgPool, product_id: i64) {
    sqlx::query(
        "UPDATE crowdfunding_products SET end_at = NOW() - INTERVAL '1 second' WHERE product_id = $1",
    )
    .bind(product_id)
    .execute(pool)
    .await
    .unwrap();
}

async fn campaign_status(pool: &PgPool, product_id: i64) -> CrowdfundingStatus {
    ProductRepository::new(pool.clone())
        .get_crowdfunding(product_id)
        .await
        .unwrap()
        .unwrap()
        .status
}

async fn refund_status(pool: &PgPool, order_id: i64) -> RefundStatus {
    OrderRepository::new(pool.clone())
        .find_by_id(order_id)
        .await
        .unwrap()
        .unwrap()
        .refund_status
}

fn worker(
    pool: &PgPool,
    stub: Arc<StubGateway>,
) -> CrowdfundingWorker<OrderRepository, InstallmentRepository> {
    let refunds = Arc::new(refund_service(pool, registry_with(stub)));
    CrowdfundingWorker::new(pool.clone(), refunds, "0 * * * * *", 100).unwrap()
}

/// 等待后台退款任务把订单推进到 success
async fn wait_refunded(pool: &PgPool, order_id: i64) -> bool {
    for _ in 0..50 {
        if refund_status(pool, order_id).await == RefundStatus::Success {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

#[tokio::test]
#[ignore = "需要 PostgreSQL"]
async fn test_settlement_uses_paid_orders_not_cached_total() {
    let _serial = SETTLEMENT.lock().await;
    let pool = setup_pool().await;
    let stub = Arc::new(StubGateway::new(PaymentMethod::Alipay, RefundResponse::Succeeded));

    // 800 / 1000：一笔已支付订单
    let (failed_product, failed_sku) = campaign(&pool).await;
    let underfunded = place_order(&pool, failed_sku, 8).await;
    pay(&pool, stub.clone(), &underfunded).await;

    // 1200 / 1000：两位买家各一笔，另有一笔未支付订单不计入
    let (funded_product, funded_sku) = campaign(&pool).await;
    let first = place_order(&pool, funded_sku, 7).await;
    let second = place_order(&pool, funded_sku, 5).await;
    let _unpaid = place_order(&pool, funded_sku, 3).await;
    pay(&pool, stub.clone(), &first).await;
    pay(&pool, stub.clone(), &second).await;

    end_campaign(&pool, failed_product).await;
    end_campaign(&pool, funded_product).await;

    let worker = worker(&pool, stub.clone());
    let report = worker.settle_due().await.unwrap();
    assert!(report.failed.contains(&failed_product));
    assert!(report.succeeded.contains(&funded_product));

    assert_eq!(campaign_status(&pool, failed_product).await, CrowdfundingStatus::Fail);
    assert_eq!(campaign_status(&pool, funded_product).await, CrowdfundingStatus::Success);

    let funded = ProductRepository::new(pool.clone())
        .get_crowdfunding(funded_product)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(funded.total_amount, 1200_00);
    assert_eq!(funded.user_count, 2);

    assert!(
        wait_refunded(&pool, underfunded.id).await,
        "underfunded campaign order should be refunded"
    );
    assert_eq!(refund_status(&pool, first.id).await, RefundStatus::Pending);
    assert_eq!(refund_status(&pool, second.id).await, RefundStatus::Pending);
    assert!(stub.refund_calls() >= 1);

    // 已结算的活动不会被再次结算
    let report = worker.settle_due().await.unwrap();
    assert!(!report.failed.contains(&failed_product));
    assert!(!report.succeeded.contains(&funded_product));
    assert!(!report.retried.contains(&failed_product));
}

#[tokio::test]
#[ignore = "需要 PostgreSQL"]
async fn test_payment_after_failed_settlement_is_refunded_next_round() {
    let _serial = SETTLEMENT.lock().await;
    let pool = setup_pool().await;
    let stub = Arc::new(StubGateway::new(PaymentMethod::Alipay, RefundResponse::Succeeded));

    let (product_id, sku_id) = campaign(&pool).await;
    let order = place_order(&pool, sku_id, 1).await;
    end_campaign(&pool, product_id).await;

    let worker = worker(&pool, stub.clone());
    let report = worker.settle_due().await.unwrap();
    assert!(report.failed.contains(&product_id));
    assert_eq!(campaign_status(&pool, product_id).await, CrowdfundingStatus::Fail);

    // 截止前发起的支付在结算之后才回调
    pay(&pool, stub.clone(), &order).await;
    assert_eq!(refund_status(&pool, order.id).await, RefundStatus::Pending);

    let mut retried = false;
    for _ in 0..50 {
        let report = worker.settle_due().await.unwrap();
        assert!(!report.failed.contains(&product_id));
        retried |= report.retried.contains(&product_id);
        if refund_status(&pool, order.id).await == RefundStatus::Success {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    assert!(retried);
    assert_eq!(refund_status(&pool, order.id).await, RefundStatus::Success);
    assert!(stub.refund_calls() >= 1);
}
