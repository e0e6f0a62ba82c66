//! 分期付款实体定义
//!
//! 一笔分期计划对应一个订单，计划由若干按期序号排列的还款项组成。
//! 每一期通过真实支付网关单独付款，商户订单号为 `{分期流水号}_{期序号}`。

use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use super::enums::{InstallmentStatus, ItemRefundStatus, PaymentMethod, RefundStatus};

/// 分期计划
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Installment {
    pub id: i64,
    pub no: String,
    pub user_id: i64,
    pub order_id: i64,
    /// 本金（分），等于订单金额
    pub base_amount: i64,
    pub count: i32,
    /// 手续费率（基点）
    pub fee_rate: i64,
    pub status: InstallmentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 分期还款项
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct InstallmentItem {
    pub id: i64,
    pub installment_id: i64,
    /// 期序号，从 0 开始
    pub sequence: i32,
    /// 本金（分）
    pub base: i64,
    /// 手续费（分）
    pub fee: i64,
    pub due_date: DateTime<Utc>,
    #[sqlx(default)]
    pub paid_at: Option<DateTime<Utc>>,
    #[sqlx(default)]
    pub payment_method: Option<PaymentMethod>,
    #[sqlx(default)]
    pub payment_no: Option<String>,
    pub refund_status: ItemRefundStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InstallmentItem {
    /// 本期应还金额（分）
    pub fn total(&self) -> i64 {
        self.base + self.fee
    }

    pub fn is_paid(&self) -> bool {
        self.paid_at.is_some()
    }
}

/// 待写入的还款项
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewInstallmentItem {
    pub sequence: i32,
    pub base: i64,
    pub fee: i64,
    pub due_date: DateTime<Utc>,
}

/// 拆分还款计划
///
/// - 每期本金 = 总额 / 期数，余数计入最后一期
/// - 手续费 = 本金 × 费率 / 10000，四舍五入到分
/// - 还款日从明天零点开始，每 30 天一期
pub fn plan_items(
    total_amount: i64,
    count: i32,
    fee_rate_bp: i64,
    now: DateTime<Utc>,
) -> Vec<NewInstallmentItem> {
    if count <= 0 {
        return Vec::new();
    }

    let per_item = total_amount / count as i64;
    let remainder = total_amount % count as i64;
    let first_due = (now + Duration::days(1))
        .date_naive()
        .and_time(NaiveTime::MIN)
        .and_utc();

    (0..count)
        .map(|sequence| {
            let base = if sequence == count - 1 {
                per_item + remainder
            } else {
                per_item
            };
            NewInstallmentItem {
                sequence,
                base,
                fee: (base * fee_rate_bp + 5_000) / 10_000,
                due_date: first_due + Duration::days(30 * sequence as i64),
            }
        })
        .collect()
}

/// 分期还款项的商户订单号
pub fn item_trade_no(installment_no: &str, sequence: i32) -> String {
    format!("{}_{}", installment_no, sequence)
}

/// 按还款项退款状态汇总订单退款状态
///
/// - 所有已支付项都退款成功 -> success
/// - 没有进行中的项且存在失败项 -> failed
/// - 其余情况仍在处理中，返回 None
pub fn aggregate_refund_status<'a, I>(items: I) -> Option<RefundStatus>
where
    I: IntoIterator<Item = &'a InstallmentItem>,
{
    let mut any_failed = false;
    let mut all_success = true;

    for item in items.into_iter().filter(|i| i.is_paid()) {
        match item.refund_status {
            ItemRefundStatus::Success => {}
            ItemRefundStatus::Failed => {
                any_failed = true;
                all_success = false;
            }
            ItemRefundStatus::Pending | ItemRefundStatus::Processing => return None,
        }
    }

    if all_success {
        Some(RefundStatus::Success)
    } else if any_failed {
        Some(RefundStatus::Failed)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn item(sequence: i32, paid: bool, refund_status: ItemRefundStatus) -> InstallmentItem {
        let now = Utc::now();
        InstallmentItem {
            id: sequence as i64 + 1,
            installment_id: 1,
            sequence,
            base: 100,
            fee: 2,
            due_date: now,
            paid_at: paid.then_some(now),
            payment_method: paid.then_some(PaymentMethod::Alipay),
            payment_no: paid.then(|| format!("T{}", sequence)),
            refund_status,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_plan_items_remainder_on_last() {
        let now = Utc.with_ymd_and_hms(2026, 3, 15, 10, 30, 0).unwrap();
        let items = plan_items(1000_01, 3, 150, now);

        assert_eq!(items.len(), 3);
        assert_eq!(items[0].base, 333_33);
        assert_eq!(items[1].base, 333_33);
        assert_eq!(items[2].base, 333_35);
        assert_eq!(items.iter().map(|i| i.base).sum::<i64>(), 1000_01);

        // 33333 * 150 / 10000 = 499.995 -> 500
        assert_eq!(items[0].fee, 500);
        // 33335 * 150 / 10000 = 500.025 -> 500
        assert_eq!(items[2].fee, 500);
    }

    #[test]
    fn test_plan_items_due_dates() {
        let now = Utc.with_ymd_and_hms(2026, 3, 15, 10, 30, 0).unwrap();
        let items = plan_items(600_00, 6, 200, now);

        assert_eq!(
            items[0].due_date,
            Utc.with_ymd_and_hms(2026, 3, 16, 0, 0, 0).unwrap()
        );
        assert_eq!(items[1].due_date - items[0].due_date, Duration::days(30));
        assert_eq!(items[5].sequence, 5);
    }

    #[test]
    fn test_plan_items_invalid_count() {
        assert!(plan_items(100, 0, 150, Utc::now()).is_empty());
    }

    #[test]
    fn test_item_trade_no() {
        assert_eq!(item_trade_no("20260101000000123456", 2), "20260101000000123456_2");
    }

    #[test]
    fn test_aggregate_all_success() {
        let items = vec![
            item(0, true, ItemRefundStatus::Success),
            item(1, true, ItemRefundStatus::Success),
            // 未支付的期不参与汇总
            item(2, false, ItemRefundStatus::Pending),
        ];
        assert_eq!(aggregate_refund_status(&items), Some(RefundStatus::Success));
    }

    #[test]
    fn test_aggregate_still_processing() {
        let items = vec![
            item(0, true, ItemRefundStatus::Success),
            item(1, true, ItemRefundStatus::Processing),
        ];
        assert_eq!(aggregate_refund_status(&items), None);

        let items = vec![
            item(0, true, ItemRefundStatus::Failed),
            item(1, true, ItemRefundStatus::Processing),
        ];
        assert_eq!(aggregate_refund_status(&items), None);
    }

    #[test]
    fn test_aggregate_failed() {
        let items = vec![
            item(0, true, ItemRefundStatus::Success),
            item(1, true, ItemRefundStatus::Failed),
        ];
        assert_eq!(aggregate_refund_status(&items), Some(RefundStatus::Failed));
    }
}
