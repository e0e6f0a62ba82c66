//! 优惠券实体与使用规则

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::enums::CouponType;
use crate::error::{OrderError, Result};

/// 优惠券
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct CouponCode {
    pub id: i64,
    pub name: String,
    pub code: String,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub coupon_type: CouponType,
    /// 固定金额（分）或折扣百分比
    pub value: i64,
    pub total: i32,
    pub used: i32,
    /// 订单最低金额（分）
    pub min_amount: i64,
    #[sqlx(default)]
    pub not_before: Option<DateTime<Utc>>,
    #[sqlx(default)]
    pub not_after: Option<DateTime<Utc>>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CouponCode {
    /// 校验优惠券是否可用
    ///
    /// `order_amount` 为 None 时只检查与订单金额无关的条件（下单前预检）。
    /// 用户是否已使用过由仓储层查询，不在此处判断。
    pub fn check_available(&self, now: DateTime<Utc>, order_amount: Option<i64>) -> Result<()> {
        if !self.enabled {
            return Err(OrderError::CouponUnavailable("优惠券不存在".to_string()));
        }
        if self.total - self.used <= 0 {
            return Err(OrderError::CouponUnavailable("该优惠券已被兑完".to_string()));
        }
        if let Some(not_before) = self.not_before {
            if not_before > now {
                return Err(OrderError::CouponUnavailable("该优惠券现在还不能使用".to_string()));
            }
        }
        if let Some(not_after) = self.not_after {
            if not_after < now {
                return Err(OrderError::CouponUnavailable("该优惠券已过期".to_string()));
            }
        }
        if let Some(amount) = order_amount {
            if amount < self.min_amount {
                return Err(OrderError::CouponUnavailable(
                    "订单金额不满足该优惠券最低金额".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// 计算使用优惠券后的金额（分）
    ///
    /// 固定金额减免后最少支付 1 分；百分比折扣向下取整
    pub fn adjusted_price(&self, order_amount: i64) -> i64 {
        match self.coupon_type {
            CouponType::Fixed => (order_amount - self.value).max(1),
            CouponType::Percent => order_amount * (100 - self.value) / 100,
        }
    }

    /// 展示用描述
    pub fn description(&self) -> String {
        let prefix = if self.min_amount > 0 {
            format!("满{}", format_yuan(self.min_amount))
        } else {
            String::new()
        };
        match self.coupon_type {
            CouponType::Percent => format!("{}优惠{}%", prefix, self.value),
            CouponType::Fixed => format!("{}减{}", prefix, format_yuan(self.value)),
        }
    }
}

fn format_yuan(cents: i64) -> String {
    if cents % 100 == 0 {
        format!("{}", cents / 100)
    } else {
        format!("{}.{:02}", cents / 100, cents % 100)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Duration;

    pub(crate) fn sample_coupon(coupon_type: CouponType, value: i64) -> CouponCode {
        let now = Utc::now();
        CouponCode {
            id: 1,
            name: "新人券".to_string(),
            code: "WELCOME2026".to_string(),
            coupon_type,
            value,
            total: 10,
            used: 0,
            min_amount: 100_00,
            not_before: None,
            not_after: None,
            enabled: true,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_check_available_ok() {
        let coupon = sample_coupon(CouponType::Fixed, 10_00);
        let now = Utc::now();
        assert!(coupon.check_available(now, None).is_ok());
        assert!(coupon.check_available(now, Some(100_00)).is_ok());
    }

    #[test]
    fn test_check_available_rejections() {
        let now = Utc::now();

        let mut disabled = sample_coupon(CouponType::Fixed, 10_00);
        disabled.enabled = false;
        assert!(disabled.check_available(now, None).is_err());

        let mut exhausted = sample_coupon(CouponType::Fixed, 10_00);
        exhausted.used = exhausted.total;
        assert!(exhausted.check_available(now, None).is_err());

        let mut early = sample_coupon(CouponType::Fixed, 10_00);
        early.not_before = Some(now + Duration::hours(1));
        assert!(early.check_available(now, None).is_err());

        let mut expired = sample_coupon(CouponType::Fixed, 10_00);
        expired.not_after = Some(now - Duration::hours(1));
        assert!(expired.check_available(now, None).is_err());

        let below_min = sample_coupon(CouponType::Fixed, 10_00);
        assert!(matches!(
            below_min.check_available(now, Some(99_99)),
            Err(OrderError::CouponUnavailable(_))
        ));
    }

    #[test]
    fn test_adjusted_price_fixed() {
        let coupon = sample_coupon(CouponType::Fixed, 10_00);
        assert_eq!(coupon.adjusted_price(150_00), 140_00);
        // 减免金额超过订单金额时最少支付 1 分
        assert_eq!(coupon.adjusted_price(5_00), 1);
    }

    #[test]
    fn test_adjusted_price_percent() {
        let coupon = sample_coupon(CouponType::Percent, 15);
        assert_eq!(coupon.adjusted_price(200_00), 170_00);
        // 向下取整：999 * 85 / 100 = 849.15
        assert_eq!(coupon.adjusted_price(999), 849);
    }

    #[test]
    fn test_description() {
        assert_eq!(sample_coupon(CouponType::Fixed, 10_00).description(), "满100减10");
        assert_eq!(sample_coupon(CouponType::Percent, 15).description(), "满100优惠15%");
        let mut no_min = sample_coupon(CouponType::Fixed, 5_50);
        no_min.min_amount = 0;
        assert_eq!(no_min.description(), "减5.50");
    }
}
