//! 用户收货地址

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::order::AddressSnapshot;

/// 用户收货地址
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct UserAddress {
    pub id: i64,
    pub user_id: i64,
    pub province: String,
    pub city: String,
    pub district: String,
    pub address: String,
    pub zip: String,
    pub contact_name: String,
    pub contact_phone: String,
    #[sqlx(default)]
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserAddress {
    /// 完整地址
    pub fn full_address(&self) -> String {
        format!("{}{}{}{}", self.province, self.city, self.district, self.address)
    }

    /// 生成订单用的地址快照
    pub fn snapshot(&self) -> AddressSnapshot {
        AddressSnapshot {
            address: self.full_address(),
            zip: self.zip.clone(),
            contact_name: self.contact_name.clone(),
            contact_phone: self.contact_phone.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot() {
        let now = Utc::now();
        let address = UserAddress {
            id: 1,
            user_id: 7,
            province: "浙江省".to_string(),
            city: "杭州市".to_string(),
            district: "西湖区".to_string(),
            address: "文三路 90 号".to_string(),
            zip: "310012".to_string(),
            contact_name: "李四".to_string(),
            contact_phone: "13900000000".to_string(),
            last_used_at: None,
            created_at: now,
            updated_at: now,
        };

        let snapshot = address.snapshot();
        assert_eq!(snapshot.address, "浙江省杭州市西湖区文三路 90 号");
        assert_eq!(snapshot.contact_name, "李四");
    }
}
