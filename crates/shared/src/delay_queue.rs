//! Redis 延迟队列
//!
//! 基于有序集合实现的持久化延迟任务队列：成员为任务标识，分数为触发时间（Unix 秒）。
//! 多实例同时轮询时，通过 `ZREM` 的返回值认领任务，只有删除成功的实例负责执行。

use crate::config::RedisConfig;
use crate::error::{Result, ShopError};
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use tracing::{debug, info, instrument};

/// 延迟队列客户端
#[derive(Clone)]
pub struct DelayQueue {
    client: Client,
    key: String,
}

impl DelayQueue {
    /// 创建队列客户端（不会立即建立连接）
    pub fn new(config: &RedisConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str())?;
        info!(key = %config.expiry_queue_key, "Redis delay queue created");
        Ok(Self {
            client,
            key: config.expiry_queue_key.clone(),
        })
    }

    async fn get_conn(&self) -> Result<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(ShopError::from)
    }

    /// 健康检查
    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.get_conn().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(ShopError::from)
    }

    /// 安排任务在 `fire_at` 触发，重复安排同一成员会覆盖触发时间
    #[instrument(skip(self))]
    pub async fn schedule_at(&self, member: &str, fire_at: DateTime<Utc>) -> Result<()> {
        let mut conn = self.get_conn().await?;
        let _: () = conn.zadd(&self.key, member, fire_at.timestamp()).await?;
        debug!(fire_at = %fire_at, "延迟任务已入队");
        Ok(())
    }

    /// 查询截至 `now` 已到期的任务（只读，不认领）
    pub async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<String>> {
        let mut conn = self.get_conn().await?;
        let members: Vec<String> = conn
            .zrangebyscore_limit(&self.key, "-inf", now.timestamp(), 0, limit as isize)
            .await?;
        Ok(members)
    }

    /// 认领任务：删除成功返回 true，已被其他实例认领返回 false
    pub async fn claim(&self, member: &str) -> Result<bool> {
        let mut conn = self.get_conn().await?;
        let removed: i64 = conn.zrem(&self.key, member).await?;
        Ok(removed == 1)
    }

    /// 队列中剩余任务数
    pub async fn pending_count(&self) -> Result<u64> {
        let mut conn = self.get_conn().await?;
        let count: u64 = conn.zcard(&self.key).await?;
        Ok(count)
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

/// 订单过期任务的成员编码
pub fn order_member(order_id: i64) -> String {
    format!("order:{}", order_id)
}

/// 解析订单过期任务成员，格式不符返回 None
pub fn parse_order_member(member: &str) -> Option<i64> {
    member.strip_prefix("order:")?.parse().ok()
}
