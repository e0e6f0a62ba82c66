//! 数据库连接管理
//!
//! 每个连接在建立时固定为 UTC 时区，并按配置设置语句超时，
//! 订单过期与众筹截止时间的比较都依赖数据库侧的 `NOW()`。

use crate::config::DatabaseConfig;
use crate::error::{Result, ShopError};
use sqlx::Executor;
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, instrument};

/// 仓库根目录 migrations/ 下的迁移脚本，编译期嵌入
pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

/// 数据库连接池包装
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    #[instrument(skip(config), fields(max_connections = config.max_connections))]
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let session_sql = session_init_sql(config.statement_timeout_ms);

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .idle_timeout(Duration::from_secs(config.idle_timeout_seconds))
            .after_connect(move |conn, _meta| {
                let sql = session_sql.clone();
                Box::pin(async move {
                    conn.execute(sql.as_str()).await?;
                    Ok(())
                })
            })
            .connect(&config.url)
            .await?;

        info!(
            statement_timeout_ms = config.statement_timeout_ms,
            "Database connection pool created"
        );

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(ShopError::from)
    }

    pub async fn close(&self) {
        self.pool.close().await;
        info!("Database connection pool closed");
    }

    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<()> {
        MIGRATOR.run(&self.pool).await?;
        info!("Database migrations applied");
        Ok(())
    }
}

/// 连接建立后执行的会话设置
fn session_init_sql(statement_timeout_ms: u64) -> String {
    let mut sql = String::from("SET TIME ZONE 'UTC';");
    if statement_timeout_ms > 0 {
        sql.push_str(&format!(" SET statement_timeout = {};", statement_timeout_ms));
    }
    sql
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_init_sql() {
        assert_eq!(session_init_sql(0), "SET TIME ZONE 'UTC';");
        assert_eq!(
            session_init_sql(5000),
            "SET TIME ZONE 'UTC'; SET statement_timeout = 5000;"
        );
    }

    #[tokio::test]
    #[ignore = "需要 PostgreSQL"]
    async fn test_connect_sets_utc_session() {
        let config = DatabaseConfig {
            url: std::env::var("DATABASE_URL").unwrap_or_else(|_| DatabaseConfig::default().url),
            ..DatabaseConfig::default()
        };
        let db = Database::connect(&config).await.unwrap();
        db.health_check().await.unwrap();

        let tz: String = sqlx::query_scalar("SHOW TIME ZONE")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(tz, "UTC");
    }
}
