//! 数据库连接管理

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use draw_core::config::DatabaseConfig;
use draw_core::{DrawError, Result};

/// 数据库连接池
#[derive(Clone)]
pub struct DatabasePool {
    pool: PgPool,
}

impl DatabasePool {
    /// 按配置建立连接池
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await
            .map_err(|e| DrawError::Database(e.to_string()))?;

        tracing::info!("database pool established ({} connections max)", config.max_connections);
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
