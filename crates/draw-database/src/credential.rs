//! 凭证存储
//!
//! 单行表；这里只保存密文，加解密发生在传输层的凭证管理器里。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::FromRow;

use crate::connection::DatabasePool;
use draw_core::store::CredentialStore;
use draw_core::{Credential, DrawError, Result};

#[derive(Debug, FromRow)]
struct DbCredential {
    encrypted_bearer_token: Option<String>,
    encrypted_refresh_token: Option<String>,
    token_expiry: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

/// 凭证存储的Postgres实现
#[derive(Clone)]
pub struct PgCredentialStore {
    pool: DatabasePool,
}

impl PgCredentialStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CredentialStore for PgCredentialStore {
    async fn load_credential(&self) -> Result<Option<Credential>> {
        let result = sqlx::query_as::<_, DbCredential>(
            "SELECT encrypted_bearer_token, encrypted_refresh_token, token_expiry, updated_at
             FROM credentials WHERE id = 1",
        )
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| DrawError::Database(e.to_string()))?;

        Ok(result.map(|db| Credential {
            encrypted_bearer_token: db.encrypted_bearer_token,
            encrypted_refresh_token: db.encrypted_refresh_token,
            token_expiry: db.token_expiry,
            updated_at: db.updated_at,
        }))
    }

    async fn save_credential(&self, credential: &Credential) -> Result<()> {
        sqlx::query(r#"
            INSERT INTO credentials (id, encrypted_bearer_token, encrypted_refresh_token, token_expiry)
            VALUES (1, $1, $2, $3)
            ON CONFLICT (id) DO UPDATE SET
                encrypted_bearer_token = EXCLUDED.encrypted_bearer_token,
                encrypted_refresh_token = EXCLUDED.encrypted_refresh_token,
                token_expiry = EXCLUDED.token_expiry,
                updated_at = NOW()
        "#)
        .bind(&credential.encrypted_bearer_token)
        .bind(&credential.encrypted_refresh_token)
        .bind(credential.token_expiry)
        .execute(self.pool.pool())
        .await
        .map_err(|e| DrawError::Database(e.to_string()))?;
        Ok(())
    }
}
