//! 凭证管理
//!
//! 令牌静态加密存放：AES-256-GCM，主密钥来自本地配置，每次
//! 加密使用新的随机nonce，密文前缀nonce后以十六进制落库。
//! 业务代码只消费解密后的明文令牌。

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::debug;

use draw_core::store::CredentialStore;
use draw_core::{Credential, DrawError, Result};

/// GCM nonce长度（字节）
const NONCE_LEN: usize = 12;

/// 凭证管理器
pub struct CredentialManager {
    store: Arc<dyn CredentialStore>,
    cipher: Aes256Gcm,
}

impl CredentialManager {
    pub fn new(store: Arc<dyn CredentialStore>, master_key: [u8; 32]) -> Self {
        Self {
            store,
            cipher: Aes256Gcm::new(&master_key.into()),
        }
    }

    /// 加密一个令牌
    fn encrypt(&self, plaintext: &str) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| DrawError::Internal(format!("encrypt failed: {}", e)))?;

        let mut combined = nonce.to_vec();
        combined.extend_from_slice(&ciphertext);
        Ok(hex::encode(combined))
    }

    /// 解密一个令牌
    fn decrypt(&self, encoded: &str) -> Result<String> {
        let combined = hex::decode(encoded)
            .map_err(|e| DrawError::Authentication(format!("stored token is not valid hex: {}", e)))?;
        if combined.len() <= NONCE_LEN {
            return Err(DrawError::Authentication(
                "stored token ciphertext too short".to_string(),
            ));
        }
        let (nonce, ciphertext) = combined.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| DrawError::Authentication("token decryption failed".to_string()))?;
        String::from_utf8(plaintext)
            .map_err(|e| DrawError::Authentication(format!("decrypted token not utf-8: {}", e)))
    }

    /// 取解密后的bearer令牌
    pub async fn bearer_token(&self) -> Result<String> {
        let credential = self
            .store
            .load_credential()
            .await?
            .ok_or_else(|| DrawError::Authentication("no stored credential".to_string()))?;
        let encrypted = credential
            .encrypted_bearer_token
            .ok_or_else(|| DrawError::Authentication("bearer token not set".to_string()))?;
        self.decrypt(&encrypted)
    }

    /// 取解密后的refresh令牌
    pub async fn refresh_token(&self) -> Result<String> {
        let credential = self
            .store
            .load_credential()
            .await?
            .ok_or_else(|| DrawError::Authentication("no stored credential".to_string()))?;
        let encrypted = credential
            .encrypted_refresh_token
            .ok_or_else(|| DrawError::Authentication("refresh token not set".to_string()))?;
        self.decrypt(&encrypted)
    }

    /// 保存新的令牌对
    ///
    /// refresh令牌只有服务端返回了新值才替换，否则保留旧值。
    pub async fn save_tokens(
        &self,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_in_secs: i64,
    ) -> Result<()> {
        let existing = self.store.load_credential().await?;
        let encrypted_refresh = match refresh_token {
            Some(token) => Some(self.encrypt(token)?),
            None => existing.and_then(|c| c.encrypted_refresh_token),
        };

        let credential = Credential {
            encrypted_bearer_token: Some(self.encrypt(access_token)?),
            encrypted_refresh_token: encrypted_refresh,
            token_expiry: Some(Utc::now() + Duration::seconds(expires_in_secs)),
            updated_at: Utc::now(),
        };
        self.store.save_credential(&credential).await?;
        debug!("credential updated, expires in {}s", expires_in_secs);
        Ok(())
    }
}
