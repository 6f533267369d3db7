//! DRAW API客户端
//!
//! 所有请求走同一套有界重试策略：网络错误与非2xx响应计入重试
//! 次数，401在每个请求内只触发一次令牌刷新，刷新后的再次401
//! 直接判定为认证失败，绝不无限循环。重试耗尽时把最后一次错误
//! 原样抛给调用方。

use futures::StreamExt;
use reqwest::StatusCode;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::credentials::CredentialManager;
use draw_core::config::ApiConfig;
use draw_core::{DrawError, Result};

/// 状态查询响应
#[derive(Debug, Clone, Deserialize)]
pub struct StatusResponse {
    pub status: String,
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    transaction_token: String,
}

#[derive(Debug, Deserialize)]
struct NotifyResponse {
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
}

/// 下载结果：本地增量计算的校验和与服务端声明的校验和
#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    pub path: PathBuf,
    pub computed_checksum: String,
    pub expected_checksum: Option<String>,
}

/// 一次失败尝试的分类
#[derive(Debug)]
pub(crate) enum Attempt {
    NetworkError(String),
    Unauthorized,
    ServerError(String),
}

/// 失败之后的动作
#[derive(Debug)]
pub(crate) enum Action {
    Retry,
    RetryAfterRefresh,
    Fail(DrawError),
}

/// 单个请求的重试状态机
///
/// 令牌刷新不计入重试次数；每个请求最多刷新一次。
pub(crate) struct RetryPolicy {
    max_retries: u32,
    attempts: u32,
    token_refreshed: bool,
}

impl RetryPolicy {
    pub(crate) fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            attempts: 0,
            token_refreshed: false,
        }
    }

    pub(crate) fn on_failure(&mut self, attempt: Attempt) -> Action {
        match attempt {
            Attempt::Unauthorized => {
                if self.token_refreshed {
                    Action::Fail(DrawError::Authentication(
                        "unauthorized after token refresh".to_string(),
                    ))
                } else {
                    self.token_refreshed = true;
                    Action::RetryAfterRefresh
                }
            }
            Attempt::NetworkError(message) => {
                self.attempts += 1;
                if self.attempts >= self.max_retries {
                    Action::Fail(DrawError::TransientNetwork(message))
                } else {
                    warn!(
                        "API request failed, attempt {} of {}: {}",
                        self.attempts, self.max_retries, message
                    );
                    Action::Retry
                }
            }
            Attempt::ServerError(message) => {
                self.attempts += 1;
                if self.attempts >= self.max_retries {
                    Action::Fail(DrawError::TransientNetwork(message))
                } else {
                    warn!(
                        "API request failed, attempt {} of {}: {}",
                        self.attempts, self.max_retries, message
                    );
                    Action::Retry
                }
            }
        }
    }
}

/// 把端点模板里的 {task_id} 占位符替换为事务令牌
pub fn fill_task_id(template: &str, token: &str) -> String {
    template.replace("{task_id}", token)
}

/// 基础URL与端点路径拼接
pub fn join_url(base_url: &str, endpoint: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        endpoint.trim_start_matches('/')
    )
}

/// 校验和比较，大小写不敏感
pub fn checksums_match(expected: &str, actual: &str) -> bool {
    expected.eq_ignore_ascii_case(actual)
}

/// DRAW API客户端
pub struct DrawApiClient {
    http: reqwest::Client,
    config: ApiConfig,
    credentials: Arc<CredentialManager>,
}

impl DrawApiClient {
    /// 建立客户端；代理设置取自环境变量
    pub fn new(config: ApiConfig, credentials: Arc<CredentialManager>) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs));
        builder = apply_proxy_settings(builder)?;
        let http = builder
            .build()
            .map_err(|e| DrawError::Internal(e.to_string()))?;
        Ok(Self {
            http,
            config,
            credentials,
        })
    }

    fn url(&self, endpoint: &str) -> String {
        join_url(&self.config.base_url, endpoint)
    }

    /// 上传前的可达性检查
    ///
    /// 认证请求失败时退回一次无认证请求，区分网络不可达与
    /// 认证配置问题。
    pub async fn health_check(&self) -> Result<()> {
        let url = self.url(&self.config.health_endpoint);
        debug!("health check against {}", url);

        let bearer = self.credentials.bearer_token().await?;
        let authenticated = self
            .http
            .get(&url)
            .bearer_auth(&bearer)
            .send()
            .await;
        match authenticated {
            Ok(response) if response.status().is_success() => {
                info!("API health check successful");
                return Ok(());
            }
            Ok(response) => {
                warn!("health check failed with status {}", response.status());
            }
            Err(e) => {
                warn!("health check request error: {}", e);
            }
        }

        // 无认证兜底检查
        let fallback = self
            .http
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| DrawError::TransientNetwork(e.to_string()))?;
        if fallback.status().is_success() {
            info!("health check without auth successful");
            Ok(())
        } else {
            Err(DrawError::TransientNetwork(format!(
                "API health check failed with status {}",
                fallback.status()
            )))
        }
    }

    /// 上传压缩包，返回服务端签发的事务令牌
    pub async fn upload(&self, zip_path: &Path, checksum: &str) -> Result<String> {
        let bytes = tokio::fs::read(zip_path).await?;
        if bytes.is_empty() {
            return Err(DrawError::Storage(format!(
                "zip file is empty: {}",
                zip_path.display()
            )));
        }
        let file_name = zip_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "payload.zip".to_string());
        let url = self.url(&self.config.upload_endpoint);
        info!("uploading {} ({} bytes) to {}", file_name, bytes.len(), url);

        let mut policy = RetryPolicy::new(self.config.max_retries);
        loop {
            let part = reqwest::multipart::Part::bytes(bytes.clone())
                .file_name(file_name.clone())
                .mime_str("application/zip")
                .map_err(|e| DrawError::Internal(e.to_string()))?;
            let form = reqwest::multipart::Form::new()
                .part("file", part)
                .text("checksum", checksum.to_string())
                .text("client_id", self.config.client_id.clone());

            let bearer = self.credentials.bearer_token().await?;
            let outcome = self
                .http
                .post(&url)
                .bearer_auth(&bearer)
                .multipart(form)
                .send()
                .await;

            match self.classify(outcome).await {
                Ok(response) => {
                    let parsed: UploadResponse = response
                        .json()
                        .await
                        .map_err(|e| DrawError::TransientNetwork(e.to_string()))?;
                    return Ok(parsed.transaction_token);
                }
                Err(attempt) => match policy.on_failure(attempt) {
                    Action::Retry => continue,
                    Action::RetryAfterRefresh => {
                        self.refresh_access_token().await?;
                        continue;
                    }
                    Action::Fail(e) => return Err(e),
                },
            }
        }
    }

    /// 查询事务状态
    pub async fn status(&self, token: &str) -> Result<StatusResponse> {
        let endpoint = fill_task_id(&self.config.status_endpoint, token);
        let url = self.url(&endpoint);
        debug!("status request to {}", url);

        let mut policy = RetryPolicy::new(self.config.max_retries);
        loop {
            let bearer = self.credentials.bearer_token().await?;
            let outcome = self.http.get(&url).bearer_auth(&bearer).send().await;
            match self.classify(outcome).await {
                Ok(response) => {
                    return response
                        .json()
                        .await
                        .map_err(|e| DrawError::TransientNetwork(e.to_string()));
                }
                Err(attempt) => match policy.on_failure(attempt) {
                    Action::Retry => continue,
                    Action::RetryAfterRefresh => {
                        self.refresh_access_token().await?;
                        continue;
                    }
                    Action::Fail(e) => return Err(e),
                },
            }
        }
    }

    /// 下载结果产物
    ///
    /// 流式写盘，校验和增量计算；服务端通过 X-File-Checksum
    /// 响应头声明期望值时一并返回，由调用方执行校验门禁。
    pub async fn download(&self, token: &str, dest: &Path) -> Result<DownloadOutcome> {
        let endpoint = fill_task_id(&self.config.download_endpoint, token);
        let url = self.url(&endpoint);
        info!("downloading artifact from {}", url);

        let mut policy = RetryPolicy::new(self.config.max_retries);
        loop {
            let bearer = self.credentials.bearer_token().await?;
            let outcome = self.http.get(&url).bearer_auth(&bearer).send().await;
            let response = match self.classify(outcome).await {
                Ok(response) => response,
                Err(attempt) => match policy.on_failure(attempt) {
                    Action::Retry => continue,
                    Action::RetryAfterRefresh => {
                        self.refresh_access_token().await?;
                        continue;
                    }
                    Action::Fail(e) => return Err(e),
                },
            };

            let expected_checksum = response
                .headers()
                .get("X-File-Checksum")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);

            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let mut file = tokio::fs::File::create(dest).await?;
            let mut hasher = Sha256::new();
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        // 半途失败的下载不留残片
                        drop(file);
                        tokio::fs::remove_file(dest).await.ok();
                        return Err(DrawError::TransientNetwork(e.to_string()));
                    }
                };
                hasher.update(&chunk);
                file.write_all(&chunk).await?;
            }
            file.flush().await?;

            return Ok(DownloadOutcome {
                path: dest.to_path_buf(),
                computed_checksum: format!("{:x}", hasher.finalize()),
                expected_checksum,
            });
        }
    }

    /// 通知服务端产物已安全接收
    ///
    /// 返回服务端的应答消息；是否达到“已通知”终态由调用方根据
    /// 应答内容判定。
    pub async fn notify(&self, token: &str) -> Result<Option<String>> {
        let endpoint = fill_task_id(&self.config.notify_endpoint, token);
        let url = self.url(&endpoint);
        debug!("notify request to {}", url);

        let mut policy = RetryPolicy::new(self.config.max_retries);
        loop {
            let bearer = self.credentials.bearer_token().await?;
            let outcome = self
                .http
                .post(&url)
                .bearer_auth(&bearer)
                .json(&serde_json::json!({ "status": "COMPLETED" }))
                .send()
                .await;
            match self.classify(outcome).await {
                Ok(response) => {
                    let parsed: NotifyResponse = response
                        .json()
                        .await
                        .map_err(|e| DrawError::TransientNetwork(e.to_string()))?;
                    return Ok(parsed.message);
                }
                Err(attempt) => match policy.on_failure(attempt) {
                    Action::Retry => continue,
                    Action::RetryAfterRefresh => {
                        self.refresh_access_token().await?;
                        continue;
                    }
                    Action::Fail(e) => return Err(e),
                },
            }
        }
    }

    /// 用refresh令牌换取新的bearer令牌并持久化
    async fn refresh_access_token(&self) -> Result<()> {
        let refresh_token = self.credentials.refresh_token().await?;
        let url = self.url(&self.config.refresh_endpoint);
        info!("token expired, attempting refresh");

        let response = self
            .http
            .post(&url)
            .bearer_auth(&refresh_token)
            .json(&serde_json::json!({ "client_id": self.config.client_id }))
            .send()
            .await
            .map_err(|e| DrawError::Authentication(format!("token refresh failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(DrawError::Authentication(format!(
                "token refresh failed with status {}",
                response.status()
            )));
        }

        let parsed: RefreshResponse = response
            .json()
            .await
            .map_err(|e| DrawError::Authentication(format!("bad refresh response: {}", e)))?;
        self.credentials
            .save_tokens(
                &parsed.access_token,
                parsed.refresh_token.as_deref(),
                parsed.expires_in.unwrap_or(3600),
            )
            .await?;
        Ok(())
    }

    /// 把一次请求结果分类为成功响应或失败尝试
    async fn classify(
        &self,
        outcome: std::result::Result<reqwest::Response, reqwest::Error>,
    ) -> std::result::Result<reqwest::Response, Attempt> {
        match outcome {
            Err(e) => Err(Attempt::NetworkError(e.to_string())),
            Ok(response) if response.status() == StatusCode::UNAUTHORIZED => {
                Err(Attempt::Unauthorized)
            }
            Ok(response) if !response.status().is_success() => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                Err(Attempt::ServerError(format!("status {}: {}", status, body)))
            }
            Ok(response) => Ok(response),
        }
    }
}

/// 从环境变量读取代理设置
///
/// 依次采用 HTTP_PROXY 与 HTTPS_PROXY；都未设置时走直连。
fn apply_proxy_settings(mut builder: reqwest::ClientBuilder) -> Result<reqwest::ClientBuilder> {
    if let Ok(proxy) = std::env::var("HTTP_PROXY") {
        if !proxy.is_empty() {
            info!("Using HTTP proxy: {}", proxy);
            let proxy =
                reqwest::Proxy::http(&proxy).map_err(|e| DrawError::Config(e.to_string()))?;
            builder = builder.proxy(proxy);
        }
    }
    if let Ok(proxy) = std::env::var("HTTPS_PROXY") {
        if !proxy.is_empty() {
            info!("Using HTTPS proxy: {}", proxy);
            let proxy =
                reqwest::Proxy::https(&proxy).map_err(|e| DrawError::Config(e.to_string()))?;
            builder = builder.proxy(proxy);
        }
    }
    Ok(builder)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_task_id() {
        assert_eq!(
            fill_task_id("api/upload/{task_id}/status/", "tok-123"),
            "api/upload/tok-123/status/"
        );
        assert_eq!(fill_task_id("api/no-placeholder/", "x"), "api/no-placeholder/");
    }

    #[test]
    fn test_join_url_normalizes_slashes() {
        assert_eq!(
            join_url("http://host:8000/", "/api/upload/"),
            "http://host:8000/api/upload/"
        );
        assert_eq!(
            join_url("http://host:8000", "api/upload/"),
            "http://host:8000/api/upload/"
        );
    }

    #[test]
    fn test_checksum_compare_is_case_insensitive() {
        assert!(checksums_match("ABC123", "abc123"));
        assert!(checksums_match("abc123", "abc123"));
        assert!(!checksums_match("xyz999", "abc123"));
    }

    #[test]
    fn test_first_unauthorized_triggers_single_refresh() {
        let mut policy = RetryPolicy::new(3);
        // 第一次401：刷新后重试
        assert!(matches!(
            policy.on_failure(Attempt::Unauthorized),
            Action::RetryAfterRefresh
        ));
        // 刷新后的第二次401：致命，不再循环
        assert!(matches!(
            policy.on_failure(Attempt::Unauthorized),
            Action::Fail(DrawError::Authentication(_))
        ));
    }

    #[test]
    fn test_network_errors_are_bounded_by_max_retries() {
        let mut policy = RetryPolicy::new(3);
        assert!(matches!(
            policy.on_failure(Attempt::NetworkError("timeout".into())),
            Action::Retry
        ));
        assert!(matches!(
            policy.on_failure(Attempt::NetworkError("timeout".into())),
            Action::Retry
        ));
        // 第三次耗尽重试额度，返回最后一次错误
        assert!(matches!(
            policy.on_failure(Attempt::NetworkError("timeout".into())),
            Action::Fail(DrawError::TransientNetwork(_))
        ));
    }

    #[test]
    fn test_refresh_is_not_counted_as_retry_attempt() {
        let mut policy = RetryPolicy::new(2);
        assert!(matches!(
            policy.on_failure(Attempt::ServerError("status 500".into())),
            Action::Retry
        ));
        // 夹在中间的401刷新不占用重试次数
        assert!(matches!(
            policy.on_failure(Attempt::Unauthorized),
            Action::RetryAfterRefresh
        ));
        assert!(matches!(
            policy.on_failure(Attempt::ServerError("status 500".into())),
            Action::Fail(DrawError::TransientNetwork(_))
        ));
    }
}
