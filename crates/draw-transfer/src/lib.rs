//! # DRAW Transfer
//!
//! 与远程DRAW分割服务的全部网络交互：校验和随行的上传、状态
//! 轮询、认证下载与完成通知，外加有界重试与令牌刷新策略。

pub mod client;
pub mod credentials;
pub mod exporter;
pub mod notifier;
pub mod poller;

pub use client::{DrawApiClient, StatusResponse};
pub use credentials::CredentialManager;
pub use exporter::initiate_transfer;
pub use notifier::notify_completed_transfers;
pub use poller::poll_pending_transfers;
