//! 传输轮询
//!
//! 轮询待定传输的远端状态。服务端上报的状态逐字记在
//! `server_status`，与客户端状态机互不干涉。每次轮询尝试都
//! 计数，包括最终出错的尝试——瞬时网络故障不能重置计数器。

use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::client::{checksums_match, DownloadOutcome, DrawApiClient};
use draw_core::store::TransferStore;
use draw_core::{Result, StageItem, StageResult, TransferRecord, TransferStatus};

/// 远端词汇表里表示分割完成的状态
pub const SEGMENTATION_COMPLETED: &str = "SEGMENTATION COMPLETED";
/// 远端词汇表里表示失败的状态
pub const REMOTE_FAILED: &str = "FAILED";

/// 下载校验结论
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum DownloadVerification {
    /// 与服务端声明的校验和一致
    Verified,
    /// 服务端未声明校验和，只记录本地计算值
    UnverifiedNoHeader,
    /// 不一致，产物必须丢弃
    Mismatch,
}

pub(crate) fn verify_download(expected: Option<&str>, computed: &str) -> DownloadVerification {
    match expected {
        None => DownloadVerification::UnverifiedNoHeader,
        Some(expected) if checksums_match(expected, computed) => DownloadVerification::Verified,
        Some(_) => DownloadVerification::Mismatch,
    }
}

/// 轮询全部待定传输
pub async fn poll_pending_transfers(
    client: &DrawApiClient,
    store: &Arc<dyn TransferStore>,
    download_dir: &Path,
) -> Result<StageResult> {
    let pending = store.list_pending_transfers().await?;
    info!("polling {} pending transfers", pending.len());

    let mut successful = Vec::new();
    let mut failed = Vec::new();

    for transfer in pending {
        // 计数先行：这次尝试无论结局如何都要留痕
        store.record_poll_attempt(transfer.id, Utc::now()).await?;

        let token = match &transfer.server_token {
            Some(token) => token.clone(),
            None => {
                warn!("transfer {} has no server token", transfer.id);
                failed.push(
                    StageItem::for_series(transfer.id, transfer.series_instance_uid.clone())
                        .with_detail("missing server token"),
                );
                continue;
            }
        };

        let status = match client.status(&token).await {
            Ok(response) => response,
            Err(e) => {
                // 可能是临时网络问题，不把记录置为失败
                warn!("error checking transfer {}: {}", transfer.id, e);
                continue;
            }
        };

        info!("transfer {} server status: {}", transfer.id, status.status);
        let mut updated = transfer.clone();
        updated.server_status = Some(status.status.clone());
        store.update_transfer(&updated).await?;

        match status.status.as_str() {
            SEGMENTATION_COMPLETED => {
                match download_and_finalize(client, store, &updated, &token, download_dir).await {
                    Ok(path) => {
                        successful.push(
                            StageItem::for_series(
                                updated.id,
                                updated.series_instance_uid.clone(),
                            )
                            .with_detail(path),
                        );
                    }
                    Err(e) => {
                        failed.push(
                            StageItem::for_series(
                                updated.id,
                                updated.series_instance_uid.clone(),
                            )
                            .with_detail(e.to_string()),
                        );
                    }
                }
            }
            REMOTE_FAILED => {
                let message = status
                    .error
                    .unwrap_or_else(|| "Unknown error".to_string());
                error!("transfer {} failed remotely: {}", transfer.id, message);
                store
                    .lock_for_finalize(transfer.id, &mut |record| {
                        record.status = TransferStatus::Failed;
                        record.error_message = Some(message.clone());
                        Ok(())
                    })
                    .await?;
                failed.push(
                    StageItem::for_series(transfer.id, transfer.series_instance_uid.clone())
                        .with_detail(message),
                );
            }
            other => {
                // 双轨状态：远端词汇不映射进客户端状态机
                info!(
                    "transfer {} has server status {}, client status remains {}",
                    transfer.id,
                    other,
                    transfer.status.as_str()
                );
            }
        }
    }

    Ok(StageResult::from_items(
        "transfer polling finished",
        successful,
        failed,
    ))
}

/// 下载产物并在校验通过后终结传输
async fn download_and_finalize(
    client: &DrawApiClient,
    store: &Arc<dyn TransferStore>,
    transfer: &TransferRecord,
    token: &str,
    download_dir: &Path,
) -> Result<String> {
    let dest = download_dir.join(format!("{}_rtstruct.dcm", transfer.series_instance_uid));
    let outcome = client.download(token, &dest).await?;

    match verify_download(outcome.expected_checksum.as_deref(), &outcome.computed_checksum) {
        DownloadVerification::Mismatch => {
            let message = format!(
                "Checksum mismatch for RTSTRUCT. Expected: {}, Got: {}",
                outcome.expected_checksum.as_deref().unwrap_or_default(),
                outcome.computed_checksum
            );
            error!("{}", message);
            // 校验门禁：不一致的产物先删再报错
            tokio::fs::remove_file(&outcome.path).await.ok();
            store
                .lock_for_finalize(transfer.id, &mut |record| {
                    record.status = TransferStatus::Failed;
                    record.error_message = Some(message.clone());
                    Ok(())
                })
                .await?;
            return Err(draw_core::DrawError::Integrity {
                expected: outcome.expected_checksum.unwrap_or_default(),
                actual: outcome.computed_checksum,
            });
        }
        DownloadVerification::UnverifiedNoHeader => {
            warn!(
                "no X-File-Checksum header for transfer {}, integrity unverified",
                transfer.id
            );
        }
        DownloadVerification::Verified => {}
    }

    finalize_completed(store, transfer.id, &outcome).await?;

    // 产物安全落地后清理上传压缩包
    let zip_path = transfer.zip_file_path.clone();
    if tokio::fs::remove_file(&zip_path).await.is_ok() {
        info!("cleaned up zip file {}", zip_path);
    }

    info!(
        "transfer {} completed with RTSTRUCT at {}",
        transfer.id,
        outcome.path.display()
    );
    Ok(outcome.path.to_string_lossy().into_owned())
}

/// 在收尾锁内把传输置为 COMPLETED
///
/// 已经终结的记录原样跳过，两个并发轮询者只有一个能生效。
pub(crate) async fn finalize_completed(
    store: &Arc<dyn TransferStore>,
    id: uuid::Uuid,
    outcome: &DownloadOutcome,
) -> Result<()> {
    let verified = outcome.expected_checksum.is_some();
    let path = outcome.path.to_string_lossy().into_owned();
    let checksum = outcome.computed_checksum.clone();

    store
        .lock_for_finalize(id, &mut |record| {
            if record.status.is_terminal() || record.status == TransferStatus::Completed {
                return Ok(());
            }
            record.status = TransferStatus::Completed;
            record.rtstruct_file_path = Some(path.clone());
            record.rtstruct_checksum = Some(checksum.clone());
            record.rtstruct_checksum_verified = verified;
            record.rtstruct_received_at = Some(Utc::now());
            record.cleaned_up = true;
            Ok(())
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use draw_core::memory::InMemoryTransferStore;
    use std::path::PathBuf;
    use uuid::Uuid;

    #[test]
    fn test_checksum_header_comparison_is_case_insensitive() {
        // 服务端返回大写、本地计算小写：一致
        assert_eq!(
            verify_download(Some("ABC123"), "abc123"),
            DownloadVerification::Verified
        );
        assert_eq!(
            verify_download(Some("xyz999"), "abc123"),
            DownloadVerification::Mismatch
        );
        assert_eq!(
            verify_download(None, "abc123"),
            DownloadVerification::UnverifiedNoHeader
        );
    }

    fn sample_transfer(id: Uuid, status: TransferStatus) -> TransferRecord {
        TransferRecord {
            id,
            study_instance_uid: "s".into(),
            series_instance_uid: "se".into(),
            zip_file_path: "/tmp/x.zip".into(),
            zip_checksum: "abc".into(),
            server_token: Some("tok".into()),
            status,
            server_status: None,
            rtstruct_file_path: None,
            rtstruct_checksum: None,
            rtstruct_checksum_verified: false,
            sent_at: None,
            rtstruct_received_at: None,
            last_poll_attempt: None,
            poll_attempts: 0,
            server_notified: false,
            cleaned_up: false,
            error_message: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_finalize_sets_completed_with_checksum() {
        let store: Arc<dyn TransferStore> = Arc::new(InMemoryTransferStore::new());
        let id = Uuid::new_v4();
        store
            .create_transfer(&sample_transfer(id, TransferStatus::Sent))
            .await
            .unwrap();

        let outcome = DownloadOutcome {
            path: PathBuf::from("/tmp/se_rtstruct.dcm"),
            computed_checksum: "abc123".into(),
            expected_checksum: Some("ABC123".into()),
        };
        finalize_completed(&store, id, &outcome).await.unwrap();

        let record = store.get_transfer(id).await.unwrap().unwrap();
        assert_eq!(record.status, TransferStatus::Completed);
        assert!(record.rtstruct_checksum_verified);
        assert_eq!(record.rtstruct_checksum.as_deref(), Some("abc123"));
    }

    #[tokio::test]
    async fn test_finalize_is_idempotent_for_terminal_records() {
        let store: Arc<dyn TransferStore> = Arc::new(InMemoryTransferStore::new());
        let id = Uuid::new_v4();
        let mut record = sample_transfer(id, TransferStatus::CompletedNotified);
        record.server_notified = true;
        store.create_transfer(&record).await.unwrap();

        let outcome = DownloadOutcome {
            path: PathBuf::from("/tmp/dup.dcm"),
            computed_checksum: "fff".into(),
            expected_checksum: None,
        };
        finalize_completed(&store, id, &outcome).await.unwrap();

        // 已通知的终态不被并发轮询者回退
        let record = store.get_transfer(id).await.unwrap().unwrap();
        assert_eq!(record.status, TransferStatus::CompletedNotified);
        assert!(record.rtstruct_file_path.is_none());
    }

    #[tokio::test]
    async fn test_unverified_download_is_not_marked_verified() {
        let store: Arc<dyn TransferStore> = Arc::new(InMemoryTransferStore::new());
        let id = Uuid::new_v4();
        store
            .create_transfer(&sample_transfer(id, TransferStatus::Processing))
            .await
            .unwrap();

        let outcome = DownloadOutcome {
            path: PathBuf::from("/tmp/se_rtstruct.dcm"),
            computed_checksum: "abc123".into(),
            expected_checksum: None,
        };
        finalize_completed(&store, id, &outcome).await.unwrap();

        let record = store.get_transfer(id).await.unwrap().unwrap();
        assert_eq!(record.status, TransferStatus::Completed);
        assert!(!record.rtstruct_checksum_verified);
    }
}
