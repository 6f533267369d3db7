//! 完成通知
//!
//! 产物安全落地并校验后告知服务端，让其释放服务端存储。只有
//! 服务端返回明确的确认消息才把记录翻到完全通知的终态；其余
//! 应答一律视为“尚未通知”，下一轮安全重试。

use std::sync::Arc;
use tracing::{info, warn};

use crate::client::DrawApiClient;
use draw_core::store::TransferStore;
use draw_core::{Result, StageItem, StageResult, TransferStatus};

/// 服务端的确认消息
pub const NOTIFY_ACK: &str = "Notification received";

/// 应答是否构成确认
pub(crate) fn is_acknowledged(message: Option<&str>) -> bool {
    message == Some(NOTIFY_ACK)
}

/// 通知全部已完成未通知的传输
pub async fn notify_completed_transfers(
    client: &DrawApiClient,
    store: &Arc<dyn TransferStore>,
) -> Result<StageResult> {
    let unnotified = store.list_unnotified_transfers().await?;
    info!("notifying server for {} completed transfers", unnotified.len());

    let mut successful = Vec::new();
    let mut failed = Vec::new();

    for transfer in unnotified {
        let token = match &transfer.server_token {
            Some(token) => token.clone(),
            None => {
                failed.push(
                    StageItem::for_series(transfer.id, transfer.series_instance_uid.clone())
                        .with_detail("missing server token"),
                );
                continue;
            }
        };

        match client.notify(&token).await {
            Ok(message) if is_acknowledged(message.as_deref()) => {
                mark_notified(store, transfer.id).await?;
                info!("successfully notified completion of transfer {}", transfer.id);
                successful.push(StageItem::for_series(
                    transfer.id,
                    transfer.series_instance_uid.clone(),
                ));
            }
            Ok(message) => {
                // 没有明确确认：保持未通知，下一轮重试
                warn!(
                    "transfer {} notify response not acknowledged: {:?}",
                    transfer.id, message
                );
            }
            Err(e) => {
                warn!("error notifying transfer {}: {}", transfer.id, e);
                failed.push(
                    StageItem::for_series(transfer.id, transfer.series_instance_uid.clone())
                        .with_detail(e.to_string()),
                );
            }
        }
    }

    Ok(StageResult::from_items(
        "completion notification finished",
        successful,
        failed,
    ))
}

/// 在收尾锁内把记录翻到完全通知终态
///
/// 只有仍处于 COMPLETED 的记录才翻转，并发通知者只有一个生效。
pub(crate) async fn mark_notified(
    store: &Arc<dyn TransferStore>,
    id: uuid::Uuid,
) -> Result<()> {
    store
        .lock_for_finalize(id, &mut |record| {
            if record.status != TransferStatus::Completed || record.server_notified {
                return Ok(());
            }
            record.status = TransferStatus::CompletedNotified;
            record.server_notified = true;
            Ok(())
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use draw_core::memory::InMemoryTransferStore;
    use draw_core::TransferRecord;
    use uuid::Uuid;

    #[test]
    fn test_only_exact_ack_counts() {
        assert!(is_acknowledged(Some("Notification received")));
        assert!(!is_acknowledged(Some("OK")));
        assert!(!is_acknowledged(Some("notification received later")));
        assert!(!is_acknowledged(None));
    }

    fn completed_transfer(id: Uuid) -> TransferRecord {
        TransferRecord {
            id,
            study_instance_uid: "s".into(),
            series_instance_uid: "se".into(),
            zip_file_path: "/tmp/x.zip".into(),
            zip_checksum: "abc".into(),
            server_token: Some("tok".into()),
            status: TransferStatus::Completed,
            server_status: Some("SEGMENTATION COMPLETED".into()),
            rtstruct_file_path: Some("/tmp/out.dcm".into()),
            rtstruct_checksum: Some("abc".into()),
            rtstruct_checksum_verified: true,
            sent_at: Some(Utc::now()),
            rtstruct_received_at: Some(Utc::now()),
            last_poll_attempt: None,
            poll_attempts: 3,
            server_notified: false,
            cleaned_up: true,
            error_message: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_mark_notified_flips_completed_record() {
        let store: Arc<dyn TransferStore> = Arc::new(InMemoryTransferStore::new());
        let id = Uuid::new_v4();
        store.create_transfer(&completed_transfer(id)).await.unwrap();

        mark_notified(&store, id).await.unwrap();

        let record = store.get_transfer(id).await.unwrap().unwrap();
        assert_eq!(record.status, TransferStatus::CompletedNotified);
        assert!(record.server_notified);
        // 通知后不再出现在未通知列表
        assert!(store.list_unnotified_transfers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mark_notified_ignores_non_completed() {
        let store: Arc<dyn TransferStore> = Arc::new(InMemoryTransferStore::new());
        let id = Uuid::new_v4();
        let mut record = completed_transfer(id);
        record.status = TransferStatus::Sent;
        store.create_transfer(&record).await.unwrap();

        mark_notified(&store, id).await.unwrap();

        let record = store.get_transfer(id).await.unwrap().unwrap();
        assert_eq!(record.status, TransferStatus::Sent);
        assert!(!record.server_notified);
    }
}
