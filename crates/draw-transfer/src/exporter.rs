//! 传输发起
//!
//! 上传一个去标识化系列的压缩包并建立传输记录。任何一步失败都
//! 把记录置为 FAILED、写入错误信息后把原错误继续抛给调用方。

use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use crate::client::DrawApiClient;
use draw_core::store::TransferStore;
use draw_core::{Result, TransferRecord, TransferStatus};

/// 发起一次传输
///
/// `study_uid`/`series_uid` 是替代UID——原始标识从不离开本机。
pub async fn initiate_transfer(
    client: &DrawApiClient,
    store: &Arc<dyn TransferStore>,
    zip_path: &Path,
    study_uid: &str,
    series_uid: &str,
    checksum: &str,
    bypass_health_check: bool,
) -> Result<TransferRecord> {
    let mut record = TransferRecord {
        id: Uuid::new_v4(),
        study_instance_uid: study_uid.to_string(),
        series_instance_uid: series_uid.to_string(),
        zip_file_path: zip_path.to_string_lossy().into_owned(),
        zip_checksum: checksum.to_string(),
        server_token: None,
        status: TransferStatus::Pending,
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
    };
    store.create_transfer(&record).await?;

    let upload_result = async {
        if bypass_health_check {
            info!("health check bypassed as requested");
        } else {
            client.health_check().await?;
        }
        client.upload(zip_path, checksum).await
    }
    .await;

    match upload_result {
        Ok(token) => {
            record.server_token = Some(token);
            record.status = TransferStatus::Sent;
            record.sent_at = Some(Utc::now());
            store.update_transfer(&record).await?;
            info!(
                "transfer {} initiated, token {:?}",
                record.id, record.server_token
            );
            Ok(record)
        }
        Err(e) => {
            let message = format!("Failed to initiate transfer: {}", e);
            error!("{}", message);
            record.status = TransferStatus::Failed;
            record.error_message = Some(message);
            store.update_transfer(&record).await?;
            Err(e)
        }
    }
}
