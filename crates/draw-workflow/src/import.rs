//! 导入流水线
//!
//! 轮询 → 重识别 → 导出。产物回到原始标识后移入导出目录，
//! 对应的处理记录推进到 RTSTRUCT_EXPORTED，系列生命周期闭环。

use std::sync::Arc;
use tracing::{info, warn};

use crate::export::{advance_status, PipelineSummary, StageOutcome};
use crate::state_machine::ProcessingStateMachine;
use draw_core::store::{ProcessingStore, TransferStore};
use draw_core::{
    DrawConfig, ProcessingStatus, Result, SeriesState, StageItem, StageResult,
};
use draw_deid::{reidentify_artifacts, IdentityMapper};
use draw_storage::workdir;
use draw_transfer::{notify_completed_transfers, poll_pending_transfers, DrawApiClient};

/// 导入流水线
pub struct ImportPipeline {
    config: DrawConfig,
    machine: ProcessingStateMachine,
    processing: Arc<dyn ProcessingStore>,
    transfers: Arc<dyn TransferStore>,
    mapper: Arc<IdentityMapper>,
    client: Arc<DrawApiClient>,
}

impl ImportPipeline {
    pub fn new(
        config: DrawConfig,
        processing: Arc<dyn ProcessingStore>,
        transfers: Arc<dyn TransferStore>,
        mapper: Arc<IdentityMapper>,
        client: Arc<DrawApiClient>,
    ) -> Self {
        Self {
            config,
            machine: ProcessingStateMachine::new(),
            processing,
            transfers,
            mapper,
            client,
        }
    }

    /// 运行完整的导入链
    pub async fn run(&self) -> Result<PipelineSummary> {
        for dir in self.config.directories.all() {
            workdir::ensure_dir(dir).await?;
        }

        let mut stages = Vec::new();

        let polled = self.poll_stage().await?;
        stages.push(StageOutcome {
            name: "poll".to_string(),
            result: polled,
        });

        let reidentified = self.reidentify_stage().await?;
        stages.push(StageOutcome {
            name: "reidentify".to_string(),
            result: reidentified,
        });

        let notified = self.notify_stage().await?;
        stages.push(StageOutcome {
            name: "notify".to_string(),
            result: notified,
        });

        Ok(PipelineSummary { stages })
    }

    /// 阶段一：轮询远端并下载完成的产物
    pub async fn poll_stage(&self) -> Result<StageResult> {
        poll_pending_transfers(
            &self.client,
            &self.transfers,
            &self.config.directories.deidentified_download,
        )
        .await
    }

    /// 阶段二：重识别并导出
    ///
    /// 每个产物独立成败；导出成功后产物源文件删除，处理记录
    /// 推进到 RTSTRUCT_EXPORTED。
    pub async fn reidentify_stage(&self) -> Result<StageResult> {
        let (artifacts, mut result) = reidentify_artifacts(
            &self.config.directories.deidentified_download,
            &self.config.directories.reidentified_output,
            &self.mapper,
            &self.processing,
        )
        .await?;

        for artifact in artifacts {
            match self.export_artifact(&artifact).await {
                Ok(exported) => {
                    info!(
                        "exported reidentified artifact to {}",
                        exported
                    );
                }
                Err(e) => {
                    warn!(
                        "failed to export artifact {}: {}",
                        artifact.output_path.display(),
                        e
                    );
                    self.mark_export_failed(&artifact.series_instance_uid, &e)
                        .await?;
                    result.failed.push(
                        StageItem::for_path(artifact.output_path.to_string_lossy())
                            .with_detail(e.to_string()),
                    );
                }
            }
        }

        Ok(result)
    }

    /// 把重识别完成的产物移入导出目录并闭环处理记录
    async fn export_artifact(
        &self,
        artifact: &draw_deid::ReidentifiedArtifact,
    ) -> Result<String> {
        let file_name = artifact
            .output_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "rtstruct.dcm".to_string());
        let dest = workdir::unique_output_path(&self.config.directories.export, &file_name);
        workdir::move_file(&artifact.output_path, &dest).await?;

        // 源产物文件清理，避免重跑时重复处理
        tokio::fs::remove_file(&artifact.source_path).await.ok();

        if let Some(mut record) = self
            .processing
            .find_record_by_series_uid(&artifact.series_instance_uid)
            .await?
        {
            if record.status == ProcessingStatus::Deidentified {
                record.state = SeriesState::Complete;
                advance_status(
                    &self.machine,
                    &self.processing,
                    &mut record,
                    ProcessingStatus::RtstructExported,
                    format!("rtstruct exported to {}", dest.display()),
                )
                .await?;
            }
        } else {
            warn!(
                "no processing record for series {}, artifact exported without status update",
                artifact.series_instance_uid
            );
        }

        Ok(dest.to_string_lossy().into_owned())
    }

    /// 导出失败时把处理记录置入可恢复的失败终态
    async fn mark_export_failed(
        &self,
        series_instance_uid: &str,
        error: &draw_core::DrawError,
    ) -> Result<()> {
        if let Some(mut record) = self
            .processing
            .find_record_by_series_uid(series_instance_uid)
            .await?
        {
            if record.status == ProcessingStatus::Deidentified {
                record.state = SeriesState::Failed;
                advance_status(
                    &self.machine,
                    &self.processing,
                    &mut record,
                    ProcessingStatus::RtstructExportFailed,
                    format!("rtstruct export failed: {}", error),
                )
                .await?;
            }
        }
        Ok(())
    }

    /// 阶段三：通知远端已完成的传输
    pub async fn notify_stage(&self) -> Result<StageResult> {
        notify_completed_transfers(&self.client, &self.transfers).await
    }
}
