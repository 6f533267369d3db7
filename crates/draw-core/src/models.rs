//! 核心数据模型定义
//!
//! 身份映射、流水线处理记录与远程传输记录。原始标识与
//! 去标识化后的替代值始终成对保存，映射一经建立永不删除。

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 患者身份映射
///
/// 原始患者ID是自然主键，去标识化ID在首次遇到该患者时生成一次，
/// 之后所有检查复用同一个替代值。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatientRecord {
    pub patient_id: String,
    pub patient_name: Option<String>,
    pub patient_birth_date: Option<NaiveDate>,
    pub deidentified_patient_id: String,
    pub deidentified_patient_name: Option<String>,
    pub deidentified_patient_birth_date: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 检查身份映射
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudyRecord {
    pub study_instance_uid: String,
    pub patient_id: String,
    pub study_date: Option<NaiveDate>,
    pub study_description: Option<String>,
    pub study_id: Option<String>,
    pub deidentified_study_instance_uid: String,
    pub deidentified_study_date: Option<NaiveDate>,
    pub deidentified_study_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 系列身份映射
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeriesRecord {
    pub series_instance_uid: String,
    pub study_instance_uid: String,
    pub series_date: Option<NaiveDate>,
    pub frame_of_reference_uid: Option<String>,
    pub deidentified_series_instance_uid: String,
    pub deidentified_series_date: Option<NaiveDate>,
    pub deidentified_frame_of_reference_uid: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 实例身份映射
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub sop_instance_uid: String,
    pub series_instance_uid: String,
    pub deidentified_sop_instance_uid: String,
    pub created_at: DateTime<Utc>,
}

/// 身份映射的层级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdentityLevel {
    Patient,
    Study,
    Series,
    Instance,
}

/// 数据店扫描复制任务记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyTask {
    pub id: Uuid,
    pub source_directory: String,
    pub source_modified_at: DateTime<Utc>,
    pub source_size_bytes: u64,
    pub target_directory: String,
    pub copy_completed: bool,
    pub created_at: DateTime<Utc>,
}

/// 系列处理状态
///
/// 流水线的权威状态，单次运行内单调推进；只有操作员触发的
/// 重启才允许回退。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessingStatus {
    SeriesSeparated,
    TemplateNotMatched,
    MultipleTemplatesMatched,
    MultipleTemplatesFound,
    NoTemplateFound,
    ReadyForDeidentification,
    Deidentified,
    DeidentificationFailed,
    RtstructExported,
    RtstructExportFailed,
    Error,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SeriesSeparated => "SERIES_SEPARATED",
            Self::TemplateNotMatched => "TEMPLATE_NOT_MATCHED",
            Self::MultipleTemplatesMatched => "MULTIPLE_TEMPLATES_MATCHED",
            Self::MultipleTemplatesFound => "MULTIPLE_TEMPLATES_FOUND",
            Self::NoTemplateFound => "NO_TEMPLATE_FOUND",
            Self::ReadyForDeidentification => "READY_FOR_DEIDENTIFICATION",
            Self::Deidentified => "DEIDENTIFIED",
            Self::DeidentificationFailed => "DEIDENTIFICATION_FAILED",
            Self::RtstructExported => "RTSTRUCT_EXPORTED",
            Self::RtstructExportFailed => "RTSTRUCT_EXPORT_FAILED",
            Self::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SERIES_SEPARATED" => Some(Self::SeriesSeparated),
            "TEMPLATE_NOT_MATCHED" => Some(Self::TemplateNotMatched),
            "MULTIPLE_TEMPLATES_MATCHED" => Some(Self::MultipleTemplatesMatched),
            "MULTIPLE_TEMPLATES_FOUND" => Some(Self::MultipleTemplatesFound),
            "NO_TEMPLATE_FOUND" => Some(Self::NoTemplateFound),
            "READY_FOR_DEIDENTIFICATION" => Some(Self::ReadyForDeidentification),
            "DEIDENTIFIED" => Some(Self::Deidentified),
            "DEIDENTIFICATION_FAILED" => Some(Self::DeidentificationFailed),
            "RTSTRUCT_EXPORTED" => Some(Self::RtstructExported),
            "RTSTRUCT_EXPORT_FAILED" => Some(Self::RtstructExportFailed),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }
}

/// 系列总体状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SeriesState {
    Processing,
    Unprocessed,
    Complete,
    Failed,
}

impl SeriesState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "PROCESSING",
            Self::Unprocessed => "UNPROCESSED",
            Self::Complete => "COMPLETE",
            Self::Failed => "FAILED",
        }
    }
}

/// 系列处理记录
///
/// 每个进入流水线的系列对应一条记录；工作目录随阶段移动而更新，
/// 目录的存在与否本身是状态机的一部分。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingRecord {
    pub id: Uuid,
    pub copy_task_id: Option<Uuid>,
    pub patient_id: String,
    pub patient_name: Option<String>,
    pub modality: String,
    pub study_instance_uid: String,
    pub series_instance_uid: String,
    pub series_description: Option<String>,
    pub study_date: Option<NaiveDate>,
    pub protocol: Option<String>,
    pub import_directory: String,
    pub current_directory: String,
    pub template_name: Option<String>,
    pub status: ProcessingStatus,
    pub state: SeriesState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 处理日志条目，只追加不修改
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingLogEntry {
    pub id: Uuid,
    pub processing_record_id: Uuid,
    pub status: ProcessingStatus,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// 传输记录的客户端状态机
///
/// `Failed` 可以从任何非终态进入；`Completed` 必须通过校验和门禁。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferStatus {
    Pending,
    Sent,
    Processing,
    Completed,
    CompletedNotified,
    Failed,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Sent => "SENT",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::CompletedNotified => "COMPLETED_NOTIFIED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "SENT" => Some(Self::Sent),
            "PROCESSING" => Some(Self::Processing),
            "COMPLETED" => Some(Self::Completed),
            "COMPLETED_NOTIFIED" => Some(Self::CompletedNotified),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::CompletedNotified | Self::Failed)
    }
}

/// 远程传输记录
///
/// 客户端状态与服务端上报状态分别记录：两套词汇表不要求一致，
/// 服务端状态只作为旁路审计信息保存。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRecord {
    pub id: Uuid,
    pub study_instance_uid: String,
    pub series_instance_uid: String,
    pub zip_file_path: String,
    pub zip_checksum: String,
    pub server_token: Option<String>,
    pub status: TransferStatus,
    pub server_status: Option<String>,
    pub rtstruct_file_path: Option<String>,
    pub rtstruct_checksum: Option<String>,
    pub rtstruct_checksum_verified: bool,
    pub sent_at: Option<DateTime<Utc>>,
    pub rtstruct_received_at: Option<DateTime<Utc>>,
    pub last_poll_attempt: Option<DateTime<Utc>>,
    pub poll_attempts: i32,
    pub server_notified: bool,
    pub cleaned_up: bool,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 自动分割模板
///
/// 模板工件以SHA-512内容指纹注册，附带工件的匹配只认指纹。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub name: String,
    pub artifact_path: String,
    pub protocol: String,
    pub file_hash: String,
    pub description: Option<String>,
}

/// 规则集：关联一个模板，包含若干条规则
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSet {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub template_name: String,
    pub rules: Vec<Rule>,
}

/// 单条规则：标签名与期望值的精确匹配
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub tag_name: String,
    pub tag_value: String,
}

/// 重识别产物记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtStructFile {
    pub series_instance_uid: String,
    pub original_file_path: String,
    pub processed_file_path: Option<String>,
    pub processing_date: NaiveDate,
    pub processing_status: String,
}

/// 静态加密的API凭证
///
/// 两个令牌均为AES-256-GCM密文，业务逻辑只接触解密后的明文。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub encrypted_bearer_token: Option<String>,
    pub encrypted_refresh_token: Option<String>,
    pub token_expiry: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// 阶段执行的总体结论
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Success,
    PartialFailure,
    Failure,
}

/// 阶段结果
///
/// 每个流水线阶段消费上一阶段的结果并产出自己的结果；逐项的
/// 成功/失败列表保证批次内的局部失败不会阻塞无关条目。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub status: StageStatus,
    pub message: String,
    pub successful: Vec<StageItem>,
    pub failed: Vec<StageItem>,
}

/// 阶段结果中的单个条目
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageItem {
    pub record_id: Option<Uuid>,
    pub series_instance_uid: Option<String>,
    pub path: Option<String>,
    pub detail: Option<String>,
}

impl StageResult {
    /// 根据成功/失败列表推导总体结论
    pub fn from_items(message: impl Into<String>, successful: Vec<StageItem>, failed: Vec<StageItem>) -> Self {
        let status = match (successful.is_empty(), failed.is_empty()) {
            (_, true) => StageStatus::Success,
            (false, false) => StageStatus::PartialFailure,
            (true, false) => StageStatus::Failure,
        };
        Self {
            status,
            message: message.into(),
            successful,
            failed,
        }
    }
}

impl StageItem {
    pub fn for_series(record_id: Uuid, series_uid: impl Into<String>) -> Self {
        Self {
            record_id: Some(record_id),
            series_instance_uid: Some(series_uid.into()),
            path: None,
            detail: None,
        }
    }

    pub fn for_path(path: impl Into<String>) -> Self {
        Self {
            record_id: None,
            series_instance_uid: None,
            path: Some(path.into()),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_processing_status_roundtrip() {
        for status in [
            ProcessingStatus::SeriesSeparated,
            ProcessingStatus::ReadyForDeidentification,
            ProcessingStatus::Deidentified,
            ProcessingStatus::RtstructExported,
            ProcessingStatus::Error,
        ] {
            assert_eq!(ProcessingStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ProcessingStatus::parse("UNKNOWN"), None);
    }

    #[test]
    fn test_transfer_status_terminal() {
        assert!(TransferStatus::CompletedNotified.is_terminal());
        assert!(TransferStatus::Failed.is_terminal());
        assert!(!TransferStatus::Completed.is_terminal());
        assert!(!TransferStatus::Pending.is_terminal());
    }

    #[test]
    fn test_stage_result_status_derivation() {
        let ok = StageItem::for_path("/tmp/a");
        let bad = StageItem::for_path("/tmp/b").with_detail("boom");

        let r = StageResult::from_items("all good", vec![ok.clone()], vec![]);
        assert_eq!(r.status, StageStatus::Success);

        let r = StageResult::from_items("mixed", vec![ok], vec![bad.clone()]);
        assert_eq!(r.status, StageStatus::PartialFailure);

        let r = StageResult::from_items("all bad", vec![], vec![bad]);
        assert_eq!(r.status, StageStatus::Failure);

        // 空批次视为成功
        let r = StageResult::from_items("empty", vec![], vec![]);
        assert_eq!(r.status, StageStatus::Success);
    }
}
