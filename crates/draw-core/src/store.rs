//! 持久化存储接口
//!
//! 核心组件只依赖这些trait，不假设任何具体的查询语言；计数器分配
//! 与轮询收尾等关键操作要求实现方提供事务性的读-改-写语义。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::*;

/// 身份映射存储
///
/// 映射是可逆去标识化的唯一依据，任何层级的记录都不允许删除。
#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn find_patient(&self, patient_id: &str) -> Result<Option<PatientRecord>>;
    async fn save_patient(&self, patient: &PatientRecord) -> Result<()>;

    async fn find_study(&self, study_instance_uid: &str) -> Result<Option<StudyRecord>>;
    async fn save_study(&self, study: &StudyRecord) -> Result<()>;
    /// 某患者名下已分配的检查数量，用于生成 `{患者替代ID}.{n}.0` 形式的UID。
    /// 实现必须保证分配过程的事务性，并发分配不得产生重复计数。
    async fn study_count_for_patient(&self, deidentified_patient_id: &str) -> Result<u32>;

    async fn find_series(&self, series_instance_uid: &str) -> Result<Option<SeriesRecord>>;
    async fn save_series(&self, series: &SeriesRecord) -> Result<()>;
    /// 替代系列UID是否已被占用，分配数字后缀时的碰撞检查
    async fn deidentified_series_uid_exists(&self, deidentified_series_uid: &str) -> Result<bool>;
    /// 某检查名下已有的替代系列UID列表
    async fn deidentified_series_uids_for_study(
        &self,
        deidentified_study_uid: &str,
    ) -> Result<Vec<String>>;

    async fn find_instance(&self, sop_instance_uid: &str) -> Result<Option<InstanceRecord>>;
    async fn save_instance(&self, instance: &InstanceRecord) -> Result<()>;
    async fn instances_for_series(&self, series_instance_uid: &str) -> Result<Vec<InstanceRecord>>;

    /// 反向查询：从替代系列UID找回原始系列记录。
    /// 重识别引擎是唯一的调用方。
    async fn find_series_by_deidentified_uid(
        &self,
        deidentified_series_uid: &str,
    ) -> Result<Option<SeriesRecord>>;
    async fn find_study_by_deidentified_uid(
        &self,
        deidentified_study_uid: &str,
    ) -> Result<Option<StudyRecord>>;
    async fn find_patient_by_deidentified_id(
        &self,
        deidentified_patient_id: &str,
    ) -> Result<Option<PatientRecord>>;
}

/// 流水线处理记录存储
#[async_trait]
pub trait ProcessingStore: Send + Sync {
    async fn create_record(&self, record: &ProcessingRecord) -> Result<()>;
    async fn get_record(&self, id: Uuid) -> Result<Option<ProcessingRecord>>;
    async fn find_record_by_series_uid(
        &self,
        series_instance_uid: &str,
    ) -> Result<Option<ProcessingRecord>>;
    async fn update_record(&self, record: &ProcessingRecord) -> Result<()>;
    async fn list_records_by_status(&self, status: ProcessingStatus) -> Result<Vec<ProcessingRecord>>;
    /// 追加一条处理日志；日志只增不改
    async fn append_log(&self, entry: &ProcessingLogEntry) -> Result<()>;
    async fn logs_for_record(&self, record_id: Uuid) -> Result<Vec<ProcessingLogEntry>>;

    async fn create_copy_task(&self, task: &CopyTask) -> Result<()>;
    async fn find_copy_task_by_source(&self, source_directory: &str) -> Result<Option<CopyTask>>;
    async fn mark_copy_task_completed(&self, id: Uuid) -> Result<()>;

    async fn upsert_rtstruct_file(&self, file: &RtStructFile) -> Result<()>;
}

/// 传输记录存储
#[async_trait]
pub trait TransferStore: Send + Sync {
    async fn create_transfer(&self, record: &TransferRecord) -> Result<()>;
    async fn get_transfer(&self, id: Uuid) -> Result<Option<TransferRecord>>;
    /// 某个（替代）系列UID下最近的一条传输记录
    async fn find_transfer_by_series_uid(
        &self,
        series_instance_uid: &str,
    ) -> Result<Option<TransferRecord>>;
    async fn update_transfer(&self, record: &TransferRecord) -> Result<()>;
    /// 客户端状态为 SENT 或 PROCESSING 的待轮询记录
    async fn list_pending_transfers(&self) -> Result<Vec<TransferRecord>>;
    /// 已完成但尚未通知服务端的记录
    async fn list_unnotified_transfers(&self) -> Result<Vec<TransferRecord>>;
    /// 记录一次轮询尝试（计数器与时间戳）。
    /// 每次调用都要计数，包括最终出错的调用。
    async fn record_poll_attempt(&self, id: Uuid, at: DateTime<Utc>) -> Result<()>;
    /// 以读-改-写锁语义执行收尾关键区。
    /// 两个并发的轮询者不得同时对同一条传输记录做终结操作。
    async fn lock_for_finalize(
        &self,
        id: Uuid,
        f: &mut (dyn for<'a> FnMut(&'a mut TransferRecord) -> Result<()> + Send),
    ) -> Result<()>;
}

/// 模板目录存储
#[async_trait]
pub trait TemplateStore: Send + Sync {
    async fn register_template(&self, template: &Template) -> Result<()>;
    async fn find_template_by_hash(&self, file_hash: &str) -> Result<Option<Template>>;
    async fn find_template_by_name(&self, name: &str) -> Result<Option<Template>>;
    async fn list_rule_sets(&self) -> Result<Vec<RuleSet>>;
    async fn save_rule_set(&self, rule_set: &RuleSet) -> Result<()>;
}

/// 凭证存储
///
/// 存取的都是密文，加解密在传输层的凭证管理器中完成。
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load_credential(&self) -> Result<Option<Credential>>;
    async fn save_credential(&self, credential: &Credential) -> Result<()>;
}
