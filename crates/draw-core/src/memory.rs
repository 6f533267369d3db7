//! 内存存储实现
//!
//! 供单元测试与轻量部署使用；与数据库实现遵守同一套trait契约。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{DrawError, Result};
use crate::models::*;
use crate::store::*;

/// 内存身份映射存储
#[derive(Default)]
pub struct InMemoryIdentityStore {
    patients: RwLock<HashMap<String, PatientRecord>>,
    studies: RwLock<HashMap<String, StudyRecord>>,
    series: RwLock<HashMap<String, SeriesRecord>>,
    instances: RwLock<HashMap<String, InstanceRecord>>,
}

impl InMemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdentityStore for InMemoryIdentityStore {
    async fn find_patient(&self, patient_id: &str) -> Result<Option<PatientRecord>> {
        Ok(self.patients.read().await.get(patient_id).cloned())
    }

    async fn save_patient(&self, patient: &PatientRecord) -> Result<()> {
        self.patients
            .write()
            .await
            .insert(patient.patient_id.clone(), patient.clone());
        Ok(())
    }

    async fn find_study(&self, study_instance_uid: &str) -> Result<Option<StudyRecord>> {
        Ok(self.studies.read().await.get(study_instance_uid).cloned())
    }

    async fn save_study(&self, study: &StudyRecord) -> Result<()> {
        self.studies
            .write()
            .await
            .insert(study.study_instance_uid.clone(), study.clone());
        Ok(())
    }

    async fn study_count_for_patient(&self, deidentified_patient_id: &str) -> Result<u32> {
        let studies = self.studies.read().await;
        let prefix = format!("{}.", deidentified_patient_id);
        Ok(studies
            .values()
            .filter(|s| s.deidentified_study_instance_uid.starts_with(&prefix))
            .count() as u32)
    }

    async fn find_series(&self, series_instance_uid: &str) -> Result<Option<SeriesRecord>> {
        Ok(self.series.read().await.get(series_instance_uid).cloned())
    }

    async fn save_series(&self, series: &SeriesRecord) -> Result<()> {
        self.series
            .write()
            .await
            .insert(series.series_instance_uid.clone(), series.clone());
        Ok(())
    }

    async fn deidentified_series_uid_exists(&self, deidentified_series_uid: &str) -> Result<bool> {
        Ok(self
            .series
            .read()
            .await
            .values()
            .any(|s| s.deidentified_series_instance_uid == deidentified_series_uid))
    }

    async fn deidentified_series_uids_for_study(
        &self,
        deidentified_study_uid: &str,
    ) -> Result<Vec<String>> {
        let prefix = format!("{}.", deidentified_study_uid);
        Ok(self
            .series
            .read()
            .await
            .values()
            .filter(|s| s.deidentified_series_instance_uid.starts_with(&prefix))
            .map(|s| s.deidentified_series_instance_uid.clone())
            .collect())
    }

    async fn find_instance(&self, sop_instance_uid: &str) -> Result<Option<InstanceRecord>> {
        Ok(self.instances.read().await.get(sop_instance_uid).cloned())
    }

    async fn save_instance(&self, instance: &InstanceRecord) -> Result<()> {
        self.instances
            .write()
            .await
            .insert(instance.sop_instance_uid.clone(), instance.clone());
        Ok(())
    }

    async fn instances_for_series(&self, series_instance_uid: &str) -> Result<Vec<InstanceRecord>> {
        Ok(self
            .instances
            .read()
            .await
            .values()
            .filter(|i| i.series_instance_uid == series_instance_uid)
            .cloned()
            .collect())
    }

    async fn find_series_by_deidentified_uid(
        &self,
        deidentified_series_uid: &str,
    ) -> Result<Option<SeriesRecord>> {
        Ok(self
            .series
            .read()
            .await
            .values()
            .find(|s| s.deidentified_series_instance_uid == deidentified_series_uid)
            .cloned())
    }

    async fn find_study_by_deidentified_uid(
        &self,
        deidentified_study_uid: &str,
    ) -> Result<Option<StudyRecord>> {
        Ok(self
            .studies
            .read()
            .await
            .values()
            .find(|s| s.deidentified_study_instance_uid == deidentified_study_uid)
            .cloned())
    }

    async fn find_patient_by_deidentified_id(
        &self,
        deidentified_patient_id: &str,
    ) -> Result<Option<PatientRecord>> {
        Ok(self
            .patients
            .read()
            .await
            .values()
            .find(|p| p.deidentified_patient_id == deidentified_patient_id)
            .cloned())
    }
}

/// 内存处理记录存储
#[derive(Default)]
pub struct InMemoryProcessingStore {
    records: RwLock<HashMap<Uuid, ProcessingRecord>>,
    logs: RwLock<Vec<ProcessingLogEntry>>,
    copy_tasks: RwLock<HashMap<Uuid, CopyTask>>,
    rtstruct_files: RwLock<HashMap<String, RtStructFile>>,
}

impl InMemoryProcessingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProcessingStore for InMemoryProcessingStore {
    async fn create_record(&self, record: &ProcessingRecord) -> Result<()> {
        self.records.write().await.insert(record.id, record.clone());
        Ok(())
    }

    async fn get_record(&self, id: Uuid) -> Result<Option<ProcessingRecord>> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn find_record_by_series_uid(
        &self,
        series_instance_uid: &str,
    ) -> Result<Option<ProcessingRecord>> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .find(|r| r.series_instance_uid == series_instance_uid)
            .cloned())
    }

    async fn update_record(&self, record: &ProcessingRecord) -> Result<()> {
        let mut records = self.records.write().await;
        if !records.contains_key(&record.id) {
            return Err(DrawError::NotFound(format!(
                "processing record {}",
                record.id
            )));
        }
        records.insert(record.id, record.clone());
        Ok(())
    }

    async fn list_records_by_status(&self, status: ProcessingStatus) -> Result<Vec<ProcessingRecord>> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect())
    }

    async fn append_log(&self, entry: &ProcessingLogEntry) -> Result<()> {
        self.logs.write().await.push(entry.clone());
        Ok(())
    }

    async fn logs_for_record(&self, record_id: Uuid) -> Result<Vec<ProcessingLogEntry>> {
        Ok(self
            .logs
            .read()
            .await
            .iter()
            .filter(|l| l.processing_record_id == record_id)
            .cloned()
            .collect())
    }

    async fn create_copy_task(&self, task: &CopyTask) -> Result<()> {
        self.copy_tasks.write().await.insert(task.id, task.clone());
        Ok(())
    }

    async fn find_copy_task_by_source(&self, source_directory: &str) -> Result<Option<CopyTask>> {
        Ok(self
            .copy_tasks
            .read()
            .await
            .values()
            .find(|t| t.source_directory == source_directory)
            .cloned())
    }

    async fn mark_copy_task_completed(&self, id: Uuid) -> Result<()> {
        let mut tasks = self.copy_tasks.write().await;
        match tasks.get_mut(&id) {
            Some(task) => {
                task.copy_completed = true;
                Ok(())
            }
            None => Err(DrawError::NotFound(format!("copy task {}", id))),
        }
    }

    async fn upsert_rtstruct_file(&self, file: &RtStructFile) -> Result<()> {
        self.rtstruct_files
            .write()
            .await
            .insert(file.original_file_path.clone(), file.clone());
        Ok(())
    }
}

/// 内存传输记录存储
#[derive(Default)]
pub struct InMemoryTransferStore {
    transfers: RwLock<HashMap<Uuid, TransferRecord>>,
}

impl InMemoryTransferStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransferStore for InMemoryTransferStore {
    async fn create_transfer(&self, record: &TransferRecord) -> Result<()> {
        self.transfers
            .write()
            .await
            .insert(record.id, record.clone());
        Ok(())
    }

    async fn get_transfer(&self, id: Uuid) -> Result<Option<TransferRecord>> {
        Ok(self.transfers.read().await.get(&id).cloned())
    }

    async fn find_transfer_by_series_uid(
        &self,
        series_instance_uid: &str,
    ) -> Result<Option<TransferRecord>> {
        Ok(self
            .transfers
            .read()
            .await
            .values()
            .filter(|t| t.series_instance_uid == series_instance_uid)
            .max_by_key(|t| t.created_at)
            .cloned())
    }

    async fn update_transfer(&self, record: &TransferRecord) -> Result<()> {
        let mut transfers = self.transfers.write().await;
        if !transfers.contains_key(&record.id) {
            return Err(DrawError::NotFound(format!("transfer {}", record.id)));
        }
        transfers.insert(record.id, record.clone());
        Ok(())
    }

    async fn list_pending_transfers(&self) -> Result<Vec<TransferRecord>> {
        Ok(self
            .transfers
            .read()
            .await
            .values()
            .filter(|t| matches!(t.status, TransferStatus::Sent | TransferStatus::Processing))
            .cloned()
            .collect())
    }

    async fn list_unnotified_transfers(&self) -> Result<Vec<TransferRecord>> {
        Ok(self
            .transfers
            .read()
            .await
            .values()
            .filter(|t| t.status == TransferStatus::Completed && !t.server_notified)
            .cloned()
            .collect())
    }

    async fn record_poll_attempt(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let mut transfers = self.transfers.write().await;
        match transfers.get_mut(&id) {
            Some(t) => {
                t.poll_attempts += 1;
                t.last_poll_attempt = Some(at);
                Ok(())
            }
            None => Err(DrawError::NotFound(format!("transfer {}", id))),
        }
    }

    async fn lock_for_finalize(
        &self,
        id: Uuid,
        f: &mut (dyn for<'a> FnMut(&'a mut TransferRecord) -> Result<()> + Send),
    ) -> Result<()> {
        // 写锁覆盖整个关键区，与数据库实现的 SELECT ... FOR UPDATE 等价
        let mut transfers = self.transfers.write().await;
        let record = transfers
            .get_mut(&id)
            .ok_or_else(|| DrawError::NotFound(format!("transfer {}", id)))?;
        f(record)
    }
}

/// 内存模板目录存储
#[derive(Default)]
pub struct InMemoryTemplateStore {
    templates: RwLock<HashMap<String, Template>>,
    rule_sets: RwLock<HashMap<Uuid, RuleSet>>,
}

impl InMemoryTemplateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TemplateStore for InMemoryTemplateStore {
    async fn register_template(&self, template: &Template) -> Result<()> {
        self.templates
            .write()
            .await
            .insert(template.name.clone(), template.clone());
        Ok(())
    }

    async fn find_template_by_hash(&self, file_hash: &str) -> Result<Option<Template>> {
        Ok(self
            .templates
            .read()
            .await
            .values()
            .find(|t| t.file_hash == file_hash)
            .cloned())
    }

    async fn find_template_by_name(&self, name: &str) -> Result<Option<Template>> {
        Ok(self.templates.read().await.get(name).cloned())
    }

    async fn list_rule_sets(&self) -> Result<Vec<RuleSet>> {
        Ok(self.rule_sets.read().await.values().cloned().collect())
    }

    async fn save_rule_set(&self, rule_set: &RuleSet) -> Result<()> {
        self.rule_sets
            .write()
            .await
            .insert(rule_set.id, rule_set.clone());
        Ok(())
    }
}

/// 内存凭证存储
#[derive(Default)]
pub struct InMemoryCredentialStore {
    credential: RwLock<Option<Credential>>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn load_credential(&self) -> Result<Option<Credential>> {
        Ok(self.credential.read().await.clone())
    }

    async fn save_credential(&self, credential: &Credential) -> Result<()> {
        *self.credential.write().await = Some(credential.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_transfer(id: Uuid) -> TransferRecord {
        TransferRecord {
            id,
            study_instance_uid: "1.2.3".into(),
            series_instance_uid: "1.2.3.4".into(),
            zip_file_path: "/tmp/payload.zip".into(),
            zip_checksum: "abc".into(),
            server_token: Some("tok".into()),
            status: TransferStatus::Sent,
            server_status: None,
            rtstruct_file_path: None,
            rtstruct_checksum: None,
            rtstruct_checksum_verified: false,
            sent_at: Some(Utc::now()),
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
    async fn test_poll_attempt_counter_increments() {
        let store = InMemoryTransferStore::new();
        let id = Uuid::new_v4();
        store.create_transfer(&sample_transfer(id)).await.unwrap();

        store.record_poll_attempt(id, Utc::now()).await.unwrap();
        store.record_poll_attempt(id, Utc::now()).await.unwrap();

        let record = store.get_transfer(id).await.unwrap().unwrap();
        assert_eq!(record.poll_attempts, 2);
        assert!(record.last_poll_attempt.is_some());
    }

    #[tokio::test]
    async fn test_lock_for_finalize_mutates_record() {
        let store = InMemoryTransferStore::new();
        let id = Uuid::new_v4();
        store.create_transfer(&sample_transfer(id)).await.unwrap();

        store
            .lock_for_finalize(id, &mut |record| {
                record.status = TransferStatus::CompletedNotified;
                record.server_notified = true;
                Ok(())
            })
            .await
            .unwrap();

        let record = store.get_transfer(id).await.unwrap().unwrap();
        assert_eq!(record.status, TransferStatus::CompletedNotified);
        assert!(record.server_notified);
    }

    #[tokio::test]
    async fn test_unnotified_listing_excludes_notified() {
        let store = InMemoryTransferStore::new();
        let done = Uuid::new_v4();
        let mut record = sample_transfer(done);
        record.status = TransferStatus::Completed;
        store.create_transfer(&record).await.unwrap();

        let notified = Uuid::new_v4();
        let mut record = sample_transfer(notified);
        record.status = TransferStatus::Completed;
        record.server_notified = true;
        store.create_transfer(&record).await.unwrap();

        let pending = store.list_unnotified_transfers().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, done);
    }
}
