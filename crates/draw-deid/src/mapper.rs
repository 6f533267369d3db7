//! 身份映射器
//!
//! 原始标识到替代标识的双向持久映射。同一原始标识无论何时再次
//! 出现都得到同一个替代值（幂等），不同原始标识的替代值两两不同
//! （单射）。替代UID按层级派生：检查是 `{患者}.{n}.0`，系列是
//! `{检查}.{m}`，m 取该检查下未被占用的最小后缀。

use chrono::{NaiveDate, Utc};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use draw_core::store::IdentityStore;
use draw_core::utils::{generate_pseudo_id, shift_date};
use draw_core::{
    DrawError, IdentityLevel, InstanceRecord, PatientRecord, Result, SeriesRecord, StudyRecord,
};

/// 替代患者姓名的固定占位符
const PATIENT_NAME_PLACEHOLDER: &str = "#";

/// 身份映射器
pub struct IdentityMapper {
    store: Arc<dyn IdentityStore>,
    /// 本次运行内的参考帧映射缓存。参考帧UID在同一检查的多个
    /// 系列间共享，缓存保证同一原始参考帧得到同一替代值。
    frame_cache: Mutex<HashMap<String, String>>,
}

impl IdentityMapper {
    pub fn new(store: Arc<dyn IdentityStore>) -> Self {
        Self {
            store,
            frame_cache: Mutex::new(HashMap::new()),
        }
    }

    /// 患者级映射
    ///
    /// 已有映射的患者原样返回，存储的替代出生日期不会被重新计算，
    /// 同一患者的重复导入因此是幂等的。
    pub async fn pseudonymize_patient(
        &self,
        patient_id: &str,
        patient_name: Option<&str>,
        patient_birth_date: Option<NaiveDate>,
        date_offset: i64,
    ) -> Result<PatientRecord> {
        if let Some(existing) = self.store.find_patient(patient_id).await? {
            debug!("reusing patient mapping for {}", patient_id);
            return Ok(existing);
        }

        let record = PatientRecord {
            patient_id: patient_id.to_string(),
            patient_name: patient_name.map(str::to_string),
            patient_birth_date,
            deidentified_patient_id: generate_pseudo_id(),
            deidentified_patient_name: Some(PATIENT_NAME_PLACEHOLDER.to_string()),
            deidentified_patient_birth_date: patient_birth_date.map(|d| shift_date(d, date_offset)),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        self.store.save_patient(&record).await?;
        info!(
            "created patient mapping {} -> {}",
            patient_id, record.deidentified_patient_id
        );
        Ok(record)
    }

    /// 检查级映射
    ///
    /// 新检查的替代UID是 `{患者替代ID}.{计数}.0`，计数按患者单调
    /// 递增；计数查询由存储层保证事务性。
    pub async fn pseudonymize_study(
        &self,
        patient: &PatientRecord,
        study_instance_uid: &str,
        study_date: Option<NaiveDate>,
        study_description: Option<&str>,
        study_id: Option<&str>,
        date_offset: i64,
    ) -> Result<StudyRecord> {
        if let Some(existing) = self.store.find_study(study_instance_uid).await? {
            debug!("reusing study mapping for {}", study_instance_uid);
            return Ok(existing);
        }

        let counter = self
            .store
            .study_count_for_patient(&patient.deidentified_patient_id)
            .await?
            + 1;
        let deidentified_uid = format!("{}.{}.0", patient.deidentified_patient_id, counter);

        let record = StudyRecord {
            study_instance_uid: study_instance_uid.to_string(),
            patient_id: patient.patient_id.clone(),
            study_date,
            study_description: study_description.map(str::to_string),
            study_id: study_id.map(str::to_string),
            deidentified_study_instance_uid: deidentified_uid,
            deidentified_study_date: study_date.map(|d| shift_date(d, date_offset)),
            deidentified_study_id: Some(counter.to_string()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        self.store.save_study(&record).await?;
        info!(
            "created study mapping {} -> {}",
            study_instance_uid, record.deidentified_study_instance_uid
        );
        Ok(record)
    }

    /// 系列级映射
    ///
    /// 新系列取该检查下一个未被占用的数字后缀，提交前再次做碰撞
    /// 检查，循环直到拿到空闲后缀。
    pub async fn pseudonymize_series(
        &self,
        study: &StudyRecord,
        series_instance_uid: &str,
        series_date: Option<NaiveDate>,
        frame_of_reference_uid: Option<&str>,
        date_offset: i64,
    ) -> Result<SeriesRecord> {
        if let Some(existing) = self.store.find_series(series_instance_uid).await? {
            debug!("reusing series mapping for {}", series_instance_uid);
            if let (Some(original), Some(pseudo)) = (
                &existing.frame_of_reference_uid,
                &existing.deidentified_frame_of_reference_uid,
            ) {
                self.frame_cache
                    .lock()
                    .await
                    .insert(original.clone(), pseudo.clone());
            }
            return Ok(existing);
        }

        let deidentified_uid = self.allocate_series_uid(study).await?;
        let deidentified_frame = match frame_of_reference_uid {
            Some(original) => Some(
                self.pseudonymize_frame_of_reference(study, original)
                    .await?,
            ),
            None => None,
        };

        let record = SeriesRecord {
            series_instance_uid: series_instance_uid.to_string(),
            study_instance_uid: study.study_instance_uid.clone(),
            series_date,
            frame_of_reference_uid: frame_of_reference_uid.map(str::to_string),
            deidentified_series_instance_uid: deidentified_uid,
            deidentified_series_date: series_date.map(|d| shift_date(d, date_offset)),
            deidentified_frame_of_reference_uid: deidentified_frame,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        self.store.save_series(&record).await?;
        info!(
            "created series mapping {} -> {}",
            series_instance_uid, record.deidentified_series_instance_uid
        );
        Ok(record)
    }

    /// 分配检查下一个未占用的系列后缀
    async fn allocate_series_uid(&self, study: &StudyRecord) -> Result<String> {
        let study_pseudo = &study.deidentified_study_instance_uid;
        let existing = self
            .store
            .deidentified_series_uids_for_study(study_pseudo)
            .await?;

        let mut next = existing
            .iter()
            .filter_map(|uid| uid.rsplit('.').next()?.parse::<u32>().ok())
            .max()
            .map(|n| n + 1)
            .unwrap_or(1);

        // 提交前复查占用，循环直到空闲
        loop {
            let candidate = format!("{}.{}", study_pseudo, next);
            if !self
                .store
                .deidentified_series_uid_exists(&candidate)
                .await?
            {
                return Ok(candidate);
            }
            next += 1;
        }
    }

    /// 参考帧映射
    ///
    /// 同一原始参考帧UID在本次运行内总是得到同一个替代值，
    /// 替代值挂在检查替代UID下，带四位随机后缀。
    pub async fn pseudonymize_frame_of_reference(
        &self,
        study: &StudyRecord,
        original_frame_uid: &str,
    ) -> Result<String> {
        let mut cache = self.frame_cache.lock().await;
        if let Some(existing) = cache.get(original_frame_uid) {
            return Ok(existing.clone());
        }

        let suffix: u32 = rand::thread_rng().gen_range(1000..=9999);
        let pseudo = format!("{}.{}", study.deidentified_study_instance_uid, suffix);
        cache.insert(original_frame_uid.to_string(), pseudo.clone());
        Ok(pseudo)
    }

    /// 实例级映射
    ///
    /// 实例已有替代UID时复用，覆盖重试或重复摄取的场景。
    pub async fn pseudonymize_instance(
        &self,
        series: &SeriesRecord,
        sop_instance_uid: &str,
    ) -> Result<InstanceRecord> {
        if let Some(existing) = self.store.find_instance(sop_instance_uid).await? {
            debug!("reusing instance mapping for {}", sop_instance_uid);
            return Ok(existing);
        }

        let record = InstanceRecord {
            sop_instance_uid: sop_instance_uid.to_string(),
            series_instance_uid: series.series_instance_uid.clone(),
            deidentified_sop_instance_uid: generate_pseudo_id(),
            created_at: Utc::now(),
        };
        self.store.save_instance(&record).await?;
        Ok(record)
    }

    /// 反向查询：替代标识找回原始标识
    ///
    /// 重识别引擎是唯一调用方；未知映射返回 `NotFound`，
    /// 说明产物属于外来系列。
    pub async fn reverse_lookup(&self, pseudonymous_id: &str, level: IdentityLevel) -> Result<String> {
        let found = match level {
            IdentityLevel::Patient => self
                .store
                .find_patient_by_deidentified_id(pseudonymous_id)
                .await?
                .map(|p| p.patient_id),
            IdentityLevel::Study => self
                .store
                .find_study_by_deidentified_uid(pseudonymous_id)
                .await?
                .map(|s| s.study_instance_uid),
            IdentityLevel::Series => self
                .store
                .find_series_by_deidentified_uid(pseudonymous_id)
                .await?
                .map(|s| s.series_instance_uid),
            IdentityLevel::Instance => None,
        };

        found.ok_or_else(|| {
            DrawError::NotFound(format!(
                "no identity mapping for {} at {:?} level",
                pseudonymous_id, level
            ))
        })
    }

    pub fn store(&self) -> &Arc<dyn IdentityStore> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use draw_core::memory::InMemoryIdentityStore;
    use draw_core::utils::parse_dicom_date;

    fn mapper() -> IdentityMapper {
        IdentityMapper::new(Arc::new(InMemoryIdentityStore::new()))
    }

    #[tokio::test]
    async fn test_patient_mapping_is_idempotent() {
        let mapper = mapper();
        let birth = parse_dicom_date("19700515");

        let first = mapper
            .pseudonymize_patient("P1", Some("Doe^Jane"), birth, -10)
            .await
            .unwrap();
        // 第二次用不同的偏移量：必须复用已存储的替代值
        let second = mapper
            .pseudonymize_patient("P1", Some("Doe^Jane"), birth, 33)
            .await
            .unwrap();

        assert_eq!(first.deidentified_patient_id, second.deidentified_patient_id);
        assert_eq!(
            first.deidentified_patient_birth_date,
            second.deidentified_patient_birth_date
        );
    }

    #[tokio::test]
    async fn test_patient_mapping_is_injective() {
        let mapper = mapper();
        let a = mapper
            .pseudonymize_patient("P1", None, None, 0)
            .await
            .unwrap();
        let b = mapper
            .pseudonymize_patient("P2", None, None, 0)
            .await
            .unwrap();
        assert_ne!(a.deidentified_patient_id, b.deidentified_patient_id);
    }

    #[tokio::test]
    async fn test_study_uid_is_hierarchical() {
        let mapper = mapper();
        let patient = mapper
            .pseudonymize_patient("P1", None, None, 0)
            .await
            .unwrap();

        let first = mapper
            .pseudonymize_study(&patient, "S1", None, None, None, 0)
            .await
            .unwrap();
        let second = mapper
            .pseudonymize_study(&patient, "S2", None, None, None, 0)
            .await
            .unwrap();

        assert_eq!(
            first.deidentified_study_instance_uid,
            format!("{}.1.0", patient.deidentified_patient_id)
        );
        assert_eq!(
            second.deidentified_study_instance_uid,
            format!("{}.2.0", patient.deidentified_patient_id)
        );
    }

    #[tokio::test]
    async fn test_series_suffix_allocation_skips_used() {
        let mapper = mapper();
        let patient = mapper
            .pseudonymize_patient("P1", None, None, 0)
            .await
            .unwrap();
        let study = mapper
            .pseudonymize_study(&patient, "S1", None, None, None, 0)
            .await
            .unwrap();

        let se1 = mapper
            .pseudonymize_series(&study, "SE1", None, None, 0)
            .await
            .unwrap();
        let se2 = mapper
            .pseudonymize_series(&study, "SE2", None, None, 0)
            .await
            .unwrap();

        let study_pseudo = &study.deidentified_study_instance_uid;
        assert_eq!(
            se1.deidentified_series_instance_uid,
            format!("{}.1", study_pseudo)
        );
        assert_eq!(
            se2.deidentified_series_instance_uid,
            format!("{}.2", study_pseudo)
        );
    }

    #[tokio::test]
    async fn test_scenario_two_series_same_run() {
        // 同一次运行、偏移-10天：两个系列共享同一检查映射，
        // 检查日期 20240101 -> 20231222；重复去标识化SE1得到
        // 与第一次相同的检查替代UID
        let mapper = mapper();
        let study_date = parse_dicom_date("20240101");

        let patient = mapper
            .pseudonymize_patient("P1", None, None, -10)
            .await
            .unwrap();
        let study = mapper
            .pseudonymize_study(&patient, "S1", study_date, None, None, -10)
            .await
            .unwrap();
        mapper
            .pseudonymize_series(&study, "SE1", study_date, None, -10)
            .await
            .unwrap();
        mapper
            .pseudonymize_series(&study, "SE2", study_date, None, -10)
            .await
            .unwrap();

        assert_eq!(
            study.deidentified_study_date,
            parse_dicom_date("20231222")
        );

        let rerun = mapper
            .pseudonymize_study(&patient, "S1", study_date, None, None, -10)
            .await
            .unwrap();
        assert_eq!(
            rerun.deidentified_study_instance_uid,
            study.deidentified_study_instance_uid
        );
    }

    #[tokio::test]
    async fn test_frame_of_reference_shared_across_series() {
        let mapper = mapper();
        let patient = mapper
            .pseudonymize_patient("P1", None, None, 0)
            .await
            .unwrap();
        let study = mapper
            .pseudonymize_study(&patient, "S1", None, None, None, 0)
            .await
            .unwrap();

        let se1 = mapper
            .pseudonymize_series(&study, "SE1", None, Some("FRAME1"), 0)
            .await
            .unwrap();
        let se2 = mapper
            .pseudonymize_series(&study, "SE2", None, Some("FRAME1"), 0)
            .await
            .unwrap();

        assert_eq!(
            se1.deidentified_frame_of_reference_uid,
            se2.deidentified_frame_of_reference_uid
        );
    }

    #[tokio::test]
    async fn test_instance_mapping_reused_on_retry() {
        let mapper = mapper();
        let patient = mapper
            .pseudonymize_patient("P1", None, None, 0)
            .await
            .unwrap();
        let study = mapper
            .pseudonymize_study(&patient, "S1", None, None, None, 0)
            .await
            .unwrap();
        let series = mapper
            .pseudonymize_series(&study, "SE1", None, None, 0)
            .await
            .unwrap();

        let first = mapper
            .pseudonymize_instance(&series, "SOP1")
            .await
            .unwrap();
        let second = mapper
            .pseudonymize_instance(&series, "SOP1")
            .await
            .unwrap();
        assert_eq!(
            first.deidentified_sop_instance_uid,
            second.deidentified_sop_instance_uid
        );
    }

    #[tokio::test]
    async fn test_reverse_lookup_round_trip() {
        let mapper = mapper();
        let patient = mapper
            .pseudonymize_patient("P1", None, None, 0)
            .await
            .unwrap();
        let study = mapper
            .pseudonymize_study(&patient, "S1", None, None, None, 0)
            .await
            .unwrap();
        let series = mapper
            .pseudonymize_series(&study, "SE1", None, None, 0)
            .await
            .unwrap();

        let original = mapper
            .reverse_lookup(
                &series.deidentified_series_instance_uid,
                IdentityLevel::Series,
            )
            .await
            .unwrap();
        assert_eq!(original, "SE1");

        let missing = mapper
            .reverse_lookup("9.9.9.9", IdentityLevel::Series)
            .await;
        assert!(matches!(missing, Err(DrawError::NotFound(_))));
    }
}
