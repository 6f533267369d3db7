//! 系列分拣
//!
//! 从数据店复制新增目录，然后把散落的文件按系列UID归组到
//! 各自的工作目录。归组用移动完成，分拣成功后源目录为空，
//! 可以安全删除。

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use draw_core::store::ProcessingStore;
use draw_core::utils::parse_dicom_date;
use draw_core::{
    CopyTask, DrawError, ProcessingLogEntry, ProcessingRecord, ProcessingStatus, Result,
    SeriesState, StageItem, StageResult,
};
use draw_dicom::{DicomParser, SeriesMetadata};
use draw_storage::workdir;

/// 目录稳定窗口：修改时间早于这个间隔才认为写入已结束
const SETTLE_MINUTES: i64 = 10;
/// 扫描回看窗口：只处理最近一周内修改过的目录
const LOOKBACK_DAYS: i64 = 7;

/// 一个分拣出的系列
#[derive(Debug, Clone)]
pub struct SeparatedSeries {
    pub record_id: Uuid,
    pub series_instance_uid: String,
    pub directory: PathBuf,
    pub metadata: SeriesMetadata,
}

/// 扫描数据店并复制新增目录到导入目录
///
/// 只复制直接包含文件、且修改时间落在回看窗口内并已稳定的目录；
/// 同一来源目录同一修改时间只复制一次，重复调用是幂等的。
pub async fn copy_from_datastore(
    datastore: &Path,
    import_dir: &Path,
    store: &Arc<dyn ProcessingStore>,
) -> Result<StageResult> {
    if !datastore.is_dir() {
        return Err(DrawError::NotFound(format!(
            "datastore {}",
            datastore.display()
        )));
    }
    workdir::ensure_dir(import_dir).await?;

    let now = Utc::now();
    let mut successful = Vec::new();
    let mut failed = Vec::new();

    for source in directories_with_files(datastore).await? {
        let modified = dir_modified_at(&source).await?;
        if modified < now - Duration::days(LOOKBACK_DAYS) {
            continue;
        }
        if modified > now - Duration::minutes(SETTLE_MINUTES) {
            debug!("skipping {}: still settling", source.display());
            continue;
        }

        let source_str = source.to_string_lossy().into_owned();
        if let Some(existing) = store.find_copy_task_by_source(&source_str).await? {
            if existing.source_modified_at == modified {
                debug!("skipping {}: already copied", source.display());
                continue;
            }
        }

        match copy_one_directory(&source, import_dir, modified, store).await {
            Ok(target) => {
                successful.push(StageItem::for_path(target.to_string_lossy()));
            }
            Err(e) => {
                warn!("failed to copy {}: {}", source.display(), e);
                failed.push(StageItem::for_path(source_str).with_detail(e.to_string()));
            }
        }
    }

    info!(
        "datastore scan copied {} directories, {} failed",
        successful.len(),
        failed.len()
    );
    Ok(StageResult::from_items(
        "datastore copy finished",
        successful,
        failed,
    ))
}

async fn copy_one_directory(
    source: &Path,
    import_dir: &Path,
    modified: DateTime<Utc>,
    store: &Arc<dyn ProcessingStore>,
) -> Result<PathBuf> {
    let target = import_dir.join(Uuid::new_v4().to_string());
    let files = workdir::list_files_recursive(source).await?;
    let mut size = 0u64;
    for file in &files {
        let relative = file
            .strip_prefix(source)
            .map_err(|e| DrawError::Storage(e.to_string()))?;
        let dest = target.join(relative);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        size += tokio::fs::copy(file, &dest).await?;
    }

    let task = CopyTask {
        id: Uuid::new_v4(),
        source_directory: source.to_string_lossy().into_owned(),
        source_modified_at: modified,
        source_size_bytes: size,
        target_directory: target.to_string_lossy().into_owned(),
        copy_completed: true,
        created_at: Utc::now(),
    };
    store.create_copy_task(&task).await?;
    Ok(target)
}

/// 找出直接包含文件的目录
async fn directories_with_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut result = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let mut has_files = false;
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                has_files = true;
            }
        }
        if has_files && dir != root {
            result.push(dir);
        }
    }

    result.sort();
    Ok(result)
}

async fn dir_modified_at(dir: &Path) -> Result<DateTime<Utc>> {
    let metadata = tokio::fs::metadata(dir).await?;
    let modified = metadata.modified()?;
    Ok(modified.into())
}

/// 把源目录中的文件按系列归组
///
/// 每个文件尝试按DICOM解析；解析失败的文件跳过并计入失败列表，
/// 模态不在白名单内的文件拒绝。成功的文件移动到
/// `processing_dir/{seriesUID}/`，并为每个新系列建立处理记录。
pub async fn separate_into_series(
    source_dir: &Path,
    processing_dir: &Path,
    allow_list: &[String],
    store: &Arc<dyn ProcessingStore>,
) -> Result<(Vec<SeparatedSeries>, StageResult)> {
    if !source_dir.is_dir() {
        return Err(DrawError::NotFound(format!(
            "source directory {}",
            source_dir.display()
        )));
    }
    workdir::ensure_dir(processing_dir).await?;

    let files = workdir::list_files_recursive(source_dir).await?;
    info!(
        "separating {} files from {}",
        files.len(),
        source_dir.display()
    );

    let mut series_dirs: HashMap<String, SeriesMetadata> = HashMap::new();
    let mut successful = Vec::new();
    let mut failed = Vec::new();

    for file in files {
        let metadata = match DicomParser::extract_metadata(&file) {
            Ok(m) => m,
            Err(DrawError::MalformedInput(_)) => {
                // 非DICOM文件静默跳过，留在原地
                debug!("skipping non-DICOM file {}", file.display());
                continue;
            }
            Err(e) => return Err(e),
        };

        if !DicomParser::modality_allowed(&metadata, allow_list) {
            warn!(
                "rejecting {}: modality {:?} not in allow list",
                file.display(),
                metadata.modality
            );
            failed.push(
                StageItem::for_path(file.to_string_lossy())
                    .with_detail("modality not allowed"),
            );
            continue;
        }

        let series_uid = match &metadata.series_instance_uid {
            Some(uid) => uid.clone(),
            None => {
                failed.push(
                    StageItem::for_path(file.to_string_lossy())
                        .with_detail("missing series instance uid"),
                );
                continue;
            }
        };

        let series_dir = processing_dir.join(&series_uid);
        let file_name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        workdir::move_file(&file, series_dir.join(file_name)).await?;

        series_dirs.entry(series_uid).or_insert(metadata);
    }

    // 分拣完成后源目录应当只剩空壳
    workdir::cleanup_empty_dirs(source_dir).await?;

    let mut separated = Vec::new();
    for (series_uid, metadata) in series_dirs {
        let directory = processing_dir.join(&series_uid);
        let record_id =
            ensure_processing_record(&series_uid, &directory, &metadata, store).await?;
        successful.push(StageItem::for_series(record_id, series_uid.clone()));
        separated.push(SeparatedSeries {
            record_id,
            series_instance_uid: series_uid,
            directory,
            metadata,
        });
    }

    let result = StageResult::from_items("series separation finished", successful, failed);
    Ok((separated, result))
}

/// 为系列建立处理记录；记录已存在时复用（重跑安全）
async fn ensure_processing_record(
    series_uid: &str,
    directory: &Path,
    metadata: &SeriesMetadata,
    store: &Arc<dyn ProcessingStore>,
) -> Result<Uuid> {
    if let Some(existing) = store.find_record_by_series_uid(series_uid).await? {
        debug!("processing record for {} already exists", series_uid);
        return Ok(existing.id);
    }

    let record = ProcessingRecord {
        id: Uuid::new_v4(),
        copy_task_id: None,
        patient_id: metadata.patient_id.clone().unwrap_or_default(),
        patient_name: metadata.patient_name.clone(),
        modality: metadata.modality.clone().unwrap_or_default(),
        study_instance_uid: metadata.study_instance_uid.clone().unwrap_or_default(),
        series_instance_uid: series_uid.to_string(),
        series_description: metadata.series_description.clone(),
        study_date: metadata.study_date.as_deref().and_then(parse_dicom_date),
        protocol: metadata.protocol_name.clone(),
        import_directory: directory.to_string_lossy().into_owned(),
        current_directory: directory.to_string_lossy().into_owned(),
        template_name: None,
        status: ProcessingStatus::SeriesSeparated,
        state: SeriesState::Processing,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    store.create_record(&record).await?;
    store
        .append_log(&ProcessingLogEntry {
            id: Uuid::new_v4(),
            processing_record_id: record.id,
            status: ProcessingStatus::SeriesSeparated,
            message: format!("series separated into {}", directory.display()),
            created_at: Utc::now(),
        })
        .await?;
    Ok(record.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom::core::{DataElement, PrimitiveValue, VR};
    use dicom::dictionary_std::tags;
    use dicom::object::{FileMetaTableBuilder, InMemDicomObject};
    use draw_core::memory::InMemoryProcessingStore;
    use tempfile::tempdir;

    /// 写一个最小可解析的DICOM文件
    fn write_dicom_file(path: &Path, patient: &str, series_uid: &str, sop_uid: &str, modality: &str) {
        let mut obj = InMemDicomObject::new_empty();
        obj.put(DataElement::new(
            tags::PATIENT_ID,
            VR::LO,
            PrimitiveValue::from(patient),
        ));
        obj.put(DataElement::new(
            tags::MODALITY,
            VR::CS,
            PrimitiveValue::from(modality),
        ));
        obj.put(DataElement::new(
            tags::STUDY_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from("1.2.900.1"),
        ));
        obj.put(DataElement::new(
            tags::SERIES_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(series_uid),
        ));
        obj.put(DataElement::new(
            tags::SOP_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(sop_uid),
        ));
        obj.put(DataElement::new(
            tags::SOP_CLASS_UID,
            VR::UI,
            PrimitiveValue::from("1.2.840.10008.5.1.4.1.1.2"),
        ));

        let file_obj = obj
            .with_meta(
                FileMetaTableBuilder::new()
                    .media_storage_sop_class_uid("1.2.840.10008.5.1.4.1.1.2")
                    .media_storage_sop_instance_uid(sop_uid)
                    .transfer_syntax("1.2.840.10008.1.2.1"),
            )
            .unwrap();
        file_obj.write_to_file(path).unwrap();
    }

    fn allow_list() -> Vec<String> {
        vec!["CT".into(), "MR".into()]
    }

    #[tokio::test]
    async fn test_separation_groups_by_series_and_empties_source() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("incoming");
        tokio::fs::create_dir_all(source.join("sub")).await.unwrap();
        write_dicom_file(&source.join("a.dcm"), "P1", "1.2.900.1.1", "1.2.900.1.1.1", "CT");
        write_dicom_file(&source.join("sub/b.dcm"), "P1", "1.2.900.1.1", "1.2.900.1.1.2", "CT");
        write_dicom_file(&source.join("c.dcm"), "P1", "1.2.900.1.2", "1.2.900.1.2.1", "MR");

        let processing = dir.path().join("processing");
        let store: Arc<dyn ProcessingStore> = Arc::new(InMemoryProcessingStore::new());

        let (separated, result) =
            separate_into_series(&source, &processing, &allow_list(), &store)
                .await
                .unwrap();

        assert_eq!(separated.len(), 2);
        assert_eq!(result.status, draw_core::StageStatus::Success);
        assert!(processing.join("1.2.900.1.1").join("a.dcm").exists());
        assert!(processing.join("1.2.900.1.1").join("b.dcm").exists());
        assert!(processing.join("1.2.900.1.2").join("c.dcm").exists());
        // 源目录分拣后被清空移除
        assert!(!source.exists());
    }

    #[tokio::test]
    async fn test_separation_skips_malformed_and_disallowed() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("incoming");
        tokio::fs::create_dir_all(&source).await.unwrap();
        write_dicom_file(&source.join("good.dcm"), "P1", "1.2.900.2.1", "1.2.900.2.1.1", "CT");
        write_dicom_file(&source.join("scout.dcm"), "P1", "1.2.900.2.2", "1.2.900.2.2.1", "RTSTRUCT");
        tokio::fs::write(source.join("notes.txt"), b"not dicom")
            .await
            .unwrap();

        let processing = dir.path().join("processing");
        let store: Arc<dyn ProcessingStore> = Arc::new(InMemoryProcessingStore::new());

        let (separated, result) =
            separate_into_series(&source, &processing, &allow_list(), &store)
                .await
                .unwrap();

        assert_eq!(separated.len(), 1);
        // 模态被拒的文件上报，非DICOM文件静默跳过
        assert_eq!(result.status, draw_core::StageStatus::PartialFailure);
        assert_eq!(result.failed.len(), 1);
    }

    #[tokio::test]
    async fn test_separation_is_idempotent_per_series() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("incoming");
        tokio::fs::create_dir_all(&source).await.unwrap();
        write_dicom_file(&source.join("a.dcm"), "P1", "1.2.900.3.1", "1.2.900.3.1.1", "CT");

        let processing = dir.path().join("processing");
        let store: Arc<dyn ProcessingStore> = Arc::new(InMemoryProcessingStore::new());

        let (first, _) = separate_into_series(&source, &processing, &allow_list(), &store)
            .await
            .unwrap();

        // 同一系列再次到达：复用已有处理记录
        tokio::fs::create_dir_all(&source).await.unwrap();
        write_dicom_file(&source.join("late.dcm"), "P1", "1.2.900.3.1", "1.2.900.3.1.9", "CT");
        let (second, _) = separate_into_series(&source, &processing, &allow_list(), &store)
            .await
            .unwrap();

        assert_eq!(first[0].record_id, second[0].record_id);
    }
}
