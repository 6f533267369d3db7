//! RTSTRUCT重识别引擎
//!
//! 远程服务返回的结构集内嵌着对去标识化实例的交叉引用。这里
//! 通过身份映射反查出系列-检查-患者链，回填顶层标识属性，并把
//! 产物里每一个嵌套引用UID替换回原始值，产物才能回到原始
//! 归档系统使用。

use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::mapper::IdentityMapper;
use dicom::object::FileMetaTableBuilder;
use draw_core::store::ProcessingStore;
use draw_core::utils::format_dicom_date;
use draw_core::{DrawError, Result, RtStructFile, StageItem, StageResult};
use draw_dicom::rewrite::{
    find_referenced_series_uid, reidentify_object, OriginalIdentifiers, UidReferenceTable,
};
use draw_dicom::DicomParser;
use draw_storage::workdir;

/// 重识别完成的产物
#[derive(Debug, Clone)]
pub struct ReidentifiedArtifact {
    pub source_path: PathBuf,
    pub output_path: PathBuf,
    /// 原始系列UID（产物所属的系列）
    pub series_instance_uid: String,
    /// 替换的引用UID数量
    pub replaced_uids: usize,
}

/// 重识别一个目录下的全部RTSTRUCT产物
///
/// 逐个产物独立处理：N个产物得到N份各自的成败记录，单个失败
/// 不影响其余产物。
pub async fn reidentify_artifacts(
    source_dir: &Path,
    target_dir: &Path,
    mapper: &IdentityMapper,
    processing_store: &Arc<dyn ProcessingStore>,
) -> Result<(Vec<ReidentifiedArtifact>, StageResult)> {
    if !source_dir.is_dir() {
        return Err(DrawError::NotFound(format!(
            "source directory {}",
            source_dir.display()
        )));
    }
    workdir::ensure_dir(target_dir).await?;

    let mut artifacts = Vec::new();
    let mut successful = Vec::new();
    let mut failed = Vec::new();

    for file in workdir::list_files_recursive(source_dir).await? {
        // 非DICOM或非RTSTRUCT的文件直接跳过
        let obj = match DicomParser::open(&file) {
            Ok(obj) => obj,
            Err(_) => {
                warn!("skipping non-DICOM file {}", file.display());
                continue;
            }
        };
        let metadata = DicomParser::metadata_from_object(&obj);
        if metadata.modality.as_deref() != Some("RTSTRUCT") {
            info!("skipping non-RTSTRUCT file {}", file.display());
            continue;
        }

        match reidentify_one(&file, &obj, target_dir, mapper).await {
            Ok(artifact) => {
                processing_store
                    .upsert_rtstruct_file(&RtStructFile {
                        series_instance_uid: artifact.series_instance_uid.clone(),
                        original_file_path: file.to_string_lossy().into_owned(),
                        processed_file_path: Some(
                            artifact.output_path.to_string_lossy().into_owned(),
                        ),
                        processing_date: Utc::now().date_naive(),
                        processing_status: "SUCCESS".to_string(),
                    })
                    .await?;
                successful.push(
                    StageItem::for_path(artifact.output_path.to_string_lossy())
                        .with_detail(format!("{} UIDs restored", artifact.replaced_uids)),
                );
                artifacts.push(artifact);
            }
            Err(e) => {
                warn!("failed to reidentify {}: {}", file.display(), e);
                processing_store
                    .upsert_rtstruct_file(&RtStructFile {
                        series_instance_uid: "UNKNOWN".to_string(),
                        original_file_path: file.to_string_lossy().into_owned(),
                        processed_file_path: None,
                        processing_date: Utc::now().date_naive(),
                        processing_status: format!("ERROR: {}", e),
                    })
                    .await?;
                failed.push(
                    StageItem::for_path(file.to_string_lossy()).with_detail(e.to_string()),
                );
            }
        }
    }

    let result = StageResult::from_items("reidentification finished", successful, failed);
    Ok((artifacts, result))
}

/// 重识别单个产物
async fn reidentify_one(
    file: &Path,
    obj: &dicom::object::DefaultDicomObject,
    target_dir: &Path,
    mapper: &IdentityMapper,
) -> Result<ReidentifiedArtifact> {
    // 被引用的系列UID藏在嵌套序列里
    let referenced_series_uid = find_referenced_series_uid(obj).ok_or_else(|| {
        DrawError::MalformedInput(format!(
            "no referenced series UID in {}",
            file.display()
        ))
    })?;

    // 映射链反查：系列 -> 检查 -> 患者；外来系列在这里报 NotFound
    let store = mapper.store();
    let series = store
        .find_series_by_deidentified_uid(&referenced_series_uid)
        .await?
        .ok_or_else(|| {
            DrawError::NotFound(format!(
                "no identity mapping for referenced series {}",
                referenced_series_uid
            ))
        })?;
    let study = store
        .find_study(&series.study_instance_uid)
        .await?
        .ok_or_else(|| {
            DrawError::NotFound(format!("study {}", series.study_instance_uid))
        })?;
    let patient = store.find_patient(&study.patient_id).await?.ok_or_else(|| {
        DrawError::NotFound(format!("patient {}", study.patient_id))
    })?;

    // 引用表：该系列已知的实例、系列、检查三级UID全部进表
    let mut table = UidReferenceTable::new();
    for instance in store
        .instances_for_series(&series.series_instance_uid)
        .await?
    {
        table.insert(
            instance.deidentified_sop_instance_uid,
            instance.sop_instance_uid,
        );
    }
    table.insert(
        series.deidentified_series_instance_uid.clone(),
        series.series_instance_uid.clone(),
    );
    table.insert(
        study.deidentified_study_instance_uid.clone(),
        study.study_instance_uid.clone(),
    );

    let original = OriginalIdentifiers {
        study_instance_uid: study.study_instance_uid.clone(),
        patient_id: patient.patient_id.clone(),
        patient_name: patient.patient_name.clone(),
        patient_birth_date: patient.patient_birth_date.map(format_dicom_date),
        study_description: study.study_description.clone(),
        frame_of_reference_uid: series.frame_of_reference_uid.clone(),
    };

    let (rewritten, replaced_uids) = reidentify_object(obj, &original, &table);

    // 新的唯一文件名，永不覆盖已有文件
    let stem = file
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("rtstruct");
    let suffix = &Uuid::new_v4().simple().to_string()[..8];
    let output_path = target_dir.join(format!("{}_{}.dcm", stem, suffix));

    let sop_class_uid = trim_meta(&obj.meta().media_storage_sop_class_uid);
    let media_sop_uid = trim_meta(&obj.meta().media_storage_sop_instance_uid);
    let transfer_syntax = trim_meta(&obj.meta().transfer_syntax);
    rewritten
        .with_meta(
            FileMetaTableBuilder::new()
                .media_storage_sop_class_uid(sop_class_uid)
                .media_storage_sop_instance_uid(media_sop_uid)
                .transfer_syntax(transfer_syntax),
        )
        .map_err(|e| DrawError::Storage(e.to_string()))?
        .write_to_file(&output_path)
        .map_err(|e| DrawError::Storage(e.to_string()))?;

    info!(
        "reidentified {} -> {} ({} UIDs restored)",
        file.display(),
        output_path.display(),
        replaced_uids
    );
    Ok(ReidentifiedArtifact {
        source_path: file.to_path_buf(),
        output_path,
        series_instance_uid: series.series_instance_uid,
        replaced_uids,
    })
}

fn trim_meta(value: &str) -> String {
    value.trim_end_matches(['\0', ' ']).to_string()
}
