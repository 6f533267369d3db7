//! 系列去标识化
//!
//! 对一个系列工作目录里的全部文件执行正向映射，输出写到
//! `输出目录/{替代系列UID}/{替代实例UID}.dcm`，原始文件随后
//! 删除。模板工件随系列一起搬到输出目录。

use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::mapper::IdentityMapper;
use dicom::object::FileMetaTableBuilder;
use draw_core::utils::parse_dicom_date;
use draw_core::{DrawError, Result, StageItem};
use draw_dicom::rewrite::{apply_forward_mapping, PseudonymSet};
use draw_dicom::DicomParser;
use draw_storage::workdir;

/// 去标识化完成的系列
#[derive(Debug, Clone)]
pub struct DeidentifiedSeries {
    /// 输出目录（以替代系列UID命名）
    pub directory: PathBuf,
    pub deidentified_series_uid: String,
    /// 成功处理的文件数
    pub processed: usize,
    /// 被跳过或删除的文件
    pub skipped: Vec<StageItem>,
}

/// 去标识化一个系列目录
///
/// `date_offset` 由调用方按“每次运行一个”生成并统一传入。
/// 无法解析或模态不在白名单内的文件被删除并计入跳过列表，
/// 不中断其余文件。
pub async fn deidentify_series(
    series_dir: &Path,
    output_dir: &Path,
    allow_list: &[String],
    date_offset: i64,
    mapper: &IdentityMapper,
) -> Result<DeidentifiedSeries> {
    if !series_dir.is_dir() {
        return Err(DrawError::NotFound(format!(
            "series directory {}",
            series_dir.display()
        )));
    }

    let files = workdir::list_files_recursive(series_dir).await?;
    let mut template_artifacts = Vec::new();
    let mut processed = 0usize;
    let mut skipped = Vec::new();
    let mut series_output: Option<(PathBuf, String)> = None;

    for file in files {
        if matches!(
            file.extension().and_then(|e| e.to_str()),
            Some("yml") | Some("yaml")
        ) {
            template_artifacts.push(file);
            continue;
        }

        match deidentify_file(&file, output_dir, allow_list, date_offset, mapper).await {
            Ok((series_dir_out, series_uid)) => {
                processed += 1;
                series_output = Some((series_dir_out, series_uid));
            }
            Err(e) => {
                warn!("removing {}: {}", file.display(), e);
                skipped.push(
                    StageItem::for_path(file.to_string_lossy()).with_detail(e.to_string()),
                );
                tokio::fs::remove_file(&file).await.ok();
            }
        }
    }

    let (directory, deidentified_series_uid) = series_output.ok_or_else(|| {
        DrawError::MalformedInput(format!(
            "no files successfully deidentified in {}",
            series_dir.display()
        ))
    })?;

    // 模板工件跟随系列进入输出目录
    for artifact in template_artifacts {
        let file_name = artifact
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "template.yml".to_string());
        workdir::move_file(&artifact, directory.join(file_name)).await?;
    }

    workdir::cleanup_empty_dirs(series_dir).await?;

    info!(
        "deidentified {} files into {} ({} skipped)",
        processed,
        directory.display(),
        skipped.len()
    );
    Ok(DeidentifiedSeries {
        directory,
        deidentified_series_uid,
        processed,
        skipped,
    })
}

/// 去标识化单个文件，返回输出系列目录与替代系列UID
async fn deidentify_file(
    file: &Path,
    output_dir: &Path,
    allow_list: &[String],
    date_offset: i64,
    mapper: &IdentityMapper,
) -> Result<(PathBuf, String)> {
    let obj = DicomParser::open(file)?;
    let metadata = DicomParser::metadata_from_object(&obj);

    if !DicomParser::modality_allowed(&metadata, allow_list) {
        return Err(DrawError::MalformedInput(format!(
            "modality {:?} not in allow list",
            metadata.modality
        )));
    }

    let patient_id = metadata
        .patient_id
        .as_deref()
        .ok_or_else(|| DrawError::MalformedInput("missing PatientID".into()))?;
    let study_uid = metadata
        .study_instance_uid
        .as_deref()
        .ok_or_else(|| DrawError::MalformedInput("missing StudyInstanceUID".into()))?;
    let series_uid = metadata
        .series_instance_uid
        .as_deref()
        .ok_or_else(|| DrawError::MalformedInput("missing SeriesInstanceUID".into()))?;
    let sop_uid = metadata
        .sop_instance_uid
        .as_deref()
        .ok_or_else(|| DrawError::MalformedInput("missing SOPInstanceUID".into()))?;

    // 映射链：患者 -> 检查 -> 系列 -> 实例
    let patient = mapper
        .pseudonymize_patient(
            patient_id,
            metadata.patient_name.as_deref(),
            metadata.patient_birth_date.as_deref().and_then(parse_dicom_date),
            date_offset,
        )
        .await?;
    let study = mapper
        .pseudonymize_study(
            &patient,
            study_uid,
            metadata.study_date.as_deref().and_then(parse_dicom_date),
            metadata.study_description.as_deref(),
            metadata.study_id.as_deref(),
            date_offset,
        )
        .await?;
    let series = mapper
        .pseudonymize_series(
            &study,
            series_uid,
            metadata.series_date.as_deref().and_then(parse_dicom_date),
            metadata.frame_of_reference_uid.as_deref(),
            date_offset,
        )
        .await?;
    let instance = mapper.pseudonymize_instance(&series, sop_uid).await?;

    let pseudonyms = PseudonymSet {
        patient_id: patient.deidentified_patient_id.clone(),
        study_instance_uid: study.deidentified_study_instance_uid.clone(),
        series_instance_uid: series.deidentified_series_instance_uid.clone(),
        sop_instance_uid: instance.deidentified_sop_instance_uid.clone(),
        frame_of_reference_uid: series.deidentified_frame_of_reference_uid.clone(),
        study_id: study.deidentified_study_id.clone(),
        date_offset,
    };

    let sop_class_uid = trim_meta(&obj.meta().media_storage_sop_class_uid);
    let transfer_syntax = trim_meta(&obj.meta().transfer_syntax);

    let mut dataset = (*obj).clone();
    apply_forward_mapping(&mut dataset, &pseudonyms);

    let series_output = output_dir.join(&series.deidentified_series_instance_uid);
    tokio::fs::create_dir_all(&series_output).await?;
    let dest = series_output.join(format!("{}.dcm", instance.deidentified_sop_instance_uid));

    // 文件元信息同步替换媒体存储SOP实例UID
    let file_obj = dataset
        .with_meta(
            FileMetaTableBuilder::new()
                .media_storage_sop_class_uid(sop_class_uid)
                .media_storage_sop_instance_uid(&instance.deidentified_sop_instance_uid)
                .transfer_syntax(transfer_syntax),
        )
        .map_err(|e| DrawError::Storage(e.to_string()))?;
    file_obj
        .write_to_file(&dest)
        .map_err(|e| DrawError::Storage(e.to_string()))?;

    tokio::fs::remove_file(file).await?;

    Ok((series_output, series.deidentified_series_instance_uid.clone()))
}

fn trim_meta(value: &str) -> String {
    value.trim_end_matches(['\0', ' ']).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom::core::{DataElement, PrimitiveValue, VR};
    use dicom::dictionary_std::tags;
    use dicom::object::InMemDicomObject;
    use draw_core::memory::InMemoryIdentityStore;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn write_ct_file(path: &Path, series_uid: &str, sop_uid: &str) {
        let mut obj = InMemDicomObject::new_empty();
        for (tag, vr, value) in [
            (tags::PATIENT_ID, VR::LO, "P1"),
            (tags::PATIENT_NAME, VR::PN, "Doe^Jane"),
            (tags::PATIENT_BIRTH_DATE, VR::DA, "19700515"),
            (tags::MODALITY, VR::CS, "CT"),
            (tags::STUDY_INSTANCE_UID, VR::UI, "1.2.800.1"),
            (tags::STUDY_DATE, VR::DA, "20240101"),
            (tags::SERIES_INSTANCE_UID, VR::UI, series_uid),
            (tags::SOP_INSTANCE_UID, VR::UI, sop_uid),
            (tags::SOP_CLASS_UID, VR::UI, "1.2.840.10008.5.1.4.1.1.2"),
        ] {
            obj.put(DataElement::new(tag, vr, PrimitiveValue::from(value)));
        }

        obj.with_meta(
            FileMetaTableBuilder::new()
                .media_storage_sop_class_uid("1.2.840.10008.5.1.4.1.1.2")
                .media_storage_sop_instance_uid(sop_uid)
                .transfer_syntax("1.2.840.10008.1.2.1"),
        )
        .unwrap()
        .write_to_file(path)
        .unwrap();
    }

    #[tokio::test]
    async fn test_deidentify_series_rewrites_and_moves() {
        let dir = tempdir().unwrap();
        let series_dir = dir.path().join("series");
        tokio::fs::create_dir_all(&series_dir).await.unwrap();
        write_ct_file(&series_dir.join("a.dcm"), "1.2.800.1.1", "1.2.800.1.1.1");
        write_ct_file(&series_dir.join("b.dcm"), "1.2.800.1.1", "1.2.800.1.1.2");
        tokio::fs::write(series_dir.join("head.yml"), b"protocol: head")
            .await
            .unwrap();

        let output = dir.path().join("deid-out");
        let mapper = IdentityMapper::new(Arc::new(InMemoryIdentityStore::new()));
        let allow = vec!["CT".to_string()];

        let result = deidentify_series(&series_dir, &output, &allow, -10, &mapper)
            .await
            .unwrap();

        assert_eq!(result.processed, 2);
        assert!(result.skipped.is_empty());
        // 输入目录整体清空移除
        assert!(!series_dir.exists());

        // 输出文件名是替代实例UID，内容已去标识化
        let files = workdir::list_files_recursive(&result.directory).await.unwrap();
        let dicom_files: Vec<_> = files
            .iter()
            .filter(|f| f.extension().and_then(|e| e.to_str()) == Some("dcm"))
            .collect();
        assert_eq!(dicom_files.len(), 2);

        let reloaded = DicomParser::open(dicom_files[0]).unwrap();
        let meta = DicomParser::metadata_from_object(&reloaded);
        assert_eq!(meta.patient_name.as_deref(), Some("Anonymous"));
        assert_eq!(meta.study_date.as_deref(), Some("20231222"));
        assert_eq!(
            meta.series_instance_uid.as_deref(),
            Some(result.deidentified_series_uid.as_str())
        );
        assert_ne!(meta.patient_id.as_deref(), Some("P1"));

        // 模板工件跟着系列走
        assert!(result.directory.join("head.yml").exists());
    }

    #[tokio::test]
    async fn test_deidentify_skips_bad_files_without_aborting() {
        let dir = tempdir().unwrap();
        let series_dir = dir.path().join("series");
        tokio::fs::create_dir_all(&series_dir).await.unwrap();
        write_ct_file(&series_dir.join("good.dcm"), "1.2.800.2.1", "1.2.800.2.1.1");
        tokio::fs::write(series_dir.join("junk.dcm"), b"not a dicom file")
            .await
            .unwrap();

        let output = dir.path().join("deid-out");
        let mapper = IdentityMapper::new(Arc::new(InMemoryIdentityStore::new()));
        let allow = vec!["CT".to_string()];

        let result = deidentify_series(&series_dir, &output, &allow, 5, &mapper)
            .await
            .unwrap();

        assert_eq!(result.processed, 1);
        assert_eq!(result.skipped.len(), 1);
    }

    #[tokio::test]
    async fn test_deidentify_empty_series_is_error() {
        let dir = tempdir().unwrap();
        let series_dir = dir.path().join("series");
        tokio::fs::create_dir_all(&series_dir).await.unwrap();
        tokio::fs::write(series_dir.join("junk.bin"), b"garbage")
            .await
            .unwrap();

        let output = dir.path().join("deid-out");
        let mapper = IdentityMapper::new(Arc::new(InMemoryIdentityStore::new()));

        let result =
            deidentify_series(&series_dir, &output, &["CT".to_string()], 0, &mapper).await;
        assert!(result.is_err());
    }
}
