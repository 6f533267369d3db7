//! DICOM数据解析器
//!
//! 提取下游各阶段所需的最小元数据集合，以及规则匹配用的
//! 完整标签/值表。

use dicom::core::dictionary::DataDictionary;
use dicom::core::header::Header;
use dicom::dictionary_std::{tags, StandardDataDictionary};
use dicom::object::{open_file, DefaultDicomObject, InMemDicomObject};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, warn};

use draw_core::{DrawError, Result};

/// 单个标签的名称与字符串值
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagValue {
    pub tag: String,
    pub tag_name: String,
    pub tag_value: String,
}

/// 一个系列的描述性元数据
///
/// 字段在原始文件中缺失时保持 None，不做任何补全。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeriesMetadata {
    pub patient_id: Option<String>,
    pub patient_name: Option<String>,
    pub patient_sex: Option<String>,
    pub patient_birth_date: Option<String>,
    pub study_instance_uid: Option<String>,
    pub study_date: Option<String>,
    pub study_description: Option<String>,
    pub study_id: Option<String>,
    pub series_instance_uid: Option<String>,
    pub series_date: Option<String>,
    pub series_description: Option<String>,
    pub modality: Option<String>,
    pub protocol_name: Option<String>,
    pub sop_instance_uid: Option<String>,
    pub sop_class_uid: Option<String>,
    pub frame_of_reference_uid: Option<String>,
}

/// DICOM数据解析器
pub struct DicomParser;

impl DicomParser {
    /// 解析DICOM文件
    ///
    /// 无法解析的文件返回 `MalformedInput`，调用方按跳过处理，
    /// 不得让单个坏文件中断整个批次。
    pub fn open<P: AsRef<Path>>(file_path: P) -> Result<DefaultDicomObject> {
        let file_path = file_path.as_ref();
        open_file(file_path).map_err(|e| {
            debug!("DICOM文件解析失败: {:?}: {}", file_path, e);
            DrawError::MalformedInput(format!("{}: {}", file_path.display(), e))
        })
    }

    /// 从文件提取系列元数据
    pub fn extract_metadata<P: AsRef<Path>>(file_path: P) -> Result<SeriesMetadata> {
        let obj = Self::open(file_path)?;
        Ok(Self::metadata_from_object(&obj))
    }

    /// 从已解析的对象提取系列元数据
    pub fn metadata_from_object(obj: &InMemDicomObject) -> SeriesMetadata {
        SeriesMetadata {
            patient_id: get_string(obj, tags::PATIENT_ID),
            patient_name: get_string(obj, tags::PATIENT_NAME),
            patient_sex: get_string(obj, tags::PATIENT_SEX),
            patient_birth_date: get_string(obj, tags::PATIENT_BIRTH_DATE),
            study_instance_uid: get_string(obj, tags::STUDY_INSTANCE_UID),
            study_date: get_string(obj, tags::STUDY_DATE),
            study_description: get_string(obj, tags::STUDY_DESCRIPTION),
            study_id: get_string(obj, tags::STUDY_ID),
            series_instance_uid: get_string(obj, tags::SERIES_INSTANCE_UID),
            series_date: get_string(obj, tags::SERIES_DATE),
            series_description: get_string(obj, tags::SERIES_DESCRIPTION),
            modality: get_string(obj, tags::MODALITY),
            protocol_name: get_string(obj, tags::PROTOCOL_NAME),
            sop_instance_uid: get_string(obj, tags::SOP_INSTANCE_UID),
            sop_class_uid: get_string(obj, tags::SOP_CLASS_UID),
            frame_of_reference_uid: get_string(obj, tags::FRAME_OF_REFERENCE_UID),
        }
    }

    /// 导出对象的全部顶层标签/值表，规则匹配的输入
    ///
    /// 序列与像素数据不参与规则匹配，跳过。标签名来自标准字典，
    /// 字典中没有的标签（通常是私有标签）同样跳过。
    pub fn extract_tag_values(obj: &InMemDicomObject) -> Vec<TagValue> {
        let mut values = Vec::new();

        for elem in obj.iter() {
            let tag = elem.tag();
            let primitive = match elem.value().primitive() {
                Some(p) => p,
                None => continue,
            };

            let tag_name = match StandardDataDictionary.by_tag(tag) {
                Some(entry) => entry.alias.to_string(),
                None => {
                    debug!("skipping tag {} not present in dictionary", tag);
                    continue;
                }
            };

            values.push(TagValue {
                tag: tag.to_string(),
                tag_name,
                tag_value: trim_dicom_str(&primitive.to_str()),
            });
        }

        values
    }

    /// 判断文件模态是否在白名单内；读不出模态按不在名单处理
    pub fn modality_allowed(metadata: &SeriesMetadata, allow_list: &[String]) -> bool {
        match &metadata.modality {
            Some(modality) => allow_list.iter().any(|m| m == modality),
            None => {
                warn!("file has no modality attribute, rejecting");
                false
            }
        }
    }
}

/// 读取单值字符串属性，缺失返回 None
pub(crate) fn get_string(obj: &InMemDicomObject, tag: dicom::core::Tag) -> Option<String> {
    match obj.element(tag) {
        Ok(elem) => elem.to_str().ok().map(|s| trim_dicom_str(&s)).filter(|s| !s.is_empty()),
        Err(_) => None,
    }
}

/// 去掉DICOM字符串值的填充字符
pub(crate) fn trim_dicom_str(value: &str) -> String {
    value.trim_end_matches(['\0', ' ']).trim_start().to_string()
}
