//! DICOM属性改写
//!
//! 正向映射把一个文件的所有标识属性替换为替代值；重识别把
//! RTSTRUCT产物中的标识属性和全部嵌套交叉引用换回原始值。
//! 两个方向都只触碰元数据，不触碰像素数据。

use dicom::core::header::Header;
use dicom::core::value::DataSetSequence;
use dicom::core::{DataElement, PrimitiveValue, Tag, VR};
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;
use std::collections::HashMap;
use tracing::debug;

use crate::parser::{get_string, trim_dicom_str};
use draw_core::utils::shift_dicom_date;

/// RTSTRUCT中的参考帧引用标签 (3006,0024)
const REFERENCED_FRAME_OF_REFERENCE_UID: Tag = Tag(0x3006, 0x0024);

/// 去标识化时整体移位的日期属性
const DATE_TAGS: [Tag; 6] = [
    tags::INSTANCE_CREATION_DATE,
    tags::STUDY_DATE,
    tags::SERIES_DATE,
    tags::ACQUISITION_DATE,
    tags::CONTENT_DATE,
    tags::PATIENT_BIRTH_DATE,
];

/// 一个实例的全部替代值
///
/// 由身份映射器生成；这里只负责把值写进数据集。
#[derive(Debug, Clone)]
pub struct PseudonymSet {
    pub patient_id: String,
    pub study_instance_uid: String,
    pub series_instance_uid: String,
    pub sop_instance_uid: String,
    pub frame_of_reference_uid: Option<String>,
    pub study_id: Option<String>,
    pub date_offset: i64,
}

impl PseudonymSet {
    /// 替代系列UID的数字后缀，用于生成系列描述占位符
    fn series_suffix(&self) -> &str {
        self.series_instance_uid
            .rsplit('.')
            .next()
            .unwrap_or(&self.series_instance_uid)
    }
}

/// 对单个数据集应用正向映射
///
/// 原始文件中不存在的属性保持不存在；要求清除的属性整体移除
/// 而不是置空。私有标签全部清除。
pub fn apply_forward_mapping(obj: &mut InMemDicomObject, pseudo: &PseudonymSet) {
    // UID替换
    put_str(obj, tags::SOP_INSTANCE_UID, VR::UI, &pseudo.sop_instance_uid);
    put_str(
        obj,
        tags::STUDY_INSTANCE_UID,
        VR::UI,
        &pseudo.study_instance_uid,
    );
    put_str(
        obj,
        tags::SERIES_INSTANCE_UID,
        VR::UI,
        &pseudo.series_instance_uid,
    );
    if has_element(obj, tags::FRAME_OF_REFERENCE_UID) {
        if let Some(frame_uid) = &pseudo.frame_of_reference_uid {
            put_str(obj, tags::FRAME_OF_REFERENCE_UID, VR::UI, frame_uid);
        }
    }

    // 日期统一移位
    for tag in DATE_TAGS {
        if let Some(original) = get_string(obj, tag) {
            put_str(obj, tag, VR::DA, &shift_dicom_date(&original, pseudo.date_offset));
        }
    }

    // 标识属性替换
    put_str(obj, tags::PATIENT_ID, VR::LO, &pseudo.patient_id);
    if has_element(obj, tags::PATIENT_NAME) {
        put_str(obj, tags::PATIENT_NAME, VR::PN, "Anonymous");
    }
    if has_element(obj, tags::STUDY_ID) {
        if let Some(study_id) = &pseudo.study_id {
            put_str(obj, tags::STUDY_ID, VR::SH, study_id);
        }
    }
    if has_element(obj, tags::STUDY_DESCRIPTION) {
        let placeholder = format!("Study_{}", pseudo.study_id.as_deref().unwrap_or("1"));
        put_str(obj, tags::STUDY_DESCRIPTION, VR::LO, &placeholder);
    }
    if has_element(obj, tags::SERIES_DESCRIPTION) {
        let placeholder = format!("Series_{}", pseudo.series_suffix());
        put_str(obj, tags::SERIES_DESCRIPTION, VR::LO, &placeholder);
    }

    // 必须清除的属性
    obj.remove_element(tags::REFERRING_PHYSICIAN_NAME);
    obj.remove_element(tags::PHYSICIANS_OF_RECORD);

    remove_private_tags(obj);
}

/// 清除全部私有标签（奇数组号）
fn remove_private_tags(obj: &mut InMemDicomObject) {
    let private: Vec<Tag> = obj
        .iter()
        .map(|e| e.tag())
        .filter(|t| t.group() % 2 == 1)
        .collect();
    for tag in private {
        obj.remove_element(tag);
    }
}

/// 重识别时需要回填的原始标识
#[derive(Debug, Clone, Default)]
pub struct OriginalIdentifiers {
    pub study_instance_uid: String,
    pub patient_id: String,
    pub patient_name: Option<String>,
    pub patient_birth_date: Option<String>,
    pub study_description: Option<String>,
    pub frame_of_reference_uid: Option<String>,
}

/// 替代UID到原始UID的引用表
///
/// 覆盖该系列已知的全部实例、系列与检查层级UID。
#[derive(Debug, Clone, Default)]
pub struct UidReferenceTable {
    mapping: HashMap<String, String>,
}

impl UidReferenceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, deidentified: impl Into<String>, original: impl Into<String>) {
        self.mapping.insert(deidentified.into(), original.into());
    }

    pub fn lookup(&self, deidentified: &str) -> Option<&str> {
        self.mapping.get(trim_dicom_str(deidentified).as_str()).map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.mapping.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mapping.is_empty()
    }
}

/// 在嵌套序列中查找被引用的系列UID
///
/// RTSTRUCT自身的顶层系列UID是产物自己的，被分割的系列UID藏在
/// 引用序列里，只在序列项内部查找。
pub fn find_referenced_series_uid(obj: &InMemDicomObject) -> Option<String> {
    for elem in obj.iter() {
        if let Some(items) = elem.value().items() {
            for item in items {
                if let Some(found) = find_series_uid_anywhere(item) {
                    return Some(found);
                }
            }
        }
    }
    None
}

fn find_series_uid_anywhere(obj: &InMemDicomObject) -> Option<String> {
    if let Some(uid) = get_string(obj, tags::SERIES_INSTANCE_UID) {
        return Some(uid);
    }
    for elem in obj.iter() {
        if let Some(items) = elem.value().items() {
            for item in items {
                if let Some(found) = find_series_uid_anywhere(item) {
                    return Some(found);
                }
            }
        }
    }
    None
}

/// 对RTSTRUCT产物执行重识别
///
/// 回填顶层标识属性，然后遍历每一个嵌套元素：引用表命中的UID
/// 一律替换为原始值，参考帧标签替换为原始参考帧UID。返回改写后
/// 的对象与UID替换次数。
pub fn reidentify_object(
    obj: &InMemDicomObject,
    original: &OriginalIdentifiers,
    table: &UidReferenceTable,
) -> (InMemDicomObject, usize) {
    let mut replaced = 0usize;
    let mut out = rewrite_tree(obj, original, table, &mut replaced);

    // 顶层标识属性回填
    put_str(
        &mut out,
        tags::STUDY_INSTANCE_UID,
        VR::UI,
        &original.study_instance_uid,
    );
    put_str(&mut out, tags::PATIENT_ID, VR::LO, &original.patient_id);
    if let Some(name) = &original.patient_name {
        put_str(&mut out, tags::PATIENT_NAME, VR::PN, name);
    }
    if let Some(birth_date) = &original.patient_birth_date {
        put_str(&mut out, tags::PATIENT_BIRTH_DATE, VR::DA, birth_date);
    }
    if let Some(description) = &original.study_description {
        put_str(&mut out, tags::STUDY_DESCRIPTION, VR::LO, description);
    }
    put_str(&mut out, tags::REFERRING_PHYSICIAN_NAME, VR::PN, "DRAW");

    debug!("reidentification replaced {} referenced UIDs", replaced);
    (out, replaced)
}

fn rewrite_tree(
    obj: &InMemDicomObject,
    original: &OriginalIdentifiers,
    table: &UidReferenceTable,
    replaced: &mut usize,
) -> InMemDicomObject {
    let mut out = InMemDicomObject::new_empty();

    for elem in obj.iter() {
        let tag = elem.tag();

        if let Some(items) = elem.value().items() {
            let rewritten: Vec<InMemDicomObject> = items
                .iter()
                .map(|item| rewrite_tree(item, original, table, replaced))
                .collect();
            out.put(DataElement::new(
                tag,
                VR::SQ,
                DataSetSequence::from(rewritten),
            ));
            continue;
        }

        let primitive = match elem.value().primitive() {
            Some(p) => p,
            None => {
                out.put(elem.clone());
                continue;
            }
        };

        // 参考帧标签换回原始参考帧UID
        if tag == tags::FRAME_OF_REFERENCE_UID || tag == REFERENCED_FRAME_OF_REFERENCE_UID {
            if let Some(frame_uid) = &original.frame_of_reference_uid {
                out.put(DataElement::new(tag, elem.vr(), PrimitiveValue::from(frame_uid.as_str())));
                continue;
            }
        }

        // 引用表命中的UID替换为原始UID
        let value = trim_dicom_str(&primitive.to_str());
        if let Some(original_uid) = table.lookup(&value) {
            *replaced += 1;
            out.put(DataElement::new(
                tag,
                elem.vr(),
                PrimitiveValue::from(original_uid),
            ));
            continue;
        }

        out.put(elem.clone());
    }

    out
}

fn put_str(obj: &mut InMemDicomObject, tag: Tag, vr: VR, value: &str) {
    obj.put(DataElement::new(tag, vr, PrimitiveValue::from(value)));
}

fn has_element(obj: &InMemDicomObject, tag: Tag) -> bool {
    obj.element(tag).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(obj: &mut InMemDicomObject, tag: Tag, vr: VR, value: &str) {
        obj.put(DataElement::new(tag, vr, PrimitiveValue::from(value)));
    }

    fn sample_instance() -> InMemDicomObject {
        let mut obj = InMemDicomObject::new_empty();
        put(&mut obj, tags::PATIENT_ID, VR::LO, "PAT001");
        put(&mut obj, tags::PATIENT_NAME, VR::PN, "Doe^Jane");
        put(&mut obj, tags::PATIENT_BIRTH_DATE, VR::DA, "19700515");
        put(&mut obj, tags::STUDY_INSTANCE_UID, VR::UI, "1.2.3");
        put(&mut obj, tags::SERIES_INSTANCE_UID, VR::UI, "1.2.3.4");
        put(&mut obj, tags::SOP_INSTANCE_UID, VR::UI, "1.2.3.4.5");
        put(&mut obj, tags::STUDY_DATE, VR::DA, "20240101");
        put(&mut obj, tags::STUDY_DESCRIPTION, VR::LO, "Chest CT");
        put(&mut obj, tags::SERIES_DESCRIPTION, VR::LO, "Axial");
        put(&mut obj, tags::REFERRING_PHYSICIAN_NAME, VR::PN, "Dr^Who");
        put(&mut obj, tags::FRAME_OF_REFERENCE_UID, VR::UI, "1.2.3.9");
        // 私有标签
        put(&mut obj, Tag(0x0009, 0x0010), VR::LO, "PRIVATE");
        obj
    }

    fn sample_pseudonyms() -> PseudonymSet {
        PseudonymSet {
            patient_id: "2024.1.1.10.0.0.1.123456".into(),
            study_instance_uid: "2024.1.1.10.0.0.1.123456.1.0".into(),
            series_instance_uid: "2024.1.1.10.0.0.1.123456.1.0.1".into(),
            sop_instance_uid: "2024.1.1.10.0.0.2.654321".into(),
            frame_of_reference_uid: Some("2024.1.1.10.0.0.1.123456.1.0.4321".into()),
            study_id: Some("1".into()),
            date_offset: -10,
        }
    }

    #[test]
    fn test_forward_mapping_replaces_identifiers() {
        let mut obj = sample_instance();
        apply_forward_mapping(&mut obj, &sample_pseudonyms());

        let pid = obj.element(tags::PATIENT_ID).unwrap().to_str().unwrap();
        assert_eq!(pid, "2024.1.1.10.0.0.1.123456");
        let name = obj.element(tags::PATIENT_NAME).unwrap().to_str().unwrap();
        assert_eq!(name, "Anonymous");
        let study_date = obj.element(tags::STUDY_DATE).unwrap().to_str().unwrap();
        assert_eq!(study_date, "20231222");
        let birth = obj
            .element(tags::PATIENT_BIRTH_DATE)
            .unwrap()
            .to_str()
            .unwrap();
        assert_eq!(birth, "19700505");
    }

    #[test]
    fn test_forward_mapping_purges_rather_than_blanks() {
        let mut obj = sample_instance();
        apply_forward_mapping(&mut obj, &sample_pseudonyms());

        assert!(obj.element(tags::REFERRING_PHYSICIAN_NAME).is_err());
        assert!(obj.element(Tag(0x0009, 0x0010)).is_err());
    }

    #[test]
    fn test_forward_mapping_keeps_absent_attributes_absent() {
        let mut obj = InMemDicomObject::new_empty();
        put(&mut obj, tags::PATIENT_ID, VR::LO, "PAT002");
        put(&mut obj, tags::STUDY_INSTANCE_UID, VR::UI, "1.2.9");
        put(&mut obj, tags::SERIES_INSTANCE_UID, VR::UI, "1.2.9.1");
        put(&mut obj, tags::SOP_INSTANCE_UID, VR::UI, "1.2.9.1.1");

        apply_forward_mapping(&mut obj, &sample_pseudonyms());

        assert!(obj.element(tags::PATIENT_NAME).is_err());
        assert!(obj.element(tags::STUDY_DESCRIPTION).is_err());
        assert!(obj.element(tags::FRAME_OF_REFERENCE_UID).is_err());
    }

    #[test]
    fn test_series_description_uses_series_suffix() {
        let mut obj = sample_instance();
        apply_forward_mapping(&mut obj, &sample_pseudonyms());
        let description = obj
            .element(tags::SERIES_DESCRIPTION)
            .unwrap()
            .to_str()
            .unwrap();
        assert_eq!(description, "Series_1");
    }

    fn rtstruct_with_nested_references() -> InMemDicomObject {
        // ContourImageSequence项，引用被分割的实例
        let mut contour_image = InMemDicomObject::new_empty();
        put(
            &mut contour_image,
            tags::REFERENCED_SOP_INSTANCE_UID,
            VR::UI,
            "P.1.0.1.100",
        );

        // RTReferencedSeriesSequence项
        let mut referenced_series = InMemDicomObject::new_empty();
        put(
            &mut referenced_series,
            tags::SERIES_INSTANCE_UID,
            VR::UI,
            "P.1.0.1",
        );
        referenced_series.put(DataElement::new(
            tags::CONTOUR_IMAGE_SEQUENCE,
            VR::SQ,
            DataSetSequence::from(vec![contour_image]),
        ));

        // RTReferencedStudySequence项
        let mut referenced_study = InMemDicomObject::new_empty();
        put(
            &mut referenced_study,
            tags::REFERENCED_SOP_INSTANCE_UID,
            VR::UI,
            "P.1.0",
        );
        referenced_study.put(DataElement::new(
            tags::RT_REFERENCED_SERIES_SEQUENCE,
            VR::SQ,
            DataSetSequence::from(vec![referenced_series]),
        ));

        // ReferencedFrameOfReferenceSequence项
        let mut frame_item = InMemDicomObject::new_empty();
        put(
            &mut frame_item,
            REFERENCED_FRAME_OF_REFERENCE_UID,
            VR::UI,
            "P.1.0.9999",
        );
        frame_item.put(DataElement::new(
            tags::RT_REFERENCED_STUDY_SEQUENCE,
            VR::SQ,
            DataSetSequence::from(vec![referenced_study]),
        ));

        let mut obj = InMemDicomObject::new_empty();
        put(&mut obj, tags::PATIENT_ID, VR::LO, "P");
        put(&mut obj, tags::PATIENT_NAME, VR::PN, "Anonymous");
        put(&mut obj, tags::STUDY_INSTANCE_UID, VR::UI, "P.1.0");
        put(&mut obj, tags::SERIES_INSTANCE_UID, VR::UI, "P.1.0.777");
        put(&mut obj, tags::MODALITY, VR::CS, "RTSTRUCT");
        obj.put(DataElement::new(
            tags::REFERENCED_FRAME_OF_REFERENCE_SEQUENCE,
            VR::SQ,
            DataSetSequence::from(vec![frame_item]),
        ));
        obj
    }

    fn sample_table() -> UidReferenceTable {
        let mut table = UidReferenceTable::new();
        table.insert("P.1.0.1.100", "1.2.3.4.5");
        table.insert("P.1.0.1", "1.2.3.4");
        table.insert("P.1.0", "1.2.3");
        table
    }

    #[test]
    fn test_find_referenced_series_uid_ignores_top_level() {
        let obj = rtstruct_with_nested_references();
        // 顶层系列UID是 P.1.0.777，被引用的是嵌套的 P.1.0.1
        assert_eq!(
            find_referenced_series_uid(&obj).as_deref(),
            Some("P.1.0.1")
        );
    }

    #[test]
    fn test_reidentify_rewrites_nested_references() {
        let obj = rtstruct_with_nested_references();
        let original = OriginalIdentifiers {
            study_instance_uid: "1.2.3".into(),
            patient_id: "PAT001".into(),
            patient_name: Some("Doe^Jane".into()),
            patient_birth_date: Some("19700515".into()),
            study_description: Some("Chest CT".into()),
            frame_of_reference_uid: Some("1.2.3.9".into()),
        };

        let (out, replaced) = reidentify_object(&obj, &original, &sample_table());
        // 嵌套的实例、系列、检查引用各替换一次
        assert!(replaced >= 3);

        let study = out
            .element(tags::STUDY_INSTANCE_UID)
            .unwrap()
            .to_str()
            .unwrap();
        assert_eq!(study, "1.2.3");
        let pid = out.element(tags::PATIENT_ID).unwrap().to_str().unwrap();
        assert_eq!(pid, "PAT001");

        // 逐层下钻验证嵌套替换
        let frame_seq = out
            .element(tags::REFERENCED_FRAME_OF_REFERENCE_SEQUENCE)
            .unwrap();
        let frame_item = &frame_seq.value().items().unwrap()[0];
        let frame_uid = frame_item
            .element(REFERENCED_FRAME_OF_REFERENCE_UID)
            .unwrap()
            .to_str()
            .unwrap();
        assert_eq!(frame_uid, "1.2.3.9");

        let study_item = &frame_item
            .element(tags::RT_REFERENCED_STUDY_SEQUENCE)
            .unwrap()
            .value()
            .items()
            .unwrap()[0];
        let series_item = &study_item
            .element(tags::RT_REFERENCED_SERIES_SEQUENCE)
            .unwrap()
            .value()
            .items()
            .unwrap()[0];
        let series_uid = series_item
            .element(tags::SERIES_INSTANCE_UID)
            .unwrap()
            .to_str()
            .unwrap();
        assert_eq!(series_uid, "1.2.3.4");

        let contour_item = &series_item
            .element(tags::CONTOUR_IMAGE_SEQUENCE)
            .unwrap()
            .value()
            .items()
            .unwrap()[0];
        let sop = contour_item
            .element(tags::REFERENCED_SOP_INSTANCE_UID)
            .unwrap()
            .to_str()
            .unwrap();
        assert_eq!(sop, "1.2.3.4.5");
    }

    #[test]
    fn test_reidentify_leaves_unknown_uids_untouched() {
        let mut obj = InMemDicomObject::new_empty();
        put(&mut obj, tags::SOP_CLASS_UID, VR::UI, "1.2.840.10008.5.1.4.1.1.481.3");
        put(&mut obj, tags::PATIENT_ID, VR::LO, "P");
        put(&mut obj, tags::STUDY_INSTANCE_UID, VR::UI, "P.1.0");

        let original = OriginalIdentifiers {
            study_instance_uid: "1.2.3".into(),
            patient_id: "PAT001".into(),
            ..Default::default()
        };
        let (out, _) = reidentify_object(&obj, &original, &sample_table());

        let sop_class = out.element(tags::SOP_CLASS_UID).unwrap().to_str().unwrap();
        assert_eq!(sop_class, "1.2.840.10008.5.1.4.1.1.481.3");
    }
}
