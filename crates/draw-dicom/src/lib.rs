//! # DRAW DICOM
//!
//! DICOM文件的解析、元数据提取与属性改写。
//! 改写分两个方向：去标识化的正向映射，以及RTSTRUCT产物的
//! 重识别（含嵌套序列中的交叉引用替换）。

pub mod parser;
pub mod rewrite;

pub use parser::{DicomParser, SeriesMetadata, TagValue};
pub use rewrite::{apply_forward_mapping, reidentify_object, PseudonymSet, UidReferenceTable};
