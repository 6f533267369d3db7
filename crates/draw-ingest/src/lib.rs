//! # DRAW Ingest
//!
//! 数据店扫描复制、系列分拣与自动分割模板匹配。
//! 这是流水线导出方向的前半段：原始文件从这里进入系统。

pub mod materializer;
pub mod matcher;

pub use materializer::{copy_from_datastore, separate_into_series, SeparatedSeries};
pub use matcher::{evaluate_rule_sets, match_series, MatchOutcome};
