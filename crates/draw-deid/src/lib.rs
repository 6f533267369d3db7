//! # DRAW Deid
//!
//! 可逆去标识化：身份映射器负责原始↔替代标识的持久映射，
//! 去标识化器对系列目录执行正向映射，重识别引擎把返回的
//! RTSTRUCT产物改写回原始标识。

pub mod deidentifier;
pub mod mapper;
pub mod reidentifier;

pub use deidentifier::{deidentify_series, DeidentifiedSeries};
pub use mapper::IdentityMapper;
pub use reidentifier::{reidentify_artifacts, ReidentifiedArtifact};
