//! # DRAW Workflow
//!
//! 流水线编排：导出方向（复制 → 分拣 → 模板匹配 → 去标识化 →
//! 传输）与导入方向（轮询 → 重识别 → 导出）。处理记录的状态
//! 是权威状态，状态机拒绝一切非法转换，每次转换都落一条处理
//! 日志。

pub mod commands;
pub mod export;
pub mod import;
pub mod state_machine;

pub use commands::{restart_series, series_status};
pub use export::ExportPipeline;
pub use import::ImportPipeline;
pub use state_machine::ProcessingStateMachine;
