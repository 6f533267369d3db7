//! # DRAW Core
//!
//! DRAW客户端的核心模块，提供基础数据结构、错误定义、存储接口和通用工具。

pub mod config;
pub mod error;
pub mod memory;
pub mod models;
pub mod store;
pub mod utils;

pub use config::DrawConfig;
pub use error::{DrawError, Result};
pub use models::*;
