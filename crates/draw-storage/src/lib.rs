//! # DRAW Storage
//!
//! 文件完整性校验、上传压缩包的打包、以及流水线阶段间
//! 以移动方式交接工作目录的文件系统原语。

pub mod archive;
pub mod checksum;
pub mod workdir;

pub use archive::build_series_archive;
pub use checksum::{compute_sha256, compute_sha512};
