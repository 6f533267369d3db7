//! 文件校验和计算
//!
//! 固定大小分块流式读入哈希器，任意大小的文件都不会整体进入内存。

use sha2::{Digest, Sha256, Sha512};
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use draw_core::Result;

/// 分块读取的块大小
const CHUNK_SIZE: usize = 8192;

/// 计算文件的SHA-256校验和，返回小写十六进制
///
/// 传输完整性验证使用SHA-256。
pub async fn compute_sha256<P: AsRef<Path>>(path: P) -> Result<String> {
    let mut file = File::open(path.as_ref()).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];

    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// 计算文件的SHA-512校验和，返回小写十六进制
///
/// 模板目录的内容指纹使用SHA-512。
pub async fn compute_sha512<P: AsRef<Path>>(path: P) -> Result<String> {
    let mut file = File::open(path.as_ref()).await?;
    let mut hasher = Sha512::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];

    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_sha256_known_value() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        tokio::fs::write(&path, b"hello world").await.unwrap();

        let digest = compute_sha256(&path).await.unwrap();
        assert_eq!(
            digest,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn test_sha256_is_deterministic_and_streams() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("big.bin");
        // 跨越多个分块边界
        let data = vec![0x5au8; CHUNK_SIZE * 3 + 17];
        tokio::fs::write(&path, &data).await.unwrap();

        let first = compute_sha256(&path).await.unwrap();
        let second = compute_sha256(&path).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
    }

    #[tokio::test]
    async fn test_sha512_differs_from_sha256() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("template.yml");
        tokio::fs::write(&path, b"protocol: head-and-neck").await.unwrap();

        let sha512 = compute_sha512(&path).await.unwrap();
        assert_eq!(sha512.len(), 128);
    }

    #[tokio::test]
    async fn test_missing_file_is_error() {
        assert!(compute_sha256("/nonexistent/file.bin").await.is_err());
    }
}
