//! 上传压缩包打包
//!
//! 把一个系列目录打成deflate压缩的ZIP，随包传输SHA-256校验和，
//! 服务端以内容寻址方式验证。

use async_zip::tokio::write::ZipFileWriter;
use async_zip::{Compression, ZipEntryBuilder};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::checksum::compute_sha256;
use crate::workdir::list_files_recursive;
use draw_core::{DrawError, Result};

/// 打包结果：压缩包路径与其SHA-256校验和
#[derive(Debug, Clone)]
pub struct SeriesArchive {
    pub zip_path: PathBuf,
    pub checksum: String,
    pub file_count: usize,
}

/// 把系列目录打包为deflate压缩的ZIP
///
/// 条目名取相对系列目录的路径，顺序固定，同一目录两次打包
/// 产生相同的条目布局。
pub async fn build_series_archive<P: AsRef<Path>, Q: AsRef<Path>>(
    series_dir: P,
    zip_path: Q,
) -> Result<SeriesArchive> {
    let series_dir = series_dir.as_ref();
    let zip_path = zip_path.as_ref().to_path_buf();

    let files = list_files_recursive(series_dir).await?;
    if files.is_empty() {
        return Err(DrawError::Storage(format!(
            "series directory {} is empty",
            series_dir.display()
        )));
    }

    if let Some(parent) = zip_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut output = tokio::fs::File::create(&zip_path).await?;
    let mut writer = ZipFileWriter::with_tokio(&mut output);

    for file in &files {
        let entry_name = file
            .strip_prefix(series_dir)
            .map_err(|e| DrawError::Storage(e.to_string()))?
            .to_string_lossy()
            .into_owned();
        let data = tokio::fs::read(file).await?;
        let builder = ZipEntryBuilder::new(entry_name.into(), Compression::Deflate);
        writer
            .write_entry_whole(builder, &data)
            .await
            .map_err(|e| DrawError::Storage(format!("zip write failed: {}", e)))?;
    }

    writer
        .close()
        .await
        .map_err(|e| DrawError::Storage(format!("zip close failed: {}", e)))?;

    let checksum = compute_sha256(&zip_path).await?;
    info!(
        "packaged {} files from {} into {} (sha256 {})",
        files.len(),
        series_dir.display(),
        zip_path.display(),
        &checksum[..12]
    );

    Ok(SeriesArchive {
        zip_path,
        checksum,
        file_count: files.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_archive_contains_all_files_and_checksum() {
        let dir = tempdir().unwrap();
        let series_dir = dir.path().join("series");
        tokio::fs::create_dir_all(&series_dir).await.unwrap();
        tokio::fs::write(series_dir.join("one.dcm"), vec![1u8; 4096])
            .await
            .unwrap();
        tokio::fs::write(series_dir.join("two.dcm"), vec![2u8; 4096])
            .await
            .unwrap();

        let zip_path = dir.path().join("upload/payload.zip");
        let archive = build_series_archive(&series_dir, &zip_path).await.unwrap();

        assert_eq!(archive.file_count, 2);
        assert!(zip_path.exists());
        assert_eq!(archive.checksum.len(), 64);
        assert_eq!(archive.checksum, compute_sha256(&zip_path).await.unwrap());
    }

    #[tokio::test]
    async fn test_empty_series_dir_is_error() {
        let dir = tempdir().unwrap();
        let series_dir = dir.path().join("empty");
        tokio::fs::create_dir_all(&series_dir).await.unwrap();

        let result = build_series_archive(&series_dir, dir.path().join("out.zip")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_missing_series_dir_is_error() {
        let dir = tempdir().unwrap();
        let result =
            build_series_archive(dir.path().join("absent"), dir.path().join("out.zip")).await;
        assert!(result.is_err());
    }
}
