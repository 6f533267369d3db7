//! 工作目录管理
//!
//! 阶段之间用移动（不是复制）交接目录所有权：目录出现在哪个
//! 阶段目录下，它就归哪个阶段。移动失败时退回复制加删除，
//! 以兼容跨文件系统的配置。

use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

use draw_core::{DrawError, Result};

/// 确保目录存在
pub async fn ensure_dir<P: AsRef<Path>>(path: P) -> Result<()> {
    tokio::fs::create_dir_all(path.as_ref()).await?;
    Ok(())
}

/// 递归列出目录下的全部文件
///
/// 用显式栈遍历，子目录深度不限。
pub async fn list_files_recursive<P: AsRef<Path>>(root: P) -> Result<Vec<PathBuf>> {
    let root = root.as_ref();
    if !root.is_dir() {
        return Err(DrawError::NotFound(format!(
            "directory {}",
            root.display()
        )));
    }

    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                files.push(path);
            }
        }
    }

    files.sort();
    Ok(files)
}

/// 移动单个文件，目标目录不存在时创建
pub async fn move_file<P: AsRef<Path>, Q: AsRef<Path>>(source: P, target: Q) -> Result<()> {
    let source = source.as_ref();
    let target = target.as_ref();
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    match tokio::fs::rename(source, target).await {
        Ok(()) => Ok(()),
        Err(e) => {
            // 跨设备移动：复制后删除源文件
            debug!("rename failed ({}), falling back to copy: {}", e, source.display());
            tokio::fs::copy(source, target).await?;
            tokio::fs::remove_file(source).await?;
            Ok(())
        }
    }
}

/// 移动整个目录
pub async fn move_directory<P: AsRef<Path>, Q: AsRef<Path>>(source: P, target: Q) -> Result<()> {
    let source = source.as_ref();
    let target = target.as_ref();
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    if tokio::fs::rename(source, target).await.is_ok() {
        return Ok(());
    }

    // 跨设备：逐文件复制后删除源目录
    debug!("directory rename failed, copying {}", source.display());
    let files = list_files_recursive(source).await?;
    for file in files {
        let relative = file
            .strip_prefix(source)
            .map_err(|e| DrawError::Storage(e.to_string()))?;
        let dest = target.join(relative);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&file, &dest).await?;
    }
    tokio::fs::remove_dir_all(source).await?;
    Ok(())
}

/// 自底向上清理空目录，包含起始目录本身
pub async fn cleanup_empty_dirs<P: AsRef<Path>>(root: P) -> Result<()> {
    let root = root.as_ref();
    if !root.exists() {
        return Ok(());
    }

    // 收集全部子目录，按深度从深到浅删除
    let mut dirs = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.is_dir() {
                dirs.push(path.clone());
                stack.push(path);
            }
        }
    }
    dirs.sort_by_key(|d| std::cmp::Reverse(d.components().count()));

    for dir in dirs {
        if is_dir_empty(&dir).await? {
            if let Err(e) = tokio::fs::remove_dir(&dir).await {
                warn!("failed to remove empty directory {}: {}", dir.display(), e);
            }
        }
    }

    if is_dir_empty(root).await? {
        if let Err(e) = tokio::fs::remove_dir(root).await {
            warn!("failed to remove directory {}: {}", root.display(), e);
        }
    }
    Ok(())
}

async fn is_dir_empty(dir: &Path) -> Result<bool> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    Ok(entries.next_entry().await?.is_none())
}

/// 生成不与现有文件冲突的输出路径
///
/// 已存在时在文件名后追加八位随机后缀；重识别输出永不覆盖。
pub fn unique_output_path(dir: &Path, file_name: &str) -> PathBuf {
    let candidate = dir.join(file_name);
    if !candidate.exists() {
        return candidate;
    }

    let path = Path::new(file_name);
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(file_name);
    let extension = path.extension().and_then(|s| s.to_str());
    let suffix = &Uuid::new_v4().simple().to_string()[..8];
    match extension {
        Some(ext) => dir.join(format!("{}_{}.{}", stem, suffix, ext)),
        None => dir.join(format!("{}_{}", stem, suffix)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_move_file_empties_source() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("in/a.dcm");
        let target = dir.path().join("out/a.dcm");
        tokio::fs::create_dir_all(source.parent().unwrap())
            .await
            .unwrap();
        tokio::fs::write(&source, b"data").await.unwrap();

        move_file(&source, &target).await.unwrap();

        assert!(!source.exists());
        assert_eq!(tokio::fs::read(&target).await.unwrap(), b"data");
    }

    #[tokio::test]
    async fn test_move_directory() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("series");
        tokio::fs::create_dir_all(source.join("nested")).await.unwrap();
        tokio::fs::write(source.join("a.dcm"), b"a").await.unwrap();
        tokio::fs::write(source.join("nested/b.dcm"), b"b").await.unwrap();

        let target = dir.path().join("stage/series");
        move_directory(&source, &target).await.unwrap();

        assert!(!source.exists());
        assert!(target.join("a.dcm").exists());
        assert!(target.join("nested/b.dcm").exists());
    }

    #[tokio::test]
    async fn test_cleanup_empty_dirs() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("tree");
        tokio::fs::create_dir_all(root.join("a/b/c")).await.unwrap();
        tokio::fs::create_dir_all(root.join("keep")).await.unwrap();
        tokio::fs::write(root.join("keep/file.txt"), b"x").await.unwrap();

        cleanup_empty_dirs(&root).await.unwrap();

        assert!(!root.join("a").exists());
        assert!(root.join("keep/file.txt").exists());
        // 根目录还有内容，不删除
        assert!(root.exists());
    }

    #[tokio::test]
    async fn test_unique_output_path_never_overwrites() {
        let dir = tempdir().unwrap();
        let existing = dir.path().join("result.dcm");
        std::fs::write(&existing, b"x").unwrap();

        let unique = unique_output_path(dir.path(), "result.dcm");
        assert_ne!(unique, existing);
        assert!(unique.file_name().unwrap().to_str().unwrap().ends_with(".dcm"));

        let fresh = unique_output_path(dir.path(), "other.dcm");
        assert_eq!(fresh, dir.path().join("other.dcm"));
    }

    #[tokio::test]
    async fn test_list_files_recursive_sorted() {
        let dir = tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("sub")).await.unwrap();
        tokio::fs::write(dir.path().join("b.dcm"), b"b").await.unwrap();
        tokio::fs::write(dir.path().join("a.dcm"), b"a").await.unwrap();
        tokio::fs::write(dir.path().join("sub/c.dcm"), b"c").await.unwrap();

        let files = list_files_recursive(dir.path()).await.unwrap();
        assert_eq!(files.len(), 3);
        assert!(files[0].ends_with("a.dcm"));
    }
}
