//! JSON 文件持久化：临时文件写入后原子重命名

use crate::error::{CoreError, CoreResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// 序列化并原子替换目标文件
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> CoreResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| CoreError::from_io(parent, e))?;
        }
    }

    let data = serde_json::to_vec(value)?;
    let temp = temp_path(path);
    fs::write(&temp, data).map_err(|e| CoreError::from_io(&temp, e))?;
    fs::rename(&temp, path).map_err(|e| CoreError::from_io(path, e))?;

    Ok(())
}

/// 读取 JSON 文件；文件不存在返回 None，内容损坏时删除文件并返回 None
pub fn read_json<T: DeserializeOwned>(path: &Path) -> CoreResult<Option<T>> {
    let data = match fs::read(path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(CoreError::from_io(path, e)),
    };

    match serde_json::from_slice(&data) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            tracing::warn!("持久化文件已损坏，丢弃: {:?} ({})", path, e);
            let _ = fs::remove_file(path);
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        write_json_atomic(&path, &vec![1u32, 2, 3]).unwrap();
        let back: Option<Vec<u32>> = read_json(&path).unwrap();
        assert_eq!(back, Some(vec![1, 2, 3]));
        assert!(!temp_path(&path).exists());
    }

    #[test]
    fn test_corrupt_file_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        fs::write(&path, b"{not json").unwrap();

        let back: Option<Vec<u32>> = read_json(&path).unwrap();
        assert!(back.is_none());
        assert!(!path.exists());
    }
}
