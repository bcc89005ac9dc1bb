//! 缓存与临时文件的写入/清理。

use std::fs;
use std::io;
use std::path::Path;

pub fn is_empty_dir(path: impl AsRef<Path>) -> io::Result<bool> {
    let path = path.as_ref();
    let mut entries = fs::read_dir(path)?;
    Ok(entries.next().is_none())
}

/// 先写临时文件再 rename，读者只会看到完整的旧文件或新文件。
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension(format!(
        "{}part",
        path.extension().and_then(|s| s.to_str()).unwrap_or("")
    ));
    fs::write(&tmp, bytes)?;
    // Windows 下 rename 不会覆盖已存在文件
    if cfg!(windows) {
        let _ = fs::remove_file(path);
    }
    fs::rename(tmp, path)?;
    Ok(())
}

/// 删除目录；不存在视为成功。
pub fn remove_dir_all_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// 父目录为空时顺手删掉，避免 temp 目录里堆积空文件夹。
pub fn remove_parent_if_empty(path: &Path) {
    if let Some(parent) = path.parent()
        && is_empty_dir(parent).unwrap_or(false)
    {
        let _ = fs::remove_dir(parent);
    }
}
