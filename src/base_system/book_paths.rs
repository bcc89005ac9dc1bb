use std::path::{Path, PathBuf};

use crate::base_system::context::safe_fs_name;

/// 每本书独立的断点缓存目录：`{temp_dir}/{book_id}`
pub fn cache_folder_path(temp_dir: &Path, book_id: &str) -> PathBuf {
    temp_dir.join(safe_fs_name(book_id, "_", 120))
}

/// 最终产物路径：`{output_dir}/{book_name}.{ext}`
pub fn artifact_path(output_dir: &Path, book_name: &str, extension: &str) -> PathBuf {
    let safe_name = safe_fs_name(book_name, "_", 120);
    let ext = extension.trim_start_matches('.');
    if ext.is_empty() {
        output_dir.join(safe_name)
    } else {
        output_dir.join(format!("{safe_name}.{ext}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_path_sanitizes_name() {
        let p = artifact_path(Path::new("/out"), "a/b:c", ".epub");
        assert_eq!(p, PathBuf::from("/out/a、b：c.epub"));
    }

    #[test]
    fn cache_folder_is_keyed_by_book_id() {
        let p = cache_folder_path(Path::new("/tmp/x"), "7143038691944959011");
        assert_eq!(p, PathBuf::from("/tmp/x/7143038691944959011"));
    }
}
