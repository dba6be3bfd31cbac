//! 工作目录内的临时文件命名：唯一 ID + 时间戳，冲突时追加数字后缀。

use chrono::Utc;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use uuid::Uuid;

/// 在 `dir` 中分配一个当前不存在的路径。
///
/// 依次探测 `base`、`base-1`、`base-2` ……，扩展名只附加到最终选中的名字上。
/// 探测与后续创建之间不是原子的，调用方需要以 create-new 方式打开文件。
pub async fn allocate_temp_path(
    dir: &Path,
    prefix: &str,
    extension: Option<&str>,
) -> io::Result<PathBuf> {
    let base = format!(
        "{prefix}{}-{}",
        Uuid::new_v4().simple(),
        Utc::now().timestamp_millis()
    );
    let extension = extension
        .map(|ext| ext.trim_start_matches('.'))
        .filter(|ext| !ext.is_empty());

    let mut suffix: u64 = 0;
    loop {
        let stem = if suffix == 0 {
            base.clone()
        } else {
            format!("{base}-{suffix}")
        };
        let candidate = dir.join(&stem);
        let candidate = match extension {
            Some(ext) => candidate.with_file_name(format!("{stem}.{ext}")),
            None => candidate,
        };
        if !fs::try_exists(&candidate).await? {
            return Ok(candidate);
        }
        suffix += 1;
    }
}

/// 取原始文件名的扩展名（不含点）。
pub fn extension_of(file_name: &str) -> Option<&str> {
    Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty())
}
