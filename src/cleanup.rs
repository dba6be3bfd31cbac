//! 清理协调：分片文件的批量删除与组装结果文件的单一消费者交接。

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tracing::{debug, warn};

use crate::chunk_store::remove_chunk;

/// 删除一组分片文件，返回删除失败的数量。失败只记录日志，不中断其余删除。
pub async fn discard_chunks<'a, I>(paths: I) -> usize
where
    I: IntoIterator<Item = &'a Path>,
{
    let mut failures = 0;
    for path in paths {
        if let Err(err) = remove_chunk(path).await {
            failures += 1;
            warn!(path = ?path, error = %err, "failed to remove chunk file");
        }
    }
    failures
}

/// 组装完成后的输出文件。
///
/// 持有者是该文件唯一的消费者：处理完毕后调用 [`AssembledFile::release`] 删除它。
/// 未调用 `release` 就被丢弃时，文件仍会在后台被删除。
#[derive(Debug)]
pub struct AssembledFile {
    path: Option<PathBuf>,
    len: u64,
}

impl AssembledFile {
    pub(crate) fn new(path: PathBuf, len: u64) -> Self {
        Self {
            path: Some(path),
            len,
        }
    }

    pub fn path(&self) -> &Path {
        self.path.as_deref().unwrap_or_else(|| Path::new(""))
    }

    pub fn size(&self) -> u64 {
        self.len
    }

    /// 以只读方式打开输出文件。
    pub async fn open(&self) -> io::Result<File> {
        File::open(self.path()).await
    }

    /// 消费者处理完毕，删除输出文件。
    pub async fn release(mut self) -> io::Result<()> {
        match self.path.take() {
            Some(path) => {
                remove_chunk(&path).await?;
                debug!(path = ?path, "assembled file released");
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Drop for AssembledFile {
    fn drop(&mut self) {
        let Some(path) = self.path.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = remove_chunk(&path).await {
                        warn!(
                            path = ?path,
                            error = %err,
                            "failed to remove dropped assembled file"
                        );
                    }
                });
            }
            Err(_) => {
                if let Err(err) = std::fs::remove_file(&path)
                    && err.kind() != io::ErrorKind::NotFound
                {
                    warn!(path = ?path, error = %err, "failed to remove dropped assembled file");
                }
            }
        }
    }
}
