//! 分片落盘：每个分片写入工作目录下独立命名的临时文件。

use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::tempname::allocate_temp_path;

const CHUNK_FILE_PREFIX: &str = "chunk-";

#[derive(Clone, Debug)]
pub struct ChunkStore {
    dir: PathBuf,
}

impl ChunkStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn ensure_dir(&self) -> io::Result<()> {
        fs::create_dir_all(&self.dir).await
    }

    /// 写入一个分片，返回刷盘并关闭后的文件路径。
    ///
    /// 写入失败时文件句柄先关闭再删除残留文件，然后返回错误。
    pub async fn write_chunk(&self, payload: &[u8]) -> io::Result<PathBuf> {
        let path = allocate_temp_path(&self.dir, CHUNK_FILE_PREFIX, None).await?;
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;

        let result: io::Result<()> = async {
            file.write_all(payload).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        drop(file);

        if let Err(err) = result {
            if let Err(cleanup) = remove_chunk(&path).await {
                warn!(path = ?path, error = %cleanup, "failed to remove partial chunk file");
            }
            return Err(err);
        }
        Ok(path)
    }
}

/// 删除分片文件；文件不存在不视为错误。
pub async fn remove_chunk(path: &Path) -> io::Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}
