//! 按分片序号顺序拼接输出文件，并在拼接过程中删除已用分片。

use std::collections::BTreeMap;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::chunk_store::remove_chunk;
use crate::cleanup::AssembledFile;
use crate::tempname::{allocate_temp_path, extension_of};

const OUTPUT_FILE_PREFIX: &str = "assembled-";

#[derive(Clone, Debug)]
pub struct Assembler {
    dir: PathBuf,
}

impl Assembler {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// 将序号 `1..=expected_count` 的分片依次追加到新的输出文件。
    ///
    /// 每个分片追加后立即删除。任何读写失败都会中止组装并删除部分输出；
    /// 尚未处理的分片由调用方清理。
    pub async fn assemble(
        &self,
        chunk_paths: &BTreeMap<u64, PathBuf>,
        expected_count: u64,
        original_filename: Option<&str>,
    ) -> io::Result<AssembledFile> {
        let extension = original_filename.and_then(extension_of);
        let output_path = allocate_temp_path(&self.dir, OUTPUT_FILE_PREFIX, extension).await?;
        let mut output = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&output_path)
            .await?;

        let result = append_chunks(&mut output, chunk_paths, expected_count).await;
        let result = match result {
            Ok(total) => output.sync_all().await.map(|_| total),
            Err(err) => Err(err),
        };
        drop(output);

        match result {
            Ok(total) => {
                debug!(path = ?output_path, bytes = total, "chunks assembled");
                Ok(AssembledFile::new(output_path, total))
            }
            Err(err) => {
                if let Err(cleanup) = remove_chunk(&output_path).await {
                    warn!(
                        path = ?output_path,
                        error = %cleanup,
                        "failed to remove partial assembled file"
                    );
                }
                Err(err)
            }
        }
    }
}

async fn append_chunks(
    output: &mut File,
    chunk_paths: &BTreeMap<u64, PathBuf>,
    expected_count: u64,
) -> io::Result<u64> {
    let mut total: u64 = 0;
    for index in 1..=expected_count {
        let path = chunk_paths.get(&index).ok_or_else(|| {
            io::Error::new(ErrorKind::NotFound, format!("chunk {index} is missing"))
        })?;
        total += append_one(output, path).await?;
        remove_chunk(path).await?;
    }
    output.flush().await?;
    Ok(total)
}

async fn append_one(output: &mut File, path: &Path) -> io::Result<u64> {
    let mut chunk = File::open(path).await?;
    tokio::io::copy(&mut chunk, output).await
}
