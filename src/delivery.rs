//! 组装结果的下游消费者：写入存储目录并释放临时输出。

use axum::http::{HeaderMap, HeaderValue, header};
use httpdate::fmt_http_date;
use std::fs::Metadata as FsMetadata;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use tokio::fs;
use tracing::{info, warn};

use crate::atomic::AtomicFile;
use crate::cleanup::AssembledFile;
use crate::config::DEFAULT_LOCK_WAIT_TIMEOUT_SECS;
use crate::error::ApiError;
use crate::locking::LockManager;
use crate::storage::Storage;

/// 交付完成后的目标文件信息。
#[derive(Debug)]
pub struct Delivered {
    pub name: String,
    pub size: u64,
    pub etag: String,
    pub last_modified: Option<String>,
}

impl Delivered {
    pub fn headers(&self) -> Result<HeaderMap, ApiError> {
        let mut headers = HeaderMap::new();
        headers.insert(header::ETAG, header_value(&self.etag)?);
        if let Some(value) = &self.last_modified {
            headers.insert(header::LAST_MODIFIED, header_value(value)?);
        }
        Ok(headers)
    }
}

#[derive(Clone, Debug)]
pub struct Delivery {
    storage: Arc<Storage>,
    locks: Arc<LockManager>,
    lock_timeout: Duration,
}

impl Delivery {
    pub fn new(storage: Arc<Storage>, locks: Arc<LockManager>) -> Self {
        Self {
            storage,
            locks,
            lock_timeout: Duration::from_secs(DEFAULT_LOCK_WAIT_TIMEOUT_SECS),
        }
    }

    /// 把组装好的文件写到 `name` 对应的存储路径，成功后删除组装输出。
    ///
    /// 失败时 `assembled` 随之丢弃，输出文件同样会被删除。
    pub async fn deliver(
        &self,
        assembled: AssembledFile,
        name: &str,
        request_headers: &HeaderMap,
    ) -> Result<Delivered, ApiError> {
        let name = Storage::normalize_name(name)?;
        let _guard = self
            .locks
            .lock_path_with_timeout(&name, self.lock_timeout)
            .await?;
        let target = self.storage.resolve_path_checked(&name, true).await?;
        let existing = match fs::metadata(&target).await {
            Ok(metadata) => Some(metadata),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => return Err(ApiError::Internal(err.to_string())),
        };
        if existing.as_ref().is_some_and(|metadata| metadata.is_dir()) {
            return Err(ApiError::Conflict("target is a directory".into()));
        }
        let current_etag = existing.as_ref().map(etag_from_metadata);
        check_preconditions(request_headers, current_etag.as_deref())?;

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| ApiError::Internal(err.to_string()))?;
        }

        let mut atomic = AtomicFile::create(&target)
            .await
            .map_err(|err| ApiError::Internal(err.to_string()))?;
        let copied: std::io::Result<u64> = async {
            let mut source = assembled.open().await?;
            atomic.write_from(&mut source).await
        }
        .await;
        match copied {
            Ok(copied) if copied == assembled.size() => {}
            Ok(copied) => {
                warn!(
                    name,
                    expected = assembled.size(),
                    actual = copied,
                    "size mismatch while delivering"
                );
                atomic.discard().await;
                return Err(ApiError::Internal("size mismatch".into()));
            }
            Err(err) => {
                atomic.discard().await;
                return Err(ApiError::Internal(err.to_string()));
            }
        }
        atomic
            .commit()
            .await
            .map_err(|err| ApiError::Internal(err.to_string()))?;

        let size = assembled.size();
        if let Err(err) = assembled.release().await {
            warn!(name, error = %err, "failed to release assembled file");
        }

        let metadata = fs::metadata(&target)
            .await
            .map_err(|err| ApiError::Internal(err.to_string()))?;
        info!(name, size, "assembled file delivered");
        Ok(Delivered {
            etag: etag_from_metadata(&metadata),
            last_modified: metadata.modified().ok().map(fmt_http_date),
            name,
            size,
        })
    }
}

/// 根据文件元数据生成弱 ETag。
pub fn etag_from_metadata(metadata: &FsMetadata) -> String {
    let size = metadata.len();
    match metadata
        .modified()
        .ok()
        .and_then(|modified| modified.duration_since(UNIX_EPOCH).ok())
    {
        Some(since) => format!(
            "W/\"{}-{}-{}\"",
            size,
            since.as_secs(),
            since.subsec_nanos()
        ),
        None => format!("W/\"{size}\""),
    }
}

/// 校验 If-Match / If-None-Match，`current` 为目标现有文件的 ETag。
pub fn check_preconditions(headers: &HeaderMap, current: Option<&str>) -> Result<(), ApiError> {
    let failed = || ApiError::PreconditionFailed("precondition failed".into());

    if let Some(value) = header_str(headers, header::IF_MATCH)
        && !tag_list_matches(value, current)
    {
        return Err(failed());
    }
    if let Some(value) = header_str(headers, header::IF_NONE_MATCH)
        && tag_list_matches(value, current)
    {
        return Err(failed());
    }
    Ok(())
}

/// `*` 匹配任意现有文件，否则逐个比较列表中的 ETag。
fn tag_list_matches(list: &str, current: Option<&str>) -> bool {
    let Some(current) = current else {
        return false;
    };
    list.split(',')
        .map(str::trim)
        .any(|tag| tag == "*" || tag == current)
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> Option<&str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn header_value(value: &str) -> Result<HeaderValue, ApiError> {
    HeaderValue::from_str(value).map_err(|_| ApiError::Internal("响应头构建失败".into()))
}
