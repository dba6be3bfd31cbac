//! 上传网关：解析分片请求，交给传输登记表，并把组装结果交付到存储目录。

use axum::Error as AxumError;
use axum::body::Body as AxumBody;
use axum::extract::{Extension, Json, Query};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use futures_util::stream::StreamExt;
use http_body_util::BodyExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::MAX_CHUNK_SIZE;
use crate::delivery::Delivery;
use crate::error::ApiError;
use crate::registry::{
    ChunkOutcome, IncomingChunk, Metadata, TerminalInfo, TransmissionKey, TransmissionRegistry,
    TransmissionSnapshot,
};

pub const CLIENT_ID_HEADER: &str = "x-client-id";
pub const TRANSMISSION_ID_HEADER: &str = "x-transmission-id";
pub const CHUNK_INDEX_HEADER: &str = "x-chunk-index";
pub const TOTAL_SIZE_HEADER: &str = "x-total-size";
pub const FILE_NAME_HEADER: &str = "x-file-name";
pub const FILE_METADATA_HEADER: &str = "x-file-metadata";

const MAX_ID_LEN: usize = 128;

#[derive(Debug)]
pub struct GatewayConfig {
    pub client_id_prefix: String,
    pub max_transmission_size: u64,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ChunkReceipt {
    client_id: String,
    transmission_id: String,
    status: ReceiptStatus,
    received_chunks: u64,
    expected_chunks: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<Metadata>,
}

#[derive(Serialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub(crate) enum ReceiptStatus {
    Incomplete,
    Complete,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TransmissionRef {
    client_id: String,
    transmission_id: String,
}

impl TransmissionRef {
    fn into_key(self) -> Result<TransmissionKey, ApiError> {
        validate_id(&self.client_id, "clientId")?;
        validate_id(&self.transmission_id, "transmissionId")?;
        Ok(TransmissionKey::new(self.client_id, self.transmission_id))
    }
}

/// 接收单个分片；传输完成时组装并交付文件。
pub async fn upload_chunk(
    Extension(registry): Extension<Arc<TransmissionRegistry>>,
    Extension(delivery): Extension<Arc<Delivery>>,
    Extension(gateway): Extension<Arc<GatewayConfig>>,
    headers: HeaderMap,
    body: AxumBody,
) -> Result<Response, ApiError> {
    let client_id = match header_str(&headers, CLIENT_ID_HEADER) {
        Some(value) => {
            validate_id(value, CLIENT_ID_HEADER)?;
            value.to_string()
        }
        None => format!("{}-{}", gateway.client_id_prefix, Uuid::new_v4()),
    };
    let transmission_id = match header_str(&headers, TRANSMISSION_ID_HEADER) {
        Some(value) => {
            validate_id(value, TRANSMISSION_ID_HEADER)?;
            value.to_string()
        }
        None => Uuid::new_v4().to_string(),
    };
    let index = parse_u64_header(&headers, CHUNK_INDEX_HEADER)?
        .ok_or_else(|| ApiError::BadRequest("X-Chunk-Index is required".into()))?;
    if index == 0 {
        return Err(ApiError::BadRequest("X-Chunk-Index starts at 1".into()));
    }
    let declared_total_size = parse_u64_header(&headers, TOTAL_SIZE_HEADER)?;
    let terminal = header_str(&headers, FILE_NAME_HEADER).map(|name| TerminalInfo {
        original_filename: name.to_string(),
        metadata: header_str(&headers, FILE_METADATA_HEADER).map(str::to_string),
    });

    let payload = read_chunk_body(body).await?;
    debug!(
        client_id,
        transmission_id,
        chunk_index = index,
        bytes = payload.len(),
        "chunk received"
    );

    let key = TransmissionKey::new(client_id.clone(), transmission_id.clone());
    let outcome = registry
        .accept_chunk(
            IncomingChunk {
                key,
                index,
                payload,
                declared_total_size,
                terminal,
            },
            None,
        )
        .await?;

    let mut response_headers = id_headers(&client_id, &transmission_id)?;
    match outcome {
        ChunkOutcome::Incomplete { received, expected } => {
            let receipt = ChunkReceipt {
                client_id,
                transmission_id,
                status: ReceiptStatus::Incomplete,
                received_chunks: received,
                expected_chunks: expected,
                name: None,
                size: None,
                metadata: None,
            };
            Ok((StatusCode::ACCEPTED, response_headers, JsonResponse(receipt)).into_response())
        }
        ChunkOutcome::QuotaExceeded(breach) => {
            warn!(client_id, transmission_id, breach = ?breach, "upload rejected by quota");
            Err(ApiError::Forbidden("transmission exceeds size limit".into()))
        }
        ChunkOutcome::Complete(done) => {
            let delivered = delivery
                .deliver(done.file, &done.original_filename, &headers)
                .await?;
            response_headers.extend(delivered.headers()?);
            let receipt = ChunkReceipt {
                client_id,
                transmission_id,
                status: ReceiptStatus::Complete,
                received_chunks: done.chunk_count,
                expected_chunks: Some(done.chunk_count),
                name: Some(delivered.name),
                size: Some(delivered.size),
                metadata: Some(done.metadata),
            };
            Ok((StatusCode::CREATED, response_headers, JsonResponse(receipt)).into_response())
        }
    }
}

/// 放弃在途传输并删除已收分片。
pub async fn abort_upload(
    Extension(registry): Extension<Arc<TransmissionRegistry>>,
    Json(payload): Json<TransmissionRef>,
) -> Result<StatusCode, ApiError> {
    let key = payload.into_key()?;
    if !registry.cancel(&key).await {
        return Err(ApiError::NotFound("transmission not found".into()));
    }
    Ok(StatusCode::NO_CONTENT)
}

/// 查询在途传输的进度。
pub async fn upload_status(
    Extension(registry): Extension<Arc<TransmissionRegistry>>,
    Query(query): Query<TransmissionRef>,
) -> Result<JsonResponse<TransmissionSnapshot>, ApiError> {
    let key = query.into_key()?;
    registry
        .snapshot(&key)
        .await
        .map(JsonResponse)
        .ok_or_else(|| ApiError::NotFound("transmission not found".into()))
}

async fn read_chunk_body(body: AxumBody) -> Result<Vec<u8>, ApiError> {
    let mut data_stream = BodyExt::into_data_stream(body);
    let mut payload = Vec::new();
    while let Some(chunk) = data_stream.next().await {
        let chunk = chunk.map_err(|err: AxumError| ApiError::BadRequest(err.to_string()))?;
        if payload.len() as u64 + chunk.len() as u64 > MAX_CHUNK_SIZE {
            return Err(ApiError::BadRequest("chunk too large".into()));
        }
        payload.extend_from_slice(&chunk);
    }
    Ok(payload)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn parse_u64_header(headers: &HeaderMap, name: &str) -> Result<Option<u64>, ApiError> {
    match header_str(headers, name) {
        Some(value) => value
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ApiError::BadRequest(format!("{name} is invalid"))),
        None => Ok(None),
    }
}

fn validate_id(value: &str, field: &str) -> Result<(), ApiError> {
    let valid = !value.is_empty()
        && value.len() <= MAX_ID_LEN
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(ApiError::BadRequest(format!("{field} is invalid")))
    }
}

fn id_headers(client_id: &str, transmission_id: &str) -> Result<HeaderMap, ApiError> {
    let mut headers = HeaderMap::new();
    for (name, value) in [
        (CLIENT_ID_HEADER, client_id),
        (TRANSMISSION_ID_HEADER, transmission_id),
    ] {
        let value = HeaderValue::from_str(value)
            .map_err(|_| ApiError::Internal("响应头构建失败".into()))?;
        headers.insert(HeaderName::from_static(name), value);
    }
    Ok(headers)
}
