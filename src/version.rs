//! 版本与上传限制信息。

use axum::extract::Extension;
use axum::response::Json as JsonResponse;
use serde::Serialize;
use std::sync::Arc;

use crate::config::MAX_CHUNK_SIZE;
use crate::upload::GatewayConfig;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    version: &'static str,
    build_time: &'static str,
    build_env: String,
    max_chunk_size: u64,
    max_transmission_size: u64,
}

/// 返回当前版本信息与客户端需要遵守的大小限制。
pub async fn get_version_info(
    Extension(gateway): Extension<Arc<GatewayConfig>>,
) -> JsonResponse<VersionInfo> {
    JsonResponse(VersionInfo {
        version: crate::build::PKG_VERSION,
        build_time: crate::build::BUILD_TIME,
        build_env: format!(
            "{},{}",
            crate::build::RUST_VERSION,
            crate::build::RUST_CHANNEL
        ),
        max_chunk_size: MAX_CHUNK_SIZE,
        max_transmission_size: gateway.max_transmission_size,
    })
}
