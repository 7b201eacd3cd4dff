//! hb-protocol: hawkBit wire JSON schemas — decode + encode.
//!
//! Five fixed document shapes are supported: the base polling ("control")
//! response, the deployment response, and three outbound status payloads
//! (config-data, close, feedback). All decoding enforces the schema's size
//! and shape invariants at parse time rather than via fixed-capacity
//! buffers — oversize or malformed input is rejected with `CodecError`
//! instead of being truncated.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum status payload size, matching the embedded reference's
/// 200-byte `STATUS_BUFFER_SIZE`.
pub const STATUS_BUFFER_SIZE: usize = 200;

/// Declared array capacity for `deployment.chunks`. The business rule
/// (exactly one chunk) is stricter and enforced separately.
pub const MAX_CHUNKS: usize = 8;

/// Declared array capacity for `chunks[].artifacts`.
pub const MAX_ARTIFACTS_PER_CHUNK: usize = 4;

const EXPECTED_DOWNLOAD_HTTP_SUBSTR: &str = "/DEFAULT/controller/v1";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("invalid JSON: {0}")]
    Json(String),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("schema violation: {0}")]
    SchemaViolation(String),
    #[error("encoded payload of {actual} bytes exceeds buffer of {limit} bytes")]
    PayloadTooLarge { actual: usize, limit: usize },
}

impl From<serde_json::Error> for CodecError {
    fn from(e: serde_json::Error) -> Self {
        CodecError::Json(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Shared status sub-document (outbound)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Execution {
    Closed,
    Proceeding,
    Canceled,
    Scheduled,
    Rejected,
    Resumed,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Finished {
    Success,
    Failure,
    None,
}

#[derive(Debug, Serialize)]
struct StatusResult {
    finished: Finished,
}

#[derive(Debug, Serialize)]
struct Status {
    execution: Execution,
    result: StatusResult,
}

// ---------------------------------------------------------------------------
// Control response (inbound): GET {root}/{board}-{device_id}
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ControlResponse {
    /// Raw `HH:MM:SS` string, not yet validated/converted to seconds.
    pub polling_sleep: Option<String>,
    pub deployment_base_href: Option<String>,
    pub cancel_action_href: Option<String>,
    pub config_data_href: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireHref {
    href: String,
}

#[derive(Debug, Deserialize, Default)]
struct WireControlLinks {
    #[serde(rename = "deploymentBase")]
    deployment_base: Option<WireHref>,
    #[serde(rename = "cancelAction")]
    cancel_action: Option<WireHref>,
    #[serde(rename = "configData")]
    config_data: Option<WireHref>,
}

#[derive(Debug, Deserialize, Default)]
struct WirePolling {
    sleep: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct WireConfigWrapper {
    #[serde(default)]
    polling: WirePolling,
}

#[derive(Debug, Deserialize)]
struct WireControlResponse {
    #[serde(default)]
    config: WireConfigWrapper,
    #[serde(rename = "_links", default)]
    links: WireControlLinks,
}

/// Parse the base polling resource response.
///
/// Each present hyperlink must be non-empty and contain its expected
/// substring (`deploymentBase/`, `cancelAction/`, `configData`); a
/// violation is a schema error, matching the original implementation's
/// "a badly formatted base is a server error" stance.
pub fn parse_control_response(body: &[u8]) -> Result<ControlResponse, CodecError> {
    let wire: WireControlResponse = serde_json::from_slice(body)?;

    let deployment_base_href =
        validate_href(wire.links.deployment_base, "deploymentBase/")?;
    let cancel_action_href = validate_href(wire.links.cancel_action, "cancelAction/")?;
    let config_data_href = validate_href(wire.links.config_data, "configData")?;

    Ok(ControlResponse {
        polling_sleep: wire.config.polling.sleep,
        deployment_base_href,
        cancel_action_href,
        config_data_href,
    })
}

fn validate_href(href: Option<WireHref>, expect_substr: &str) -> Result<Option<String>, CodecError> {
    match href {
        None => Ok(None),
        Some(WireHref { href }) => {
            if href.is_empty() || !href.contains(expect_substr) {
                return Err(CodecError::SchemaViolation(format!(
                    "href '{href}' missing expected substring '{expect_substr}'"
                )));
            }
            Ok(Some(href))
        }
    }
}

// ---------------------------------------------------------------------------
// Cancel reference
// ---------------------------------------------------------------------------

/// Extract the trailing positive decimal action id from a `cancelAction`
/// href, e.g. `.../cancelAction/42` -> `42`.
///
/// The second `/`-delimited path segment after `cancelAction` must parse
/// as a positive (`> 0`) integer; anything else is a server error.
pub fn parse_cancel_action_id(href: &str) -> Result<i64, CodecError> {
    let after = href
        .split("cancelAction/")
        .nth(1)
        .ok_or_else(|| CodecError::SchemaViolation("missing cancelAction/ segment".into()))?;
    let segment = after.split('/').next().unwrap_or("");
    let id: i64 = segment
        .parse()
        .map_err(|_| CodecError::SchemaViolation(format!("invalid cancel action id '{segment}'")))?;
    if id <= 0 {
        return Err(CodecError::SchemaViolation(format!(
            "non-positive cancel action id {id}"
        )));
    }
    Ok(id)
}

/// Return the `deploymentBase/...` tail of a `deploymentBase` href, for
/// assembling the deployment-probe URL.
pub fn extract_deployment_path(href: &str) -> Result<&str, CodecError> {
    href.find("deploymentBase/")
        .map(|idx| &href[idx..])
        .ok_or_else(|| CodecError::SchemaViolation("missing deploymentBase/ segment".into()))
}

// ---------------------------------------------------------------------------
// Deployment response (inbound)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hashes {
    pub sha1: Option<String>,
    pub md5: Option<String>,
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub filename: String,
    pub size: i64,
    pub hashes: Hashes,
    pub download_http_href: String,
    pub md5sum_http_href: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub part: String,
    pub name: Option<String>,
    pub version: Option<String>,
    pub artifact: Artifact,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentResponse {
    pub action_id: i64,
    pub download_phase: String,
    pub update_phase: String,
    pub chunk: Chunk,
}

#[derive(Debug, Deserialize)]
struct WireHashes {
    sha1: Option<String>,
    md5: Option<String>,
    sha256: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireArtifactLinks {
    #[serde(rename = "download-http")]
    download_http: WireHref,
    #[serde(rename = "md5sum-http")]
    md5sum_http: Option<WireHref>,
}

#[derive(Debug, Deserialize)]
struct WireArtifact {
    filename: String,
    size: i64,
    hashes: WireHashes,
    #[serde(rename = "_links")]
    links: WireArtifactLinks,
}

#[derive(Debug, Deserialize)]
struct WireChunk {
    part: String,
    name: Option<String>,
    version: Option<String>,
    artifacts: Vec<WireArtifact>,
}

#[derive(Debug, Deserialize)]
struct WireDeployment {
    download: String,
    update: String,
    chunks: Vec<WireChunk>,
}

#[derive(Debug, Deserialize)]
struct WireDeploymentResponse {
    id: String,
    deployment: WireDeployment,
}

/// Parse and fully validate a deployment response: exactly one chunk of
/// part `"bApp"`, exactly one artifact, and a `download-http` href
/// containing `/DEFAULT/controller/v1`. Any deviation is a schema error.
pub fn parse_deployment_response(body: &[u8]) -> Result<DeploymentResponse, CodecError> {
    let wire: WireDeploymentResponse = serde_json::from_slice(body)?;

    let action_id: i64 = wire
        .id
        .parse()
        .map_err(|_| CodecError::SchemaViolation(format!("invalid action id '{}'", wire.id)))?;
    if action_id <= 0 {
        return Err(CodecError::SchemaViolation(format!(
            "non-positive deployment action id {action_id}"
        )));
    }

    if wire.deployment.chunks.len() > MAX_CHUNKS {
        return Err(CodecError::SchemaViolation(format!(
            "too many chunks: {} exceeds capacity {}",
            wire.deployment.chunks.len(),
            MAX_CHUNKS
        )));
    }
    if wire.deployment.chunks.len() != 1 {
        return Err(CodecError::SchemaViolation(format!(
            "expecting one chunk, got {}",
            wire.deployment.chunks.len()
        )));
    }
    let wire_chunk = wire.deployment.chunks.into_iter().next().unwrap();

    if wire_chunk.part != "bApp" {
        return Err(CodecError::SchemaViolation(format!(
            "only part 'bApp' is supported, got '{}'",
            wire_chunk.part
        )));
    }

    if wire_chunk.artifacts.len() > MAX_ARTIFACTS_PER_CHUNK {
        return Err(CodecError::SchemaViolation(format!(
            "too many artifacts: {} exceeds capacity {}",
            wire_chunk.artifacts.len(),
            MAX_ARTIFACTS_PER_CHUNK
        )));
    }
    if wire_chunk.artifacts.len() != 1 {
        return Err(CodecError::SchemaViolation(format!(
            "expecting one artifact, got {}",
            wire_chunk.artifacts.len()
        )));
    }
    let wire_artifact = wire_chunk.artifacts.into_iter().next().unwrap();

    if wire_artifact.links.download_http.href.is_empty() {
        return Err(CodecError::SchemaViolation("empty download-http href".into()));
    }
    if !wire_artifact
        .links
        .download_http
        .href
        .contains(EXPECTED_DOWNLOAD_HTTP_SUBSTR)
    {
        return Err(CodecError::SchemaViolation(format!(
            "unexpected download-http href format: {}",
            wire_artifact.links.download_http.href
        )));
    }

    Ok(DeploymentResponse {
        action_id,
        download_phase: wire.deployment.download,
        update_phase: wire.deployment.update,
        chunk: Chunk {
            part: wire_chunk.part,
            name: wire_chunk.name,
            version: wire_chunk.version,
            artifact: Artifact {
                filename: wire_artifact.filename,
                size: wire_artifact.size,
                hashes: Hashes {
                    sha1: wire_artifact.hashes.sha1,
                    md5: wire_artifact.hashes.md5,
                    sha256: wire_artifact.hashes.sha256,
                },
                download_http_href: wire_artifact.links.download_http.href,
                md5sum_http_href: wire_artifact.links.md5sum_http.map(|h| h.href),
            },
        },
    })
}

// ---------------------------------------------------------------------------
// Outbound payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ConfigDataPayload<'a> {
    mode: &'a str,
    data: ConfigDataFields<'a>,
    id: &'a str,
    time: &'a str,
    status: Status,
}

#[derive(Debug, Serialize)]
struct ConfigDataFields<'a> {
    #[serde(rename = "VIN")]
    vin: &'a str,
    #[serde(rename = "hwRevision")]
    hw_revision: &'a str,
}

/// Encode the `configData` PUT body. `mode` is always `"merge"` per the
/// spec; `hw_revision` defaults to `"3"` to match the original device's
/// constant.
pub fn encode_config_data(
    device_id: &str,
    hw_revision: &str,
    execution: Execution,
    finished: Finished,
) -> Result<Vec<u8>, CodecError> {
    let payload = ConfigDataPayload {
        mode: "merge",
        data: ConfigDataFields {
            vin: device_id,
            hw_revision,
        },
        id: "",
        time: "",
        status: Status { execution, result: StatusResult { finished } },
    };
    encode_bounded(&payload)
}

#[derive(Debug, Serialize)]
struct ClosePayload<'a> {
    id: &'a str,
    time: &'a str,
    status: Status,
}

/// Encode a cancel-acknowledgement `feedback` POST body (the "close"
/// shape — carries `time` in addition to `id`/`status`).
pub fn encode_close(action_id: i64, execution: Execution, finished: Finished) -> Result<Vec<u8>, CodecError> {
    let id = action_id.to_string();
    let payload = ClosePayload {
        id: &id,
        time: "",
        status: Status { execution, result: StatusResult { finished } },
    };
    encode_bounded(&payload)
}

#[derive(Debug, Serialize)]
struct FeedbackPayload<'a> {
    id: &'a str,
    status: Status,
}

/// Encode a deployment `feedback` POST body.
pub fn encode_feedback(action_id: i64, execution: Execution, finished: Finished) -> Result<Vec<u8>, CodecError> {
    let id = action_id.to_string();
    let payload = FeedbackPayload {
        id: &id,
        status: Status { execution, result: StatusResult { finished } },
    };
    encode_bounded(&payload)
}

fn encode_bounded<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    let bytes = serde_json::to_vec(value)?;
    if bytes.len() > STATUS_BUFFER_SIZE {
        return Err(CodecError::PayloadTooLarge {
            actual: bytes.len(),
            limit: STATUS_BUFFER_SIZE,
        });
    }
    Ok(bytes)
}

// ---------------------------------------------------------------------------
// Polling sleep conversion
// ---------------------------------------------------------------------------

/// Parse an `HH:MM:SS` polling-sleep string into milliseconds.
///
/// Must be exactly 8 characters; a length mismatch or non-numeric field
/// is rejected (the caller should then leave the interval unchanged).
pub fn parse_polling_sleep_ms(sleep: &str) -> Option<u32> {
    if sleep.len() != 8 {
        return None;
    }
    let bytes = sleep.as_bytes();
    if bytes[2] != b':' || bytes[5] != b':' {
        return None;
    }
    let hours: u32 = sleep.get(0..2)?.parse().ok()?;
    let minutes: u32 = sleep.get(3..5)?.parse().ok()?;
    let seconds: u32 = sleep.get(6..8)?.parse().ok()?;
    let total_seconds = hours * 3600 + minutes * 60 + seconds;
    if total_seconds == 0 {
        return None;
    }
    Some(total_seconds * 1000)
}
