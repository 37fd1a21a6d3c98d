//! Phase 1 — Probe (spec §4.7).
//!
//! Issues a HEAD to learn size/range-support/validators; falls back to a
//! zero-length ranged GET when HEAD is disallowed or the server's headers
//! are incoherent.

use reqwest::header::{
    HeaderMap, HeaderValue, ACCEPT_RANGES, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE, ETAG, LAST_MODIFIED, RANGE,
};
use reqwest::{Client, StatusCode};
use tracing::{debug, instrument, warn};

use crate::error::Error;
use crate::request::FileInfo;

/// Runs the probe phase against `url`, returning the resolved [`FileInfo`].
#[instrument(skip(client, headers), fields(url))]
pub async fn probe(client: &Client, url: &str, headers: &HeaderMap) -> Result<FileInfo, Error> {
    let head = client
        .head(url)
        .headers(headers.clone())
        .send()
        .await
        .map_err(|e| Error::network(url.to_string(), e))?;

    if head.status() == StatusCode::METHOD_NOT_ALLOWED || !head.status().is_success() {
        debug!(status = %head.status(), "HEAD unavailable, falling back to ranged GET probe");
        return probe_via_range_get(client, url, headers).await;
    }

    Ok(file_info_from_headers(url, head.status(), head.headers()))
}

async fn probe_via_range_get(client: &Client, url: &str, headers: &HeaderMap) -> Result<FileInfo, Error> {
    let mut req_headers = headers.clone();
    req_headers.insert(RANGE, HeaderValue::from_static("bytes=0-0"));

    let resp = client
        .get(url)
        .headers(req_headers)
        .send()
        .await
        .map_err(|e| Error::network(url.to_string(), e))?;

    let status = resp.status();
    let mut info = file_info_from_headers(url, status, resp.headers());

    if status == StatusCode::PARTIAL_CONTENT {
        if let Some(total) = total_from_content_range(resp.headers()) {
            info.total_size = total;
            info.supports_ranges = true;
        }
    } else {
        warn!(%status, "server does not support ranged requests");
        info.supports_ranges = false;
    }

    Ok(info)
}

fn file_info_from_headers(url: &str, status: StatusCode, headers: &HeaderMap) -> FileInfo {
    let total_size = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<i64>().ok())
        .filter(|_| status != StatusCode::PARTIAL_CONTENT) // 206's Content-Length is the range length, not total
        .unwrap_or(-1);

    let supports_ranges = headers
        .get(ACCEPT_RANGES)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.eq_ignore_ascii_case("bytes"))
        .unwrap_or(false);

    let etag = headers.get(ETAG).and_then(|v| v.to_str().ok()).map(str::to_string);
    let last_modified = headers.get(LAST_MODIFIED).and_then(|v| v.to_str().ok()).map(str::to_string);
    let content_type = headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok()).map(str::to_string);
    let suggested_filename = headers
        .get(CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .and_then(filename_from_content_disposition);

    let mut raw_headers = std::collections::HashMap::new();
    for (name, value) in headers {
        if let Ok(v) = value.to_str() {
            raw_headers.insert(name.to_string(), v.to_string());
        }
    }

    FileInfo {
        url: url.to_string(),
        total_size,
        last_modified,
        content_type,
        suggested_filename,
        supports_ranges,
        etag,
        headers: raw_headers,
    }
}

/// Extracts `filename="..."` (or the bare-token form) from a
/// `Content-Disposition` header value (spec §11 filename fallback chain).
fn filename_from_content_disposition(value: &str) -> Option<String> {
    for part in value.split(';') {
        let part = part.trim();
        let rest = part.strip_prefix("filename=").or_else(|| part.strip_prefix("filename*=UTF-8''"));
        if let Some(rest) = rest {
            let name = rest.trim_matches('"');
            if !name.is_empty() {
                return Some(name.to_string());
            }
        }
    }
    None
}

/// Parses `Content-Range: bytes 0-0/<total>` to recover the total size.
fn total_from_content_range(headers: &HeaderMap) -> Option<i64> {
    let value = headers.get(reqwest::header::CONTENT_RANGE)?.to_str().ok()?;
    let total_part = value.rsplit('/').next()?;
    if total_part == "*" {
        return None;
    }
    total_part.parse::<i64>().ok()
}
