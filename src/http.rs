//! Auxiliary HTTP interface (CC2 and proxy helpers).
//!
//! `GET /system/info` enriches attributes, `PUT /upload` ships printable
//! files in ranged chunks with an end-to-end MD5, and `fetch_bytes` pulls
//! thumbnails.

use std::net::IpAddr;
use std::time::Duration;

use md5::{Digest, Md5};
use serde_json::Value;

use crate::error::{ElegooError, Result};

const AUX_PORT: u16 = 8080;
const UPLOAD_CHUNK: usize = 1024 * 1024;

pub struct AuxHttp {
    base: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl AuxHttp {
    pub fn new(ip: IpAddr, token: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            base: format!("http://{ip}:{AUX_PORT}"),
            token,
            client,
        }
    }

    fn token(&self) -> &str {
        self.token.as_deref().unwrap_or("")
    }

    /// `GET /system/info?X-Token=<code>`.
    pub async fn system_info(&self) -> Result<Value> {
        let url = format!("{}/system/info?X-Token={}", self.base, self.token());
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ElegooError::Http(format!("system info: {e}")))?;
        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(ElegooError::UnauthorizedAccess);
        }
        resp.json::<Value>()
            .await
            .map_err(|e| ElegooError::Http(format!("system info body: {e}")))
    }

    /// Upload a printable file in ranged chunks.
    ///
    /// Every chunk carries the whole file's MD5; the printer verifies after
    /// the last range and answers 9004 on mismatch, which maps to
    /// `ChecksumMismatch` so the caller can restart the upload.
    pub async fn upload(&self, file_name: &str, bytes: &[u8]) -> Result<()> {
        let mut hasher = Md5::new();
        hasher.update(bytes);
        let md5_hex = format!("{:x}", hasher.finalize());

        let total = bytes.len();
        let url = format!("{}/upload", self.base);
        let mut offset = 0;
        while offset < total {
            let end = (offset + UPLOAD_CHUNK).min(total);
            let chunk = bytes[offset..end].to_vec();
            let resp = self
                .client
                .put(&url)
                .header("Content-Range", format!("bytes {}-{}/{}", offset, end - 1, total))
                .header("X-File-Name", file_name)
                .header("X-File-MD5", &md5_hex)
                .header("X-Token", self.token())
                .body(chunk)
                .send()
                .await
                .map_err(|e| ElegooError::Http(format!("upload: {e}")))?;

            match resp.status() {
                reqwest::StatusCode::UNAUTHORIZED => return Err(ElegooError::UnauthorizedAccess),
                status if !status.is_success() => {
                    let body = resp.text().await.unwrap_or_default();
                    if let Some(err) = printer_error_in(&body) {
                        return Err(err);
                    }
                    return Err(ElegooError::Http(format!("upload failed: {status}")));
                }
                _ => {}
            }
            offset = end;
        }
        tracing::info!("uploaded {file_name} ({total} bytes)");
        Ok(())
    }

    /// Fetch a URL to bytes (thumbnails, camera stills).
    pub async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ElegooError::Http(format!("fetch {url}: {e}")))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ElegooError::FileNotFound(url.to_string()));
        }
        if !resp.status().is_success() {
            return Err(ElegooError::Http(format!("fetch {url}: {}", resp.status())));
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| ElegooError::Http(format!("fetch body: {e}")))?;
        Ok(bytes.to_vec())
    }
}

/// Map an error body like `{"error_code": 9004}` to a typed error.
fn printer_error_in(body: &str) -> Option<ElegooError> {
    let value: Value = serde_json::from_str(body).ok()?;
    let code = value.get("error_code").and_then(Value::as_i64)?;
    if code == 0 {
        return None;
    }
    Some(ElegooError::from_printer_code(code, "upload"))
}
