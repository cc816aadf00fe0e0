// src/upload.rs

use crate::cache::JsonCache;
use crate::config::DriveConfig;
use crate::error::BoxError;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use time::Date;
use time::macros::format_description;
use tracing::{debug, info, instrument, warn};
use yup_oauth2::{InstalledFlowAuthenticator, InstalledFlowReturnMethod};

const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive";
const DRIVE_FILES: &str = "https://www.googleapis.com/drive/v3/files";
const DRIVE_UPLOAD: &str = "https://www.googleapis.com/upload/drive/v3/files";
const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
const TINYURL_CREATE: &str = "https://api.tinyurl.com/create";
const BOUNDARY: &str = "notice_map_part_boundary";

/// Publish a notice directory and return a shareable link to it.
#[async_trait]
pub trait Upload: Send + Sync {
    async fn upload(&self, dir: &Path, primary_file: &str, address: &str) -> Result<String, BoxError>;
}

/// Used when Drive publishing is switched off.
pub struct NoUpload;

#[async_trait]
impl Upload for NoUpload {
    async fn upload(&self, _dir: &Path, _primary_file: &str, _address: &str) -> Result<String, BoxError> {
        Ok(String::new())
    }
}

/// `"{suburb} - {title} ({ddMonyy})"`, or `"{title} ({ddMonyy})"` without a suburb.
///
/// Title and suburb are the first two comma segments of the address; the
/// title falls back to the file name when there is no address.
pub fn folder_name(address: &str, primary_file: &str, date: Date) -> String {
    let parts: Vec<&str> = if address.trim().is_empty() {
        Vec::new()
    } else {
        address.split(',').map(str::trim).collect()
    };
    let title = parts.first().copied().unwrap_or(primary_file);
    let stamp = date
        .format(format_description!("([day][month repr:short][year repr:last_two])"))
        .unwrap_or_default();

    match parts.get(1).filter(|s| !s.is_empty()) {
        Some(suburb) => format!("{suburb} - {title} {stamp}"),
        None => format!("{title} {stamp}"),
    }
}

/// Quote a value for a Drive `q` expression.
fn query_literal(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

fn multipart_body(metadata: &serde_json::Value, mime: &str, content: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(content.len() + 512);
    body.extend_from_slice(
        format!("--{BOUNDARY}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{metadata}\r\n").as_bytes(),
    );
    body.extend_from_slice(format!("--{BOUNDARY}\r\nContent-Type: {mime}\r\n\r\n").as_bytes());
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    body
}

fn mime_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase).as_deref() {
        Some("pdf") => "application/pdf",
        Some("txt") => "text/plain",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        _ => "application/octet-stream",
    }
}

#[derive(Debug, Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
}

#[derive(Debug, Deserialize)]
struct DriveFile {
    id: String,
}

#[derive(Debug, Deserialize)]
struct TinyUrlResponse {
    data: TinyUrlData,
}

#[derive(Debug, Deserialize)]
struct TinyUrlData {
    tiny_url: String,
}

/// Google Drive v3 over REST, authorized once per run.
pub struct DriveUploader {
    client: Client,
    access_token: String,
    parent_folder_id: Option<String>,
    short_links: JsonCache,
    shortener_token: Option<String>,
}

impl DriveUploader {
    /// Run the installed-app OAuth flow (browser on first use, cached token after).
    pub async fn connect(cfg: &DriveConfig, short_links: JsonCache) -> Result<Self, BoxError> {
        let secret = yup_oauth2::read_application_secret(&cfg.credentials)
            .await
            .map_err(|e| format!("cannot read OAuth client secret {}: {e}", cfg.credentials))?;

        let auth = InstalledFlowAuthenticator::builder(secret, InstalledFlowReturnMethod::HTTPRedirect)
            .persist_tokens_to_disk(PathBuf::from(&cfg.token_cache))
            .build()
            .await?;
        let token = auth.token(&[DRIVE_SCOPE]).await?;
        let access_token = token
            .token()
            .ok_or("OAuth flow returned no access token")?
            .to_string();
        info!(token_cache = %cfg.token_cache, "Authorized Google Drive");

        let shortener_token = std::env::var(&cfg.shortener_token_env).ok();
        if shortener_token.is_none() {
            warn!(var = %cfg.shortener_token_env, "No TinyURL token, folder links stay long");
        }

        Ok(Self {
            client: Client::new(),
            access_token,
            parent_folder_id: cfg.parent_folder_id.clone(),
            short_links,
            shortener_token,
        })
    }

    async fn find(&self, query: &str) -> Result<Option<String>, BoxError> {
        let url = format!(
            "{DRIVE_FILES}?q={}&fields={}",
            urlencoding::encode(query),
            urlencoding::encode("files(id, name)")
        );
        let list: FileList = self
            .client
            .get(&url)
            .bearer_auth(&self.access_token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(list.files.into_iter().next().map(|f| f.id))
    }

    async fn find_or_create_folder(&self, name: &str) -> Result<String, BoxError> {
        let mut query = format!(
            "name = {} and mimeType = '{FOLDER_MIME}' and trashed = false",
            query_literal(name)
        );
        if let Some(parent) = &self.parent_folder_id {
            query.push_str(&format!(" and {} in parents", query_literal(parent)));
        }
        if let Some(id) = self.find(&query).await? {
            debug!(folder = %name, id = %id, "Reusing Drive folder");
            return Ok(id);
        }

        let mut metadata = json!({ "name": name, "mimeType": FOLDER_MIME });
        if let Some(parent) = &self.parent_folder_id {
            metadata["parents"] = json!([parent]);
        }
        let created: DriveFile = self
            .client
            .post(format!("{DRIVE_FILES}?fields=id"))
            .bearer_auth(&self.access_token)
            .json(&metadata)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        info!(folder = %name, id = %created.id, "Created Drive folder");
        Ok(created.id)
    }

    /// Upload one file unless a file with the same name is already in the folder.
    async fn upload_file(&self, path: &Path, folder_id: &str) -> Result<String, BoxError> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or("file name is not valid UTF-8")?;

        let query = format!(
            "name = {} and {} in parents and trashed = false",
            query_literal(name),
            query_literal(folder_id)
        );
        if let Some(id) = self.find(&query).await? {
            return Ok(id);
        }

        let content = tokio::fs::read(path).await?;
        let metadata = json!({ "name": name, "parents": [folder_id] });
        let created: DriveFile = self
            .client
            .post(format!("{DRIVE_UPLOAD}?uploadType=multipart&fields=id"))
            .bearer_auth(&self.access_token)
            .header("Content-Type", format!("multipart/related; boundary={BOUNDARY}"))
            .body(multipart_body(&metadata, mime_for(path), &content))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(created.id)
    }

    async fn share_publicly(&self, folder_id: &str) -> Result<String, BoxError> {
        self.client
            .post(format!("{DRIVE_FILES}/{folder_id}/permissions?fields=id"))
            .bearer_auth(&self.access_token)
            .json(&json!({ "type": "anyone", "role": "reader" }))
            .send()
            .await?
            .error_for_status()?;
        Ok(format!("https://drive.google.com/drive/folders/{folder_id}"))
    }

    /// Short link for `link`, memoized since the free TinyURL tier is metered.
    async fn shorten(&self, link: &str) -> Result<String, BoxError> {
        if let Some(short) = self.short_links.get(link) {
            return Ok(short);
        }
        let Some(token) = &self.shortener_token else {
            return Ok(link.to_string());
        };

        let response: TinyUrlResponse = self
            .client
            .post(TINYURL_CREATE)
            .bearer_auth(token)
            .json(&json!({ "url": link, "domain": "tinyurl.com" }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let short = response.data.tiny_url;
        self.short_links.insert(link, &short)?;
        Ok(short)
    }
}

#[async_trait]
impl Upload for DriveUploader {
    #[instrument(skip_all, fields(dir = %dir.display(), file = %primary_file))]
    async fn upload(&self, dir: &Path, primary_file: &str, address: &str) -> Result<String, BoxError> {
        let name = folder_name(address, primary_file, time::OffsetDateTime::now_utc().date());
        let folder_id = self.find_or_create_folder(&name).await?;

        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                files.push(entry.path());
            }
        }
        files.sort();

        for path in &files {
            if let Err(e) = self.upload_file(path, &folder_id).await {
                warn!(file = %path.display(), error = %e, "Upload failed, skipping file");
            }
        }
        info!(folder = %name, files = files.len(), "Uploaded notice directory");

        let link = self.share_publicly(&folder_id).await?;
        self.shorten(&link).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    #[test]
    fn test_folder_name_with_suburb() {
        assert_eq!(
            folder_name("12 Main Road, Rondebosch, Cape Town", "notice.pdf", date!(2025 - 06 - 03)),
            "Rondebosch - 12 Main Road (03Jun25)"
        );
    }

    #[test]
    fn test_folder_name_without_address() {
        assert_eq!(
            folder_name("", "notice_erf_12.pdf", date!(2024 - 12 - 25)),
            "notice_erf_12.pdf (25Dec24)"
        );
        assert_eq!(
            folder_name("12 Main Road", "notice.pdf", date!(2024 - 12 - 25)),
            "12 Main Road (25Dec24)"
        );
    }

    #[test]
    fn test_query_literal_escapes_quotes() {
        assert_eq!(query_literal("St John's Road"), r"'St John\'s Road'");
    }

    #[test]
    fn test_multipart_layout() {
        let body = multipart_body(&json!({ "name": "a.pdf" }), "application/pdf", b"%PDF");
        let text = String::from_utf8(body).unwrap();
        assert!(text.starts_with(&format!("--{BOUNDARY}\r\nContent-Type: application/json")));
        assert!(text.contains("{\"name\":\"a.pdf\"}"));
        assert!(text.contains("Content-Type: application/pdf\r\n\r\n%PDF\r\n"));
        assert!(text.ends_with(&format!("--{BOUNDARY}--\r\n")));
    }

    #[test]
    fn test_mime_for() {
        assert_eq!(mime_for(Path::new("Notice.PDF")), "application/pdf");
        assert_eq!(mime_for(Path::new("plan.dwg")), "application/octet-stream");
    }

    #[tokio::test]
    async fn test_no_upload() {
        let link = NoUpload.upload(Path::new("."), "notice.pdf", "1 Long Street").await.unwrap();
        assert_eq!(link, "");
    }
}
