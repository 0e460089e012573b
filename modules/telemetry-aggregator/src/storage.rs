//! Blob sources scanned by the aggregator.

use async_trait::async_trait;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[async_trait]
pub trait BlobSource: Send + Sync {
    /// Human-readable location, for logs and status.
    fn describe(&self) -> String;

    async fn list_blobs(&self) -> Result<Vec<String>, String>;

    async fn read_blob(&self, name: &str) -> Result<Vec<u8>, String>;
}

// =====================================================
// Azure Blob Container (SAS URL)
// =====================================================

pub struct ContainerClient {
    client: reqwest::Client,
    /// Container URL without query string
    container_url: String,
    /// SAS query string without the leading `?`
    sas: String,
    name_re: Regex,
    marker_re: Regex,
}

impl ContainerClient {
    /// Build from a container URL carrying a SAS query, e.g.
    /// `https://acct.blob.core.windows.net/telemetry?sv=...&sig=...`.
    pub fn from_sas_url(url: &str) -> Result<Self, String> {
        let (base, sas) = url
            .split_once('?')
            .ok_or_else(|| "Container URL has no SAS query".to_string())?;
        if base.is_empty() || sas.is_empty() {
            return Err("Container URL or SAS query is empty".to_string());
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| format!("Failed to build HTTP client: {}", e))?;

        Ok(Self {
            client,
            container_url: base.trim_end_matches('/').to_string(),
            sas: sas.to_string(),
            name_re: Regex::new(r"<Blob>\s*<Name>([^<]*)</Name>").map_err(|e| e.to_string())?,
            marker_re: Regex::new(r"<NextMarker>([^<]+)</NextMarker>").map_err(|e| e.to_string())?,
        })
    }

    fn parse_page(&self, xml: &str) -> (Vec<String>, Option<String>) {
        let names = self
            .name_re
            .captures_iter(xml)
            .map(|c| unescape_xml(&c[1]))
            .collect();
        let marker = self.marker_re.captures(xml).map(|c| unescape_xml(&c[1]));
        (names, marker)
    }

    async fn get_text(&self, url: &str) -> Result<String, String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| format!("Storage request failed: {}", e))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| format!("Failed to read response: {}", e))?;
        if !status.is_success() {
            return Err(format!("Storage error ({}): {}", status, truncate_error(&body)));
        }
        Ok(body)
    }
}

#[async_trait]
impl BlobSource for ContainerClient {
    fn describe(&self) -> String {
        self.container_url.clone()
    }

    async fn list_blobs(&self) -> Result<Vec<String>, String> {
        let mut names = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let mut url = format!(
                "{}?restype=container&comp=list&{}",
                self.container_url, self.sas
            );
            if let Some(m) = &marker {
                url.push_str("&marker=");
                url.push_str(&urlencoding::encode(m));
            }

            let xml = self.get_text(&url).await?;
            let (page, next) = self.parse_page(&xml);
            names.extend(page);

            match next {
                Some(m) => marker = Some(m),
                None => break,
            }
        }

        Ok(names)
    }

    async fn read_blob(&self, name: &str) -> Result<Vec<u8>, String> {
        let url = format!("{}/{}?{}", self.container_url, encode_blob_path(name), self.sas);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| format!("Storage request failed: {}", e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("Storage error ({}) reading {}", status, name));
        }
        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| format!("Failed to read {}: {}", name, e))
    }
}

fn unescape_xml(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Percent-encode each segment of a blob name, keeping `/` as the separator.
fn encode_blob_path(name: &str) -> String {
    name.split('/')
        .map(urlencoding::encode)
        .collect::<Vec<_>>()
        .join("/")
}

fn truncate_error(s: &str) -> &str {
    if s.len() > 200 && s.is_char_boundary(200) {
        &s[..200]
    } else {
        s
    }
}

// =====================================================
// Local Directory Mirror
// =====================================================

/// A directory laid out like a container; blob names are `/`-separated
/// paths relative to the root.
pub struct LocalDirSource {
    root: PathBuf,
}

impl LocalDirSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn blob_name(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect();
        Some(parts.join("/"))
    }
}

#[async_trait]
impl BlobSource for LocalDirSource {
    fn describe(&self) -> String {
        self.root.display().to_string()
    }

    async fn list_blobs(&self) -> Result<Vec<String>, String> {
        if !self.root.is_dir() {
            return Err(format!("{} is not a directory", self.root.display()));
        }
        let mut names: Vec<String> = walkdir::WalkDir::new(&self.root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| self.blob_name(e.path()))
            .collect();
        names.sort();
        Ok(names)
    }

    async fn read_blob(&self, name: &str) -> Result<Vec<u8>, String> {
        if name.split('/').any(|part| part == "..") {
            return Err(format!("Invalid blob name: {}", name));
        }
        let path = self.root.join(name);
        tokio::fs::read(&path)
            .await
            .map_err(|e| format!("Failed to read {}: {}", path.display(), e))
    }
}
