// archive.org client: a small blocking HTTP client for the advanced-search
// and metadata endpoints, plus a plain streaming GET used when files are
// staged locally before being pushed to the cabinet.

use crate::error::{Error, Result};
use crate::transfer::Fetcher;
use reqwest::blocking::Client;
use serde::{Deserialize, Deserializer, Serialize};
use std::io::{Read, Write};

/// Arcade ROM collections searched when no collection is given.
pub const ARCADE_COLLECTIONS: &[&str] = &[
    "MAME_0.139_ROMS_(arcade_only)",
    "MAME_0.37b5_ROMs_(MAME_2000)",
    "MAME_2003_Reference_Set_MAME_0.78_ROMs",
    "MAME_0.151_Software_List_ROMs_(CHDs)",
    "FinalBurn_Neo_-_Arcade_Games",
];

/// Extensions `rom_files` keeps.
pub const ROM_EXTENSIONS: &[&str] = &[".zip", ".7z", ".bin", ".iso", ".chd"];

/// One search match.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub identifier: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub downloads: Option<u64>,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub item_size: Option<u64>,
}

/// One file inside an archive item.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ItemFile {
    #[serde(rename = "name")]
    pub filename: String,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub size: Option<u64>,
}

#[derive(Deserialize)]
struct SearchEnvelope {
    response: SearchBody,
}

#[derive(Deserialize)]
struct SearchBody {
    docs: Vec<SearchHit>,
}

#[derive(Deserialize)]
struct MetadataEnvelope {
    files: Option<Vec<ItemFile>>,
}

// archive.org reports sizes as strings in item metadata and as numbers in
// search results.
fn lenient_u64<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Number(n)) => n.as_u64(),
        Some(serde_json::Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

/// Blocking client bound to one archive base URL.
#[derive(Clone)]
pub struct ArchiveClient {
    client: Client,
    base_url: String,
}

impl ArchiveClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("cabinet-loader/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Network(format!("failed to build HTTP client: {}", e)))?;
        Ok(ArchiveClient {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Search arcade collections (or just `collection`) for `query`.
    /// Returns at most `max_results` hits in the order the API ranked them.
    pub fn search(
        &self,
        query: &str,
        collection: Option<&str>,
        max_results: usize,
    ) -> Result<Vec<SearchHit>> {
        let url = format!("{}/advancedsearch.php", self.base_url);
        let q = build_query(query, collection);
        let rows = max_results.to_string();
        tracing::debug!(%q, rows = max_results, "archive search");

        let res = self
            .client
            .get(&url)
            .query(&[
                ("q", q.as_str()),
                ("fl[]", "identifier"),
                ("fl[]", "title"),
                ("fl[]", "downloads"),
                ("fl[]", "item_size"),
                ("rows", rows.as_str()),
                ("output", "json"),
                ("sort[]", "downloads desc"),
            ])
            .send()
            .map_err(|e| Error::Network(format!("search request failed: {}", e)))?;
        let body = checked_body(res)?;
        parse_search(&body, max_results)
    }

    /// List the files of one archive item.
    pub fn browse(&self, identifier: &str) -> Result<Vec<ItemFile>> {
        let url = format!("{}/metadata/{}", self.base_url, urlencoding::encode(identifier));
        tracing::debug!(identifier, "archive metadata");
        let res = self
            .client
            .get(&url)
            .send()
            .map_err(|e| Error::Network(format!("metadata request failed: {}", e)))?;
        let body = checked_body(res)?;
        parse_metadata(&body, identifier)
    }

    /// Direct download URL of `filename` inside item `identifier`.
    pub fn download_url(&self, identifier: &str, filename: &str) -> String {
        let path: Vec<_> = filename
            .split('/')
            .map(|seg| urlencoding::encode(seg).into_owned())
            .collect();
        format!(
            "{}/download/{}/{}",
            self.base_url,
            urlencoding::encode(identifier),
            path.join("/")
        )
    }
}

impl Fetcher for ArchiveClient {
    fn fetch(
        &self,
        url: &str,
        out: &mut dyn Write,
        progress: &mut dyn FnMut(u64, Option<u64>),
    ) -> Result<u64> {
        let mut res = self
            .client
            .get(url)
            .send()
            .map_err(|e| Error::Network(format!("download of {} failed: {}", url, e)))?;
        if !res.status().is_success() {
            return Err(Error::Response(format!("{} returned {}", url, res.status())));
        }
        let total = res.content_length();
        let mut buf = vec![0u8; 64 * 1024];
        let mut written = 0u64;
        progress(0, total);
        loop {
            let n = res
                .read(&mut buf)
                .map_err(|e| Error::Transfer(format!("download of {} interrupted: {}", url, e)))?;
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n])
                .map_err(|e| Error::Transfer(format!("cannot write local file: {}", e)))?;
            written += n as u64;
            progress(written, total);
        }
        out.flush()
            .map_err(|e| Error::Transfer(format!("cannot write local file: {}", e)))?;
        Ok(written)
    }
}

fn checked_body(res: reqwest::blocking::Response) -> Result<String> {
    let status = res.status();
    if !status.is_success() {
        let txt = res.text().unwrap_or_default();
        return Err(Error::Response(format!("{} - {}", status, txt.trim())));
    }
    res.text()
        .map_err(|e| Error::Network(format!("failed to read response body: {}", e)))
}

/// `(<query>) AND collection:(<c1> OR <c2> ...)`.
pub fn build_query(query: &str, collection: Option<&str>) -> String {
    let collections = match collection {
        Some(c) => c.to_string(),
        None => ARCADE_COLLECTIONS.join(" OR "),
    };
    format!("({}) AND collection:({})", query.trim(), collections)
}

fn parse_search(body: &str, max_results: usize) -> Result<Vec<SearchHit>> {
    let envelope: SearchEnvelope = serde_json::from_str(body)
        .map_err(|e| Error::Response(format!("malformed search response: {}", e)))?;
    let mut docs = envelope.response.docs;
    docs.truncate(max_results);
    Ok(docs)
}

fn parse_metadata(body: &str, identifier: &str) -> Result<Vec<ItemFile>> {
    let envelope: MetadataEnvelope = serde_json::from_str(body)
        .map_err(|e| Error::Response(format!("malformed metadata response: {}", e)))?;
    envelope
        .files
        .ok_or_else(|| Error::Response(format!("no file listing for item '{}'", identifier)))
}

/// Keep only files that look like ROM images or archives.
pub fn rom_files(files: &[ItemFile]) -> Vec<ItemFile> {
    files
        .iter()
        .filter(|f| {
            let name = f.filename.to_ascii_lowercase();
            ROM_EXTENSIONS.iter().any(|ext| name.ends_with(ext))
        })
        .cloned()
        .collect()
}
