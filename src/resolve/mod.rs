//! Turns a raw data API body into the final payload.
//!
//! Two steps:
//!
//! 1. Indirection: a `{"link": ...}` body (or, failing that, a
//!    `{"data_url": ...}` body) is replaced by the document it points to.
//!    The target is object storage, so it is fetched without credentials.
//! 2. Chunks: every object carrying a `chunk_info` block gets the
//!    concatenation of its chunk files injected under [`CHUNK_DATA_KEY`].
//!
//! Objects are walked recursively; arrays are not.

use crate::transport::{Auth, Transport};
use crate::Error;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;


/// Key under which merged chunk rows are injected.
pub const CHUNK_DATA_KEY: &str = "_chunk_data";

const CHUNK_INFO_KEY: &str = "chunk_info";

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("chunked response is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),

    #[error("malformed chunk_info at '{path}': {source}")]
    MalformedChunkInfo {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid url '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("chunk {url} is not a JSON array: {source}")]
    MalformedChunk {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Deserialize)]
struct LinkBody {
    #[serde(default)]
    link: Option<String>,
}

#[derive(Deserialize)]
struct DataUrlBody {
    #[serde(default)]
    data_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkInfo {
    base_download_url: String,
    #[serde(default)]
    chunk_file_names: Vec<String>,
}

/// A `chunk_info` block found while walking the tree.
struct ChunkSite {
    /// Object keys from the root to the object holding `chunk_info`
    path: Vec<String>,
    info: Option<ChunkInfo>,
}

pub struct Resolver {
    transport: Arc<Transport>,
}

impl Resolver {
    pub fn new(transport: Arc<Transport>) -> Self {
        Self { transport }
    }

    pub async fn resolve(&self, body: Vec<u8>) -> Result<Vec<u8>, Error> {
        let body = self.follow_indirection(body).await?;
        self.resolve_chunks(body).await
    }

    async fn follow_indirection(&self, body: Vec<u8>) -> Result<Vec<u8>, Error> {
        let link = serde_json::from_slice::<LinkBody>(&body)
            .ok()
            .and_then(|b| b.link)
            .filter(|l| !l.is_empty());
        if let Some(link) = link {
            debug!(link = %link, "Following link");
            return self.fetch(&link).await;
        }

        let data_url = serde_json::from_slice::<DataUrlBody>(&body)
            .ok()
            .and_then(|b| b.data_url)
            .filter(|u| !u.is_empty());
        if let Some(data_url) = data_url {
            debug!(data_url = %data_url, "Following data_url");
            return self.fetch(&data_url).await;
        }

        Ok(body)
    }

    /// Anonymous GET that must succeed with a 2xx.
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, Error> {
        let parsed = Url::parse(url).map_err(|source| ResolveError::InvalidUrl {
            url: url.to_string(),
            source,
        })?;

        let response = self.transport.execute(&parsed, Auth::Anonymous).await?;
        if !response.status.is_success() {
            return Err(Error::UnexpectedStatus {
                url: url.to_string(),
                status: response.status,
                body: response.body,
            });
        }

        Ok(response.body)
    }

    async fn resolve_chunks(&self, body: Vec<u8>) -> Result<Vec<u8>, Error> {
        if !contains(&body, CHUNK_INFO_KEY.as_bytes()) {
            return Ok(body);
        }

        let mut root: Value = serde_json::from_slice(&body).map_err(ResolveError::InvalidJson)?;
        let Value::Object(object) = &root else {
            return Ok(body);
        };

        let mut sites = Vec::new();
        collect_sites(object, &mut Vec::new(), &mut sites)?;
        if sites.is_empty() {
            return Ok(body);
        }

        for site in sites {
            let rows = match &site.info {
                Some(info) => self.fetch_chunks(info).await?,
                None => Vec::new(),
            };

            if let Some(target) = object_at_mut(&mut root, &site.path) {
                target.insert(CHUNK_DATA_KEY.to_string(), Value::Array(rows));
            }
        }

        Ok(serde_json::to_vec(&root).map_err(ResolveError::InvalidJson)?)
    }

    /// Fetches each chunk in list order and concatenates their rows.
    async fn fetch_chunks(&self, info: &ChunkInfo) -> Result<Vec<Value>, Error> {
        info!(
            base = %info.base_download_url,
            chunks = info.chunk_file_names.len(),
            "Fetching chunked data"
        );

        let mut rows = Vec::new();
        for name in &info.chunk_file_names {
            let url = format!("{}{}", info.base_download_url, name);
            let body = self.fetch(&url).await?;
            let chunk: Vec<Value> = serde_json::from_slice(&body)
                .map_err(|source| ResolveError::MalformedChunk { url, source })?;
            rows.extend(chunk);
        }

        Ok(rows)
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Depth-first walk over nested objects collecting `chunk_info` blocks.
///
/// The contents of a `chunk_info` value are not walked, nor are arrays.
fn collect_sites(
    object: &Map<String, Value>,
    path: &mut Vec<String>,
    sites: &mut Vec<ChunkSite>,
) -> Result<(), ResolveError> {
    for (key, value) in object {
        if key == CHUNK_INFO_KEY {
            let info = Option::<ChunkInfo>::deserialize(value).map_err(|source| {
                ResolveError::MalformedChunkInfo {
                    path: display_path(path),
                    source,
                }
            })?;
            sites.push(ChunkSite {
                path: path.clone(),
                info,
            });
        } else if let Value::Object(child) = value {
            path.push(key.clone());
            collect_sites(child, path, sites)?;
            path.pop();
        }
    }
    Ok(())
}

fn object_at_mut<'a>(root: &'a mut Value, path: &[String]) -> Option<&'a mut Map<String, Value>> {
    let mut current = root;
    for key in path {
        current = current.as_object_mut()?.get_mut(key)?;
    }
    current.as_object_mut()
}

fn display_path(path: &[String]) -> String {
    if path.is_empty() {
        "$".to_string()
    } else {
        format!("$.{}", path.join("."))
    }
}
