//! HTTP transport against the catalog service.
//!
//! Three response-handling styles: buffered (xml/json), buffered with HAL
//! envelope unwrapping, and a streamed byte pipe into a file. Failures are
//! never retried and surface exactly once through the returned `Result`.

use std::path::Path;

use futures::StreamExt;
use log::debug;
use serde_json::Value;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use url::Url;

use crate::auth::Credentials;
use crate::error::DumpError;
use crate::query::{Format, Query, TokenRef};

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub server: String,
    pub version: String,
    pub client_id: String,
    pub secret: String,
}

/// Buffered fetch result, by query format.
#[derive(Debug)]
pub enum Payload {
    Xml(String),
    Json(Value),
    /// The embedded item collection plus the envelope (minus items) as
    /// metadata: total count, page count, links.
    Hal { items: Vec<Value>, meta: Value },
}

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_uri: String,
    credentials: Credentials,
}

impl ApiClient {
    pub fn new(config: &ServiceConfig) -> Result<Self, DumpError> {
        let root = if config.server.contains("://") {
            config.server.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", config.server)
        };
        let base_uri = format!("{root}/api/{}/", config.version);

        let mut auth_uri = Url::parse(&format!("{root}/oauth/v2/token"))?;
        auth_uri
            .query_pairs_mut()
            .append_pair("grant_type", "client_credentials")
            .append_pair("client_id", &config.client_id)
            .append_pair("client_secret", &config.secret);

        let http = reqwest::Client::new();
        let credentials = Credentials::new(http.clone(), auth_uri.into());
        Ok(Self {
            http,
            base_uri,
            credentials,
        })
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Wire URI for a query, using the live token.
    pub fn resolve(&self, query: &Query) -> Result<String, DumpError> {
        let token = self.credentials.token()?;
        query.uri(&self.base_uri, TokenRef::Bearer(&token))
    }

    /// Loggable URI for a query; no token needed or leaked.
    pub fn masked(&self, query: &Query) -> Result<String, DumpError> {
        query.uri(&self.base_uri, TokenRef::Masked)
    }

    async fn get_ok(&self, uri: &str) -> Result<reqwest::Response, DumpError> {
        debug!("GET {}", scrub(uri));
        let response = self.http.get(uri).send().await?;
        if !response.status().is_success() {
            return Err(DumpError::Transport {
                status: response.status().as_u16(),
                url: scrub(uri),
            });
        }
        Ok(response)
    }

    async fn get_text(&self, uri: &str) -> Result<String, DumpError> {
        Ok(self.get_ok(uri).await?.text().await?)
    }

    /// Buffered fetch, dispatched on the query's format.
    pub async fn fetch(&self, query: &Query) -> Result<Payload, DumpError> {
        let uri = self.resolve(query)?;
        let body = self.get_text(&uri).await?;
        match query.format() {
            Format::Xml => Ok(Payload::Xml(body)),
            Format::Json => Ok(Payload::Json(serde_json::from_str(&body)?)),
            Format::JsonHal => {
                let mut envelope: Value = serde_json::from_str(&body)?;
                let items = envelope
                    .get_mut("_embedded")
                    .and_then(|embedded| embedded.get_mut("items"))
                    .map(Value::take);
                let Some(Value::Array(items)) = items else {
                    return Err(DumpError::Malformed(
                        "json+hal response without _embedded.items".to_string(),
                    ));
                };
                if let Some(embedded) = envelope.get_mut("_embedded").and_then(Value::as_object_mut)
                {
                    embedded.remove("items");
                }
                Ok(Payload::Hal {
                    items,
                    meta: envelope,
                })
            }
        }
    }

    /// Pipe the response body into `path` without buffering.
    ///
    /// Returns the number of bytes written. Request failures, non-200
    /// statuses, and write failures all travel through the one returned
    /// `Result`; a partially written file is left for the caller to remove.
    pub async fn stream_to_file(&self, uri: &str, path: &Path) -> Result<u64, DumpError> {
        let response = self.get_ok(uri).await?;
        let mut file = File::create(path).await?;
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(written)
    }
}

/// Replace any access token in a URI with `***` so it can be logged.
pub fn scrub(uri: &str) -> String {
    let Ok(mut url) = Url::parse(uri) else {
        return uri.to_string();
    };
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if !pairs.iter().any(|(k, _)| k == "access_token") {
        return url.into();
    }
    {
        let mut serializer = url.query_pairs_mut();
        serializer.clear();
        for (key, value) in &pairs {
            if key == "access_token" {
                serializer.append_pair(key, "***");
            } else {
                serializer.append_pair(key, value);
            }
        }
    }
    url.into()
}
