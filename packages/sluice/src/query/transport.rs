//! Outbound HTTP for query endpoints.
//!
//! The engine only needs one call, [`Transport::request`], and a response
//! exposing status, headers, and a text or JSON body. [`ReqwestTransport`] is the
//! default; tests substitute a scripted transport.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::cache::canonicalize;
use crate::error::{Result, SluiceError};

/// HTTP method of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Method> for reqwest::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        }
    }
}

/// What an endpoint's `query` function produces for one call.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryRequest {
    pub url: String,
    pub method: Method,
    pub body: Option<Value>,
    pub headers: BTreeMap<String, String>,
}

impl QueryRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method,
            ..Default::default()
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::Post, url)
    }

    pub fn put(url: impl Into<String>) -> Self {
        Self::new(Method::Put, url)
    }

    pub fn patch(url: impl Into<String>) -> Self {
        Self::new(Method::Patch, url)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(Method::Delete, url)
    }

    /// For GET requests an object body becomes the query string.
    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Status and headers of a response, detached from its body.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResponseMeta {
    pub status: u16,
    /// Header names are stored lowercased.
    pub headers: BTreeMap<String, String>,
}

impl ResponseMeta {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_json(&self) -> bool {
        self.header("content-type")
            .map(|ct| ct.contains("application/json"))
            .unwrap_or(false)
    }
}

/// A fully received response.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    meta: ResponseMeta,
    body: String,
}

impl Response {
    pub fn new(meta: ResponseMeta, body: impl Into<String>) -> Self {
        Self {
            meta,
            body: body.into(),
        }
    }

    /// A response carrying `body` as JSON.
    pub fn json_body(status: u16, body: &Value) -> Self {
        Self::new(
            ResponseMeta::new(status).with_header("content-type", "application/json"),
            body.to_string(),
        )
    }

    pub fn ok(&self) -> bool {
        self.meta.ok()
    }

    pub fn status(&self) -> u16 {
        self.meta.status
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.meta.header(name)
    }

    pub fn meta(&self) -> &ResponseMeta {
        &self.meta
    }

    pub fn text(&self) -> &str {
        &self.body
    }

    pub fn json(&self) -> anyhow::Result<Value> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

/// A non-2xx or non-JSON response.
///
/// `data` is the parsed JSON body, or the raw text when the body was not JSON.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryError {
    pub data: Value,
    pub response: ResponseMeta,
}

impl QueryError {
    pub fn new(data: Value, response: ResponseMeta) -> Self {
        Self { data, response }
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "an error occurred while fetching the data (status {})",
            self.response.status
        )
    }
}

impl std::error::Error for QueryError {}

/// Sends one HTTP request.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn request(
        &self,
        method: Method,
        url: &str,
        body: Option<Value>,
        headers: &BTreeMap<String, String>,
    ) -> Result<Response>;
}

/// Default transport over `reqwest`.
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn request(
        &self,
        method: Method,
        url: &str,
        body: Option<Value>,
        headers: &BTreeMap<String, String>,
    ) -> Result<Response> {
        let mut request = self.client.request(method.into(), url);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(SluiceError::transport)?;

        let mut meta = ResponseMeta::new(response.status().as_u16());
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                meta = meta.with_header(name.as_str(), value);
            }
        }
        let text = response.text().await.map_err(SluiceError::transport)?;

        Ok(Response::new(meta, text))
    }
}

/// Base URL, default headers and a transport, shared by every endpoint of an api.
#[derive(Clone)]
pub struct BaseQuery {
    base_url: String,
    headers: BTreeMap<String, String>,
    transport: Arc<dyn Transport>,
}

impl BaseQuery {
    /// Base query over the default `reqwest` transport.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_transport(base_url, Arc::new(ReqwestTransport::new()))
    }

    pub fn with_transport(base_url: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            base_url: base_url.into(),
            headers: BTreeMap::new(),
            transport,
        }
    }

    /// Default header sent with every request; request headers win on conflict.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn execute(&self, query: &QueryRequest) -> Result<Response> {
        let mut url = format!("{}{}", self.base_url, query.url);
        let mut headers = self.headers.clone();
        headers.extend(query.headers.clone());

        let body = match query.method {
            Method::Get => {
                if let Some(params) = query.body.as_ref().and_then(encode_query) {
                    url.push(if url.contains('?') { '&' } else { '?' });
                    url.push_str(&params);
                }
                None
            }
            _ => {
                headers.insert("Content-Type".to_string(), "application/json".to_string());
                query.body.clone()
            }
        };

        debug!(method = %query.method, url = %url, "query request");
        self.transport.request(query.method, &url, body, &headers).await
    }
}

impl fmt::Debug for BaseQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BaseQuery")
            .field("base_url", &self.base_url)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Encode an object body as `k=v&...`, or `None` when there is nothing to encode.
fn encode_query(body: &Value) -> Option<String> {
    let params = body.as_object().filter(|map| !map.is_empty())?;
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in params {
        serializer.append_pair(key, &canonicalize(value));
    }
    Some(serializer.finish())
}
