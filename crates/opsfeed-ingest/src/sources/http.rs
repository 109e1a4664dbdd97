//! JSON-over-HTTP sources for the contact-center gateway
//!
//! List endpoints answer `{ "<items>": [...], "NextToken": "..." }` and take
//! the cursor back as the `NextToken` query parameter. Detail endpoints answer
//! `{ "<detail>": {...} }` or 404.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::framework::{DetailSource, Page, PageSource, RawRecord, SourceError};

/// Map a non-success HTTP status onto the source error taxonomy
pub fn classify_status(status: StatusCode, body: &str) -> SourceError {
    let message = format!("HTTP {}: {}", status.as_u16(), body.chars().take(200).collect::<String>());
    if status == StatusCode::TOO_MANY_REQUESTS {
        SourceError::RateLimited(message)
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        SourceError::Transient(message)
    } else {
        SourceError::Permanent(message)
    }
}

fn classify_transport(err: reqwest::Error) -> SourceError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        SourceError::Transient(err.to_string())
    } else {
        SourceError::Permanent(err.to_string())
    }
}

/// Authenticated client shared by the gateway sources
#[derive(Clone)]
pub struct GatewayClient {
    http: Client,
    base_url: String,
    token: Option<String>,
}

impl GatewayClient {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("opsfeed-ingest/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub fn get(&self, path: &str) -> RequestBuilder {
        self.authorize(self.http.get(self.url(path)))
    }

    pub fn post(&self, path: &str) -> RequestBuilder {
        self.authorize(self.http.post(self.url(path)))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Send and decode a JSON body; `None` on 404
    pub async fn send_json(&self, request: RequestBuilder) -> Result<Option<Value>, SourceError> {
        let response = request.send().await.map_err(classify_transport)?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }
        let value = response
            .json::<Value>()
            .await
            .map_err(|e| SourceError::Permanent(format!("malformed JSON response: {e}")))?;
        Ok(Some(value))
    }
}

/// Query of one list endpoint; a body turns the call into a POST
#[derive(Debug, Clone, Default)]
pub struct ListRequest {
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl ListRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// Paginated list endpoint
pub struct HttpPageSource {
    client: GatewayClient,
    path: String,
    items_field: String,
    page_size: u32,
}

impl HttpPageSource {
    pub fn new(client: GatewayClient, path: impl Into<String>, items_field: impl Into<String>, page_size: u32) -> Self {
        Self {
            client,
            path: path.into(),
            items_field: items_field.into(),
            page_size,
        }
    }

    fn parse_page(&self, value: Value) -> Result<Page, SourceError> {
        let next_cursor = value
            .get("NextToken")
            .and_then(Value::as_str)
            .map(str::to_owned);

        let records = match value.get(self.items_field.as_str()) {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .cloned()
                .map(|item| {
                    RawRecord::from_value(item).ok_or_else(|| {
                        SourceError::Permanent(format!("{} contains a non-object item", self.items_field))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
            Some(_) => {
                return Err(SourceError::Permanent(format!(
                    "{} in response from {} is not an array",
                    self.items_field, self.path
                )))
            },
        };

        Ok(Page::new(records, next_cursor))
    }
}

#[async_trait]
impl PageSource for HttpPageSource {
    type Filter = ListRequest;

    async fn list_page(&self, filter: &ListRequest, cursor: Option<&str>) -> Result<Page, SourceError> {
        let mut request = match &filter.body {
            Some(body) => self.client.post(&self.path).json(body),
            None => self.client.get(&self.path),
        };
        request = request
            .query(&filter.query)
            .query(&[("MaxResults", self.page_size.to_string())]);
        if let Some(cursor) = cursor {
            request = request.query(&[("NextToken", cursor)]);
        }

        debug!(path = %self.path, cursor = ?cursor, "Listing page");
        match self.client.send_json(request).await? {
            Some(value) => self.parse_page(value),
            None => Err(SourceError::Permanent(format!("list endpoint {} not found", self.path))),
        }
    }
}

/// By-id lookup endpoint at `<path>/<id>`
pub struct HttpDetailSource {
    client: GatewayClient,
    path: String,
    detail_field: String,
}

impl HttpDetailSource {
    pub fn new(client: GatewayClient, path: impl Into<String>, detail_field: impl Into<String>) -> Self {
        Self {
            client,
            path: path.into(),
            detail_field: detail_field.into(),
        }
    }
}

#[async_trait]
impl DetailSource for HttpDetailSource {
    async fn get_detail(&self, id: &str) -> Result<Option<RawRecord>, SourceError> {
        let path = format!("{}/{}", self.path.trim_end_matches('/'), id);
        let Some(mut value) = self.client.send_json(self.client.get(&path)).await? else {
            return Ok(None);
        };
        Ok(value
            .get_mut(self.detail_field.as_str())
            .map(Value::take)
            .and_then(RawRecord::from_value))
    }
}
