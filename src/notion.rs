use crate::config::{API_PAGE_SIZE, NOTION_VERSION, REQUEST_TIMEOUT_SECS};
use crate::error::StoreError;
use crate::models::{Block, DocumentSummary, RichText};
use crate::store::{DocumentStore, Page};
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Spaces requests out so that all workers together stay under the API's rate limit.
struct RateLimiter {
    last_request: Mutex<Option<Instant>>,
    min_interval: Duration,
}

impl RateLimiter {
    fn new(min_interval: Duration) -> Self {
        Self {
            last_request: Mutex::new(None),
            min_interval,
        }
    }

    async fn wait(&self) {
        let mut last = self.last_request.lock().await;

        if let Some(last_time) = *last {
            let elapsed = last_time.elapsed();
            if elapsed < self.min_interval {
                let wait_time = self.min_interval - elapsed;
                debug!("Rate limiting: waiting {:?}", wait_time);
                tokio::time::sleep(wait_time).await;
            }
        }

        *last = Some(Instant::now());
    }
}

#[derive(Deserialize)]
struct ListResponse<T> {
    results: Vec<T>,
    #[serde(default)]
    next_cursor: Option<String>,
    #[serde(default)]
    has_more: bool,
}

impl<T> ListResponse<T> {
    fn into_page(self) -> Page<T> {
        Page {
            items: self.results,
            next_cursor: if self.has_more { self.next_cursor } else { None },
        }
    }
}

#[derive(Deserialize)]
struct PageObject {
    id: String,
    #[serde(default)]
    properties: Map<String, Value>,
    #[serde(default)]
    archived: bool,
}

impl PageObject {
    fn summary(&self) -> DocumentSummary {
        DocumentSummary {
            id: self.id.clone(),
            title: page_title(&self.properties),
        }
    }
}

#[derive(Deserialize)]
struct Created {
    id: String,
}

/// Concatenated plain text of the page's title-typed property.
fn page_title(properties: &Map<String, Value>) -> String {
    properties
        .values()
        .find(|p| p.get("type").and_then(Value::as_str) == Some("title"))
        .and_then(|p| p.get("title"))
        .and_then(Value::as_array)
        .map(|runs| {
            runs.iter()
                .filter_map(|r| r.get("plain_text").and_then(Value::as_str))
                .collect::<String>()
        })
        .unwrap_or_default()
}

/// Wire body for a block to be created: ids, flags and read-only run fields stripped.
fn block_request_value(block: &Block) -> Value {
    let kind = block.kind().to_string();
    let mut body = serde_json::to_value(block).unwrap_or(Value::Null);
    if let Value::Object(map) = &mut body {
        map.remove("id");
        map.remove("has_children");
        map.remove("children");
        if let Some(rich_text) = block.content.rich_text() {
            if let Some(Value::Object(inner)) = map.get_mut(&kind) {
                inner.insert(
                    "rich_text".to_string(),
                    Value::Array(rich_text.iter().map(RichText::to_request_value).collect()),
                );
            }
        }
    }
    body
}

fn classify_status(status: StatusCode, retry_after: Option<u64>, body: String) -> StoreError {
    match status.as_u16() {
        401 | 403 => StoreError::Unauthorized(body),
        404 => StoreError::NotFound(body),
        429 => StoreError::RateLimited { retry_after },
        code => StoreError::Api {
            status: code,
            message: body,
        },
    }
}

/// Client for the Notion REST API.
pub struct NotionStore {
    http_client: reqwest::Client,
    api_base: String,
    token: String,
    rate_limiter: RateLimiter,
}

impl NotionStore {
    pub fn new(token: &str, api_base: &str, request_interval: Duration) -> Result<Self, StoreError> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| StoreError::Network(e.to_string()))?;

        Ok(Self {
            http_client,
            api_base: api_base.trim_end_matches('/').to_string(),
            token: token.to_string(),
            rate_limiter: RateLimiter::new(request_interval),
        })
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<Value>,
    ) -> Result<T, StoreError> {
        self.rate_limiter.wait().await;

        let url = format!("{}{}", self.api_base, path);
        debug!(method = %method, url = %url, "Notion request");

        let mut request = self
            .http_client
            .request(method, &url)
            .bearer_auth(&self.token)
            .header("Notion-Version", NOTION_VERSION)
            .query(query);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| StoreError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            let error_text = response.text().await.unwrap_or_default();
            if status == StatusCode::TOO_MANY_REQUESTS {
                warn!(url = %url, retry_after = ?retry_after, "Rate limited by Notion");
            }
            return Err(classify_status(status, retry_after, error_text));
        }

        response
            .json()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))
    }
}

#[async_trait]
impl DocumentStore for NotionStore {
    fn source_key(&self) -> String {
        format!("notion:{}", self.api_base)
    }

    async fn verify_access(&self) -> Result<(), StoreError> {
        let _: Value = self.request(Method::GET, "/users/me", &[], None).await?;
        Ok(())
    }

    async fn search_documents(
        &self,
        cursor: Option<&str>,
    ) -> Result<Page<DocumentSummary>, StoreError> {
        let mut body = json!({
            "filter": { "property": "object", "value": "page" },
            "page_size": API_PAGE_SIZE,
        });
        if let Some(cursor) = cursor {
            body["start_cursor"] = Value::String(cursor.to_string());
        }

        let response: ListResponse<PageObject> =
            self.request(Method::POST, "/search", &[], Some(body)).await?;
        let page = response.into_page();
        Ok(Page {
            items: page
                .items
                .iter()
                .filter(|p| !p.archived)
                .map(PageObject::summary)
                .collect(),
            next_cursor: page.next_cursor,
        })
    }

    async fn document(&self, id: &str) -> Result<DocumentSummary, StoreError> {
        let page: PageObject = self
            .request(Method::GET, &format!("/pages/{id}"), &[], None)
            .await?;
        Ok(page.summary())
    }

    async fn list_children(
        &self,
        block_id: &str,
        cursor: Option<&str>,
    ) -> Result<Page<Block>, StoreError> {
        let mut query = vec![("page_size", API_PAGE_SIZE.to_string())];
        if let Some(cursor) = cursor {
            query.push(("start_cursor", cursor.to_string()));
        }
        let response: ListResponse<Block> = self
            .request(
                Method::GET,
                &format!("/blocks/{block_id}/children"),
                &query,
                None,
            )
            .await?;
        Ok(response.into_page())
    }

    async fn update_rich_text(
        &self,
        block_id: &str,
        kind: &str,
        runs: &[RichText],
    ) -> Result<(), StoreError> {
        let rich_text: Vec<Value> = runs.iter().map(RichText::to_request_value).collect();
        let mut body = Map::new();
        body.insert(kind.to_string(), json!({ "rich_text": rich_text }));
        let body = Value::Object(body);
        let _: Value = self
            .request(Method::PATCH, &format!("/blocks/{block_id}"), &[], Some(body))
            .await?;
        Ok(())
    }

    async fn create_document(&self, parent_id: &str, title: &str) -> Result<String, StoreError> {
        let body = json!({
            "parent": { "page_id": parent_id },
            "properties": {
                "title": { "title": [{ "type": "text", "text": { "content": title } }] }
            },
        });
        let created: Created = self.request(Method::POST, "/pages", &[], Some(body)).await?;
        Ok(created.id)
    }

    async fn append_blocks(&self, parent_id: &str, blocks: &[Block]) -> Result<(), StoreError> {
        let children: Vec<Value> = blocks.iter().map(block_request_value).collect();
        let _: Value = self
            .request(
                Method::PATCH,
                &format!("/blocks/{parent_id}/children"),
                &[],
                Some(json!({ "children": children })),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Annotations;

    #[test]
    fn title_concatenates_title_property_runs() {
        let properties = json!({
            "Tags": { "type": "multi_select", "multi_select": [] },
            "Name": { "type": "title", "title": [
                { "plain_text": "Trip " }, { "plain_text": "Notes" }
            ]}
        });
        let Value::Object(map) = properties else {
            panic!("expected object")
        };
        assert_eq!(page_title(&map), "Trip Notes");
    }

    #[test]
    fn missing_title_property_is_blank() {
        assert_eq!(page_title(&Map::new()), "");
    }

    #[test]
    fn status_codes_map_to_store_errors() {
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, None, String::new()),
            StoreError::Unauthorized(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, None, String::new()),
            StoreError::Unauthorized(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, None, String::new()),
            StoreError::NotFound(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, Some(2), String::new()),
            StoreError::RateLimited { retry_after: Some(2) }
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, None, "x".into()),
            StoreError::Api { status: 502, .. }
        ));
    }

    #[test]
    fn list_response_drops_cursor_without_more() {
        let raw = json!({ "results": [], "next_cursor": "abc", "has_more": false });
        let response: ListResponse<Value> = serde_json::from_value(raw).unwrap();
        assert!(response.into_page().next_cursor.is_none());
    }

    #[test]
    fn appended_block_body_has_no_read_only_fields() {
        let block = Block::paragraph(
            "b1",
            vec![RichText::page_mention("p1", "Label", Annotations::default())],
        );
        let value = block_request_value(&block);
        assert!(value.get("id").is_none());
        assert!(value.get("has_children").is_none());
        assert_eq!(value["type"], "paragraph");
        assert!(value["paragraph"]["rich_text"][0].get("plain_text").is_none());
    }

    #[tokio::test]
    async fn rate_limiter_spaces_requests() {
        let limiter = RateLimiter::new(Duration::from_millis(20));
        let start = Instant::now();
        limiter.wait().await;
        limiter.wait().await;
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
