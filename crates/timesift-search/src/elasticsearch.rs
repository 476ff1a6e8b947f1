use std::collections::VecDeque;

use async_trait::async_trait;
use futures::stream;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, RequestBuilder, Url};
use serde_json::{json, Map, Value};
use tracing::{debug, info, instrument, warn};

use timesift_core::config::DatastoreConfig;
use timesift_core::datastore::{self, Datastore, HitStream, LabelRequest, SearchRequest};
use timesift_core::errors::DatastoreError;
use timesift_core::queue::{MutationQueue, PendingUpdate};

use crate::query::{self, DATETIME_FIELD};

/// Document type reported for hits from backends that no longer return one.
pub const DEFAULT_DOC_TYPE: &str = "_doc";

/// Elasticsearch backend over its REST API.
///
/// Partial updates are batched in a [`MutationQueue`] and written with the
/// bulk API, either when `flush_interval` documents are pending or when
/// [`Datastore::flush_queued_events`] is called.
pub struct ElasticsearchDatastore {
    client: Client,
    base_url: Url,
    config: DatastoreConfig,
    queue: MutationQueue,
}

impl ElasticsearchDatastore {
    pub fn new(config: &DatastoreConfig) -> Result<Self, DatastoreError> {
        let base_url = Url::parse(&config.base_url())
            .map_err(|e| DatastoreError::InvalidUrl(format!("{}: {e}", config.base_url())))?;
        if base_url.cannot_be_a_base() {
            return Err(DatastoreError::InvalidUrl(config.base_url()));
        }
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| DatastoreError::Network(e.to_string()))?;

        Ok(Self {
            client,
            base_url,
            config: config.clone(),
            queue: MutationQueue::new(),
        })
    }

    /// Documents waiting for the next bulk write.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    fn url(&self, segments: &[&str]) -> Result<Url, DatastoreError> {
        endpoint(&self.base_url, segments)
    }
}

#[async_trait]
impl Datastore for ElasticsearchDatastore {
    fn name(&self) -> &str {
        "elasticsearch"
    }

    #[instrument(skip(self))]
    async fn refresh(&self, index: &str) -> Result<(), DatastoreError> {
        let url = self.url(&[index, "_refresh"])?;
        send_json(self.client.post(url)).await?;
        Ok(())
    }

    #[instrument(skip(self, request), fields(indices = ?request.indices, query = %request.query_string))]
    async fn search_stream(&self, request: &SearchRequest) -> Result<HitStream, DatastoreError> {
        if request.indices.is_empty() {
            debug!("no indices to search");
            return Ok(Box::pin(stream::empty::<Result<Value, DatastoreError>>()));
        }

        let mut cursor = ScrollCursor {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            indices: request.indices.join(","),
            keep_alive: self.config.scroll_keep_alive(),
            page_size: self.config.scroll_size,
            initial_body: Some(build_search_body(request, self.config.scroll_size)),
            scroll_id: None,
            buffer: VecDeque::new(),
            exhausted: false,
        };
        // First page is fetched eagerly so a bad index fails the call itself.
        cursor.next_page().await?;

        let hits = stream::unfold(cursor, |mut cursor| async move {
            loop {
                if let Some(hit) = cursor.buffer.pop_front() {
                    return Some((Ok(hit), cursor));
                }
                if cursor.exhausted {
                    return None;
                }
                if let Err(e) = cursor.next_page().await {
                    cursor.exhausted = true;
                    return Some((Err(e), cursor));
                }
            }
        });
        Ok(Box::pin(hits))
    }

    async fn import_event(
        &self,
        index: &str,
        event_type: &str,
        event_id: &str,
        event: Map<String, Value>,
    ) -> Result<(), DatastoreError> {
        let pending = self.queue.enqueue(index, event_type, event_id, event);
        if pending >= self.config.flush_interval {
            debug!(pending, "flush interval reached");
            self.flush_queued_events().await?;
        }
        Ok(())
    }

    #[instrument(skip(self, request), fields(index = %request.index, event_id = %request.event_id, label = %request.label))]
    async fn set_label(&self, request: &LabelRequest) -> Result<Map<String, Value>, DatastoreError> {
        let url = self.url(&[&request.index, "_doc", &request.event_id])?;
        let document = match send_json(self.client.get(url)).await {
            Ok(document) => document,
            Err(DatastoreError::Status { status: 404, .. }) => {
                return Err(DatastoreError::DocumentNotFound {
                    index: request.index.clone(),
                    event_id: request.event_id.clone(),
                })
            }
            Err(e) => return Err(e),
        };
        let stored = document
            .get("_source")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        let update = datastore::resolve_label_update(&self.queue, &stored, request)?;
        if request.single_update {
            let url = self.url(&[&request.index, "_update", &request.event_id])?;
            send_json(self.client.post(url).json(&json!({ "doc": update }))).await?;
        }
        Ok(update)
    }

    #[instrument(skip(self))]
    async fn flush_queued_events(&self) -> Result<(), DatastoreError> {
        let url = self.url(&["_bulk"])?;
        let updates = self.queue.drain();
        if updates.is_empty() {
            debug!("no queued events");
            return Ok(());
        }

        let total = updates.len();
        let request = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/x-ndjson")
            .body(render_bulk(&updates));
        let response = match send_json(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, kind = e.error_kind(), documents = total, "bulk write failed, requeueing");
                self.queue.restore(updates);
                return Err(e);
            }
        };

        let failed = bulk_failures(&response);
        if failed > 0 {
            warn!(failed, total, "bulk write partially rejected");
            return Err(DatastoreError::BulkRejected { failed, total });
        }
        info!(documents = total, "flushed queued events");
        Ok(())
    }
}

/// Paginated scroll over one search.
struct ScrollCursor {
    client: Client,
    base_url: Url,
    indices: String,
    keep_alive: String,
    page_size: usize,
    initial_body: Option<Value>,
    scroll_id: Option<String>,
    buffer: VecDeque<Value>,
    exhausted: bool,
}

impl ScrollCursor {
    async fn next_page(&mut self) -> Result<(), DatastoreError> {
        let response = match self.initial_body.take() {
            Some(body) => {
                let mut url = endpoint(&self.base_url, &[&self.indices, "_search"])?;
                url.query_pairs_mut().append_pair("scroll", &self.keep_alive);
                send_json(self.client.post(url).json(&body)).await?
            }
            None => {
                let Some(scroll_id) = self.scroll_id.clone() else {
                    self.exhausted = true;
                    return Ok(());
                };
                let url = endpoint(&self.base_url, &["_search", "scroll"])?;
                let body = json!({ "scroll": self.keep_alive, "scroll_id": scroll_id });
                send_json(self.client.post(url).json(&body)).await?
            }
        };

        let page = parse_scroll_page(&response)?;
        if page.scroll_id.is_some() {
            self.scroll_id = page.scroll_id;
        }
        if page.hits.len() < self.page_size {
            self.exhausted = true;
        }
        self.buffer.extend(page.hits);
        if self.exhausted {
            self.clear().await;
        }
        Ok(())
    }

    /// Release the scroll context. Failures are only logged.
    async fn clear(&mut self) {
        let Some(scroll_id) = self.scroll_id.take() else {
            return;
        };
        let url = match endpoint(&self.base_url, &["_search", "scroll"]) {
            Ok(url) => url,
            Err(_) => return,
        };
        let body = json!({ "scroll_id": [scroll_id] });
        if let Err(e) = send_json(self.client.delete(url).json(&body)).await {
            debug!(error = %e, "failed to clear scroll context");
        }
    }
}

/// One page of a scroll response.
#[derive(Debug, PartialEq)]
pub struct ScrollPage {
    pub scroll_id: Option<String>,
    pub hits: Vec<Value>,
}

pub fn parse_scroll_page(response: &Value) -> Result<ScrollPage, DatastoreError> {
    let hits = response
        .pointer("/hits/hits")
        .and_then(Value::as_array)
        .ok_or_else(|| DatastoreError::MalformedResponse("search response without hits.hits".into()))?;

    Ok(ScrollPage {
        scroll_id: response
            .get("_scroll_id")
            .and_then(Value::as_str)
            .map(str::to_string),
        hits: hits.iter().cloned().map(with_doc_type).collect(),
    })
}

fn with_doc_type(mut hit: Value) -> Value {
    if let Some(fields) = hit.as_object_mut() {
        fields
            .entry("_type")
            .or_insert_with(|| Value::String(DEFAULT_DOC_TYPE.to_string()));
    }
    hit
}

/// Search body for a scroll query: a query-string match, optionally bounded
/// by the filter's time range, projecting `return_fields`.
pub fn build_search_body(request: &SearchRequest, page_size: usize) -> Value {
    let query_string = match request.query_string.trim() {
        "" => "*",
        q => q,
    };
    let mut bool_query = Map::new();
    bool_query.insert(
        "must".into(),
        json!([{ "query_string": { "query": query_string, "default_operator": "AND" } }]),
    );

    let (start, end) = query::time_range(&request.query_filter);
    if start.is_some() || end.is_some() {
        let mut bounds = Map::new();
        if let Some(start) = start {
            bounds.insert("gte".into(), json!(start));
        }
        if let Some(end) = end {
            bounds.insert("lte".into(), json!(end));
        }
        let mut range = Map::new();
        range.insert(DATETIME_FIELD.to_string(), Value::Object(bounds));
        bool_query.insert("filter".into(), json!([{ "range": range }]));
    }

    let sort = match request.query_filter.get("order").and_then(Value::as_str) {
        Some(order @ ("asc" | "desc")) => {
            let mut by_time = Map::new();
            by_time.insert(DATETIME_FIELD.to_string(), json!(order));
            json!([by_time])
        }
        _ => json!(["_doc"]),
    };

    json!({
        "query": { "bool": bool_query },
        "_source": request.return_fields,
        "size": page_size,
        "sort": sort,
    })
}

/// NDJSON body for the bulk API: one `update` action with a partial `doc`
/// per queued document.
pub fn render_bulk(updates: &[PendingUpdate]) -> String {
    let mut body = String::new();
    for update in updates {
        let action = json!({ "update": { "_index": update.index, "_id": update.event_id } });
        let doc = json!({ "doc": update.fields });
        body.push_str(&action.to_string());
        body.push('\n');
        body.push_str(&doc.to_string());
        body.push('\n');
    }
    body
}

/// Number of rejected items in a bulk response.
pub fn bulk_failures(response: &Value) -> usize {
    if !response.get("errors").and_then(Value::as_bool).unwrap_or(false) {
        return 0;
    }
    let failed = response
        .get("items")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_object().and_then(|actions| actions.values().next()))
                .filter(|result| result.get("error").is_some())
                .count()
        })
        .unwrap_or(0);
    failed.max(1)
}

fn endpoint(base: &Url, segments: &[&str]) -> Result<Url, DatastoreError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|()| DatastoreError::InvalidUrl(base.to_string()))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

async fn send_json(request: RequestBuilder) -> Result<Value, DatastoreError> {
    let resp = request
        .send()
        .await
        .map_err(|e| DatastoreError::Network(e.to_string()))?;

    if !resp.status().is_success() {
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        return Err(DatastoreError::from_status(status, body));
    }

    resp.json::<Value>()
        .await
        .map_err(|e| DatastoreError::MalformedResponse(e.to_string()))
}
