use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use hashbrown::{HashMap, HashSet};
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    config::EngineConfig,
    entity::Entity,
    error::EngineError,
    gateway::{FetchQuery, Filter, RemoteStore},
    schema::ResourceSchema,
};

use super::page::{JoinSpec, LogEntry, LogPage};

/// Forward-only pagination over an append-only log.
///
/// Each page is fetched once at `offset = rows fetched so far` and enriched
/// with one batched lookup. A page shorter than the page size ends the log.
pub struct LogReader {
    gateway: Arc<dyn RemoteStore>,
    schema: Arc<ResourceSchema>,
    join: JoinSpec,
    filters: Vec<Filter>,
    page_size: usize,
    fallback: String,
    pages: Vec<LogPage>,
    fetched: usize,
    has_more: bool,
    loading: AtomicBool,
    error: Option<EngineError>,
}

impl LogReader {
    pub fn new(gateway: Arc<dyn RemoteStore>, schema: ResourceSchema, config: &EngineConfig) -> Self {
        Self {
            gateway,
            schema: Arc::new(schema),
            join: JoinSpec::default(),
            filters: Vec::new(),
            page_size: config.log_page_size.max(1),
            fallback: config.log_fallback_label.clone(),
            pages: Vec::new(),
            fetched: 0,
            has_more: true,
            loading: AtomicBool::new(false),
            error: None,
        }
    }

    /// Replaces the display-name join.
    pub fn with_join(mut self, join: JoinSpec) -> Self {
        self.join = join;
        self
    }

    /// Restricts the log to rows where `field` equals `value`.
    pub fn with_filter(mut self, field: &str, value: Value) -> Self {
        self.filters.push(Filter {
            field: field.to_string(),
            value,
        });
        self
    }

    pub fn pages(&self) -> &[LogPage] {
        &self.pages
    }

    /// Loaded entries in log order.
    pub fn entries(&self) -> impl Iterator<Item = &LogEntry> {
        self.pages.iter().flat_map(|p| p.entries().iter())
    }

    pub fn len(&self) -> usize {
        self.pages.iter().map(|p| p.entries().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::Relaxed)
    }

    /// Failure of the most recent fetch, cleared by the next success.
    pub fn error(&self) -> Option<&EngineError> {
        self.error.as_ref()
    }

    /// Fetches the next page. Returns `Ok(false)` without touching the
    /// store once the log is exhausted.
    ///
    /// A failed fetch keeps every loaded page and records the error. A
    /// failed lookup does not fail the page; its entries get the fallback
    /// label.
    pub async fn load_more(&mut self) -> Result<bool, EngineError> {
        if !self.has_more {
            return Ok(false);
        }

        let offset = self.fetched;
        let mut query = FetchQuery::new(&self.schema.name)
            .order(self.schema.order_by.clone())
            .page(offset, self.page_size);
        query.filters = self.filters.clone();

        let loading = LoadingFlag::raise(&self.loading);
        let rows = match self.gateway.fetch(&query).await {
            Ok(rows) => rows,
            Err(err) => {
                let err = EngineError::from(err);
                warn!(resource = %self.schema.name, offset, error = %err, "log page fetch failed");
                self.error = Some(err.clone());
                return Err(err);
            }
        };

        let fetched = rows.len();
        let mut entities = Vec::with_capacity(fetched);
        for row in &rows {
            match self.schema.ingest(row) {
                Ok(entity) => entities.push(entity),
                Err(err) => warn!(resource = %self.schema.name, error = %err, "malformed log row skipped"),
            }
        }
        let entries = self.enrich(entities).await;
        drop(loading);

        self.fetched += fetched;
        self.has_more = fetched == self.page_size;
        if fetched > 0 {
            self.pages.push(LogPage::new(offset, fetched, entries));
        }
        self.error = None;
        debug!(resource = %self.schema.name, offset, fetched, has_more = self.has_more, "log page loaded");
        Ok(true)
    }

    /// Drops every page and loads the first one again.
    pub async fn refresh(&mut self) -> Result<bool, EngineError> {
        self.pages.clear();
        self.fetched = 0;
        self.has_more = true;
        self.error = None;
        self.load_more().await
    }

    async fn enrich(&self, entities: Vec<Entity>) -> Vec<LogEntry> {
        let actor_ids: Vec<Option<String>> = entities
            .iter()
            .map(|e| e.get(&self.join.foreign_field).and_then(foreign_key))
            .collect();

        let distinct: Vec<String> = {
            let mut seen = HashSet::new();
            actor_ids
                .iter()
                .flatten()
                .filter(|id| seen.insert(id.as_str()))
                .cloned()
                .collect()
        };

        let names = if distinct.is_empty() {
            HashMap::new()
        } else {
            match self
                .gateway
                .batched_lookup(&self.join.lookup_resource, &self.join.display_field, &distinct)
                .await
            {
                Ok(names) => names,
                Err(err) => {
                    warn!(
                        resource = %self.join.lookup_resource,
                        ids = distinct.len(),
                        error = %err,
                        "display name lookup failed, using fallback"
                    );
                    HashMap::new()
                }
            }
        };

        entities
            .into_iter()
            .zip(actor_ids)
            .map(|(entity, actor_id)| {
                let display_name = actor_id
                    .as_ref()
                    .and_then(|id| names.get(id))
                    .cloned()
                    .unwrap_or_else(|| self.fallback.clone());
                LogEntry {
                    id: entity.id,
                    fields: entity.fields,
                    actor_id,
                    display_name,
                }
            })
            .collect()
    }
}

/// Holds the loading flag up until the page finishes or its future is
/// dropped.
struct LoadingFlag<'a>(&'a AtomicBool);

impl<'a> LoadingFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Relaxed);
        Self(flag)
    }
}

impl Drop for LoadingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Relaxed);
    }
}

fn foreign_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
