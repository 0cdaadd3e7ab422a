use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use parking_lot::lock_api::ArcRwLockReadGuard;
use tracing::debug;

use crate::collection::{Collection, DeleteResult, InsertManyResult, UpdateResult};
use crate::config::StoreConfig;
use crate::document::Document;
use crate::error::{Error, Result};
use crate::pipeline::Pipeline;
use crate::projection::Projection;
use crate::query::{self, FindOptions, Filter};
use crate::update::UpdateSpec;
use crate::value::Value;

type Registry = RwLock<HashMap<String, Arc<RwLock<Collection>>>>;

/// An in-memory store of named collections.
///
/// Thread-safe: a `RwLock` guards the name registry and every collection
/// sits behind its own `RwLock`, so reads on the same collection run
/// concurrently while a write excludes every other operation on that
/// collection for its whole duration. Reads lock recursively, so a thread
/// holding a [`Cursor`] is never blocked by a queued writer.
#[derive(Debug)]
pub struct Store {
    config: StoreConfig,
    collections: Arc<Registry>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Self {
            config: StoreConfig::default(),
            collections: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn with_config(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            collections: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn new_collection(&self, name: &str) -> Arc<RwLock<Collection>> {
        Arc::new(RwLock::new(Collection::with_options(
            name,
            self.config.initial_capacity,
            self.config.max_documents_per_collection,
        )))
    }

    fn handle(&self, name: &str, inner: Arc<RwLock<Collection>>) -> CollectionHandle {
        CollectionHandle {
            name: name.to_string(),
            inner,
            registry: Arc::clone(&self.collections),
        }
    }

    /// Get a handle to a collection, creating it when the store is
    /// configured to do so.
    pub fn collection(&self, name: &str) -> Result<CollectionHandle> {
        // Fast path: read lock only
        if let Some(col) = self.collections.read().get(name) {
            return Ok(self.handle(name, Arc::clone(col)));
        }
        if !self.config.auto_create_collections {
            return Err(Error::CollectionNotFound(name.to_string()));
        }
        let mut cols = self.collections.write();
        // Double-check after acquiring write lock
        let col = cols
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(target: "memdoc::engine", collection = name, "collection created");
                self.new_collection(name)
            })
            .clone();
        Ok(self.handle(name, col))
    }

    /// Create a new, empty collection.
    pub fn create_collection(&self, name: &str) -> Result<CollectionHandle> {
        let mut cols = self.collections.write();
        if cols.contains_key(name) {
            return Err(Error::CollectionAlreadyExists(name.to_string()));
        }
        let col = self.new_collection(name);
        cols.insert(name.to_string(), Arc::clone(&col));
        debug!(target: "memdoc::engine", collection = name, "collection created");
        Ok(self.handle(name, col))
    }

    /// List all collection names, sorted.
    pub fn list_collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Drop a collection. Returns whether it existed.
    ///
    /// Handles obtained earlier keep working on the detached collection.
    pub fn drop_collection(&self, name: &str) -> bool {
        let dropped = self.collections.write().remove(name).is_some();
        debug!(target: "memdoc::engine", collection = name, dropped, "drop_collection");
        dropped
    }
}

// ---------------------------------------------------------------------------
// Collection handle
// ---------------------------------------------------------------------------

/// A cheap, cloneable handle to one collection of a [`Store`].
///
/// Filters, updates, projections and pipelines are parsed before any lock
/// is taken, so malformed input never blocks other callers.
#[derive(Debug, Clone)]
pub struct CollectionHandle {
    name: String,
    inner: Arc<RwLock<Collection>>,
    registry: Arc<Registry>,
}

impl CollectionHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn insert_one(&self, doc: Document) -> Result<Value> {
        self.inner.write().insert(doc)
    }

    pub fn insert_many(&self, docs: Vec<Document>) -> InsertManyResult {
        self.inner.write().insert_many(docs)
    }

    /// Find documents matching `filter`, optionally projected.
    ///
    /// The returned [`Cursor`] holds a read lock on the collection until it
    /// is dropped. Other reads from the same thread may run meanwhile, even
    /// with a writer queued, since every read takes the lock recursively.
    /// Writing to the same collection from that thread deadlocks.
    pub fn find(&self, filter: &Document, projection: Option<&Document>) -> Result<Cursor> {
        let options = FindOptions {
            projection: projection.cloned(),
            ..Default::default()
        };
        self.find_with_options(filter, &options)
    }

    /// Find with projection, sort, skip and limit. With a sort the matching
    /// positions are ordered up front; documents are still cloned lazily.
    pub fn find_with_options(&self, filter: &Document, options: &FindOptions) -> Result<Cursor> {
        let filter = Filter::parse(filter)?;
        let projection = options.projection.as_ref().map(Projection::parse).transpose()?;
        let guard = self.inner.read_arc_recursive();

        let order = options.sort.as_ref().map(|keys| {
            let docs = guard.documents();
            let mut positions: Vec<usize> = (0..docs.len())
                .filter(|&i| filter.matches(&docs[i]))
                .collect();
            // stable: ties keep collection order
            positions.sort_by(|&a, &b| query::compare_documents(&docs[a], &docs[b], keys));
            positions
        });

        debug!(
            target: "memdoc::engine",
            collection = %self.name,
            sorted = order.is_some(),
            skip = options.skip,
            limit = options.limit,
            "find"
        );
        Ok(Cursor {
            guard,
            filter,
            projection,
            order,
            position: 0,
            skip: to_usize(options.skip.unwrap_or(0)),
            remaining: options.limit.map(to_usize),
        })
    }

    pub fn find_one(&self, filter: &Document) -> Result<Option<Document>> {
        let filter = Filter::parse(filter)?;
        Ok(self.inner.read_recursive().find_one(&filter).cloned())
    }

    pub fn update_one(&self, filter: &Document, update: &Document) -> Result<UpdateResult> {
        self.update(filter, update, false)
    }

    pub fn update_many(&self, filter: &Document, update: &Document) -> Result<UpdateResult> {
        self.update(filter, update, true)
    }

    fn update(&self, filter: &Document, update: &Document, multi: bool) -> Result<UpdateResult> {
        let filter = Filter::parse(filter)?;
        let update = UpdateSpec::parse(update)?;
        self.inner.write().update_matching(&filter, &update, multi)
    }

    pub fn delete_one(&self, filter: &Document) -> Result<DeleteResult> {
        let filter = Filter::parse(filter)?;
        Ok(self.inner.write().delete_matching(&filter, false))
    }

    pub fn delete_many(&self, filter: &Document) -> Result<DeleteResult> {
        let filter = Filter::parse(filter)?;
        Ok(self.inner.write().delete_matching(&filter, true))
    }

    pub fn count_documents(&self, filter: &Document) -> Result<usize> {
        let filter = Filter::parse(filter)?;
        Ok(self.inner.read_recursive().count(&filter))
    }

    /// Total number of documents, without evaluating a filter.
    pub fn estimated_document_count(&self) -> usize {
        self.inner.read_recursive().len()
    }

    /// Run an aggregation pipeline over this collection.
    ///
    /// The source is snapshotted under a read lock (filtered by a leading
    /// `$match` when there is one) and the stages then run without holding
    /// any lock. `$lookup` reads each foreign collection under its own read
    /// lock; an unknown foreign collection joins as empty.
    pub fn aggregate(&self, stages: &[Document]) -> Result<Vec<Document>> {
        let pipeline = Pipeline::parse(stages)?;

        let (initial, start) = {
            let col = self.inner.read_recursive();
            match pipeline.leading_match() {
                Some(filter) => (col.find_matching(filter).cloned().collect(), 1),
                None => (col.documents().to_vec(), 0),
            }
        };
        let scanned = initial.len();

        let lookup_fn = |foreign: &str, filter: &Filter| -> Result<Vec<Document>> {
            let col = self.registry.read().get(foreign).cloned();
            Ok(match col {
                Some(col) => col.read_recursive().find_matching(filter).cloned().collect(),
                None => Vec::new(),
            })
        };

        let output = pipeline.execute_from(start, initial, &lookup_fn)?;
        debug!(
            target: "memdoc::engine",
            collection = %self.name,
            stages = pipeline.len(),
            scanned,
            output = output.len(),
            "aggregate"
        );
        Ok(output)
    }
}

fn to_usize(n: u64) -> usize {
    usize::try_from(n).unwrap_or(usize::MAX)
}

// ---------------------------------------------------------------------------
// Cursor
// ---------------------------------------------------------------------------

/// Lazy, single-pass iterator over the results of a find.
///
/// Each call to `next` yields an owned copy of the next matching document.
/// To iterate again, call `find` again.
pub struct Cursor {
    guard: ArcRwLockReadGuard<parking_lot::RawRwLock, Collection>,
    filter: Filter,
    projection: Option<Projection>,
    /// Pre-filtered, sorted positions when the find has a sort.
    order: Option<Vec<usize>>,
    position: usize,
    skip: usize,
    remaining: Option<usize>,
}

impl Iterator for Cursor {
    type Item = Document;

    fn next(&mut self) -> Option<Document> {
        if self.remaining == Some(0) {
            return None;
        }
        let docs = self.guard.documents();
        loop {
            let doc = match &self.order {
                Some(order) => {
                    let &i = order.get(self.position)?;
                    self.position += 1;
                    &docs[i]
                }
                None => {
                    let doc = docs.get(self.position)?;
                    self.position += 1;
                    if !self.filter.matches(doc) {
                        continue;
                    }
                    doc
                }
            };
            if self.skip > 0 {
                self.skip -= 1;
                continue;
            }
            if let Some(remaining) = self.remaining.as_mut() {
                *remaining -= 1;
            }
            return Some(match &self.projection {
                Some(projection) => projection.apply(doc),
                None => doc.clone(),
            });
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
