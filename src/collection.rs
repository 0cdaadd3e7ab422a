use std::collections::BTreeSet;

use tracing::{debug, warn};

use crate::document::{Document, ID_FIELD};
use crate::error::{Error, Result};
use crate::query::Filter;
use crate::update::UpdateSpec;
use crate::value::{ObjectId, Value};

/// A per-document failure inside a batch operation.
#[derive(Debug)]
pub struct WriteError {
    /// Position of the failing document in the batch input (inserts) or
    /// among the matched documents (updates).
    pub index: usize,
    pub id: Option<Value>,
    pub error: Error,
}

#[derive(Debug, Default)]
pub struct InsertManyResult {
    pub inserted_ids: Vec<Value>,
    pub write_errors: Vec<WriteError>,
}

#[derive(Debug, Default)]
pub struct UpdateResult {
    pub matched_count: u64,
    pub modified_count: u64,
    pub write_errors: Vec<WriteError>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeleteResult {
    pub deleted_count: u64,
}

/// An insertion-ordered sequence of documents with unique `_id`s.
#[derive(Debug, Clone)]
pub struct Collection {
    name: String,
    documents: Vec<Document>,
    ids: BTreeSet<Value>,
    max_documents: Option<usize>,
}

impl Collection {
    pub fn new(name: &str) -> Self {
        Self::with_options(name, 0, None)
    }

    pub fn with_options(name: &str, capacity: usize, max_documents: Option<usize>) -> Self {
        Self {
            name: name.to_string(),
            documents: Vec::with_capacity(capacity),
            ids: BTreeSet::new(),
            max_documents,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of documents in the collection.
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn documents(&self) -> &[Document] {
        &self.documents
    }

    /// Get a document by its _id directly.
    pub fn get(&self, id: &Value) -> Option<&Document> {
        if !self.ids.contains(id) {
            return None;
        }
        self.documents.iter().find(|doc| doc.id() == Some(id))
    }

    // -----------------------------------------------------------------------
    // CRUD operations
    // -----------------------------------------------------------------------

    /// Insert a document. Returns the `_id`, generated when absent.
    pub fn insert(&mut self, doc: Document) -> Result<Value> {
        if let Some(limit) = self.max_documents {
            if self.documents.len() >= limit {
                return Err(Error::CollectionFull {
                    name: self.name.clone(),
                    limit,
                });
            }
        }

        let id = match doc.id() {
            Some(Value::Array(_)) => {
                return Err(Error::TypeMismatch("_id cannot be an array".into()));
            }
            Some(id) if self.ids.contains(id) => {
                return Err(Error::DuplicateKey(id.to_string()));
            }
            Some(id) => id.clone(),
            None => Value::Id(ObjectId::new()),
        };

        // _id always leads the stored document
        let mut stored = Document::with_capacity(doc.len() + 1);
        stored.insert(ID_FIELD, id.clone());
        stored.extend(doc.into_iter().filter(|(k, _)| k != ID_FIELD));

        self.ids.insert(id.clone());
        self.documents.push(stored);
        debug!(target: "memdoc::collection", collection = %self.name, id = %id, "document inserted");
        Ok(id)
    }

    /// Insert documents one by one, in order. A failing document is recorded
    /// and skipped; documents before and after it are still inserted.
    pub fn insert_many(&mut self, docs: Vec<Document>) -> InsertManyResult {
        let mut result = InsertManyResult::default();
        for (index, doc) in docs.into_iter().enumerate() {
            let id = doc.id().cloned();
            match self.insert(doc) {
                Ok(id) => result.inserted_ids.push(id),
                Err(error) => {
                    warn!(
                        target: "memdoc::collection",
                        collection = %self.name,
                        index,
                        error = %error,
                        "insert_many skipped a document"
                    );
                    result.write_errors.push(WriteError { index, id, error });
                }
            }
        }
        debug!(
            target: "memdoc::collection",
            collection = %self.name,
            inserted = result.inserted_ids.len(),
            failed = result.write_errors.len(),
            "insert_many finished"
        );
        result
    }

    /// Documents matching `filter`, lazily, in collection order. The items
    /// borrow only the collection, not the filter.
    pub fn find_matching<'a, 'f>(
        &'a self,
        filter: &'f Filter,
    ) -> impl Iterator<Item = &'a Document> + use<'a, 'f> {
        self.documents.iter().filter(move |doc| filter.matches(doc))
    }

    pub fn find_one<'a>(&'a self, filter: &Filter) -> Option<&'a Document> {
        self.find_matching(filter).next()
    }

    /// Apply `update` to the first match (`multi == false`) or to every match.
    ///
    /// With `multi == false` a failure is returned as the error. With
    /// `multi == true` each failure is recorded in `write_errors`, the
    /// failing document stays untouched and the batch carries on.
    pub fn update_matching(
        &mut self,
        filter: &Filter,
        update: &UpdateSpec,
        multi: bool,
    ) -> Result<UpdateResult> {
        let mut result = UpdateResult::default();
        for doc in self.documents.iter_mut().filter(|doc| filter.matches(doc)) {
            let index = usize::try_from(result.matched_count).unwrap_or(usize::MAX);
            result.matched_count += 1;
            match update.apply(doc) {
                Ok(true) => result.modified_count += 1,
                Ok(false) => {}
                Err(error) if multi => {
                    warn!(
                        target: "memdoc::collection",
                        collection = %self.name,
                        error = %error,
                        "update_many skipped a document"
                    );
                    result.write_errors.push(WriteError {
                        index,
                        id: doc.id().cloned(),
                        error,
                    });
                }
                Err(error) => return Err(error),
            }
            if !multi {
                break;
            }
        }
        debug!(
            target: "memdoc::collection",
            collection = %self.name,
            matched = result.matched_count,
            modified = result.modified_count,
            failed = result.write_errors.len(),
            multi,
            "update applied"
        );
        Ok(result)
    }

    /// Remove the first match (`multi == false`) or every match.
    pub fn delete_matching(&mut self, filter: &Filter, multi: bool) -> DeleteResult {
        let before = self.documents.len();
        if multi {
            let ids = &mut self.ids;
            self.documents.retain(|doc| {
                if !filter.matches(doc) {
                    return true;
                }
                if let Some(id) = doc.id() {
                    ids.remove(id);
                }
                false
            });
        } else if let Some(pos) = self.documents.iter().position(|doc| filter.matches(doc)) {
            let doc = self.documents.remove(pos);
            if let Some(id) = doc.id() {
                self.ids.remove(id);
            }
        }
        let deleted_count = (before - self.documents.len()) as u64;
        debug!(
            target: "memdoc::collection",
            collection = %self.name,
            deleted = deleted_count,
            multi,
            "delete applied"
        );
        DeleteResult { deleted_count }
    }

    /// Count documents matching a filter without collecting them.
    pub fn count(&self, filter: &Filter) -> usize {
        self.find_matching(filter).count()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
