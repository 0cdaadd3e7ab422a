//! End-to-end tests through the public `Store` API.
//!
//! Fixtures follow the demo data set: a `users` collection with names, ages,
//! cities, interests and scores.

use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use serde_json::{Value as JsonValue, json};

use memdoc::{Document, Error, FindOptions, SortOrder, Store, Value};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn doc(v: JsonValue) -> Document {
    Document::from_json(v).unwrap()
}

fn pipeline(stages: JsonValue) -> Vec<Document> {
    stages
        .as_array()
        .unwrap()
        .iter()
        .map(|s| doc(s.clone()))
        .collect()
}

fn seeded_store() -> Store {
    let store = Store::new();
    let users = store.collection("users").unwrap();
    let result = users.insert_many(vec![
        doc(json!({"name": "Alice", "age": 30, "city": "New York",
                   "interests": ["reading", "hiking"], "scores": [8, 9, 7]})),
        doc(json!({"name": "Bob", "age": 25, "city": "Los Angeles",
                   "interests": ["gaming", "cooking"], "scores": [6, 7, 8]})),
        doc(json!({"name": "Charlie", "age": 35, "city": "New York",
                   "interests": ["reading", "cooking"], "scores": [9, 8, 9]})),
        doc(json!({"name": "Diana", "age": 28, "city": "Chicago",
                   "interests": ["hiking"], "scores": [7, 7, 6]})),
    ]);
    assert!(result.write_errors.is_empty());
    store
}

fn names(docs: impl IntoIterator<Item = Document>) -> Vec<String> {
    docs.into_iter()
        .filter_map(|d| d.get("name").and_then(Value::as_str).map(str::to_string))
        .collect()
}

// ---------------------------------------------------------------------------
// Insert / find
// ---------------------------------------------------------------------------

#[test]
fn insert_then_find_by_id_round_trips() {
    let store = Store::new();
    let col = store.collection("things").unwrap();
    let original = doc(json!({"name": "Widget", "tags": ["a", "b"], "dims": {"w": 2, "h": 3.5}}));
    let id = col.insert_one(original.clone()).unwrap();

    let mut found = col.find_one(&doc(json!({"_id": id.to_json()}))).unwrap().unwrap();
    assert_eq!(found.remove("_id"), Some(id));
    assert_eq!(found, original);
}

#[test]
fn duplicate_explicit_id_fails() {
    let store = Store::new();
    let col = store.collection("products").unwrap();
    col.insert_one(doc(json!({"_id": "P001", "price": 10}))).unwrap();
    let err = col.insert_one(doc(json!({"_id": "P001", "price": 12}))).unwrap_err();
    assert!(matches!(err, Error::DuplicateKey(_)));
    assert_eq!(col.count_documents(&doc(json!({}))).unwrap(), 1);
}

#[test]
fn insert_many_is_not_all_or_nothing() {
    let store = Store::new();
    let col = store.collection("products").unwrap();
    let result = col.insert_many(vec![
        doc(json!({"_id": "a"})),
        doc(json!({"_id": "a"})),
        doc(json!({"_id": "b"})),
    ]);
    assert_eq!(result.inserted_ids.len(), 2);
    assert_eq!(result.write_errors[0].index, 1);
    assert_eq!(col.estimated_document_count(), 2);
}

#[test]
fn implicit_array_membership() {
    let store = seeded_store();
    let users = store.collection("users").unwrap();
    let readers = users.find(&doc(json!({"interests": "reading"})), None).unwrap();
    assert_eq!(names(readers), ["Alice", "Charlie"]);

    let none = users
        .find(&doc(json!({"interests": {"$all": ["reading", "cooking"]}, "name": "Alice"})), None)
        .unwrap();
    assert_eq!(none.count(), 0);
    let charlie = users
        .find(&doc(json!({"interests": {"$all": ["cooking", "reading"]}})), None)
        .unwrap();
    assert_eq!(names(charlie), ["Charlie"]);
}

#[test]
fn in_and_ne_operators() {
    let store = seeded_store();
    let users = store.collection("users").unwrap();
    let in_cities = users
        .find(&doc(json!({"city": {"$in": ["Chicago", "Los Angeles"]}})), None)
        .unwrap();
    assert_eq!(names(in_cities), ["Bob", "Diana"]);

    let not_ny = users.find(&doc(json!({"city": {"$ne": "New York"}})), None).unwrap();
    assert_eq!(names(not_ny), ["Bob", "Diana"]);

    // missing field: only negations match
    assert_eq!(users.count_documents(&doc(json!({"email": {"$ne": "x"}}))).unwrap(), 4);
    assert_eq!(users.count_documents(&doc(json!({"email": {"$gt": ""}}))).unwrap(), 0);
}

#[test]
fn projection_with_sort_and_limit() {
    let store = seeded_store();
    let users = store.collection("users").unwrap();
    let opts = FindOptions {
        projection: Some(doc(json!({"name": 1, "age": 1, "_id": 0}))),
        sort: Some(vec![("age".to_string(), SortOrder::Desc)]),
        limit: Some(2),
        ..Default::default()
    };
    let found: Vec<Document> = users.find_with_options(&doc(json!({})), &opts).unwrap().collect();
    assert_eq!(
        found,
        vec![doc(json!({"name": "Charlie", "age": 35})), doc(json!({"name": "Alice", "age": 30}))]
    );
    let keys: Vec<&String> = found[0].keys().collect();
    assert_eq!(keys, ["name", "age"]);
}

#[test]
fn mixed_projection_is_rejected() {
    let store = seeded_store();
    let users = store.collection("users").unwrap();
    let err = users
        .find(&doc(json!({})), Some(&doc(json!({"name": 1, "city": 0}))))
        .err()
        .unwrap();
    assert!(matches!(err, Error::InvalidProjection(_)));
}

#[test]
fn slice_projection() {
    let store = seeded_store();
    let users = store.collection("users").unwrap();
    let found: Vec<Document> = users
        .find(&doc(json!({"name": "Alice"})), Some(&doc(json!({"scores": {"$slice": 2}}))))
        .unwrap()
        .collect();
    assert_eq!(found[0].get("scores"), Some(&Value::from(vec![Value::from(8), Value::from(9)])));
    assert!(found[0].contains_key("city"));
}

// ---------------------------------------------------------------------------
// Update
// ---------------------------------------------------------------------------

#[test]
fn inc_adds_and_rejects_strings() {
    let store = seeded_store();
    let users = store.collection("users").unwrap();
    let result = users
        .update_one(&doc(json!({"name": "Alice"})), &doc(json!({"$inc": {"age": 1}})))
        .unwrap();
    assert_eq!((result.matched_count, result.modified_count), (1, 1));
    let alice = users.find_one(&doc(json!({"name": "Alice"}))).unwrap().unwrap();
    assert_eq!(alice.get("age"), Some(&Value::Integer(31)));

    let err = users
        .update_one(&doc(json!({"name": "Alice"})), &doc(json!({"$inc": {"city": 1}})))
        .unwrap_err();
    assert!(matches!(err, Error::TypeMismatch(_)));
    let alice = users.find_one(&doc(json!({"name": "Alice"}))).unwrap().unwrap();
    assert_eq!(alice.get("city"), Some(&Value::from("New York")));
}

#[test]
fn set_twice_is_idempotent() {
    let store = seeded_store();
    let users = store.collection("users").unwrap();
    let filter = doc(json!({"city": "New York"}));
    let update = doc(json!({"$set": {"region": "east"}}));
    let first = users.update_many(&filter, &update).unwrap();
    assert_eq!((first.matched_count, first.modified_count), (2, 2));
    let second = users.update_many(&filter, &update).unwrap();
    assert_eq!((second.matched_count, second.modified_count), (2, 0));
}

#[test]
fn add_to_set_and_pull() {
    let store = seeded_store();
    let users = store.collection("users").unwrap();
    let bob = doc(json!({"name": "Bob"}));

    let dup = users
        .update_one(&bob, &doc(json!({"$addToSet": {"interests": "gaming"}})))
        .unwrap();
    assert_eq!(dup.modified_count, 0);

    users
        .update_one(&bob, &doc(json!({"$addToSet": {"interests": "chess"}, "$pull": {"scores": 7}})))
        .unwrap();
    let found = users.find_one(&bob).unwrap().unwrap();
    assert_eq!(
        found.get("interests"),
        Some(&Value::from(vec![Value::from("gaming"), Value::from("cooking"), Value::from("chess")]))
    );
    assert_eq!(found.get("scores"), Some(&Value::from(vec![Value::from(6), Value::from(8)])));

    let missing = users
        .update_one(&bob, &doc(json!({"$pull": {"nicknames": "bobby"}})))
        .unwrap();
    assert_eq!((missing.matched_count, missing.modified_count), (1, 0));
}

#[test]
fn update_many_reports_per_document_errors() {
    let store = Store::new();
    let col = store.collection("mixed").unwrap();
    col.insert_many(vec![
        doc(json!({"_id": 1, "tags": ["x"]})),
        doc(json!({"_id": 2, "tags": "x"})),
        doc(json!({"_id": 3})),
    ]);
    let result = col
        .update_many(&doc(json!({})), &doc(json!({"$addToSet": {"tags": "y"}})))
        .unwrap();
    assert_eq!((result.matched_count, result.modified_count), (3, 2));
    assert_eq!(result.write_errors.len(), 1);
    assert_eq!(result.write_errors[0].id, Some(Value::Integer(2)));
}

#[test]
fn far_array_index_update_fails_cleanly() {
    let store = Store::new();
    let col = store.collection("tagged").unwrap();
    col.insert_one(doc(json!({"_id": 1, "tags": ["a"]}))).unwrap();
    let err = col
        .update_one(&doc(json!({"_id": 1})), &doc(json!({"$set": {"tags.18446744073709551615": "x"}})))
        .unwrap_err();
    assert!(matches!(err, Error::TypeMismatch(_)));

    let result = col
        .update_one(&doc(json!({"_id": 1})), &doc(json!({"$set": {"tags.1": "b"}})))
        .unwrap();
    assert_eq!(result.modified_count, 1);
    let found = col.find_one(&doc(json!({"_id": 1}))).unwrap().unwrap();
    assert_eq!(found.get("tags"), Some(&Value::from(vec![Value::from("a"), Value::from("b")])));
}

#[test]
fn changing_id_is_rejected() {
    let store = seeded_store();
    let users = store.collection("users").unwrap();
    let err = users
        .update_one(&doc(json!({"name": "Bob"})), &doc(json!({"$set": {"_id": 5}})))
        .unwrap_err();
    assert!(matches!(err, Error::ImmutableField(_)));
}

// ---------------------------------------------------------------------------
// Delete
// ---------------------------------------------------------------------------

#[test]
fn delete_many_removes_exact_subset() {
    let store = seeded_store();
    let users = store.collection("users").unwrap();
    let result = users.delete_many(&doc(json!({"age": {"$lt": 30}}))).unwrap();
    assert_eq!(result.deleted_count, 2);
    assert_eq!(users.count_documents(&doc(json!({}))).unwrap(), 2);
    let left = users.find(&doc(json!({})), None).unwrap();
    assert_eq!(names(left), ["Alice", "Charlie"]);
}

#[test]
fn delete_one_removes_first_match() {
    let store = seeded_store();
    let users = store.collection("users").unwrap();
    let result = users.delete_one(&doc(json!({"city": "New York"}))).unwrap();
    assert_eq!(result.deleted_count, 1);
    let left = users.find(&doc(json!({"city": "New York"})), None).unwrap();
    assert_eq!(names(left), ["Charlie"]);
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

#[test]
fn group_average_in_first_seen_order() {
    let store = Store::new();
    let col = store.collection("people").unwrap();
    col.insert_many(vec![
        doc(json!({"city": "NY", "age": 30})),
        doc(json!({"city": "NY", "age": 20})),
        doc(json!({"city": "LA", "age": 40})),
    ]);
    let out = col
        .aggregate(&pipeline(json!([
            {"$group": {"_id": "$city", "avg": {"$avg": "$age"}}}
        ])))
        .unwrap();
    assert_eq!(
        out,
        vec![doc(json!({"_id": "NY", "avg": 25.0})), doc(json!({"_id": "LA", "avg": 40.0}))]
    );
}

#[test]
fn group_then_sort_by_count() {
    let store = seeded_store();
    let users = store.collection("users").unwrap();
    let out = users
        .aggregate(&pipeline(json!([
            {"$group": {"_id": "$city", "count": {"$sum": 1}, "avgAge": {"$avg": "$age"}}},
            {"$sort": {"count": -1}}
        ])))
        .unwrap();
    assert_eq!(out[0].get("_id"), Some(&Value::from("New York")));
    assert_eq!(out[0].get("count"), Some(&Value::Integer(2)));
    assert_eq!(out[0].get("avgAge"), Some(&Value::Float(32.5)));
    // ties keep first-seen order
    assert_eq!(out[1].get("_id"), Some(&Value::from("Los Angeles")));
    assert_eq!(out[2].get("_id"), Some(&Value::from("Chicago")));
}

#[test]
fn unwind_fans_out_and_drops_missing() {
    let store = Store::new();
    let col = store.collection("posts").unwrap();
    col.insert_many(vec![
        doc(json!({"title": "a", "tags": ["x", "y"]})),
        doc(json!({"title": "b", "tags": []})),
        doc(json!({"title": "c"})),
    ]);
    let out = col
        .aggregate(&pipeline(json!([{"$unwind": "$tags"}, {"$project": {"_id": 0}}])))
        .unwrap();
    assert_eq!(
        out,
        vec![doc(json!({"title": "a", "tags": "x"})), doc(json!({"title": "a", "tags": "y"}))]
    );

    let preserved = col
        .aggregate(&pipeline(json!([
            {"$unwind": {"path": "$tags", "preserveNullAndEmptyArrays": true}}
        ])))
        .unwrap();
    assert_eq!(preserved.len(), 4);
}

#[test]
fn sort_is_stable() {
    let store = Store::new();
    let col = store.collection("s").unwrap();
    col.insert_many(vec![
        doc(json!({"k": 2, "tag": "first"})),
        doc(json!({"k": 1, "tag": "x"})),
        doc(json!({"k": 2, "tag": "second"})),
        doc(json!({"k": 2, "tag": "third"})),
    ]);
    let out = col.aggregate(&pipeline(json!([{"$sort": {"k": 1}}]))).unwrap();
    let tags: Vec<&str> = out.iter().filter_map(|d| d.get("tag").and_then(Value::as_str)).collect();
    assert_eq!(tags, ["x", "first", "second", "third"]);
}

#[test]
fn project_with_filter_expression() {
    let store = seeded_store();
    let users = store.collection("users").unwrap();
    let out = users
        .aggregate(&pipeline(json!([
            {"$project": {
                "_id": 0,
                "name": 1,
                "highScores": {"$filter": {
                    "input": "$scores",
                    "as": "score",
                    "cond": {"$gt": ["$$score", 7]}
                }}
            }},
            {"$match": {"highScores": {"$ne": []}}}
        ])))
        .unwrap();
    assert_eq!(names(out.clone()), ["Alice", "Bob", "Charlie"]);
    assert_eq!(
        out[2].get("highScores"),
        Some(&Value::from(vec![Value::from(9), Value::from(8), Value::from(9)]))
    );
}

#[test]
fn multiply_inside_group() {
    let store = Store::new();
    let orders = store.collection("orders").unwrap();
    orders.insert_many(vec![
        doc(json!({"product": "pen", "qty": 3, "price": 1.5})),
        doc(json!({"product": "book", "qty": 1, "price": 12})),
        doc(json!({"product": "pen", "qty": 2, "price": 1.5})),
    ]);
    let out = orders
        .aggregate(&pipeline(json!([
            {"$group": {"_id": "$product", "revenue": {"$sum": {"$multiply": ["$qty", "$price"]}}}},
            {"$sort": {"revenue": -1}}
        ])))
        .unwrap();
    assert_eq!(out[0].get("_id"), Some(&Value::from("book")));
    assert_eq!(out[1].get("revenue"), Some(&Value::Float(7.5)));
}

#[test]
fn aggregation_error_names_stage() {
    let store = seeded_store();
    let users = store.collection("users").unwrap();
    let err = users
        .aggregate(&pipeline(json!([
            {"$sort": {"age": 1}},
            {"$addFields": {"bad": {"$multiply": ["$city", 2]}}}
        ])))
        .unwrap_err();
    assert_eq!(err.stage(), Some(1));
    assert!(matches!(err, Error::Aggregation { ref name, .. } if name == "$addFields"));
}

#[test]
fn malformed_pipeline_is_rejected_at_parse() {
    let store = seeded_store();
    let users = store.collection("users").unwrap();
    let err = users.aggregate(&pipeline(json!([{"$explode": {}}]))).unwrap_err();
    assert!(matches!(err, Error::InvalidPipeline(_)));
}

#[test]
fn aggregate_leaves_source_untouched() {
    let store = seeded_store();
    let users = store.collection("users").unwrap();
    let before: Vec<Document> = users.find(&doc(json!({})), None).unwrap().collect();
    users
        .aggregate(&pipeline(json!([
            {"$unwind": "$scores"},
            {"$set": {"name": "changed"}},
            {"$limit": 1}
        ])))
        .unwrap();
    let after: Vec<Document> = users.find(&doc(json!({})), None).unwrap().collect();
    assert_eq!(before, after);
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[test]
fn concurrent_writers_and_readers() {
    let store = Arc::new(Store::new());
    let counter = store.collection("counter").unwrap();
    counter.insert_one(doc(json!({"_id": "c", "n": 0}))).unwrap();

    let mut handles = Vec::new();
    for t in 0..4 {
        let store = Arc::clone(&store);
        handles.push(thread::spawn(move || {
            let events = store.collection("events").unwrap();
            let counter = store.collection("counter").unwrap();
            for i in 0..50 {
                events.insert_one(doc(json!({"thread": t, "i": i}))).unwrap();
                counter
                    .update_one(&doc(json!({"_id": "c"})), &doc(json!({"$inc": {"n": 1}})))
                    .unwrap();
                let seen = events.count_documents(&doc(json!({"thread": t}))).unwrap();
                assert_eq!(seen, i + 1);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let events = store.collection("events").unwrap();
    assert_eq!(events.estimated_document_count(), 200);
    let c = counter.find_one(&doc(json!({"_id": "c"}))).unwrap().unwrap();
    assert_eq!(c.get("n"), Some(&Value::Integer(200)));
}

#[test]
fn cursor_blocks_writers_until_dropped() {
    let store = Arc::new(seeded_store());
    let users = store.collection("users").unwrap();
    let cursor = users.find(&doc(json!({})), None).unwrap();

    let writer = {
        let users = users.clone();
        thread::spawn(move || {
            users.insert_one(doc(json!({"name": "Eve"}))).unwrap();
        })
    };
    // the writer cannot commit while the cursor holds its read lock
    let seen = names(cursor);
    assert_eq!(seen.len(), 4);
    writer.join().unwrap();
    assert_eq!(users.estimated_document_count(), 5);
}

#[test]
fn reads_while_holding_cursor_do_not_wait_for_queued_writer() {
    let store = Arc::new(seeded_store());
    let users = store.collection("users").unwrap();
    let (opened_tx, opened_rx) = mpsc::channel();
    let (queued_tx, queued_rx) = mpsc::channel::<()>();
    let (done_tx, done_rx) = mpsc::channel();

    let reader = {
        let users = users.clone();
        thread::spawn(move || {
            let mut cursor = users.find(&doc(json!({})), None).unwrap();
            let first = cursor.next().unwrap();
            opened_tx.send(()).unwrap();
            queued_rx.recv().unwrap();
            // give the writer time to park on the lock
            thread::sleep(Duration::from_millis(100));

            let count = users.count_documents(&doc(json!({}))).unwrap();
            let bob = users.find_one(&doc(json!({"name": "Bob"}))).unwrap();
            let again = users.find(&doc(json!({"age": {"$gt": 29}})), None).unwrap().count();
            let grouped = users
                .aggregate(&pipeline(json!([{"$group": {"_id": null, "n": {"$sum": 1}}}])))
                .unwrap();
            let rest = cursor.count();
            done_tx
                .send((first, count, bob.is_some(), again, grouped.len(), rest))
                .unwrap();
        })
    };

    opened_rx.recv().unwrap();
    let writer = {
        let users = users.clone();
        thread::spawn(move || {
            queued_tx.send(()).unwrap();
            users.insert_one(doc(json!({"name": "Eve"}))).unwrap();
        })
    };

    let (first, count, found_bob, again, groups, rest) = done_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("reads behind a queued writer did not complete");
    assert_eq!(first.get("name"), Some(&Value::from("Alice")));
    assert_eq!((count, found_bob, again, groups, rest), (4, true, 2, 1, 3));

    reader.join().unwrap();
    writer.join().unwrap();
    assert_eq!(users.estimated_document_count(), 5);
}
