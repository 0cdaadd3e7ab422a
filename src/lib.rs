pub mod collection;
pub mod config;
pub mod document;
pub mod engine;
pub mod error;
pub mod expression;
pub mod pipeline;
pub mod projection;
pub mod query;
pub mod update;
pub mod value;

pub use collection::{Collection, DeleteResult, InsertManyResult, UpdateResult, WriteError};
pub use config::StoreConfig;
pub use document::{Document, ID_FIELD};
pub use engine::{CollectionHandle, Cursor, Store};
pub use error::{Error, Result};
pub use pipeline::Pipeline;
pub use query::{FindOptions, Filter, SortOrder};
pub use update::UpdateSpec;
pub use value::{ObjectId, Value};
