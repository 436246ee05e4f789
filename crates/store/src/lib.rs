pub mod connection;
pub mod memory;
pub mod migrations;
pub mod record;
pub mod sqlite;
mod watchers;

pub use connection::{connect, connect_with_settings, DbPool};
pub use memory::MemoryStore;
pub use record::{
    decode_doc, encode_doc, Collection, DocWatcher, Filter, OrderBy, QueryWatcher, RecordStore,
    StoreError, VersionedDoc,
};
pub use sqlite::SqliteStore;
