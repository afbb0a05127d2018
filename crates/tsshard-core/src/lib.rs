//! Table metadata core for a tsshard storage shard.
//!
//! Within one storage shard ("repository"), this crate is the authoritative
//! in-memory registry of every table and of the schema history by which
//! their rows are decoded. It keeps four coupled views of the same tables
//! consistent under concurrent readers and writers — a dense tid slot
//! array, a uid map, the super-table list, and each super's secondary
//! index on its designated tag column — persists every mutation through a
//! checksummed action log, and rebuilds itself from that log at startup.
//!
//! Responsibilities (high level):
//! - Column schemas, the bounded schema history, and tag-value rows with
//!   their binary codecs ([`schema`], [`tag_row`]).
//! - The per-table record and factory ([`table`]), configured through a
//!   kind-checked descriptor parsed from network-order messages
//!   ([`table_cfg`]).
//! - The shard-wide registry with its running buffer-sizing maxima
//!   ([`meta`]) and the per-super tag index ([`tag_index`]).
//! - Checksummed action records ([`action`]), the file-backed key-value
//!   log store that folds them by uid ([`log_store`]), and the open /
//!   commit / close driver that binds registry and store ([`repo`]).
//!
//! Row data, query execution, and the transport delivering create/update
//! messages live in the hosting repository; they reach this crate only
//! through [`repo::MetaHooks`] and the message parsers.
pub mod action;
mod codec;
pub mod config;
pub mod error;
pub mod log_store;
pub mod meta;
pub mod repo;
pub mod schema;
pub mod storage;
pub mod table;
pub mod table_cfg;
pub mod tag_index;
pub mod tag_row;

pub use action::{ActionRecord, MetaAction};
pub use config::ShardConfig;
pub use error::{MetaError, MetaResult};
pub use log_store::MetaLogStore;
pub use meta::{Meta, TableId};
pub use repo::{MetaHooks, NoopHooks, ShardMeta};
pub use schema::{
    ColId, ColumnSchema, ColumnType, Schema, SchemaBuilder, SchemaHistory, SchemaVersion,
    MAX_TABLE_SCHEMAS,
};
pub use storage::StorageError;
pub use table::{
    Table, TableKind, Tid, Uid, INVALID_SUPER_UID, LAST_KEY_INITIAL, TAG_INDEX_COLUMN, TID_SUPER,
};
pub use table_cfg::{CreateTableMsg, TableCfg, UpdateTagValMsg, MAX_TABLE_NAME_LEN};
pub use tag_index::TagIndex;
pub use tag_row::{encode_var_value, var_value_len, TagRow, TagRowBuilder};
