//! The per-table metadata record and its binary codec.
//!
//! A [`Table`] is the unit the registry tracks: identity (uid, tid, name),
//! an atomic in-flight use-count, and a kind-specific payload. Normal and
//! stream tables own their schema history; super tables additionally own a
//! tag schema and the secondary index over their children; child tables own
//! only a tag-value row and the uid of their super.
//!
//! The codec here produces the UpdateMeta payload persisted to the action
//! log: little-endian fixed-width integers, strings as u16-length + bytes.
//! Decoding a super eagerly builds an empty tag index; the child-to-super
//! link is not established at decode time but by the reorg pass once every
//! record has been replayed.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;

use bytes::BufMut;
use log::trace;

use crate::codec::{self, CodecError, CodecResult};
use crate::error::{InvalidCreateMessageSnafu, MetaError, MetaResult};
use crate::schema::{Schema, SchemaHistory, MAX_TABLE_SCHEMAS};
use crate::table_cfg::TableCfg;
use crate::tag_index::TagIndex;
use crate::tag_row::TagRow;

/// Globally unique 64-bit table identifier.
pub type Uid = u64;

/// Shard-local numeric table id; index into the registry's slot array.
pub type Tid = i32;

/// Sentinel tid carried by super tables, which own no slot.
pub const TID_SUPER: Tid = -1;

/// Sentinel for "no super table"; never a valid super uid.
pub const INVALID_SUPER_UID: Uid = 0;

/// Index of the designated tag column within a tag schema.
pub const TAG_INDEX_COLUMN: usize = 0;

/// Initial value of a table's ingestion high-water mark.
pub const LAST_KEY_INITIAL: i64 = i64::MIN;

/// The kind of a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    /// Standalone table owning its schema history and row data.
    Normal,
    /// Template for a family of children; owns schema history, tag schema,
    /// and the tag index. No rows, no tid slot.
    Super,
    /// Instance of a super; owns a tag-value row and points at its super.
    Child,
    /// Normal-shaped table materialized by a continuous query.
    Stream,
}

impl TableKind {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            TableKind::Normal => 0,
            TableKind::Super => 1,
            TableKind::Child => 2,
            TableKind::Stream => 3,
        }
    }

    pub(crate) fn from_u8(value: u8) -> CodecResult<Self> {
        Ok(match value {
            0 => TableKind::Normal,
            1 => TableKind::Super,
            2 => TableKind::Child,
            3 => TableKind::Stream,
            other => {
                return Err(CodecError::InvalidTag {
                    what: "table kind",
                    value: other,
                })
            }
        })
    }
}

/// Kind-specific payload of a table.
#[derive(Debug)]
pub(crate) enum TableDetail {
    Normal {
        schemas: SchemaHistory,
    },
    Super {
        schemas: SchemaHistory,
        tag_schema: Arc<Schema>,
        index: TagIndex,
    },
    Child {
        super_uid: Uid,
        tag_values: TagRow,
    },
    Stream {
        schemas: SchemaHistory,
        sql: String,
    },
}

/// A registered table's metadata record.
#[derive(Debug)]
pub struct Table {
    uid: Uid,
    tid: Tid,
    name: String,
    refs: AtomicU32,
    last_key: AtomicI64,
    pub(crate) detail: TableDetail,
}

impl Table {
    /// Construct a table from a configuration descriptor.
    ///
    /// With `as_super` the kind is forced to [`TableKind::Super`]: identity
    /// comes from `super_name`/`super_uid`, the tid is the sentinel, and a
    /// fresh empty tag index is created. Otherwise the kind is taken from
    /// the descriptor; children duplicate the tag-value row and receive no
    /// schema of their own, streams duplicate the query text.
    pub fn new(cfg: &TableCfg, as_super: bool) -> MetaResult<Table> {
        let detail;
        let uid;
        let tid;
        let name;

        if as_super {
            name = cfg
                .super_name()
                .ok_or_else(|| missing("superName"))?
                .to_string();
            uid = cfg.super_uid().ok_or_else(|| missing("superUid"))?;
            tid = TID_SUPER;
            let schema = cfg.schema().ok_or_else(|| missing("schema"))?;
            let tag_schema = cfg.tag_schema().ok_or_else(|| missing("tagSchema"))?;
            if tag_schema.ncols() == 0 {
                return InvalidCreateMessageSnafu {
                    reason: "tag schema declares no columns".to_string(),
                }
                .fail();
            }
            detail = TableDetail::Super {
                schemas: SchemaHistory::seed(Arc::clone(schema)),
                tag_schema: Arc::clone(tag_schema),
                index: TagIndex::new(),
            };
        } else {
            name = cfg.name().ok_or_else(|| missing("name"))?.to_string();
            uid = cfg.uid();
            tid = cfg.tid();
            detail = match cfg.kind() {
                TableKind::Child => TableDetail::Child {
                    super_uid: cfg.super_uid().ok_or_else(|| missing("superUid"))?,
                    tag_values: cfg.tag_values().cloned().unwrap_or_default(),
                },
                TableKind::Normal => TableDetail::Normal {
                    schemas: SchemaHistory::seed(Arc::clone(
                        cfg.schema().ok_or_else(|| missing("schema"))?,
                    )),
                },
                TableKind::Stream => TableDetail::Stream {
                    schemas: SchemaHistory::seed(Arc::clone(
                        cfg.schema().ok_or_else(|| missing("schema"))?,
                    )),
                    sql: cfg.sql().ok_or_else(|| missing("sql"))?.to_string(),
                },
                TableKind::Super => {
                    return InvalidCreateMessageSnafu {
                        reason: "super tables are created implicitly".to_string(),
                    }
                    .fail()
                }
            };
        }

        Ok(Table {
            uid,
            tid,
            name,
            refs: AtomicU32::new(1),
            last_key: AtomicI64::new(LAST_KEY_INITIAL),
            detail,
        })
    }

    /// The table's globally unique id.
    pub fn uid(&self) -> Uid {
        self.uid
    }

    /// The table's shard-local id, or [`TID_SUPER`] for a super table.
    pub fn tid(&self) -> Tid {
        self.tid
    }

    /// The table name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The table kind.
    pub fn kind(&self) -> TableKind {
        match self.detail {
            TableDetail::Normal { .. } => TableKind::Normal,
            TableDetail::Super { .. } => TableKind::Super,
            TableDetail::Child { .. } => TableKind::Child,
            TableDetail::Stream { .. } => TableKind::Stream,
        }
    }

    /// Current in-flight use-count.
    pub fn refs(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    /// Ingestion high-water mark.
    pub fn last_key(&self) -> i64 {
        self.last_key.load(Ordering::Acquire)
    }

    /// Raise the ingestion high-water mark if `key` is newer.
    pub fn update_last_key(&self, key: i64) {
        self.last_key.fetch_max(key, Ordering::AcqRel);
    }

    /// The uid of a child's super table.
    pub fn super_uid(&self) -> Option<Uid> {
        match &self.detail {
            TableDetail::Child { super_uid, .. } => Some(*super_uid),
            _ => None,
        }
    }

    /// The source query of a stream table.
    pub fn sql(&self) -> Option<&str> {
        match &self.detail {
            TableDetail::Stream { sql, .. } => Some(sql),
            _ => None,
        }
    }

    /// The schema history of a non-child table.
    pub fn schemas(&self) -> Option<&SchemaHistory> {
        match &self.detail {
            TableDetail::Normal { schemas }
            | TableDetail::Super { schemas, .. }
            | TableDetail::Stream { schemas, .. } => Some(schemas),
            TableDetail::Child { .. } => None,
        }
    }

    /// The tag schema of a super table.
    pub fn tag_schema(&self) -> Option<&Arc<Schema>> {
        match &self.detail {
            TableDetail::Super { tag_schema, .. } => Some(tag_schema),
            _ => None,
        }
    }

    /// The tag-value row of a child table.
    pub fn tag_values(&self) -> Option<&TagRow> {
        match &self.detail {
            TableDetail::Child { tag_values, .. } => Some(tag_values),
            _ => None,
        }
    }

    /// The tag index of a super table.
    pub fn tag_index(&self) -> Option<&TagIndex> {
        match &self.detail {
            TableDetail::Super { index, .. } => Some(index),
            _ => None,
        }
    }

    pub(crate) fn acquire(&self) -> u32 {
        self.refs.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn release(&self) -> u32 {
        let prev = self.refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "use-count underflow on table {}", self.uid);
        prev.saturating_sub(1)
    }

    pub(crate) fn schemas_mut(&mut self) -> Option<&mut SchemaHistory> {
        match &mut self.detail {
            TableDetail::Normal { schemas }
            | TableDetail::Super { schemas, .. }
            | TableDetail::Stream { schemas, .. } => Some(schemas),
            TableDetail::Child { .. } => None,
        }
    }

    pub(crate) fn tag_index_mut(&mut self) -> Option<&mut TagIndex> {
        match &mut self.detail {
            TableDetail::Super { index, .. } => Some(index),
            _ => None,
        }
    }

    pub(crate) fn tag_values_mut(&mut self) -> Option<&mut TagRow> {
        match &mut self.detail {
            TableDetail::Child { tag_values, .. } => Some(tag_values),
            _ => None,
        }
    }

    pub(crate) fn replace_tag_schema(&mut self, schema: Arc<Schema>) {
        if let TableDetail::Super { tag_schema, .. } = &mut self.detail {
            *tag_schema = schema;
        }
    }

    /// Encode the table into the UpdateMeta payload layout.
    pub(crate) fn encode(&self, buf: &mut Vec<u8>) {
        buf.put_u8(self.kind().as_u8());
        codec::put_str16_le(buf, &self.name);
        buf.put_u64_le(self.uid);
        buf.put_i32_le(self.tid);

        match &self.detail {
            TableDetail::Child {
                super_uid,
                tag_values,
            } => {
                buf.put_u64_le(*super_uid);
                tag_values.encode(buf);
            }
            TableDetail::Normal { schemas } => {
                encode_history(buf, schemas);
            }
            TableDetail::Super {
                schemas,
                tag_schema,
                ..
            } => {
                encode_history(buf, schemas);
                tag_schema.encode(buf);
            }
            TableDetail::Stream { schemas, sql } => {
                encode_history(buf, schemas);
                codec::put_str16_le(buf, sql);
            }
        }
    }

    /// Decode a table from an UpdateMeta payload.
    pub(crate) fn decode(buf: &mut &[u8]) -> CodecResult<Table> {
        let kind = TableKind::from_u8(codec::get_u8(buf)?)?;
        let name = codec::get_str16_le(buf)?;
        let uid = codec::get_u64_le(buf)?;
        let tid = codec::get_i32_le(buf)?;

        let detail = match kind {
            TableKind::Child => {
                let super_uid = codec::get_u64_le(buf)?;
                let tag_values = TagRow::decode(buf)?;
                TableDetail::Child {
                    super_uid,
                    tag_values,
                }
            }
            TableKind::Normal => TableDetail::Normal {
                schemas: decode_history(buf)?,
            },
            TableKind::Super => {
                let schemas = decode_history(buf)?;
                let tag_schema = Arc::new(Schema::decode(buf)?);
                TableDetail::Super {
                    schemas,
                    tag_schema,
                    index: TagIndex::new(),
                }
            }
            TableKind::Stream => {
                let schemas = decode_history(buf)?;
                let sql = codec::get_str16_le(buf)?;
                TableDetail::Stream { schemas, sql }
            }
        };

        trace!("table {name} uid {uid} tid {tid} decoded");

        Ok(Table {
            uid,
            tid,
            name,
            refs: AtomicU32::new(1),
            last_key: AtomicI64::new(LAST_KEY_INITIAL),
            detail,
        })
    }
}

fn encode_history(buf: &mut Vec<u8>, schemas: &SchemaHistory) {
    buf.put_u8(schemas.len() as u8);
    for schema in schemas.entries() {
        schema.encode(buf);
    }
}

fn decode_history(buf: &mut &[u8]) -> CodecResult<SchemaHistory> {
    let n = codec::get_u8(buf)? as usize;
    if n == 0 || n > MAX_TABLE_SCHEMAS {
        return Err(CodecError::InvalidTag {
            what: "schema count",
            value: n as u8,
        });
    }
    let mut entries = Vec::with_capacity(n);
    for _ in 0..n {
        entries.push(Arc::new(Schema::decode(buf)?));
    }
    SchemaHistory::from_entries(entries).ok_or(CodecError::InvalidTag {
        what: "schema count",
        value: 0,
    })
}

/// Structural equality over the encoded fields: identity, schemas, tag
/// schema, tag values, super link, and query text. The use-count, the
/// ingestion high-water mark, and the derived tag index are excluded.
impl PartialEq for Table {
    fn eq(&self, other: &Self) -> bool {
        if self.uid != other.uid || self.tid != other.tid || self.name != other.name {
            return false;
        }
        match (&self.detail, &other.detail) {
            (TableDetail::Normal { schemas: a }, TableDetail::Normal { schemas: b }) => a == b,
            (
                TableDetail::Super {
                    schemas: a,
                    tag_schema: ta,
                    ..
                },
                TableDetail::Super {
                    schemas: b,
                    tag_schema: tb,
                    ..
                },
            ) => a == b && ta == tb,
            (
                TableDetail::Child {
                    super_uid: sa,
                    tag_values: va,
                },
                TableDetail::Child {
                    super_uid: sb,
                    tag_values: vb,
                },
            ) => sa == sb && va == vb,
            (
                TableDetail::Stream {
                    schemas: a,
                    sql: qa,
                },
                TableDetail::Stream {
                    schemas: b,
                    sql: qb,
                },
            ) => a == b && qa == qb,
            _ => false,
        }
    }
}

fn missing(field: &str) -> MetaError {
    InvalidCreateMessageSnafu {
        reason: format!("missing required field {field}"),
    }
    .build()
}
