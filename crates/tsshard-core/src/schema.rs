//! Column schemas, the versioned schema history, and their binary codec.
//!
//! A [`Schema`] is an ordered list of typed columns stamped with a version.
//! Non-child tables carry a [`SchemaHistory`]: a newest-last sequence of
//! schemas bounded by [`MAX_TABLE_SCHEMAS`], evicted FIFO, with strictly
//! increasing (not necessarily contiguous) versions. Rows persisted under an
//! older version stay decodable as long as that version is still in the
//! history.
//!
//! Pure data; no I/O happens here.

use std::sync::Arc;

use bytes::BufMut;
use snafu::Snafu;

use crate::codec::{self, CodecError, CodecResult};

/// Shard-local column identifier.
pub type ColId = i16;

/// Schema version number. Strictly increasing within a history.
pub type SchemaVersion = i32;

/// Maximum number of schemas retained per table before FIFO eviction.
pub const MAX_TABLE_SCHEMAS: usize = 16;

/// The value type of a column.
///
/// `Binary` and `NChar` are variable-length: their payloads embed a `u16`
/// length that must be strictly less than the schema-declared width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    /// Boolean, 1 byte.
    Bool,
    /// 8-bit signed integer.
    TinyInt,
    /// 16-bit signed integer.
    SmallInt,
    /// 32-bit signed integer.
    Int,
    /// 64-bit signed integer.
    BigInt,
    /// 32-bit floating point.
    Float,
    /// 64-bit floating point.
    Double,
    /// 64-bit epoch timestamp.
    Timestamp,
    /// Variable-length byte string.
    Binary,
    /// Variable-length unicode string.
    NChar,
}

impl ColumnType {
    /// Whether payloads of this type carry an embedded length.
    pub fn is_var_len(self) -> bool {
        matches!(self, ColumnType::Binary | ColumnType::NChar)
    }

    pub(crate) fn as_u8(self) -> u8 {
        match self {
            ColumnType::Bool => 0,
            ColumnType::TinyInt => 1,
            ColumnType::SmallInt => 2,
            ColumnType::Int => 3,
            ColumnType::BigInt => 4,
            ColumnType::Float => 5,
            ColumnType::Double => 6,
            ColumnType::Timestamp => 7,
            ColumnType::Binary => 8,
            ColumnType::NChar => 9,
        }
    }

    pub(crate) fn from_u8(value: u8) -> CodecResult<Self> {
        Ok(match value {
            0 => ColumnType::Bool,
            1 => ColumnType::TinyInt,
            2 => ColumnType::SmallInt,
            3 => ColumnType::Int,
            4 => ColumnType::BigInt,
            5 => ColumnType::Float,
            6 => ColumnType::Double,
            7 => ColumnType::Timestamp,
            8 => ColumnType::Binary,
            9 => ColumnType::NChar,
            other => {
                return Err(CodecError::InvalidTag {
                    what: "column type",
                    value: other,
                })
            }
        })
    }
}

/// One column of a schema: id, type, and declared width in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnSchema {
    /// Shard-local column id, unique within the schema.
    pub col_id: ColId,
    /// Value type.
    pub ty: ColumnType,
    /// Declared width in bytes. For variable-length types this is the
    /// maximum payload size including the embedded length prefix.
    pub bytes: u16,
}

/// An ordered, versioned collection of columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    version: SchemaVersion,
    cols: Vec<ColumnSchema>,
}

/// Errors raised while building a schema.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
pub enum SchemaBuildError {
    /// Two columns were declared with the same id.
    #[snafu(display("duplicate column id {col_id}"))]
    DuplicateColumnId {
        /// The duplicated column id.
        col_id: ColId,
    },

    /// A schema must declare at least one column.
    #[snafu(display("schema version {version} has no columns"))]
    Empty {
        /// The version of the offending schema.
        version: SchemaVersion,
    },
}

impl Schema {
    /// The schema version.
    pub fn version(&self) -> SchemaVersion {
        self.version
    }

    /// Number of columns.
    pub fn ncols(&self) -> usize {
        self.cols.len()
    }

    /// Borrow the columns in declaration order.
    pub fn cols(&self) -> &[ColumnSchema] {
        &self.cols
    }

    /// Column at a positional index.
    pub fn col_at(&self, idx: usize) -> Option<&ColumnSchema> {
        self.cols.get(idx)
    }

    /// Column with the given id, if declared.
    pub fn col_by_id(&self, col_id: ColId) -> Option<&ColumnSchema> {
        self.cols.iter().find(|c| c.col_id == col_id)
    }

    /// Upper bound on the byte size of a row under this schema: the sum of
    /// all declared column widths. Used by the write path to size buffers.
    pub fn row_bytes(&self) -> usize {
        self.cols.iter().map(|c| c.bytes as usize).sum()
    }

    pub(crate) fn encode(&self, buf: &mut Vec<u8>) {
        buf.put_i32_le(self.version);
        buf.put_i16_le(self.cols.len() as i16);
        for col in &self.cols {
            buf.put_u8(col.ty.as_u8());
            buf.put_i16_le(col.col_id);
            buf.put_u16_le(col.bytes);
        }
    }

    pub(crate) fn decode(buf: &mut &[u8]) -> CodecResult<Schema> {
        let version = codec::get_i32_le(buf)?;
        let ncols = codec::get_i16_le(buf)?.max(0) as usize;
        let mut cols = Vec::with_capacity(ncols);
        for _ in 0..ncols {
            let ty = ColumnType::from_u8(codec::get_u8(buf)?)?;
            let col_id = codec::get_i16_le(buf)?;
            let bytes = codec::get_u16_le(buf)?;
            cols.push(ColumnSchema { col_id, ty, bytes });
        }
        Ok(Schema { version, cols })
    }
}

/// Builder for [`Schema`], rejecting duplicate column ids at build time.
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    version: SchemaVersion,
    cols: Vec<ColumnSchema>,
}

impl SchemaBuilder {
    /// Start a schema at the given version.
    pub fn new(version: SchemaVersion) -> Self {
        Self {
            version,
            cols: Vec::new(),
        }
    }

    /// Reset the builder for another schema, keeping the allocation.
    pub fn reset(&mut self, version: SchemaVersion) {
        self.version = version;
        self.cols.clear();
    }

    /// Append a column.
    pub fn add_col(&mut self, col_id: ColId, ty: ColumnType, bytes: u16) -> &mut Self {
        self.cols.push(ColumnSchema { col_id, ty, bytes });
        self
    }

    /// Validate and produce the schema.
    pub fn build(&mut self) -> Result<Schema, SchemaBuildError> {
        if self.cols.is_empty() {
            return Err(SchemaBuildError::Empty {
                version: self.version,
            });
        }
        for (i, col) in self.cols.iter().enumerate() {
            if self.cols[..i].iter().any(|c| c.col_id == col.col_id) {
                return Err(SchemaBuildError::DuplicateColumnId { col_id: col.col_id });
            }
        }
        Ok(Schema {
            version: self.version,
            cols: std::mem::take(&mut self.cols),
        })
    }
}

/// Newest-last sequence of schemas with FIFO eviction.
#[derive(Debug, Clone)]
pub struct SchemaHistory {
    entries: Vec<Arc<Schema>>,
}

impl SchemaHistory {
    /// Start a history from its first schema. A history is never empty.
    pub fn seed(first: Arc<Schema>) -> Self {
        Self {
            entries: vec![first],
        }
    }

    /// Number of retained schemas.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Histories are non-empty by construction; kept for API symmetry.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The newest schema.
    pub fn latest(&self) -> &Arc<Schema> {
        // Invariant: entries is non-empty.
        &self.entries[self.entries.len() - 1]
    }

    /// Exact-version lookup via binary search over the sorted versions.
    pub fn by_version(&self, version: SchemaVersion) -> Option<Arc<Schema>> {
        self.entries
            .binary_search_by(|s| s.version().cmp(&version))
            .ok()
            .map(|idx| Arc::clone(&self.entries[idx]))
    }

    /// Versions currently retained, oldest first.
    pub fn versions(&self) -> Vec<SchemaVersion> {
        self.entries.iter().map(|s| s.version()).collect()
    }

    /// Append a strictly newer schema, evicting the oldest entry when the
    /// history is full. Returns false (and changes nothing) when the
    /// candidate is not newer than the current latest.
    pub fn push(&mut self, schema: Arc<Schema>) -> bool {
        if schema.version() <= self.latest().version() {
            return false;
        }
        if self.entries.len() == MAX_TABLE_SCHEMAS {
            self.entries.remove(0);
        }
        self.entries.push(schema);
        true
    }

    pub(crate) fn entries(&self) -> &[Arc<Schema>] {
        &self.entries
    }

    pub(crate) fn from_entries(entries: Vec<Arc<Schema>>) -> Option<Self> {
        if entries.is_empty() {
            return None;
        }
        Some(Self { entries })
    }
}

impl PartialEq for SchemaHistory {
    fn eq(&self, other: &Self) -> bool {
        self.entries.len() == other.entries.len()
            && self
                .entries
                .iter()
                .zip(other.entries.iter())
                .all(|(a, b)| a == b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(version: SchemaVersion, ncols: usize) -> Arc<Schema> {
        let mut b = SchemaBuilder::new(version);
        b.add_col(1, ColumnType::Timestamp, 8);
        for i in 1..ncols {
            b.add_col(1 + i as ColId, ColumnType::Int, 4);
        }
        Arc::new(b.build().expect("valid schema"))
    }

    #[test]
    fn builder_rejects_duplicate_column_ids() {
        let mut b = SchemaBuilder::new(1);
        b.add_col(1, ColumnType::Timestamp, 8);
        b.add_col(1, ColumnType::Int, 4);

        let err = b.build().expect_err("duplicate ids");
        assert_eq!(err, SchemaBuildError::DuplicateColumnId { col_id: 1 });
    }

    #[test]
    fn builder_rejects_empty_schema() {
        let err = SchemaBuilder::new(3).build().expect_err("no columns");
        assert_eq!(err, SchemaBuildError::Empty { version: 3 });
    }

    #[test]
    fn row_bytes_sums_declared_widths() {
        let s = schema(1, 3);
        assert_eq!(s.row_bytes(), 8 + 4 + 4);
        assert_eq!(s.ncols(), 3);
    }

    #[test]
    fn schema_binary_roundtrip() {
        let mut b = SchemaBuilder::new(9);
        b.add_col(1, ColumnType::Timestamp, 8);
        b.add_col(2, ColumnType::Binary, 32);
        let s = b.build().expect("valid schema");

        let mut buf = Vec::new();
        s.encode(&mut buf);

        let mut rd: &[u8] = &buf;
        let decoded = Schema::decode(&mut rd).expect("decode");
        assert_eq!(decoded, s);
        assert!(rd.is_empty());
    }

    #[test]
    fn decode_rejects_unknown_column_type() {
        let mut buf = Vec::new();
        schema(1, 1).encode(&mut buf);
        buf[6] = 0xff; // first column's type tag

        let mut rd: &[u8] = &buf;
        assert!(matches!(
            Schema::decode(&mut rd),
            Err(CodecError::InvalidTag { .. })
        ));
    }

    #[test]
    fn history_push_requires_strictly_newer_version() {
        let mut h = SchemaHistory::seed(schema(5, 2));

        assert!(!h.push(schema(5, 2)));
        assert!(!h.push(schema(4, 2)));
        assert!(h.push(schema(7, 2)));
        assert_eq!(h.versions(), vec![5, 7]);
        assert_eq!(h.latest().version(), 7);
    }

    #[test]
    fn history_evicts_fifo_at_capacity() {
        let mut h = SchemaHistory::seed(schema(1, 2));
        for v in 2..=(MAX_TABLE_SCHEMAS as SchemaVersion + 1) {
            assert!(h.push(schema(v, 2)));
        }

        assert_eq!(h.len(), MAX_TABLE_SCHEMAS);
        assert_eq!(h.versions()[0], 2);
        assert_eq!(h.latest().version(), MAX_TABLE_SCHEMAS as SchemaVersion + 1);
        assert!(h.by_version(1).is_none());
        assert!(h.by_version(2).is_some());
    }

    #[test]
    fn by_version_is_exact_match_only() {
        let mut h = SchemaHistory::seed(schema(2, 2));
        h.push(schema(6, 2));

        assert_eq!(h.by_version(6).expect("present").version(), 6);
        assert!(h.by_version(3).is_none());
        assert!(h.by_version(7).is_none());
    }
}
