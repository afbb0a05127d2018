//! The table configuration descriptor and wire-message parsing.
//!
//! [`TableCfg`] collects the fields needed to construct a [`crate::Table`].
//! Setters are kind-checked: tag fields only apply to child creation, the
//! query text only to streams. Invalid combinations fail with
//! `InvalidCreateMessage` before any table is built.
//!
//! Create and tag-update messages arrive in network byte order and are
//! parsed here into host types: [`TableCfg::from_create_msg`] mirrors the
//! layout produced by [`CreateTableMsg::encode`], which hosts (and test
//! doubles) use to synthesize messages.

use std::sync::Arc;

use bytes::BufMut;

use crate::codec::{self, CodecError};
use crate::error::{InvalidCreateMessageSnafu, MetaResult};
use crate::schema::{ColId, ColumnSchema, ColumnType, Schema, SchemaBuilder};
use crate::table::{TableKind, Tid, Uid, INVALID_SUPER_UID};
use crate::tag_row::{TagRow, TagRowBuilder};

/// Maximum length of a table name in bytes.
pub const MAX_TABLE_NAME_LEN: usize = 192;

/// Builder-style descriptor of a table to be created or updated.
#[derive(Debug, Clone)]
pub struct TableCfg {
    kind: TableKind,
    uid: Uid,
    tid: Tid,
    name: Option<String>,
    schema: Option<Arc<Schema>>,
    tag_schema: Option<Arc<Schema>>,
    super_name: Option<String>,
    super_uid: Option<Uid>,
    tag_values: Option<TagRow>,
    sql: Option<String>,
}

impl TableCfg {
    /// Start a descriptor for the given kind and identity.
    ///
    /// Super tables are never created directly; requesting one fails with
    /// `InvalidCreateMessage`.
    pub fn new(kind: TableKind, uid: Uid, tid: Tid) -> MetaResult<Self> {
        if kind == TableKind::Super {
            return InvalidCreateMessageSnafu {
                reason: "super tables cannot be created directly".to_string(),
            }
            .fail();
        }
        Ok(Self {
            kind,
            uid,
            tid,
            name: None,
            schema: None,
            tag_schema: None,
            super_name: None,
            super_uid: None,
            tag_values: None,
            sql: None,
        })
    }

    /// Set the table name.
    pub fn set_name(mut self, name: impl Into<String>) -> MetaResult<Self> {
        let name = name.into();
        if name.is_empty() || name.len() > MAX_TABLE_NAME_LEN {
            return InvalidCreateMessageSnafu {
                reason: format!("table name length {} out of range", name.len()),
            }
            .fail();
        }
        self.name = Some(name);
        Ok(self)
    }

    /// Set the column schema.
    pub fn set_schema(mut self, schema: Arc<Schema>) -> MetaResult<Self> {
        self.schema = Some(schema);
        Ok(self)
    }

    /// Set the tag schema. Only valid for child creation.
    pub fn set_tag_schema(mut self, schema: Arc<Schema>) -> MetaResult<Self> {
        self.check_child("tagSchema")?;
        self.tag_schema = Some(schema);
        Ok(self)
    }

    /// Set the super-table name used when the super is created implicitly.
    pub fn set_super_name(mut self, name: impl Into<String>) -> MetaResult<Self> {
        self.check_child("superName")?;
        let name = name.into();
        if name.is_empty() || name.len() > MAX_TABLE_NAME_LEN {
            return InvalidCreateMessageSnafu {
                reason: format!("super table name length {} out of range", name.len()),
            }
            .fail();
        }
        self.super_name = Some(name);
        Ok(self)
    }

    /// Set the super-table uid. Only valid for child creation, and the
    /// invalid-super sentinel is rejected.
    pub fn set_super_uid(mut self, uid: Uid) -> MetaResult<Self> {
        self.check_child("superUid")?;
        if uid == INVALID_SUPER_UID {
            return InvalidCreateMessageSnafu {
                reason: "superUid is the invalid-super sentinel".to_string(),
            }
            .fail();
        }
        self.super_uid = Some(uid);
        Ok(self)
    }

    /// Set the tag-value row. Only valid for child creation.
    pub fn set_tag_values(mut self, row: TagRow) -> MetaResult<Self> {
        self.check_child("tagValues")?;
        self.tag_values = Some(row);
        Ok(self)
    }

    /// Set the source query text. Only valid for stream creation.
    pub fn set_sql(mut self, sql: impl Into<String>) -> MetaResult<Self> {
        if self.kind != TableKind::Stream {
            return InvalidCreateMessageSnafu {
                reason: format!("sql is not applicable to a {:?} table", self.kind),
            }
            .fail();
        }
        self.sql = Some(sql.into());
        Ok(self)
    }

    fn check_child(&self, field: &str) -> MetaResult<()> {
        if self.kind != TableKind::Child {
            return InvalidCreateMessageSnafu {
                reason: format!("{field} is not applicable to a {:?} table", self.kind),
            }
            .fail();
        }
        Ok(())
    }

    /// The requested table kind.
    pub fn kind(&self) -> TableKind {
        self.kind
    }

    /// The requested uid.
    pub fn uid(&self) -> Uid {
        self.uid
    }

    /// The requested tid.
    pub fn tid(&self) -> Tid {
        self.tid
    }

    /// The table name, if set.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The column schema, if set.
    pub fn schema(&self) -> Option<&Arc<Schema>> {
        self.schema.as_ref()
    }

    /// The tag schema, if set.
    pub fn tag_schema(&self) -> Option<&Arc<Schema>> {
        self.tag_schema.as_ref()
    }

    /// The super-table name, if set.
    pub fn super_name(&self) -> Option<&str> {
        self.super_name.as_deref()
    }

    /// The super-table uid, if set.
    pub fn super_uid(&self) -> Option<Uid> {
        self.super_uid
    }

    /// The tag-value row, if set.
    pub fn tag_values(&self) -> Option<&TagRow> {
        self.tag_values.as_ref()
    }

    /// The stream query text, if set.
    pub fn sql(&self) -> Option<&str> {
        self.sql.as_deref()
    }

    /// Parse a network-order create-table message into a descriptor.
    pub fn from_create_msg(msg: &[u8]) -> MetaResult<TableCfg> {
        let mut buf = msg;
        parse_create_msg(&mut buf).map_err(|e| {
            InvalidCreateMessageSnafu {
                reason: e.to_string(),
            }
            .build()
        })
    }
}

fn parse_create_msg(buf: &mut &[u8]) -> Result<TableCfg, ParseError> {
    let kind = TableKind::from_u8(codec::get_u8(buf)?)?;
    let uid = codec::get_u64_be(buf)?;
    let tid = codec::get_i32_be(buf)?;
    let sversion = codec::get_i32_be(buf)?;
    let tversion = codec::get_i32_be(buf)?;
    let num_columns = codec::get_i16_be(buf)?;
    let num_tags = codec::get_i16_be(buf)?;
    let tag_data_len = codec::get_i32_be(buf)?;
    let name = codec::get_str16_be(buf)?;

    if num_columns <= 0 || num_tags < 0 || tag_data_len < 0 {
        return Err(ParseError::Shape("negative field count"));
    }

    let mut cfg = TableCfg::new(kind, uid, tid)?.set_name(name)?;

    let (super_name, super_uid) = if num_tags > 0 {
        let sname = codec::get_str16_be(buf)?;
        let suid = codec::get_u64_be(buf)?;
        (Some(sname), Some(suid))
    } else {
        (None, None)
    };

    let mut builder = SchemaBuilder::new(sversion);
    for _ in 0..num_columns {
        let (col_id, ty, bytes) = parse_column(buf)?;
        builder.add_col(col_id, ty, bytes);
    }
    cfg = cfg.set_schema(Arc::new(builder.build()?))?;

    if num_tags > 0 {
        builder.reset(tversion);
        let mut tag_cols: Vec<ColumnSchema> = Vec::with_capacity(num_tags as usize);
        for _ in 0..num_tags {
            let (col_id, ty, bytes) = parse_column(buf)?;
            builder.add_col(col_id, ty, bytes);
            tag_cols.push(ColumnSchema { col_id, ty, bytes });
        }
        cfg = cfg
            .set_tag_schema(Arc::new(builder.build()?))?
            .set_super_name(super_name.unwrap_or_default())?
            .set_super_uid(super_uid.unwrap_or(INVALID_SUPER_UID))?;

        if tag_data_len > 0 {
            let declared: usize = tag_cols.iter().map(|c| c.bytes as usize).sum();
            if declared != tag_data_len as usize {
                return Err(ParseError::Shape("tag data length disagrees with schema"));
            }
            let mut row = TagRowBuilder::new();
            for col in &tag_cols {
                let value = codec::get_bytes(buf, col.bytes as usize)?;
                row.add(col.col_id, value)
                    .map_err(|_| ParseError::Shape("duplicate tag column in value block"))?;
            }
            cfg = cfg.set_tag_values(row.build())?;
        }
    }

    if kind == TableKind::Stream {
        let sql = codec::get_str16_be(buf)?;
        cfg = cfg.set_sql(sql)?;
    }

    Ok(cfg)
}

fn parse_column(buf: &mut &[u8]) -> Result<(ColId, ColumnType, u16), ParseError> {
    let ty = ColumnType::from_u8(codec::get_u8(buf)?)?;
    let col_id = codec::get_i16_be(buf)?;
    let bytes = codec::get_u16_be(buf)?;
    Ok((col_id, ty, bytes))
}

/// Internal parse failure: folded into `InvalidCreateMessage` at the API
/// boundary.
enum ParseError {
    Codec(CodecError),
    Build(String),
    Shape(&'static str),
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::Codec(e) => write!(f, "{e}"),
            ParseError::Build(e) => write!(f, "{e}"),
            ParseError::Shape(e) => write!(f, "{e}"),
        }
    }
}

impl From<CodecError> for ParseError {
    fn from(e: CodecError) -> Self {
        ParseError::Codec(e)
    }
}

impl From<crate::error::MetaError> for ParseError {
    fn from(e: crate::error::MetaError) -> Self {
        ParseError::Build(e.to_string())
    }
}

impl From<crate::schema::SchemaBuildError> for ParseError {
    fn from(e: crate::schema::SchemaBuildError) -> Self {
        ParseError::Build(e.to_string())
    }
}

/// A create-table message in host form, encodable to network order.
///
/// Hosts deliver these bytes over the transport; the configuration
/// callback returns them when the registry needs a fresh tag schema.
#[derive(Debug, Clone)]
pub struct CreateTableMsg {
    /// Kind of the table to create.
    pub kind: TableKind,
    /// Globally unique table id.
    pub uid: Uid,
    /// Shard-local table id.
    pub tid: Tid,
    /// Column schema version.
    pub sversion: i32,
    /// Tag schema version.
    pub tversion: i32,
    /// Table name.
    pub name: String,
    /// Super-table name; required when tags are present.
    pub super_name: Option<String>,
    /// Super-table uid; required when tags are present.
    pub super_uid: Option<Uid>,
    /// Data columns.
    pub columns: Vec<ColumnSchema>,
    /// Tag columns.
    pub tags: Vec<ColumnSchema>,
    /// Contiguous tag-value block: one declared-width slice per tag
    /// column, in tag declaration order. Empty when no values are sent.
    pub tag_data: Vec<u8>,
    /// Stream source query.
    pub sql: Option<String>,
}

impl CreateTableMsg {
    /// Encode into the network-order layout parsed by
    /// [`TableCfg::from_create_msg`].
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.put_u8(self.kind.as_u8());
        buf.put_u64(self.uid);
        buf.put_i32(self.tid);
        buf.put_i32(self.sversion);
        buf.put_i32(self.tversion);
        buf.put_i16(self.columns.len() as i16);
        buf.put_i16(self.tags.len() as i16);
        buf.put_i32(self.tag_data.len() as i32);
        codec::put_str16_be(&mut buf, &self.name);

        if !self.tags.is_empty() {
            codec::put_str16_be(&mut buf, self.super_name.as_deref().unwrap_or(""));
            buf.put_u64(self.super_uid.unwrap_or(INVALID_SUPER_UID));
        }
        for col in self.columns.iter().chain(self.tags.iter()) {
            buf.put_u8(col.ty.as_u8());
            buf.put_i16(col.col_id);
            buf.put_u16(col.bytes);
        }
        buf.put_slice(&self.tag_data);
        if let Some(sql) = &self.sql {
            codec::put_str16_be(&mut buf, sql);
        }
        buf
    }
}

/// A tag-value update message, transported in network order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateTagValMsg {
    /// Uid of the child table to update.
    pub uid: Uid,
    /// Tid of the child table; must agree with the registered table.
    pub tid: Tid,
    /// Tag-schema version the client built the update against.
    pub tversion: i32,
    /// The tag column to change.
    pub col_id: ColId,
    /// Declared type of the value.
    pub ty: ColumnType,
    /// Length of the value payload in bytes.
    pub bytes: u16,
    /// The new value. Variable-length values embed their length prefix.
    pub data: Vec<u8>,
}

impl UpdateTagValMsg {
    /// Parse a network-order update message.
    pub fn parse(msg: &[u8]) -> MetaResult<UpdateTagValMsg> {
        let mut buf = msg;
        let parse = |buf: &mut &[u8]| -> Result<UpdateTagValMsg, CodecError> {
            let uid = codec::get_u64_be(buf)?;
            let tid = codec::get_i32_be(buf)?;
            let tversion = codec::get_i16_be(buf)? as i32;
            let col_id = codec::get_i16_be(buf)?;
            let ty = ColumnType::from_u8(codec::get_u8(buf)?)?;
            let bytes = codec::get_u16_be(buf)?;
            let data = codec::get_bytes(buf, bytes as usize)?;
            Ok(UpdateTagValMsg {
                uid,
                tid,
                tversion,
                col_id,
                ty,
                bytes,
                data,
            })
        };
        parse(&mut buf).map_err(|e| {
            InvalidCreateMessageSnafu {
                reason: e.to_string(),
            }
            .build()
        })
    }

    /// Encode into the network-order layout parsed by [`Self::parse`].
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.put_u64(self.uid);
        buf.put_i32(self.tid);
        buf.put_i16(self.tversion as i16);
        buf.put_i16(self.col_id);
        buf.put_u8(self.ty.as_u8());
        buf.put_u16(self.data.len() as u16);
        buf.put_slice(&self.data);
        buf
    }
}
