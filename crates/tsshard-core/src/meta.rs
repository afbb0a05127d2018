//! The shard-wide table registry.
//!
//! [`Meta`] keeps four coupled views of the same tables consistent: a dense
//! slot array indexed by tid, a uid hash map that owns every table, the
//! insertion-ordered list of super tables (which have no slot), and the
//! per-super tag index. One reader/writer lock guards the whole structure;
//! lookups copy data out instead of leaking references, so readers never
//! hold the lock across their own work.
//!
//! Ownership follows an arena-plus-id scheme: the uid map owns each
//! [`Table`], children refer to their super by uid, and the super's index
//! stores child uids. The per-table use-count is advisory bookkeeping for
//! in-flight queries and commits; destruction happens when a table is
//! removed from the map.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, error, trace, warn};
use parking_lot::RwLock;

use crate::config::ShardConfig;
use crate::error::{
    InvalidActionSnafu, InvalidTableIdSnafu, InvalidTableTypeSnafu, MetaResult,
    TableAlreadyExistsSnafu,
};
use crate::schema::{ColId, ColumnType, Schema, SchemaVersion};
use crate::table::{Table, TableKind, Tid, Uid, TAG_INDEX_COLUMN};
use crate::table_cfg::TableCfg;
use crate::tag_row::var_value_len;

/// A table's identity pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableId {
    /// Globally unique id.
    pub uid: Uid,
    /// Shard-local id; the super sentinel for super tables.
    pub tid: Tid,
}

/// The shard-wide metadata registry.
#[derive(Debug)]
pub struct Meta {
    shard_id: u32,
    max_tables: usize,
    state: RwLock<MetaState>,
}

#[derive(Debug)]
pub(crate) struct MetaState {
    /// Dense slot array; `slots[tid]` names the table occupying that tid.
    slots: Vec<Option<Uid>>,
    /// Owner of every registered table, of every kind.
    by_uid: HashMap<Uid, Table>,
    /// Super tables in insertion order.
    super_list: Vec<Uid>,
    /// Number of tables holding a tid slot.
    n_tables: usize,
    /// Running maximum of column counts over non-child tables.
    max_cols: usize,
    /// Running maximum of row byte widths over non-child tables.
    max_row_bytes: usize,
}

impl Meta {
    /// Create an empty registry sized from the shard configuration.
    pub fn new(cfg: &ShardConfig) -> Self {
        Self {
            shard_id: cfg.shard_id,
            max_tables: cfg.max_tables,
            state: RwLock::new(MetaState {
                slots: vec![None; cfg.max_tables],
                by_uid: HashMap::new(),
                super_list: Vec::new(),
                n_tables: 0,
                max_cols: 0,
                max_row_bytes: 0,
            }),
        }
    }

    /// The shard this registry belongs to.
    pub fn shard_id(&self) -> u32 {
        self.shard_id
    }

    // ---------------- lookups (shared lock) ----------------

    /// Whether a table with this uid is registered.
    pub fn contains(&self, uid: Uid) -> bool {
        self.state.read().by_uid.contains_key(&uid)
    }

    /// Run a closure against the registered table, if present.
    pub fn with_table<R>(&self, uid: Uid, f: impl FnOnce(&Table) -> R) -> Option<R> {
        let state = self.state.read();
        state.by_uid.get(&uid).map(f)
    }

    /// The identity pair of a table.
    pub fn table_id(&self, uid: Uid) -> Option<TableId> {
        self.with_table(uid, |t| TableId {
            uid: t.uid(),
            tid: t.tid(),
        })
    }

    /// The name of a table.
    pub fn table_name(&self, uid: Uid) -> Option<String> {
        self.with_table(uid, |t| t.name().to_string())
    }

    /// The kind of a table.
    pub fn table_kind(&self, uid: Uid) -> Option<TableKind> {
        self.with_table(uid, |t| t.kind())
    }

    /// The current use-count of a table.
    pub fn table_refs(&self, uid: Uid) -> Option<u32> {
        self.with_table(uid, |t| t.refs())
    }

    /// Acquire one in-flight reference on a table.
    pub fn ref_table(&self, uid: Uid) -> Option<u32> {
        self.with_table(uid, |t| t.acquire())
    }

    /// Release one in-flight reference on a table.
    pub fn unref_table(&self, uid: Uid) -> Option<u32> {
        self.with_table(uid, |t| t.release())
    }

    /// The newest schema of a table; a child resolves through its super.
    pub fn schema(&self, uid: Uid) -> Option<Arc<Schema>> {
        self.state.read().schema_of(uid)
    }

    /// Exact-version schema lookup over the (super's, for a child) history.
    pub fn schema_by_version(&self, uid: Uid, version: SchemaVersion) -> Option<Arc<Schema>> {
        let state = self.state.read();
        let owner = state.schema_owner(uid)?;
        owner.schemas()?.by_version(version)
    }

    /// The tag schema of a super table, directly or through a child's link.
    pub fn tag_schema(&self, uid: Uid) -> Option<Arc<Schema>> {
        self.state.read().tag_schema_of(uid)
    }

    /// Fetch a child's tag value for `col_id`, checking the declared type
    /// and width against the super's tag schema.
    ///
    /// Returns `Ok(None)` when the table has no tag schema, the column is
    /// not declared, or no value is stored. A `(type, bytes)` disagreement
    /// fails the precondition; a variable-length value whose embedded
    /// length reaches the declared width is reported as corruption.
    pub fn tag_value(
        &self,
        uid: Uid,
        col_id: ColId,
        expected_ty: ColumnType,
        expected_bytes: u16,
    ) -> MetaResult<Option<Vec<u8>>> {
        let state = self.state.read();
        if !state.by_uid.contains_key(&uid) {
            return InvalidTableIdSnafu { uid, tid: 0 }.fail();
        }
        let Some(tag_schema) = state.tag_schema_of(uid) else {
            return Ok(None);
        };
        let Some(col) = tag_schema.col_by_id(col_id) else {
            return Ok(None);
        };
        if col.ty != expected_ty || col.bytes != expected_bytes {
            return InvalidActionSnafu {
                uid,
                detail: format!(
                    "tag column {col_id} is declared {:?}({}), queried as {:?}({})",
                    col.ty, col.bytes, expected_ty, expected_bytes
                ),
            }
            .fail();
        }
        let value = state
            .by_uid
            .get(&uid)
            .and_then(|t| t.tag_values())
            .and_then(|row| row.get(col_id))
            .map(|v| v.to_vec());
        if let Some(v) = &value {
            if col.ty.is_var_len() {
                let embedded = var_value_len(v);
                if embedded.is_none() || embedded.is_some_and(|len| len >= col.bytes) {
                    return crate::error::FileCorruptedSnafu {
                        reason: format!(
                            "tag value of column {col_id} on table uid {uid} overflows its declared width"
                        ),
                    }
                    .fail();
                }
            }
        }
        Ok(value)
    }

    /// Number of tables holding a tid slot.
    pub fn table_count(&self) -> usize {
        self.state.read().n_tables
    }

    /// Number of registered super tables.
    pub fn super_count(&self) -> usize {
        self.state.read().super_list.len()
    }

    /// Super uids in registration order.
    pub fn super_uids(&self) -> Vec<Uid> {
        self.state.read().super_list.clone()
    }

    /// The uid occupying a tid slot.
    pub fn tid_slot(&self, tid: Tid) -> Option<Uid> {
        if tid < 0 {
            return None;
        }
        self.state.read().slots.get(tid as usize).copied().flatten()
    }

    /// Running maximum of column counts over non-child tables.
    pub fn max_cols(&self) -> usize {
        self.state.read().max_cols
    }

    /// Running maximum of row byte widths over non-child tables.
    pub fn max_row_bytes(&self) -> usize {
        self.state.read().max_row_bytes
    }

    /// Number of children indexed under a super table.
    pub fn tag_index_len(&self, super_uid: Uid) -> Option<usize> {
        self.with_table(super_uid, |t| t.tag_index().map(|i| i.len()))
            .flatten()
    }

    /// Children of a super registered under exactly this tag key.
    pub fn children_with_tag(&self, super_uid: Uid, key: &[u8]) -> Vec<Uid> {
        self.with_table(super_uid, |t| {
            t.tag_index().map(|i| i.get(key).to_vec()).unwrap_or_default()
        })
        .unwrap_or_default()
    }

    /// All children currently indexed under a super.
    pub fn children_of_super(&self, super_uid: Uid) -> Vec<Uid> {
        self.with_table(super_uid, |t| {
            t.tag_index()
                .map(|i| i.children().collect())
                .unwrap_or_default()
        })
        .unwrap_or_default()
    }

    /// Encode a registered table into its UpdateMeta payload.
    pub(crate) fn encode_table(&self, uid: Uid) -> Option<Vec<u8>> {
        self.with_table(uid, |t| {
            let mut buf = Vec::new();
            t.encode(&mut buf);
            buf
        })
    }

    // ---------------- structural ops (exclusive lock) ----------------

    /// Register a table. For a child, `register_index` controls whether the
    /// super's tag index is updated immediately; restore defers that to the
    /// reorg pass because the super may not be present yet.
    pub(crate) fn add_to_meta(&self, table: Table, register_index: bool) -> MetaResult<()> {
        let mut state = self.state.write();
        state.insert(table, register_index, self.max_tables, self.shard_id)
    }

    /// Remove a table, returning it to the caller. `remove_from_index`
    /// controls whether a child is also unlinked from its super's index;
    /// the super-drop path skips that because the index dies with the
    /// super.
    pub(crate) fn remove_from_meta(&self, uid: Uid, remove_from_index: bool) -> Option<Table> {
        let mut state = self.state.write();
        state.remove(uid, remove_from_index, self.shard_id)
    }

    /// Link one child into its super's tag index (used by the reorg pass).
    pub(crate) fn add_to_index(&self, child_uid: Uid) -> MetaResult<()> {
        let mut state = self.state.write();
        state.index_child(child_uid)
    }

    /// Apply a configuration update to a non-child table: replace the tag
    /// schema when strictly newer, append a strictly newer column schema
    /// (FIFO-evicting at capacity), and refresh the registry maxima.
    /// Returns whether anything changed.
    pub(crate) fn apply_update(&self, uid: Uid, cfg: &TableCfg) -> MetaResult<bool> {
        let mut state = self.state.write();

        let Some(table) = state.by_uid.get_mut(&uid) else {
            return InvalidTableIdSnafu { uid, tid: 0 }.fail();
        };
        if table.kind() == TableKind::Child {
            return InvalidTableTypeSnafu {
                uid,
                kind: TableKind::Child,
            }
            .fail();
        }

        let mut changed = false;
        let mut new_dims: Option<(usize, usize)> = None;

        if table.kind() == TableKind::Super {
            if let Some(new_tag) = cfg.tag_schema() {
                let cur_version = table.tag_schema().map(|s| s.version());
                if cur_version.is_some_and(|v| v < new_tag.version()) {
                    table.replace_tag_schema(Arc::clone(new_tag));
                    changed = true;
                }
            }
        }

        if let Some(new_schema) = cfg.schema() {
            let cur_version = table
                .schemas()
                .map(|h| h.latest().version())
                .unwrap_or(SchemaVersion::MAX);
            if cur_version < new_schema.version() {
                if let Some(history) = table.schemas_mut() {
                    history.push(Arc::clone(new_schema));
                    new_dims = Some((new_schema.ncols(), new_schema.row_bytes()));
                    changed = true;
                }
            }
        }

        if let Some((cols, row_bytes)) = new_dims {
            state.max_cols = state.max_cols.max(cols);
            state.max_row_bytes = state.max_row_bytes.max(row_bytes);
        }

        if changed {
            trace!(
                "shard {}: table uid {uid} updated from config",
                self.shard_id
            );
        }
        Ok(changed)
    }

    /// Mutate a child's tag value in place, re-linking it in the super's
    /// index when the designated tag column is affected.
    pub(crate) fn apply_tag_value(
        &self,
        uid: Uid,
        col_id: ColId,
        value: Vec<u8>,
        reindex: bool,
    ) -> MetaResult<()> {
        let mut state = self.state.write();
        if reindex {
            state.unindex_child(uid)?;
        }
        let Some(row) = state.by_uid.get_mut(&uid).and_then(|t| t.tag_values_mut()) else {
            return InvalidTableIdSnafu { uid, tid: 0 }.fail();
        };
        row.set(col_id, value);
        if reindex {
            state.index_child(uid)?;
        }
        trace!(
            "shard {}: tag column {col_id} of table uid {uid} updated",
            self.shard_id
        );
        Ok(())
    }

    /// Drop every table, releasing the whole registry.
    pub(crate) fn clear(&self) {
        let mut state = self.state.write();
        state.slots.iter_mut().for_each(|s| *s = None);
        state.super_list.clear();
        state.by_uid.clear();
        state.n_tables = 0;
        state.max_cols = 0;
        state.max_row_bytes = 0;
    }

    /// Uids of all child tables currently holding a slot, in tid order.
    /// Used by the reorg pass after restore.
    pub(crate) fn child_uids(&self) -> Vec<Uid> {
        let state = self.state.read();
        state
            .slots
            .iter()
            .flatten()
            .filter(|uid| {
                state
                    .by_uid
                    .get(*uid)
                    .is_some_and(|t| t.kind() == TableKind::Child)
            })
            .copied()
            .collect()
    }
}

impl MetaState {
    fn get(&self, uid: Uid) -> Option<&Table> {
        self.by_uid.get(&uid)
    }

    /// The table owning `uid`'s schema history: the table itself, or its
    /// super for a child.
    fn schema_owner(&self, uid: Uid) -> Option<&Table> {
        let table = self.get(uid)?;
        match table.super_uid() {
            Some(super_uid) => self.get(super_uid),
            None => Some(table),
        }
    }

    fn schema_of(&self, uid: Uid) -> Option<Arc<Schema>> {
        let owner = self.schema_owner(uid)?;
        owner.schemas().map(|h| Arc::clone(h.latest()))
    }

    fn tag_schema_of(&self, uid: Uid) -> Option<Arc<Schema>> {
        let table = self.get(uid)?;
        let owner = match table.super_uid() {
            Some(super_uid) => self.get(super_uid)?,
            None => table,
        };
        owner.tag_schema().cloned()
    }

    fn insert(
        &mut self,
        table: Table,
        register_index: bool,
        max_tables: usize,
        shard_id: u32,
    ) -> MetaResult<()> {
        let uid = table.uid();
        let tid = table.tid();
        let kind = table.kind();
        let name = table.name().to_string();

        if self.by_uid.contains_key(&uid) {
            error!("shard {shard_id}: table {name} already exists, tid {tid} uid {uid}");
            return TableAlreadyExistsSnafu { uid }.fail();
        }
        if kind != TableKind::Super {
            if tid < 1 || tid as usize >= max_tables {
                error!("shard {shard_id}: table {name} uid {uid} has out-of-range tid {tid}");
                return InvalidTableIdSnafu { uid, tid }.fail();
            }
            if self.slots[tid as usize].is_some() {
                error!("shard {shard_id}: tid {tid} is already occupied, refusing table {name}");
                return InvalidTableIdSnafu { uid, tid }.fail();
            }
        }

        let dims = table
            .schemas()
            .map(|h| (h.latest().ncols(), h.latest().row_bytes()));

        self.by_uid.insert(uid, table);

        if kind == TableKind::Super {
            self.super_list.push(uid);
        } else {
            if kind == TableKind::Child && register_index {
                if let Err(e) = self.index_child(uid) {
                    trace!(
                        "shard {shard_id}: failed to add table {name} to meta while indexing: {e}"
                    );
                    self.by_uid.remove(&uid);
                    return Err(e);
                }
            }
            self.slots[tid as usize] = Some(uid);
            self.n_tables += 1;
        }

        if let Some((cols, row_bytes)) = dims {
            self.max_cols = self.max_cols.max(cols);
            self.max_row_bytes = self.max_row_bytes.max(row_bytes);
        }

        debug!("shard {shard_id}: table {name} tid {tid} uid {uid} is added to meta");
        Ok(())
    }

    fn remove(&mut self, uid: Uid, remove_from_index: bool, shard_id: u32) -> Option<Table> {
        let dims = self
            .schema_of(uid)
            .map(|s| (s.ncols(), s.row_bytes()))
            .unwrap_or((0, 0));

        let table = self.by_uid.remove(&uid)?;

        match table.kind() {
            TableKind::Super => {
                // Few supers relative to children; a backward scan is fine.
                if let Some(pos) = self.super_list.iter().rposition(|u| *u == uid) {
                    self.super_list.remove(pos);
                }
            }
            _ => {
                let tid = table.tid();
                if tid >= 1 && (tid as usize) < self.slots.len() {
                    self.slots[tid as usize] = None;
                }
                if table.kind() == TableKind::Child && remove_from_index {
                    self.unindex_child_detached(&table, shard_id);
                }
                self.n_tables = self.n_tables.saturating_sub(1);
            }
        }

        if dims.0 == self.max_cols || dims.1 == self.max_row_bytes {
            self.recompute_maxima();
        }

        table.release();
        debug!(
            "shard {shard_id}: table {} is removed from meta",
            table.name()
        );
        Some(table)
    }

    /// Resolve a registered child's super uid and current tag-index key.
    fn child_link(&self, child_uid: Uid) -> MetaResult<(Uid, Vec<u8>)> {
        let Some(child) = self.get(child_uid) else {
            return InvalidTableIdSnafu {
                uid: child_uid,
                tid: 0,
            }
            .fail();
        };
        let Some(super_uid) = child.super_uid() else {
            return InvalidActionSnafu {
                uid: child_uid,
                detail: format!("table kind {:?} carries no super link", child.kind()),
            }
            .fail();
        };
        let Some(sup) = self.get(super_uid) else {
            return InvalidTableIdSnafu {
                uid: super_uid,
                tid: 0,
            }
            .fail();
        };
        if sup.kind() != TableKind::Super {
            return InvalidTableTypeSnafu {
                uid: super_uid,
                kind: sup.kind(),
            }
            .fail();
        }
        let key = tag_key(sup, child);
        Ok((super_uid, key))
    }

    fn index_child(&mut self, child_uid: Uid) -> MetaResult<()> {
        let (super_uid, key) = self.child_link(child_uid)?;
        let Some(sup) = self.by_uid.get_mut(&super_uid) else {
            return InvalidTableIdSnafu {
                uid: super_uid,
                tid: 0,
            }
            .fail();
        };
        if let Some(index) = sup.tag_index_mut() {
            index.insert(key, child_uid);
        }
        sup.acquire();
        Ok(())
    }

    fn unindex_child(&mut self, child_uid: Uid) -> MetaResult<()> {
        let (super_uid, key) = self.child_link(child_uid)?;
        let Some(sup) = self.by_uid.get_mut(&super_uid) else {
            return InvalidTableIdSnafu {
                uid: super_uid,
                tid: 0,
            }
            .fail();
        };
        if let Some(index) = sup.tag_index_mut() {
            index.remove(&key, child_uid);
        }
        sup.release();
        Ok(())
    }

    /// Unlink a child that has already been taken out of the uid map.
    fn unindex_child_detached(&mut self, child: &Table, shard_id: u32) {
        let Some(super_uid) = child.super_uid() else {
            return;
        };
        let Some(sup) = self.by_uid.get(&super_uid) else {
            warn!(
                "shard {shard_id}: child {} points at unknown super uid {super_uid}",
                child.uid()
            );
            return;
        };
        let key = tag_key(sup, child);
        if let Some(sup) = self.by_uid.get_mut(&super_uid) {
            if let Some(index) = sup.tag_index_mut() {
                index.remove(&key, child.uid());
            }
            sup.release();
        }
    }

    /// Recompute both maxima over every registered non-child table.
    fn recompute_maxima(&mut self) {
        let mut max_cols = 0;
        let mut max_row_bytes = 0;
        for table in self.by_uid.values() {
            if let Some(history) = table.schemas() {
                let latest = history.latest();
                max_cols = max_cols.max(latest.ncols());
                max_row_bytes = max_row_bytes.max(latest.row_bytes());
            }
        }
        self.max_cols = max_cols;
        self.max_row_bytes = max_row_bytes;
    }
}

/// Project the super's designated tag column out of a child's tag row.
/// A missing value indexes under the empty key.
fn tag_key(sup: &Table, child: &Table) -> Vec<u8> {
    let col_id: Option<ColId> = sup
        .tag_schema()
        .and_then(|s| s.col_at(TAG_INDEX_COLUMN).map(|c| c.col_id));
    match (col_id, child.tag_values()) {
        (Some(col_id), Some(row)) => row.get(col_id).map(|v| v.to_vec()).unwrap_or_default(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MetaError;
    use crate::schema::SchemaBuilder;
    use crate::tag_row::TagRowBuilder;

    fn test_meta() -> Meta {
        Meta::new(&ShardConfig {
            shard_id: 1,
            max_tables: 32,
        })
    }

    fn data_schema(version: i32, ncols: usize) -> Arc<Schema> {
        let mut b = SchemaBuilder::new(version);
        b.add_col(1, ColumnType::Timestamp, 8);
        for i in 1..ncols {
            b.add_col(1 + i as ColId, ColumnType::Int, 4);
        }
        Arc::new(b.build().expect("valid schema"))
    }

    fn tag_schema(version: i32) -> Arc<Schema> {
        let mut b = SchemaBuilder::new(version);
        b.add_col(10, ColumnType::Int, 4);
        Arc::new(b.build().expect("valid schema"))
    }

    fn child_cfg(uid: Uid, tid: Tid, super_uid: Uid, tag: i32) -> TableCfg {
        let mut tags = TagRowBuilder::new();
        tags.add(10, tag.to_le_bytes().to_vec()).expect("tag");
        TableCfg::new(TableKind::Child, uid, tid)
            .expect("cfg")
            .set_name(format!("c{uid}"))
            .expect("name")
            .set_schema(data_schema(1, 2))
            .expect("schema")
            .set_tag_schema(tag_schema(1))
            .expect("tag schema")
            .set_super_name("s")
            .expect("super name")
            .set_super_uid(super_uid)
            .expect("super uid")
            .set_tag_values(tags.build())
            .expect("tag values")
    }

    fn normal_cfg(uid: Uid, tid: Tid, ncols: usize) -> TableCfg {
        TableCfg::new(TableKind::Normal, uid, tid)
            .expect("cfg")
            .set_name(format!("n{uid}"))
            .expect("name")
            .set_schema(data_schema(1, ncols))
            .expect("schema")
    }

    fn register_family(meta: &Meta) {
        let cfg = child_cfg(1001, 5, 77, 42);
        let sup = Table::new(&cfg, true).expect("super");
        let child = Table::new(&cfg, false).expect("child");
        meta.add_to_meta(sup, true).expect("register super");
        meta.add_to_meta(child, true).expect("register child");
    }

    #[test]
    fn registration_links_all_four_views() {
        let meta = test_meta();
        register_family(&meta);

        assert!(meta.contains(77));
        assert!(meta.contains(1001));
        assert_eq!(meta.super_uids(), vec![77]);
        assert_eq!(meta.tid_slot(5), Some(1001));
        assert_eq!(meta.table_count(), 1);
        assert_eq!(meta.tag_index_len(77), Some(1));
        assert_eq!(
            meta.children_with_tag(77, &42i32.to_le_bytes()),
            vec![1001]
        );
        // Indexing a child acquires one reference on the super.
        assert_eq!(meta.table_refs(77), Some(2));
        assert_eq!(meta.table_refs(1001), Some(1));
    }

    #[test]
    fn duplicate_uid_is_rejected_and_rolls_back_nothing() {
        let meta = test_meta();
        register_family(&meta);

        let cfg = child_cfg(1001, 6, 77, 43);
        let dup = Table::new(&cfg, false).expect("child");
        let err = meta.add_to_meta(dup, true).expect_err("duplicate uid");
        assert!(matches!(err, MetaError::TableAlreadyExists { uid: 1001, .. }));

        assert_eq!(meta.table_count(), 1);
        assert_eq!(meta.tag_index_len(77), Some(1));
        assert_eq!(meta.tid_slot(6), None);
    }

    #[test]
    fn child_with_unknown_super_fails_registration_cleanly() {
        let meta = test_meta();
        let cfg = child_cfg(1001, 5, 88, 42);
        let child = Table::new(&cfg, false).expect("child");

        let err = meta.add_to_meta(child, true).expect_err("missing super");
        assert!(matches!(err, MetaError::InvalidTableId { uid: 88, .. }));
        assert!(!meta.contains(1001));
        assert_eq!(meta.tid_slot(5), None);
        assert_eq!(meta.table_count(), 0);
    }

    #[test]
    fn out_of_range_tid_is_rejected() {
        let meta = test_meta();
        let table = Table::new(&normal_cfg(9, 32, 2), false).expect("table");
        let err = meta.add_to_meta(table, true).expect_err("tid past capacity");
        assert!(matches!(err, MetaError::InvalidTableId { tid: 32, .. }));

        let table = Table::new(&normal_cfg(9, 0, 2), false).expect("table");
        let err = meta.add_to_meta(table, true).expect_err("reserved slot 0");
        assert!(matches!(err, MetaError::InvalidTableId { tid: 0, .. }));
    }

    #[test]
    fn schema_resolution_follows_the_super_link() {
        let meta = test_meta();
        register_family(&meta);

        let direct = meta.schema(77).expect("super schema");
        let via_child = meta.schema(1001).expect("child schema");
        assert_eq!(direct, via_child);

        assert!(meta.schema_by_version(1001, 1).is_some());
        assert!(meta.schema_by_version(1001, 2).is_none());

        let tag = meta.tag_schema(1001).expect("tag schema via child");
        assert_eq!(tag.version(), 1);
    }

    #[test]
    fn tag_value_checks_the_declared_type_and_width() {
        let meta = test_meta();
        register_family(&meta);

        let val = meta
            .tag_value(1001, 10, ColumnType::Int, 4)
            .expect("fetch")
            .expect("value present");
        assert_eq!(val, 42i32.to_le_bytes());

        let err = meta
            .tag_value(1001, 10, ColumnType::BigInt, 8)
            .expect_err("type mismatch");
        assert!(matches!(err, MetaError::InvalidAction { .. }));

        // Unknown column id resolves to nothing.
        assert_eq!(
            meta.tag_value(1001, 99, ColumnType::Int, 4).expect("fetch"),
            None
        );
    }

    #[test]
    fn maxima_track_registration_and_removal() {
        let meta = test_meta();
        meta.add_to_meta(Table::new(&normal_cfg(1, 1, 2), false).expect("t"), true)
            .expect("register");
        meta.add_to_meta(Table::new(&normal_cfg(2, 2, 5), false).expect("t"), true)
            .expect("register");

        assert_eq!(meta.max_cols(), 5);
        assert_eq!(meta.max_row_bytes(), 8 + 4 * 4);

        // Removing the wide table forces a rescan down to the narrow one.
        meta.remove_from_meta(2, true).expect("removed");
        assert_eq!(meta.max_cols(), 2);
        assert_eq!(meta.max_row_bytes(), 12);

        // Removing a table that holds neither maximum does not rescan away
        // the remaining bound.
        meta.add_to_meta(Table::new(&normal_cfg(3, 3, 4), false).expect("t"), true)
            .expect("register");
        meta.remove_from_meta(1, true).expect("removed");
        assert_eq!(meta.max_cols(), 4);
    }

    #[test]
    fn removing_a_child_unlinks_the_index_and_releases_the_super() {
        let meta = test_meta();
        register_family(&meta);
        assert_eq!(meta.table_refs(77), Some(2));

        let removed = meta.remove_from_meta(1001, true).expect("removed");
        assert_eq!(removed.uid(), 1001);

        assert!(!meta.contains(1001));
        assert_eq!(meta.tid_slot(5), None);
        assert_eq!(meta.tag_index_len(77), Some(0));
        assert_eq!(meta.table_refs(77), Some(1));
    }

    #[test]
    fn super_removal_scans_the_list_backward() {
        let meta = test_meta();
        register_family(&meta);

        let removed = meta.remove_from_meta(77, true).expect("removed");
        assert_eq!(removed.kind(), TableKind::Super);
        assert_eq!(meta.super_count(), 0);
        assert!(!meta.contains(77));
    }

    #[test]
    fn equal_tag_keys_disambiguate_by_identity() {
        let meta = test_meta();
        register_family(&meta);

        let cfg = child_cfg(1002, 6, 77, 42);
        let sibling = Table::new(&cfg, false).expect("child");
        meta.add_to_meta(sibling, true).expect("register");

        let key = 42i32.to_le_bytes();
        assert_eq!(meta.children_with_tag(77, &key), vec![1001, 1002]);

        meta.remove_from_meta(1001, true).expect("removed");
        assert_eq!(meta.children_with_tag(77, &key), vec![1002]);
    }

    #[test]
    fn apply_update_appends_only_strictly_newer_schemas() {
        let meta = test_meta();
        meta.add_to_meta(Table::new(&normal_cfg(1, 1, 2), false).expect("t"), true)
            .expect("register");

        let stale = normal_cfg(1, 1, 3); // still version 1
        assert!(!meta.apply_update(1, &stale).expect("no-op"));

        let mut newer = TableCfg::new(TableKind::Normal, 1, 1).expect("cfg");
        newer = newer
            .set_name("n1")
            .expect("name")
            .set_schema(data_schema(2, 3))
            .expect("schema");
        assert!(meta.apply_update(1, &newer).expect("applied"));

        let latest = meta.schema(1).expect("schema");
        assert_eq!(latest.version(), 2);
        assert_eq!(meta.max_cols(), 3);
    }

    #[test]
    fn apply_update_rejects_child_tables() {
        let meta = test_meta();
        register_family(&meta);

        let err = meta
            .apply_update(1001, &child_cfg(1001, 5, 77, 42))
            .expect_err("child");
        assert!(matches!(err, MetaError::InvalidTableType { .. }));
    }
}
