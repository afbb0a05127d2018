//! The shard metadata driver: persistence lifecycle and CRUD surface.
//!
//! [`ShardMeta`] binds the in-memory registry to the file-backed action
//! log. Opening replays every surviving record through the restore path
//! (checksum check, table decode, registration without index linkage) and
//! then runs the reorg pass that links each child into its super's tag
//! index. Mutations register in memory first and append their action
//! record second, while the caller still owns the logical operation; the
//! pending list is drained to the store by [`ShardMeta::commit`].
//!
//! Collaborators of the hosting repository are reached through
//! [`MetaHooks`]: a configuration fetch used to bootstrap newer tag
//! schemas, and the continuous-query notification fired when a stream
//! table is dropped. Hook calls never happen while the registry lock is
//! held.

use std::path::Path;
use std::sync::Arc;

use log::{debug, error, trace};
use parking_lot::Mutex;

use crate::action::{ActionRecord, MetaAction};
use crate::config::ShardConfig;
use crate::error::{
    FileCorruptedSnafu, InvalidActionSnafu, InvalidCreateMessageSnafu, InvalidTableIdSnafu,
    InvalidTableTypeSnafu, MetaResult, TableAlreadyExistsSnafu, TagVersionOutOfDateSnafu,
};
use crate::log_store::MetaLogStore;
use crate::meta::Meta;
use crate::table::{Table, TableKind, Tid, Uid, TAG_INDEX_COLUMN};
use crate::table_cfg::{TableCfg, UpdateTagValMsg};

/// Callbacks consumed from the hosting repository.
pub trait MetaHooks: Send + Sync {
    /// Return a fresh create-table message for the given tid, used to
    /// bootstrap a newer tag schema when a tag-value update arrives ahead
    /// of its schema. `None` when the host cannot provide one.
    fn refresh_config(&self, shard_id: u32, tid: Tid) -> Option<Vec<u8>>;

    /// Notify the continuous-query subsystem that a stream table was
    /// dropped. Failures are the subsystem's to handle; they are not
    /// propagated into the drop.
    fn on_stream_drop(&self, uid: Uid, sql: &str);
}

/// Hooks implementation for hosts without a config service or continuous
/// queries.
#[derive(Debug, Default)]
pub struct NoopHooks;

impl MetaHooks for NoopHooks {
    fn refresh_config(&self, _shard_id: u32, _tid: Tid) -> Option<Vec<u8>> {
        None
    }

    fn on_stream_drop(&self, _uid: Uid, _sql: &str) {}
}

/// The metadata core of one storage shard.
#[derive(Debug)]
pub struct ShardMeta {
    cfg: ShardConfig,
    meta: Meta,
    hooks: Arc<dyn MetaHooks>,
    /// Pending action list of the current in-memory segment, drained by
    /// [`ShardMeta::commit`].
    pending: Mutex<Vec<ActionRecord>>,
    store: tokio::sync::Mutex<MetaLogStore>,
}

impl std::fmt::Debug for dyn MetaHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MetaHooks")
    }
}

impl ShardMeta {
    /// Open the shard's metadata, restoring every table from the action
    /// log under `root_dir` and rebuilding the tag indexes.
    pub async fn open(
        root_dir: impl AsRef<Path>,
        cfg: ShardConfig,
        hooks: Arc<dyn MetaHooks>,
    ) -> MetaResult<ShardMeta> {
        let meta = Meta::new(&cfg);
        let shard_id = cfg.shard_id;

        let store = MetaLogStore::open(root_dir.as_ref(), |record| {
            restore_table(&meta, shard_id, record)
        })
        .await?;

        // Index registration was deferred during restore because a child
        // can be replayed ahead of its super; link everything now.
        for child_uid in meta.child_uids() {
            meta.add_to_index(child_uid)?;
        }

        debug!("shard {shard_id}: meta opened, {} tables", meta.table_count());
        Ok(ShardMeta {
            cfg,
            meta,
            hooks,
            pending: Mutex::new(Vec::new()),
            store: tokio::sync::Mutex::new(store),
        })
    }

    /// The shard this driver belongs to.
    pub fn shard_id(&self) -> u32 {
        self.cfg.shard_id
    }

    /// The in-memory registry.
    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    /// Kinds and uids of the actions emitted since the last commit, in
    /// emission order.
    pub fn pending_actions(&self) -> Vec<(MetaAction, Uid)> {
        self.pending
            .lock()
            .iter()
            .map(|r| (r.act(), r.uid()))
            .collect()
    }

    /// Drain the pending action list to the log store.
    pub async fn commit(&self) -> MetaResult<()> {
        let records: Vec<ActionRecord> = std::mem::take(&mut *self.pending.lock());
        if records.is_empty() {
            return Ok(());
        }
        let mut store = self.store.lock().await;
        store.append(&records).await?;
        trace!(
            "shard {}: {} meta actions committed",
            self.cfg.shard_id,
            records.len()
        );
        Ok(())
    }

    /// Commit outstanding actions, release every table, and close the log.
    pub async fn close(self) -> MetaResult<()> {
        self.commit().await?;
        self.meta.clear();
        let store = self.store.into_inner();
        store.close().await?;
        debug!("shard {}: meta is closed", self.cfg.shard_id);
        Ok(())
    }

    /// Create a table from a configuration descriptor.
    ///
    /// A child whose super is unknown synthesizes that super from the same
    /// descriptor; a child whose super exists validates it and refreshes
    /// its schemas instead. UpdateMeta actions are emitted with the newly
    /// synthesized super ahead of the child.
    pub fn create_table(&self, cfg: &TableCfg) -> MetaResult<()> {
        let uid = cfg.uid();
        let shard_id = self.cfg.shard_id;

        if let Some(id) = self.meta.table_id(uid) {
            error!(
                "shard {shard_id}: table already exists, tid {} uid {}",
                id.tid, id.uid
            );
            return TableAlreadyExistsSnafu { uid }.fail();
        }

        let mut new_super: Option<Uid> = None;
        if cfg.kind() == TableKind::Child {
            let super_uid = cfg.super_uid().ok_or_else(|| {
                InvalidCreateMessageSnafu {
                    reason: "child table without a superUid".to_string(),
                }
                .build()
            })?;
            match self.meta.table_kind(super_uid) {
                None => {
                    // Super table does not exist; create it from this cfg.
                    let sup = Table::new(cfg, true)?;
                    self.meta.add_to_meta(sup, true)?;
                    new_super = Some(super_uid);
                }
                Some(TableKind::Super) => {
                    self.update_table(super_uid, cfg)?;
                }
                Some(kind) => {
                    return InvalidTableTypeSnafu {
                        uid: super_uid,
                        kind,
                    }
                    .fail()
                }
            }
        }

        let table = Table::new(cfg, false)?;
        if let Err(e) = self.meta.add_to_meta(table, true) {
            if let Some(sup_uid) = new_super {
                self.meta.remove_from_meta(sup_uid, false);
            }
            return Err(e);
        }

        if let Some(sup_uid) = new_super {
            self.push_update_action(sup_uid)?;
        }
        self.push_update_action(uid)?;
        Ok(())
    }

    /// Drop a table by uid.
    ///
    /// Dropping a super first drains every indexed child, emitting one
    /// DropMeta record per child before its removal; the record for the
    /// dropped root itself is the caller's responsibility. Dropping a
    /// stream notifies the continuous-query hook before any removal.
    pub fn drop_table(&self, uid: Uid) -> MetaResult<()> {
        let shard_id = self.cfg.shard_id;
        let Some(kind) = self.meta.table_kind(uid) else {
            error!("shard {shard_id}: failed to drop table since table not exists! uid {uid}");
            return InvalidTableIdSnafu { uid, tid: 0 }.fail();
        };
        let name = self.meta.table_name(uid).unwrap_or_default();
        trace!("shard {shard_id}: try to drop table {name} kind {kind:?}");

        if kind == TableKind::Stream {
            let sql = self
                .meta
                .with_table(uid, |t| t.sql().map(str::to_string))
                .flatten();
            if let Some(sql) = sql {
                self.hooks.on_stream_drop(uid, &sql);
            }
        }

        if kind == TableKind::Super {
            for child_uid in self.meta.children_of_super(uid) {
                self.push_drop_action(child_uid);
                self.meta.remove_from_meta(child_uid, false);
            }
        }

        self.meta.remove_from_meta(uid, true);

        trace!("shard {shard_id}: table {name} is dropped, uid {uid}");
        Ok(())
    }

    /// Apply a configuration update to a non-child table, emitting an
    /// UpdateMeta action when anything changed.
    ///
    /// Callers must quiesce queries and commits on the table; the registry
    /// lock serializes the mutation itself.
    pub fn update_table(&self, uid: Uid, cfg: &TableCfg) -> MetaResult<()> {
        let changed = self.meta.apply_update(uid, cfg)?;
        if changed {
            self.push_update_action(uid)?;
        }
        Ok(())
    }

    /// Apply a tag-value update message to a child table.
    ///
    /// A message built against a newer tag schema than the local one
    /// triggers a configuration refresh through the hooks; a message built
    /// against an older schema is rejected with `TagVersionOutOfDate`.
    /// When the designated tag column changes, the child is re-linked in
    /// its super's index under the new key.
    pub fn update_tag_value(&self, msg: &UpdateTagValMsg) -> MetaResult<()> {
        let shard_id = self.cfg.shard_id;
        let uid = msg.uid;

        let Some(id) = self.meta.table_id(uid) else {
            return InvalidTableIdSnafu { uid, tid: msg.tid }.fail();
        };
        if id.tid != msg.tid {
            return InvalidTableIdSnafu { uid, tid: msg.tid }.fail();
        }
        let kind = self.meta.table_kind(uid).unwrap_or(TableKind::Child);
        if kind != TableKind::Child {
            error!(
                "shard {shard_id}: failed to update tag value of table uid {uid} since its kind is {kind:?}"
            );
            return InvalidActionSnafu {
                uid,
                detail: format!("cannot update tag value of a {kind:?} table"),
            }
            .fail();
        }

        let Some(tag_schema) = self.meta.tag_schema(uid) else {
            return InvalidActionSnafu {
                uid,
                detail: "table has no tag schema".to_string(),
            }
            .fail();
        };

        if tag_schema.version() < msg.tversion {
            trace!(
                "shard {shard_id}: server tag version {} is older than client tag version {}, try to config",
                tag_schema.version(),
                msg.tversion
            );
            let Some(bytes) = self.hooks.refresh_config(shard_id, id.tid) else {
                return TagVersionOutOfDateSnafu {
                    client: msg.tversion,
                    server: tag_schema.version(),
                }
                .fail();
            };
            let fresh = TableCfg::from_create_msg(&bytes)?;
            let Some(super_uid) = fresh.super_uid() else {
                return InvalidCreateMessageSnafu {
                    reason: "refreshed config names no super table".to_string(),
                }
                .fail();
            };
            if !self.meta.contains(super_uid) {
                return InvalidTableIdSnafu {
                    uid: super_uid,
                    tid: 0,
                }
                .fail();
            }
            self.update_table(super_uid, &fresh)?;
        }

        let Some(tag_schema) = self.meta.tag_schema(uid) else {
            return InvalidActionSnafu {
                uid,
                detail: "table has no tag schema".to_string(),
            }
            .fail();
        };
        if tag_schema.version() > msg.tversion {
            error!(
                "shard {shard_id}: failed to update tag value of table uid {uid} since version out of date, \
                 client tag version {} server tag version {}",
                msg.tversion,
                tag_schema.version()
            );
            return TagVersionOutOfDateSnafu {
                client: msg.tversion,
                server: tag_schema.version(),
            }
            .fail();
        }

        let designated = tag_schema.col_at(TAG_INDEX_COLUMN).map(|c| c.col_id);
        let reindex = designated == Some(msg.col_id);
        self.meta
            .apply_tag_value(uid, msg.col_id, msg.data.clone(), reindex)
    }

    fn push_update_action(&self, uid: Uid) -> MetaResult<()> {
        let Some(payload) = self.meta.encode_table(uid) else {
            return InvalidTableIdSnafu { uid, tid: 0 }.fail();
        };
        self.pending
            .lock()
            .push(ActionRecord::update_meta(uid, &payload));
        Ok(())
    }

    fn push_drop_action(&self, uid: Uid) {
        self.pending.lock().push(ActionRecord::drop_meta(uid));
    }
}

/// Restore callback invoked by the log store per surviving record.
fn restore_table(meta: &Meta, shard_id: u32, record: &ActionRecord) -> MetaResult<()> {
    let payload = record.verify_payload()?;
    let mut rd: &[u8] = payload;
    let table = Table::decode(&mut rd).map_err(|e| {
        FileCorruptedSnafu {
            reason: format!("record for uid {}: {e}", record.uid()),
        }
        .build()
    })?;

    let name = table.name().to_string();
    let tid = table.tid();
    let uid = table.uid();
    meta.add_to_meta(table, false)?;

    trace!("shard {shard_id}: table {name} tid {tid} uid {uid} is restored from file");
    Ok(())
}
