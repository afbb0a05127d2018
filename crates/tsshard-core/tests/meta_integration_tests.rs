//! Integration tests for the shard metadata core.
//!
//! These tests validate end-to-end behavior of the registry and its
//! persistence driver:
//! - Implicit super creation and action ordering,
//! - Tag-index maintenance across tag-value updates,
//! - Schema history bounds and FIFO eviction,
//! - Restart round-trips through the action log, including corruption.
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;
use tsshard_core::{
    ColId, ColumnType, MetaAction, MetaError, NoopHooks, Schema, SchemaBuilder, ShardConfig,
    ShardMeta, TableCfg, TableKind, TagRowBuilder, Tid, Uid, UpdateTagValMsg, MAX_TABLE_SCHEMAS,
};

type TestResult = Result<(), Box<dyn std::error::Error>>;

// =============================================================================
// Test Helpers
// =============================================================================

async fn open_shard(root: &Path) -> ShardMeta {
    ShardMeta::open(
        root,
        ShardConfig {
            shard_id: 1,
            max_tables: 64,
        },
        Arc::new(NoopHooks),
    )
    .await
    .expect("open shard meta")
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
    child_cfg_versioned(uid, tid, super_uid, tag, 1)
}

fn child_cfg_versioned(uid: Uid, tid: Tid, super_uid: Uid, tag: i32, tversion: i32) -> TableCfg {
    let mut tags = TagRowBuilder::new();
    tags.add(10, tag.to_le_bytes().to_vec()).expect("tag value");
    TableCfg::new(TableKind::Child, uid, tid)
        .expect("cfg")
        .set_name(format!("c{uid}"))
        .expect("name")
        .set_schema(data_schema(1, 2))
        .expect("schema")
        .set_tag_schema(tag_schema(tversion))
        .expect("tag schema")
        .set_super_name("s")
        .expect("super name")
        .set_super_uid(super_uid)
        .expect("super uid")
        .set_tag_values(tags.build())
        .expect("tag values")
}

fn normal_cfg(uid: Uid, tid: Tid, version: i32, ncols: usize) -> TableCfg {
    TableCfg::new(TableKind::Normal, uid, tid)
        .expect("cfg")
        .set_name(format!("n{uid}"))
        .expect("name")
        .set_schema(data_schema(version, ncols))
        .expect("schema")
}

fn tag_update(uid: Uid, tid: Tid, tversion: i32, value: i32) -> UpdateTagValMsg {
    UpdateTagValMsg {
        uid,
        tid,
        tversion,
        col_id: 10,
        ty: ColumnType::Int,
        bytes: 4,
        data: value.to_le_bytes().to_vec(),
    }
}

// =============================================================================
// Creation and drop
// =============================================================================

/// Scenario: creating a child whose super is unknown synthesizes the super
/// and registers both, super's action first.
#[tokio::test]
async fn implicit_super_creation_links_everything() -> TestResult {
    let tmp = TempDir::new()?;
    let shard = open_shard(tmp.path()).await;

    shard.create_table(&child_cfg(1001, 5, 77, 42))?;
    let meta = shard.meta();

    assert!(meta.contains(77));
    assert!(meta.contains(1001));
    assert_eq!(meta.super_uids(), vec![77]);
    assert_eq!(meta.tid_slot(5), Some(1001));
    assert_eq!(meta.table_kind(77), Some(TableKind::Super));
    assert_eq!(meta.table_kind(1001), Some(TableKind::Child));

    assert_eq!(meta.tag_index_len(77), Some(1));
    assert_eq!(meta.children_with_tag(77, &42i32.to_le_bytes()), vec![1001]);

    assert_eq!(
        shard.pending_actions(),
        vec![(MetaAction::UpdateMeta, 77), (MetaAction::UpdateMeta, 1001)]
    );
    Ok(())
}

/// Scenario: re-issuing the same create is rejected and leaves no trace.
#[tokio::test]
async fn duplicate_uid_is_rejected_without_side_effects() -> TestResult {
    let tmp = TempDir::new()?;
    let shard = open_shard(tmp.path()).await;
    shard.create_table(&child_cfg(1001, 5, 77, 42))?;

    let err = shard
        .create_table(&child_cfg(1001, 5, 77, 42))
        .expect_err("duplicate uid");
    assert!(matches!(err, MetaError::TableAlreadyExists { uid: 1001, .. }));

    let meta = shard.meta();
    assert_eq!(meta.table_count(), 1);
    assert_eq!(meta.super_count(), 1);
    assert_eq!(meta.tag_index_len(77), Some(1));
    assert_eq!(shard.pending_actions().len(), 2);
    Ok(())
}

/// A second child of an existing super reuses it instead of synthesizing.
#[tokio::test]
async fn second_child_attaches_to_the_existing_super() -> TestResult {
    let tmp = TempDir::new()?;
    let shard = open_shard(tmp.path()).await;
    shard.create_table(&child_cfg(1001, 5, 77, 42))?;
    shard.create_table(&child_cfg(1002, 6, 77, 42))?;

    let meta = shard.meta();
    assert_eq!(meta.super_count(), 1);
    assert_eq!(meta.tag_index_len(77), Some(2));
    assert_eq!(
        meta.children_with_tag(77, &42i32.to_le_bytes()),
        vec![1001, 1002]
    );

    // Only the child's action is emitted; the super already existed and
    // nothing about it changed.
    assert_eq!(
        shard.pending_actions(),
        vec![
            (MetaAction::UpdateMeta, 77),
            (MetaAction::UpdateMeta, 1001),
            (MetaAction::UpdateMeta, 1002),
        ]
    );
    Ok(())
}

/// A child naming a non-super table as its super is rejected.
#[tokio::test]
async fn child_of_a_normal_table_is_rejected() -> TestResult {
    let tmp = TempDir::new()?;
    let shard = open_shard(tmp.path()).await;
    shard.create_table(&normal_cfg(77, 3, 1, 2))?;

    let err = shard
        .create_table(&child_cfg(1001, 5, 77, 42))
        .expect_err("super uid names a normal table");
    assert!(matches!(err, MetaError::InvalidTableType { uid: 77, .. }));
    assert!(!shard.meta().contains(1001));
    Ok(())
}

/// Dropping a super drains every child first, one DropMeta record each.
#[tokio::test]
async fn dropping_a_super_removes_children_first() -> TestResult {
    let tmp = TempDir::new()?;
    let shard = open_shard(tmp.path()).await;
    shard.create_table(&child_cfg(1001, 5, 77, 1))?;
    shard.create_table(&child_cfg(1002, 6, 77, 2))?;
    shard.create_table(&child_cfg(1003, 7, 77, 3))?;
    shard.commit().await?;

    shard.drop_table(77)?;

    let meta = shard.meta();
    assert!(!meta.contains(77));
    assert!(!meta.contains(1001));
    assert!(!meta.contains(1002));
    assert!(!meta.contains(1003));
    assert_eq!(meta.table_count(), 0);
    assert_eq!(meta.super_count(), 0);
    assert_eq!(meta.tid_slot(5), None);

    let actions = shard.pending_actions();
    assert_eq!(actions.len(), 3);
    assert!(actions.iter().all(|(act, _)| *act == MetaAction::DropMeta));
    let mut dropped: Vec<Uid> = actions.iter().map(|(_, uid)| *uid).collect();
    dropped.sort_unstable();
    assert_eq!(dropped, vec![1001, 1002, 1003]);
    Ok(())
}

/// Dropping an unknown uid reports an invalid table id.
#[tokio::test]
async fn dropping_an_unknown_table_fails() -> TestResult {
    let tmp = TempDir::new()?;
    let shard = open_shard(tmp.path()).await;

    let err = shard.drop_table(4242).expect_err("unknown uid");
    assert!(matches!(err, MetaError::InvalidTableId { uid: 4242, .. }));
    Ok(())
}

// =============================================================================
// Tag values and the tag index
// =============================================================================

/// Scenario: updating the designated tag column moves the child from the
/// old index key to the new one.
#[tokio::test]
async fn tag_value_update_moves_the_index_key() -> TestResult {
    let tmp = TempDir::new()?;
    let shard = open_shard(tmp.path()).await;
    shard.create_table(&child_cfg(1001, 5, 77, 42))?;

    shard.update_tag_value(&tag_update(1001, 5, 1, 99))?;

    let meta = shard.meta();
    assert!(meta.children_with_tag(77, &42i32.to_le_bytes()).is_empty());
    assert_eq!(meta.children_with_tag(77, &99i32.to_le_bytes()), vec![1001]);

    let val = meta
        .tag_value(1001, 10, ColumnType::Int, 4)?
        .expect("tag value");
    assert_eq!(val, 99i32.to_le_bytes());
    Ok(())
}

/// Scenario: a message built against an older tag schema is rejected and
/// the child is left untouched.
#[tokio::test]
async fn stale_tag_schema_version_is_rejected() -> TestResult {
    let tmp = TempDir::new()?;
    let shard = open_shard(tmp.path()).await;
    shard.create_table(&child_cfg_versioned(1001, 5, 77, 42, 3))?;

    let err = shard
        .update_tag_value(&tag_update(1001, 5, 2, 99))
        .expect_err("client version older than server");
    assert!(matches!(
        err,
        MetaError::TagVersionOutOfDate {
            client: 2,
            server: 3,
            ..
        }
    ));

    let meta = shard.meta();
    assert_eq!(meta.children_with_tag(77, &42i32.to_le_bytes()), vec![1001]);
    let val = meta
        .tag_value(1001, 10, ColumnType::Int, 4)?
        .expect("tag value");
    assert_eq!(val, 42i32.to_le_bytes());
    Ok(())
}

/// A tid that disagrees with the registered table is an invalid id.
#[tokio::test]
async fn tag_update_with_wrong_tid_is_rejected() -> TestResult {
    let tmp = TempDir::new()?;
    let shard = open_shard(tmp.path()).await;
    shard.create_table(&child_cfg(1001, 5, 77, 42))?;

    let err = shard
        .update_tag_value(&tag_update(1001, 6, 1, 99))
        .expect_err("tid mismatch");
    assert!(matches!(err, MetaError::InvalidTableId { .. }));
    Ok(())
}

/// Tag updates only apply to child tables.
#[tokio::test]
async fn tag_update_on_a_super_is_an_invalid_action() -> TestResult {
    let tmp = TempDir::new()?;
    let shard = open_shard(tmp.path()).await;
    shard.create_table(&child_cfg(1001, 5, 77, 42))?;

    let err = shard
        .update_tag_value(&tag_update(77, -1, 1, 99))
        .expect_err("super table");
    assert!(matches!(err, MetaError::InvalidAction { uid: 77, .. }));
    Ok(())
}

/// Updating a non-designated tag column leaves the index untouched.
#[tokio::test]
async fn non_designated_tag_column_updates_in_place() -> TestResult {
    let tmp = TempDir::new()?;
    let shard = open_shard(tmp.path()).await;

    // Tag schema with two columns; col 11 is not the index column.
    let mut b = SchemaBuilder::new(1);
    b.add_col(10, ColumnType::Int, 4);
    b.add_col(11, ColumnType::Int, 4);
    let two_tags = Arc::new(b.build().expect("valid schema"));

    let mut tags = TagRowBuilder::new();
    tags.add(10, 42i32.to_le_bytes().to_vec()).expect("tag");
    tags.add(11, 7i32.to_le_bytes().to_vec()).expect("tag");
    let cfg = TableCfg::new(TableKind::Child, 1001, 5)
        .expect("cfg")
        .set_name("c1001")
        .expect("name")
        .set_schema(data_schema(1, 2))
        .expect("schema")
        .set_tag_schema(two_tags)
        .expect("tag schema")
        .set_super_name("s")
        .expect("super name")
        .set_super_uid(77)
        .expect("super uid")
        .set_tag_values(tags.build())
        .expect("tag values");
    shard.create_table(&cfg)?;

    let msg = UpdateTagValMsg {
        uid: 1001,
        tid: 5,
        tversion: 1,
        col_id: 11,
        ty: ColumnType::Int,
        bytes: 4,
        data: 8i32.to_le_bytes().to_vec(),
    };
    shard.update_tag_value(&msg)?;

    let meta = shard.meta();
    assert_eq!(meta.children_with_tag(77, &42i32.to_le_bytes()), vec![1001]);
    let val = meta
        .tag_value(1001, 11, ColumnType::Int, 4)?
        .expect("tag value");
    assert_eq!(val, 8i32.to_le_bytes());
    Ok(())
}

// =============================================================================
// Schema history
// =============================================================================

/// Scenario: the history is bounded and evicts its oldest entry FIFO.
#[tokio::test]
async fn schema_history_evicts_fifo_at_capacity() -> TestResult {
    let tmp = TempDir::new()?;
    let shard = open_shard(tmp.path()).await;
    shard.create_table(&normal_cfg(2001, 9, 1, 2))?;

    let last = MAX_TABLE_SCHEMAS as i32 + 1;
    for version in 2..=last {
        shard.update_table(2001, &normal_cfg(2001, 9, version, 2))?;
    }

    let meta = shard.meta();
    let versions = meta
        .with_table(2001, |t| t.schemas().map(|h| h.versions()))
        .flatten()
        .expect("history");
    assert_eq!(versions.len(), MAX_TABLE_SCHEMAS);
    assert_eq!(versions[0], 2);
    assert_eq!(*versions.last().expect("newest"), last);

    assert!(meta.schema_by_version(2001, 1).is_none());
    assert_eq!(meta.schema(2001).expect("latest").version(), last);
    Ok(())
}

/// An update carrying the current version changes nothing and emits no
/// action.
#[tokio::test]
async fn same_version_update_is_a_no_op() -> TestResult {
    let tmp = TempDir::new()?;
    let shard = open_shard(tmp.path()).await;
    shard.create_table(&normal_cfg(2001, 9, 3, 2))?;
    shard.commit().await?;

    shard.update_table(2001, &normal_cfg(2001, 9, 3, 4))?;

    assert!(shard.pending_actions().is_empty());
    assert_eq!(shard.meta().schema(2001).expect("latest").ncols(), 2);
    Ok(())
}

/// Growing schemas push the registry's buffer-sizing maxima up.
#[tokio::test]
async fn maxima_follow_schema_updates() -> TestResult {
    let tmp = TempDir::new()?;
    let shard = open_shard(tmp.path()).await;
    shard.create_table(&normal_cfg(2001, 9, 1, 2))?;
    assert_eq!(shard.meta().max_cols(), 2);

    shard.update_table(2001, &normal_cfg(2001, 9, 2, 6))?;
    assert_eq!(shard.meta().max_cols(), 6);
    assert_eq!(shard.meta().max_row_bytes(), 8 + 5 * 4);
    Ok(())
}

// =============================================================================
// Restart round-trips
// =============================================================================

/// Scenario: close and reopen the shard; every table reappears, the child
/// is re-linked to its super, and the maxima are rebuilt.
#[tokio::test]
async fn restart_roundtrip_restores_tables_and_indexes() -> TestResult {
    let tmp = TempDir::new()?;
    {
        let shard = open_shard(tmp.path()).await;
        shard.create_table(&child_cfg(1001, 5, 77, 42))?;
        shard.create_table(&normal_cfg(2001, 9, 1, 2))?;
        let last = MAX_TABLE_SCHEMAS as i32 + 1;
        for version in 2..=last {
            shard.update_table(2001, &normal_cfg(2001, 9, version, 2))?;
        }
        shard.close().await?;
    }

    let shard = open_shard(tmp.path()).await;
    let meta = shard.meta();

    assert!(meta.contains(77));
    assert!(meta.contains(1001));
    assert!(meta.contains(2001));
    assert_eq!(meta.table_count(), 2);
    assert_eq!(meta.super_uids(), vec![77]);
    assert_eq!(meta.tid_slot(5), Some(1001));
    assert_eq!(meta.tid_slot(9), Some(2001));

    // The child-to-super link is rebuilt by the reorg pass.
    assert_eq!(meta.children_of_super(77), vec![1001]);
    assert_eq!(meta.children_with_tag(77, &42i32.to_le_bytes()), vec![1001]);
    assert_eq!(meta.schema(1001).expect("via super").version(), 1);

    // Only the newest state per uid survives replay.
    let versions = meta
        .with_table(2001, |t| t.schemas().map(|h| h.versions()))
        .flatten()
        .expect("history");
    assert_eq!(versions.len(), MAX_TABLE_SCHEMAS);
    assert_eq!(versions[0], 2);

    assert_eq!(meta.max_cols(), 2);
    assert_eq!(meta.max_row_bytes(), 12);
    Ok(())
}

/// Children dropped with their super stay dropped across a restart; the
/// root's own DropMeta record is the commit subsystem's to emit.
#[tokio::test]
async fn dropped_children_do_not_come_back() -> TestResult {
    let tmp = TempDir::new()?;
    {
        let shard = open_shard(tmp.path()).await;
        shard.create_table(&child_cfg(1001, 5, 77, 42))?;
        shard.create_table(&child_cfg(1002, 6, 77, 43))?;
        shard.drop_table(77)?;
        shard.close().await?;
    }

    let shard = open_shard(tmp.path()).await;
    let meta = shard.meta();
    assert!(!meta.contains(1001));
    assert!(!meta.contains(1002));
    assert_eq!(meta.table_count(), 0);
    // No DropMeta was written for the root inside drop_table.
    assert!(meta.contains(77));
    assert_eq!(meta.tag_index_len(77), Some(0));
    Ok(())
}

/// A flipped payload byte fails checksum verification and aborts the open.
#[tokio::test]
async fn corrupted_record_aborts_restore() -> TestResult {
    let tmp = TempDir::new()?;
    {
        let shard = open_shard(tmp.path()).await;
        shard.create_table(&normal_cfg(2001, 9, 1, 2))?;
        shard.close().await?;
    }

    let meta_file = tmp.path().join("META");
    let mut bytes = std::fs::read(&meta_file)?;
    // act(1) + uid(8) + len(4) puts offset 13 at the first payload byte.
    bytes[13] ^= 0x01;
    std::fs::write(&meta_file, &bytes)?;

    let result = ShardMeta::open(
        tmp.path(),
        ShardConfig {
            shard_id: 1,
            max_tables: 64,
        },
        Arc::new(NoopHooks),
    )
    .await;
    assert!(matches!(result, Err(MetaError::FileCorrupted { .. })));
    Ok(())
}

/// Stream tables survive restart with their query text.
#[tokio::test]
async fn stream_tables_restore_with_their_query() -> TestResult {
    let tmp = TempDir::new()?;
    {
        let shard = open_shard(tmp.path()).await;
        let cfg = TableCfg::new(TableKind::Stream, 9, 3)
            .expect("cfg")
            .set_name("st")
            .expect("name")
            .set_schema(data_schema(1, 2))
            .expect("schema")
            .set_sql("select avg(v) from m interval(10s)")
            .expect("sql");
        shard.create_table(&cfg)?;
        shard.close().await?;
    }

    let shard = open_shard(tmp.path()).await;
    let meta = shard.meta();
    assert_eq!(meta.table_kind(9), Some(TableKind::Stream));
    let sql = meta
        .with_table(9, |t| t.sql().map(str::to_string))
        .flatten()
        .expect("query text");
    assert_eq!(sql, "select avg(v) from m interval(10s)");
    Ok(())
}
