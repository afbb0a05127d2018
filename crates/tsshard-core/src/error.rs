//! Error types and SNAFU context selectors for the metadata core.
//!
//! This module centralizes the `MetaError` enum used by the public API and
//! exposes context selectors (via `#[snafu(visibility(pub(crate)))]`) so
//! sibling modules can attach error context without re-exporting everything
//! at the crate root. Errors are carried explicitly as result values; the
//! core keeps no ambient last-error state.

use snafu::{Backtrace, Snafu};

use crate::storage::StorageError;
use crate::table::{TableKind, Tid, Uid};

/// General result type used throughout the metadata core.
pub type MetaResult<T> = Result<T, MetaError>;

/// Errors surfaced by the metadata registry and its persistence driver.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum MetaError {
    /// A create request named a uid that is already registered.
    #[snafu(display("table with uid {uid} already exists"))]
    TableAlreadyExists {
        /// The colliding table uid.
        uid: Uid,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// A uid or tid lookup missed, or a message named an id that disagrees
    /// with the registered table.
    #[snafu(display("invalid table id: uid {uid}, tid {tid}"))]
    InvalidTableId {
        /// The uid that failed to resolve.
        uid: Uid,
        /// The tid carried by the request, or the sentinel when unknown.
        tid: Tid,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// The resolved table has the wrong kind for the requested operation.
    #[snafu(display("table uid {uid} has kind {kind:?}, invalid for this operation"))]
    InvalidTableType {
        /// The offending table uid.
        uid: Uid,
        /// The kind that was actually registered.
        kind: TableKind,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// The operation itself is not applicable to the target table.
    #[snafu(display("invalid action on table uid {uid}: {detail}"))]
    InvalidAction {
        /// The target table uid.
        uid: Uid,
        /// What made the action invalid.
        detail: String,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// A create-table message or configuration descriptor is malformed.
    #[snafu(display("invalid create-table message: {reason}"))]
    InvalidCreateMessage {
        /// A description of the malformation.
        reason: String,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// The incoming tag-schema version is older than the registered one.
    #[snafu(display(
        "tag version out of date: client tag version {client}, server tag version {server}"
    ))]
    TagVersionOutOfDate {
        /// The version carried by the client message.
        client: i32,
        /// The version currently registered on the server side.
        server: i32,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// A persisted record failed checksum verification or decoding.
    #[snafu(display("meta file corrupted: {reason}"))]
    FileCorrupted {
        /// A description of the corruption.
        reason: String,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// Underlying storage error while working with the meta log file.
    ///
    /// Backtraces are delegated to the inner StorageError.
    #[snafu(display("storage error while accessing meta log: {source}"))]
    Storage {
        /// Underlying storage error returned by the storage layer.
        #[snafu(backtrace)]
        source: StorageError,
    },
}
