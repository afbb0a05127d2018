//! Action-log records describing metadata mutations.
//!
//! Every structural mutation that must survive restart is serialized into a
//! record appended to the pending action list of the in-memory segment and,
//! from there, to the key-value log store. A record is:
//!
//! ```text
//! u8 act, u64 uid (little-endian)
//! UpdateMeta only: u32 len, payload = encode(Table), u32 crc32
//! ```
//!
//! `len` counts payload plus checksum; the crc32 covers the payload bytes.
//! DropMeta records carry no content. Records are self-delimiting, so the
//! store file is a plain concatenation.

use bytes::BufMut;

use crate::codec::{self, CodecError, CodecResult, CHECKSUM_LEN};
use crate::error::{FileCorruptedSnafu, MetaResult};
use crate::table::Uid;

/// The kind of metadata mutation a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaAction {
    /// A table was created or its schema state changed; the record carries
    /// the table's full encoding.
    UpdateMeta,
    /// A table was dropped; the uid alone identifies it.
    DropMeta,
}

impl MetaAction {
    fn as_u8(self) -> u8 {
        match self {
            MetaAction::UpdateMeta => 0,
            MetaAction::DropMeta => 1,
        }
    }

    fn from_u8(value: u8) -> CodecResult<Self> {
        Ok(match value {
            0 => MetaAction::UpdateMeta,
            1 => MetaAction::DropMeta,
            other => {
                return Err(CodecError::InvalidTag {
                    what: "meta action",
                    value: other,
                })
            }
        })
    }
}

/// One record of the meta action log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionRecord {
    act: MetaAction,
    uid: Uid,
    /// Payload plus trailing checksum; empty for DropMeta.
    cont: Vec<u8>,
}

impl ActionRecord {
    /// Build an UpdateMeta record around an encoded table payload,
    /// appending the trailing checksum.
    pub fn update_meta(uid: Uid, payload: &[u8]) -> Self {
        let mut cont = Vec::with_capacity(payload.len() + CHECKSUM_LEN);
        cont.extend_from_slice(payload);
        codec::put_checksum(&mut cont, payload);
        Self {
            act: MetaAction::UpdateMeta,
            uid,
            cont,
        }
    }

    /// Build a DropMeta record.
    pub fn drop_meta(uid: Uid) -> Self {
        Self {
            act: MetaAction::DropMeta,
            uid,
            cont: Vec::new(),
        }
    }

    /// The mutation kind.
    pub fn act(&self) -> MetaAction {
        self.act
    }

    /// The table the record refers to.
    pub fn uid(&self) -> Uid {
        self.uid
    }

    /// The checksummed content block (payload plus trailing crc32).
    pub fn content(&self) -> &[u8] {
        &self.cont
    }

    /// Verify the trailing checksum and return the table payload.
    pub fn verify_payload(&self) -> MetaResult<&[u8]> {
        codec::verify_checksum(&self.cont).map_err(|e| {
            FileCorruptedSnafu {
                reason: format!("record for uid {}: {e}", self.uid),
            }
            .build()
        })
    }

    /// Append the record's on-disk form to `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.put_u8(self.act.as_u8());
        buf.put_u64_le(self.uid);
        if self.act == MetaAction::UpdateMeta {
            buf.put_u32_le(self.cont.len() as u32);
            buf.put_slice(&self.cont);
        }
    }

    /// Decode one record, consuming exactly its bytes. The checksum is not
    /// verified here; the restore path does that per record.
    pub fn decode(buf: &mut &[u8]) -> CodecResult<ActionRecord> {
        let act = MetaAction::from_u8(codec::get_u8(buf)?)?;
        let uid = codec::get_u64_le(buf)?;
        let cont = match act {
            MetaAction::UpdateMeta => {
                let len = codec::get_u32_le(buf)? as usize;
                if len < CHECKSUM_LEN {
                    return Err(CodecError::UnexpectedEof {
                        needed: CHECKSUM_LEN,
                        remaining: len,
                    });
                }
                codec::get_bytes(buf, len)?
            }
            MetaAction::DropMeta => Vec::new(),
        };
        Ok(ActionRecord { act, uid, cont })
    }
}
