//! Log record types and their on-disk encoding
//!
//! ## Record Format
//!
//! ```text
//! [type: u8][txn_id: u64][commit_id: u64][tile_group_id: u64][offset: u32][payload_len: u32][payload][crc32: u32]
//! ```
//!
//! - All integers are little-endian
//! - `commit_id` is `PENDING_CID` on every record except COMMIT
//! - `tile_group_id` and `offset` are present only on tuple records
//! - `payload` is the bincode-encoded `Tuple` for INSERT and UPDATE, empty otherwise
//! - `crc32` covers every preceding byte of the record
//!
//! A record cut short (crash mid-write) decodes as `Error::IncompleteRecord`;
//! a record whose checksum does not match decodes as `Error::Corruption`.

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use crc32fast::Hasher;
use tessera_core::{CommitId, Error, Result, Tuple, TupleSlot, TxnId, PENDING_CID};

/// Record type tags
pub const TYPE_BEGIN: u8 = 1;
/// COMMIT record tag
pub const TYPE_COMMIT: u8 = 2;
/// ABORT record tag
pub const TYPE_ABORT: u8 = 3;
/// TUPLE_INSERT record tag
pub const TYPE_INSERT: u8 = 4;
/// TUPLE_UPDATE record tag
pub const TYPE_UPDATE: u8 = 5;
/// TUPLE_DELETE record tag
pub const TYPE_DELETE: u8 = 6;

/// `type + txn_id + commit_id`
const HEADER_LEN: usize = 1 + 8 + 8;
/// `tile_group_id + offset`
const SLOT_LEN: usize = 8 + 4;
const LEN_FIELD: usize = 4;
const CRC_LEN: usize = 4;

/// Upper bound on a payload, used to tell garbage lengths from short reads
pub const MAX_PAYLOAD_LEN: usize = 64 * 1024 * 1024;

/// One write-ahead log record
#[derive(Debug, Clone, PartialEq)]
pub enum LogRecord {
    /// Transaction started
    Begin {
        /// Transaction id
        txn_id: TxnId,
    },
    /// Transaction committed at `commit_id`
    Commit {
        /// Transaction id
        txn_id: TxnId,
        /// Assigned commit id
        commit_id: CommitId,
    },
    /// Transaction rolled back
    Abort {
        /// Transaction id
        txn_id: TxnId,
    },
    /// New row at `slot`
    TupleInsert {
        /// Transaction id
        txn_id: TxnId,
        /// Target slot
        slot: TupleSlot,
        /// Column values
        tuple: Tuple,
    },
    /// New version of the row at `slot`
    TupleUpdate {
        /// Transaction id
        txn_id: TxnId,
        /// Target slot
        slot: TupleSlot,
        /// Column values
        tuple: Tuple,
    },
    /// Row at `slot` deleted
    TupleDelete {
        /// Transaction id
        txn_id: TxnId,
        /// Target slot
        slot: TupleSlot,
    },
}

impl LogRecord {
    /// Type tag written to disk
    pub fn type_tag(&self) -> u8 {
        match self {
            LogRecord::Begin { .. } => TYPE_BEGIN,
            LogRecord::Commit { .. } => TYPE_COMMIT,
            LogRecord::Abort { .. } => TYPE_ABORT,
            LogRecord::TupleInsert { .. } => TYPE_INSERT,
            LogRecord::TupleUpdate { .. } => TYPE_UPDATE,
            LogRecord::TupleDelete { .. } => TYPE_DELETE,
        }
    }

    /// Transaction the record belongs to
    pub fn txn_id(&self) -> TxnId {
        match self {
            LogRecord::Begin { txn_id }
            | LogRecord::Commit { txn_id, .. }
            | LogRecord::Abort { txn_id }
            | LogRecord::TupleInsert { txn_id, .. }
            | LogRecord::TupleUpdate { txn_id, .. }
            | LogRecord::TupleDelete { txn_id, .. } => *txn_id,
        }
    }

    /// Commit id carried by a COMMIT record
    pub fn commit_id(&self) -> Option<CommitId> {
        match self {
            LogRecord::Commit { commit_id, .. } => Some(*commit_id),
            _ => None,
        }
    }

    /// Slot touched by a tuple record
    pub fn slot(&self) -> Option<TupleSlot> {
        match self {
            LogRecord::TupleInsert { slot, .. }
            | LogRecord::TupleUpdate { slot, .. }
            | LogRecord::TupleDelete { slot, .. } => Some(*slot),
            _ => None,
        }
    }

    /// Whether the record carries a slot
    pub fn is_tuple_record(&self) -> bool {
        self.slot().is_some()
    }
}

fn tag_has_slot(tag: u8) -> bool {
    matches!(tag, TYPE_INSERT | TYPE_UPDATE | TYPE_DELETE)
}

/// Encode a record to bytes ready for the log file
pub fn encode_record(record: &LogRecord) -> Result<Vec<u8>> {
    let payload = match record {
        LogRecord::TupleInsert { tuple, .. } | LogRecord::TupleUpdate { tuple, .. } => {
            bincode::serialize(tuple)?
        }
        _ => Vec::new(),
    };
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(Error::Serialization(format!(
            "payload of {} bytes exceeds limit of {}",
            payload.len(),
            MAX_PAYLOAD_LEN
        )));
    }

    let slot_len = if record.is_tuple_record() { SLOT_LEN } else { 0 };
    let mut buf =
        Vec::with_capacity(HEADER_LEN + slot_len + LEN_FIELD + payload.len() + CRC_LEN);

    buf.write_u8(record.type_tag())?;
    buf.write_u64::<LittleEndian>(record.txn_id())?;
    buf.write_u64::<LittleEndian>(record.commit_id().unwrap_or(PENDING_CID))?;
    if let Some(slot) = record.slot() {
        buf.write_u64::<LittleEndian>(slot.tile_group_id)?;
        buf.write_u32::<LittleEndian>(slot.offset)?;
    }
    buf.write_u32::<LittleEndian>(payload.len() as u32)?;
    buf.extend_from_slice(&payload);

    let mut hasher = Hasher::new();
    hasher.update(&buf);
    buf.write_u32::<LittleEndian>(hasher.finalize())?;

    Ok(buf)
}

fn incomplete(offset: u64, have: usize, needed: usize) -> Error {
    Error::IncompleteRecord {
        offset,
        have,
        needed,
    }
}

/// Decode one record from the front of `buf`
///
/// `offset` is the file position of `buf[0]`, used in error reports.
/// Returns the record and the number of bytes it occupied.
pub fn decode_record(buf: &[u8], offset: u64) -> Result<(LogRecord, usize)> {
    if buf.len() < HEADER_LEN {
        return Err(incomplete(offset, buf.len(), HEADER_LEN));
    }

    let tag = buf[0];
    if !(TYPE_BEGIN..=TYPE_DELETE).contains(&tag) {
        return Err(Error::Corruption(format!(
            "offset {}: unknown record type {}",
            offset, tag
        )));
    }
    let txn_id = LittleEndian::read_u64(&buf[1..9]);
    let commit_id = LittleEndian::read_u64(&buf[9..17]);

    let mut pos = HEADER_LEN;
    let slot = if tag_has_slot(tag) {
        if buf.len() < pos + SLOT_LEN {
            return Err(incomplete(offset, buf.len(), pos + SLOT_LEN));
        }
        let tile_group_id = LittleEndian::read_u64(&buf[pos..pos + 8]);
        let slot_offset = LittleEndian::read_u32(&buf[pos + 8..pos + 12]);
        pos += SLOT_LEN;
        Some(TupleSlot::new(tile_group_id, slot_offset))
    } else {
        None
    };

    if buf.len() < pos + LEN_FIELD {
        return Err(incomplete(offset, buf.len(), pos + LEN_FIELD));
    }
    let payload_len = LittleEndian::read_u32(&buf[pos..pos + LEN_FIELD]) as usize;
    pos += LEN_FIELD;
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(Error::Corruption(format!(
            "offset {}: payload length {} exceeds limit",
            offset, payload_len
        )));
    }

    let total = pos + payload_len + CRC_LEN;
    if buf.len() < total {
        return Err(incomplete(offset, buf.len(), total));
    }

    let payload = &buf[pos..pos + payload_len];
    let expected_crc = LittleEndian::read_u32(&buf[total - CRC_LEN..total]);
    let mut hasher = Hasher::new();
    hasher.update(&buf[..total - CRC_LEN]);
    let actual_crc = hasher.finalize();
    if actual_crc != expected_crc {
        return Err(Error::Corruption(format!(
            "offset {}: CRC mismatch: expected {:08x}, got {:08x}",
            offset, expected_crc, actual_crc
        )));
    }

    let decode_tuple = |bytes: &[u8]| -> Result<Tuple> {
        bincode::deserialize(bytes).map_err(|e| {
            Error::Corruption(format!("offset {}: payload decode failed: {}", offset, e))
        })
    };

    let record = match (tag, slot) {
        (TYPE_BEGIN, _) => LogRecord::Begin { txn_id },
        (TYPE_COMMIT, _) => LogRecord::Commit { txn_id, commit_id },
        (TYPE_ABORT, _) => LogRecord::Abort { txn_id },
        (TYPE_INSERT, Some(slot)) => LogRecord::TupleInsert {
            txn_id,
            slot,
            tuple: decode_tuple(payload)?,
        },
        (TYPE_UPDATE, Some(slot)) => LogRecord::TupleUpdate {
            txn_id,
            slot,
            tuple: decode_tuple(payload)?,
        },
        (TYPE_DELETE, Some(slot)) => LogRecord::TupleDelete { txn_id, slot },
        _ => {
            return Err(Error::Corruption(format!(
                "offset {}: malformed record of type {}",
                offset, tag
            )))
        }
    };

    Ok((record, total))
}
