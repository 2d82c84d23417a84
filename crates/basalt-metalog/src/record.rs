//! Metadata log records and their wire codec.
//!
//! A record describes one structural change to the LSM tree: index
//! creation or drop, range insertion or deletion, run insertion or
//! deletion. On disk a record is a MessagePack map keyed by small
//! integers; only the keys required by the record type are present.
//!
//! Range boundary keys are opaque byte strings. An absent boundary (or an
//! empty one) stands for the unbounded end of the key space.

use std::fmt;
use std::io::Read;

use crate::error::{Error, Result};

/// Wire key for the record type tag.
const KEY_TYPE: u8 = 0;
/// Wire key for `index_id`.
const KEY_INDEX_ID: u8 = 1;
/// Wire key for `range_id`.
const KEY_RANGE_ID: u8 = 2;
/// Wire key for `run_id`.
const KEY_RUN_ID: u8 = 3;
/// Wire key for `range_begin`.
const KEY_RANGE_BEGIN: u8 = 4;
/// Wire key for `range_end`.
const KEY_RANGE_END: u8 = 5;

/// Type tag of a metadata log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordType {
    /// A new index was created.
    CreateIndex = 0,
    /// An index was dropped.
    DropIndex = 1,
    /// A range was inserted into an index.
    InsertRange = 2,
    /// A range (and, transitively, its runs) was deleted.
    DeleteRange = 3,
    /// A run was inserted into a range.
    InsertRun = 4,
    /// A run was deleted.
    DeleteRun = 5,
}

impl RecordType {
    /// Decode a wire type tag.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::CreateIndex),
            1 => Some(Self::DropIndex),
            2 => Some(Self::InsertRange),
            3 => Some(Self::DeleteRange),
            4 => Some(Self::InsertRun),
            5 => Some(Self::DeleteRun),
            _ => None,
        }
    }

    /// Stable uppercase name, used in diagnostics.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::CreateIndex => "CREATE_INDEX",
            Self::DropIndex => "DROP_INDEX",
            Self::InsertRange => "INSERT_RANGE",
            Self::DeleteRange => "DELETE_RANGE",
            Self::InsertRun => "INSERT_RUN",
            Self::DeleteRun => "DELETE_RUN",
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One structural change to the LSM tree.
///
/// `index_id` is the logical-clock LSN at which the index was created and
/// uniquely identifies an index incarnation. `range_id` and `run_id` are
/// allocated by the writer and are unique within a journal lineage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    /// Create a new index.
    CreateIndex {
        /// Id of the created index.
        index_id: i64,
    },
    /// Drop an index. Recovery purges its ranges and runs.
    DropIndex {
        /// Id of the dropped index.
        index_id: i64,
    },
    /// Insert a new range into an index.
    InsertRange {
        /// Owner index.
        index_id: i64,
        /// Id of the new range.
        range_id: i64,
        /// Start of the key interval; `None` (or empty) is unbounded.
        begin: Option<Vec<u8>>,
        /// End of the key interval; `None` (or empty) is unbounded.
        end: Option<Vec<u8>>,
    },
    /// Delete a range and all its runs.
    DeleteRange {
        /// Id of the deleted range.
        range_id: i64,
    },
    /// Insert a new run into a range.
    InsertRun {
        /// Owner range.
        range_id: i64,
        /// Id of the new run.
        run_id: i64,
    },
    /// Delete a run.
    DeleteRun {
        /// Id of the deleted run.
        run_id: i64,
    },
}

impl Record {
    /// Type tag of this record.
    #[must_use]
    pub fn record_type(&self) -> RecordType {
        match self {
            Self::CreateIndex { .. } => RecordType::CreateIndex,
            Self::DropIndex { .. } => RecordType::DropIndex,
            Self::InsertRange { .. } => RecordType::InsertRange,
            Self::DeleteRange { .. } => RecordType::DeleteRange,
            Self::InsertRun { .. } => RecordType::InsertRun,
            Self::DeleteRun { .. } => RecordType::DeleteRun,
        }
    }

    /// Encode the record into `buf` as a MessagePack map.
    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<()> {
        match self {
            Self::CreateIndex { index_id } | Self::DropIndex { index_id } => {
                write_map_len(buf, 2)?;
                write_type(buf, self.record_type())?;
                write_id(buf, KEY_INDEX_ID, *index_id)?;
            }
            Self::InsertRange {
                index_id,
                range_id,
                begin,
                end,
            } => {
                let len = 3 + u32::from(begin.is_some()) + u32::from(end.is_some());
                write_map_len(buf, len)?;
                write_type(buf, RecordType::InsertRange)?;
                write_id(buf, KEY_INDEX_ID, *index_id)?;
                write_id(buf, KEY_RANGE_ID, *range_id)?;
                if let Some(key) = begin {
                    write_key_bound(buf, KEY_RANGE_BEGIN, key)?;
                }
                if let Some(key) = end {
                    write_key_bound(buf, KEY_RANGE_END, key)?;
                }
            }
            Self::DeleteRange { range_id } => {
                write_map_len(buf, 2)?;
                write_type(buf, RecordType::DeleteRange)?;
                write_id(buf, KEY_RANGE_ID, *range_id)?;
            }
            Self::InsertRun { range_id, run_id } => {
                write_map_len(buf, 3)?;
                write_type(buf, RecordType::InsertRun)?;
                write_id(buf, KEY_RANGE_ID, *range_id)?;
                write_id(buf, KEY_RUN_ID, *run_id)?;
            }
            Self::DeleteRun { run_id } => {
                write_map_len(buf, 2)?;
                write_type(buf, RecordType::DeleteRun)?;
                write_id(buf, KEY_RUN_ID, *run_id)?;
            }
        }
        Ok(())
    }

    /// Decode a record from a payload produced by [`Record::encode`].
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let rd = &mut &payload[..];

        let len = rmp::decode::read_map_len(rd)
            .map_err(|e| Error::Format(format!("record is not a map: {e}")))?;

        let mut record_type: Option<RecordType> = None;
        let mut index_id: Option<i64> = None;
        let mut range_id: Option<i64> = None;
        let mut run_id: Option<i64> = None;
        let mut begin: Option<Vec<u8>> = None;
        let mut end: Option<Vec<u8>> = None;

        for _ in 0..len {
            let key: u8 = rmp::decode::read_int(rd)
                .map_err(|e| Error::Format(format!("bad record key: {e}")))?;
            match key {
                KEY_TYPE => {
                    let tag: u8 = rmp::decode::read_int(rd)
                        .map_err(|e| Error::Format(format!("bad record type tag: {e}")))?;
                    record_type = Some(
                        RecordType::from_u8(tag)
                            .ok_or_else(|| Error::Format(format!("unknown record type {tag}")))?,
                    );
                }
                KEY_INDEX_ID => index_id = Some(read_id(rd, "index_id")?),
                KEY_RANGE_ID => range_id = Some(read_id(rd, "range_id")?),
                KEY_RUN_ID => run_id = Some(read_id(rd, "run_id")?),
                KEY_RANGE_BEGIN => begin = Some(read_key_bound(rd, "range_begin")?),
                KEY_RANGE_END => end = Some(read_key_bound(rd, "range_end")?),
                other => {
                    return Err(Error::Format(format!("unknown record key {other}")));
                }
            }
        }

        let record_type =
            record_type.ok_or_else(|| Error::Format("record without a type tag".to_string()))?;

        let record = match record_type {
            RecordType::CreateIndex => Self::CreateIndex {
                index_id: require(index_id, record_type, "index_id")?,
            },
            RecordType::DropIndex => Self::DropIndex {
                index_id: require(index_id, record_type, "index_id")?,
            },
            RecordType::InsertRange => Self::InsertRange {
                index_id: require(index_id, record_type, "index_id")?,
                range_id: require(range_id, record_type, "range_id")?,
                begin,
                end,
            },
            RecordType::DeleteRange => Self::DeleteRange {
                range_id: require(range_id, record_type, "range_id")?,
            },
            RecordType::InsertRun => Self::InsertRun {
                range_id: require(range_id, record_type, "range_id")?,
                run_id: require(run_id, record_type, "run_id")?,
            },
            RecordType::DeleteRun => Self::DeleteRun {
                run_id: require(run_id, record_type, "run_id")?,
            },
        };
        Ok(record)
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CreateIndex { index_id } | Self::DropIndex { index_id } => {
                write!(f, "{}({index_id})", self.record_type())
            }
            Self::InsertRange {
                index_id, range_id, ..
            } => write!(f, "INSERT_RANGE(index {index_id}, range {range_id})"),
            Self::DeleteRange { range_id } => write!(f, "DELETE_RANGE({range_id})"),
            Self::InsertRun { range_id, run_id } => {
                write!(f, "INSERT_RUN(range {range_id}, run {run_id})")
            }
            Self::DeleteRun { run_id } => write!(f, "DELETE_RUN({run_id})"),
        }
    }
}

fn require(field: Option<i64>, record_type: RecordType, name: &'static str) -> Result<i64> {
    field.ok_or(Error::MissingField {
        record_type: record_type.name(),
        field: name,
    })
}

fn write_map_len(buf: &mut Vec<u8>, len: u32) -> Result<()> {
    rmp::encode::write_map_len(buf, len)
        .map_err(|e| Error::Format(format!("map header encode failed: {e}")))?;
    Ok(())
}

fn write_type(buf: &mut Vec<u8>, record_type: RecordType) -> Result<()> {
    write_uint(buf, u64::from(KEY_TYPE))?;
    write_uint(buf, u64::from(record_type as u8))
}

fn write_id(buf: &mut Vec<u8>, key: u8, id: i64) -> Result<()> {
    write_uint(buf, u64::from(key))?;
    rmp::encode::write_sint(buf, id)
        .map_err(|e| Error::Format(format!("id encode failed: {e}")))?;
    Ok(())
}

fn write_uint(buf: &mut Vec<u8>, value: u64) -> Result<()> {
    rmp::encode::write_uint(buf, value)
        .map_err(|e| Error::Format(format!("uint encode failed: {e}")))?;
    Ok(())
}

/// Boundary keys travel as MessagePack str frames carrying raw bytes, so
/// keys that are not valid UTF-8 round-trip unchanged.
fn write_key_bound(buf: &mut Vec<u8>, key: u8, bytes: &[u8]) -> Result<()> {
    write_uint(buf, u64::from(key))?;
    let len = u32::try_from(bytes.len())
        .map_err(|_| Error::Format("range key exceeds u32 length".to_string()))?;
    rmp::encode::write_str_len(buf, len)
        .map_err(|e| Error::Format(format!("key header encode failed: {e}")))?;
    buf.extend_from_slice(bytes);
    Ok(())
}

fn read_id(rd: &mut &[u8], name: &str) -> Result<i64> {
    rmp::decode::read_int(rd).map_err(|e| Error::Format(format!("bad {name}: {e}")))
}

fn read_key_bound(rd: &mut &[u8], name: &str) -> Result<Vec<u8>> {
    let len = rmp::decode::read_str_len(rd)
        .map_err(|e| Error::Format(format!("bad {name} header: {e}")))?;
    let mut bytes = vec![0u8; len as usize];
    rd.read_exact(&mut bytes)
        .map_err(|e| Error::Format(format!("truncated {name}: {e}")))?;
    Ok(bytes)
}
