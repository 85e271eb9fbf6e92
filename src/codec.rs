//! Binary encoding of cached entities
//!
//! Frame layout:
//!
//! ```text
//! +--------+-----------+---------------------------+
//! | "DPC1" | crc32 LE  | bincode payload           |
//! | 4 B    | 4 B       | (checksummed by crc32)    |
//! +--------+-----------+---------------------------+
//! ```
//!
//! The payload is `{known.start, known.end, last_access, statement_count,
//! series_count, [series]}` where each series is `{hash, name, labels,
//! value_kind, statement_index, point_count, [ts, value]*, point_size}`.
//! Sequence lengths are the bincode length prefixes.

use crate::error::{DeltaError, Result};
use crate::models::{Extent, Timestamp};
use crate::series::{Dataset, Point, Series, SeriesHash, SeriesHeader, ValueKind};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Leading bytes of every encoded entity
pub const MAGIC: &[u8; 4] = b"DPC1";

const HEADER_LEN: usize = 8;

/// What the store holds for one cache key
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CachedEntity {
    /// Extent the dataset is known to be complete for; never past the backfill cutoff
    pub known_extent: Extent,
    /// When the entity was last written
    pub last_access: Timestamp,
    pub dataset: Dataset,
}

#[derive(Serialize, Deserialize)]
struct EntityRecord {
    known_start: i64,
    known_end: i64,
    last_access: i64,
    statement_count: u64,
    series: Vec<SeriesRecord>,
}

#[derive(Serialize, Deserialize)]
struct SeriesRecord {
    hash: u64,
    name: String,
    labels: BTreeMap<String, String>,
    value_kind: ValueKind,
    statement_index: u64,
    points: Vec<(i64, f64)>,
    point_size: u64,
}

impl From<&Series> for SeriesRecord {
    fn from(series: &Series) -> Self {
        SeriesRecord {
            hash: series.header.hash().0,
            name: series.header.name.clone(),
            labels: series.header.labels.clone(),
            value_kind: series.header.value_kind,
            statement_index: series.header.statement_index as u64,
            points: series.points.iter().map(|p| (p.timestamp, p.value)).collect(),
            point_size: series.point_size as u64,
        }
    }
}

impl TryFrom<SeriesRecord> for Series {
    type Error = DeltaError;

    fn try_from(record: SeriesRecord) -> Result<Self> {
        let header = SeriesHeader {
            name: record.name,
            labels: record.labels,
            value_kind: record.value_kind,
            statement_index: record.statement_index as usize,
        };
        if header.hash() != SeriesHash(record.hash) {
            return Err(DeltaError::CodecError(format!(
                "series hash mismatch: stored={:016x}, computed={:016x}",
                record.hash,
                header.hash().0
            )));
        }
        Ok(Series {
            header,
            points: record.points.into_iter().map(|(t, v)| Point::new(t, v)).collect(),
            point_size: record.point_size as usize,
        })
    }
}

impl CachedEntity {
    pub fn new(known_extent: Extent, last_access: Timestamp, dataset: Dataset) -> Self {
        CachedEntity {
            known_extent,
            last_access,
            dataset,
        }
    }

    /// Serialize into a framed, checksummed blob
    pub fn encode(&self) -> Result<Bytes> {
        let record = EntityRecord {
            known_start: self.known_extent.start,
            known_end: self.known_extent.end,
            last_access: self.last_access,
            statement_count: self.dataset.statement_count as u64,
            series: self.dataset.series.iter().map(SeriesRecord::from).collect(),
        };
        let payload = bincode::serialize(&record)?;

        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
        buf.put_slice(MAGIC);
        buf.put_u32_le(crc32fast::hash(&payload));
        buf.put_slice(&payload);
        Ok(buf.freeze())
    }

    /// Parse a blob produced by [`CachedEntity::encode`]
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(DeltaError::CodecError(format!(
                "entity too short: {} bytes",
                data.len()
            )));
        }
        if &data[..4] != MAGIC {
            return Err(DeltaError::CodecError("bad magic".to_string()));
        }
        let stored = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        let payload = &data[HEADER_LEN..];
        let computed = crc32fast::hash(payload);
        if stored != computed {
            return Err(DeltaError::CodecError(format!(
                "checksum mismatch: stored={:08x}, computed={:08x}",
                stored, computed
            )));
        }

        let record: EntityRecord = bincode::deserialize(payload)?;
        let series = record
            .series
            .into_iter()
            .map(Series::try_from)
            .collect::<Result<Vec<_>>>()?;

        Ok(CachedEntity {
            known_extent: Extent::new(record.known_start, record.known_end),
            last_access: record.last_access,
            dataset: Dataset {
                statement_count: record.statement_count as usize,
                series,
            },
        })
    }
}
