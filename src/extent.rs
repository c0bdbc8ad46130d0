//! Extent tables and the retrieval pointer decoder.
//!
//! On NTFS the cluster layout of a file is queried with
//! `FSCTL_GET_RETRIEVAL_POINTERS`. The driver answers with a
//! `RETRIEVAL_POINTERS_BUFFER`:
//!
//! ```text
//! offset  size  field
//!      0     4  extent count (u32)
//!      4     4  padding
//!      8     8  starting VCN (i64)
//!     16  16*n  n x { next VCN (i64), LCN (i64) }
//! ```
//!
//! Each run covers `[previous next VCN, next VCN)`, the first one starting at
//! the buffer's starting VCN. An LCN of `-1` marks a sparse hole. When the
//! buffer is too small the driver reports "more data" and the query is
//! reissued from the last next VCN.

use crate::device::AlignedBuffer;
use crate::error::{Error, Result};

use byteorder::{ByteOrder, LittleEndian};
use tracing::debug;

/// LCN reported for clusters with no backing storage.
pub const UNMAPPED_LCN: i64 = -1;

/// Size of the response buffer handed to each extent query.
pub const QUERY_BUFFER_LEN: usize = 64 * 1024;

/// One contiguous run of clusters backing part of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    /// First file-relative cluster covered by this run.
    pub starting_vcn: u64,
    /// First volume-relative cluster, or `None` for a hole.
    pub lcn: Option<u64>,
    /// Number of clusters in the run.
    pub cluster_count: u64,
}

impl Extent {
    /// Create an extent backed by clusters starting at `lcn`.
    pub fn mapped(starting_vcn: u64, lcn: u64, cluster_count: u64) -> Self {
        Self {
            starting_vcn,
            lcn: Some(lcn),
            cluster_count,
        }
    }

    /// Create a hole extent with no backing clusters.
    pub fn hole(starting_vcn: u64, cluster_count: u64) -> Self {
        Self {
            starting_vcn,
            lcn: None,
            cluster_count,
        }
    }

    /// Whether this run is a sparse hole.
    pub fn is_hole(&self) -> bool {
        self.lcn.is_none()
    }

    /// First VCN after this run.
    pub fn next_vcn(&self) -> u64 {
        self.starting_vcn + self.cluster_count
    }

    /// Length of the run in bytes.
    pub fn byte_len(&self, cluster_size: u64) -> u64 {
        self.cluster_count * cluster_size
    }

    /// Byte offset of the run within the file.
    pub fn file_offset(&self, cluster_size: u64) -> u64 {
        self.starting_vcn * cluster_size
    }

    /// Byte offset of the run on the volume, `None` for holes.
    pub fn volume_offset(&self, cluster_size: u64) -> Option<u64> {
        self.lcn.map(|lcn| lcn * cluster_size)
    }
}

/// Ordered, immutable cluster map of one file.
///
/// Extents are contiguous in VCN space: every extent starts where the
/// previous one ends, and holes are explicit. All byte offsets derived from
/// the table are checked against `u64` overflow at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtentTable {
    cluster_size: u64,
    extents: Vec<Extent>,
}

impl ExtentTable {
    /// Build a table, validating ordering, contiguity and offset ranges.
    pub fn new(cluster_size: u64, extents: Vec<Extent>) -> Result<Self> {
        if cluster_size == 0 {
            return Err(Error::malformed("cluster size is zero"));
        }

        let mut expected_vcn: Option<u64> = None;
        for (index, extent) in extents.iter().enumerate() {
            if extent.cluster_count == 0 {
                return Err(Error::malformed(format!("extent {} is empty", index)));
            }
            if let Some(vcn) = expected_vcn {
                if extent.starting_vcn != vcn {
                    return Err(Error::malformed(format!(
                        "extent {} starts at VCN {} but the previous extent ends at VCN {}",
                        index, extent.starting_vcn, vcn
                    )));
                }
            }
            let next = extent
                .starting_vcn
                .checked_add(extent.cluster_count)
                .ok_or_else(|| Error::malformed(format!("extent {} overflows VCN space", index)))?;
            if next.checked_mul(cluster_size).is_none() {
                return Err(Error::malformed(format!(
                    "extent {} ends beyond the addressable file size",
                    index
                )));
            }
            if let Some(lcn) = extent.lcn {
                let end = lcn
                    .checked_add(extent.cluster_count)
                    .and_then(|end| end.checked_mul(cluster_size));
                if end.is_none() {
                    return Err(Error::malformed(format!(
                        "extent {} lies beyond the addressable volume size",
                        index
                    )));
                }
            }
            expected_vcn = Some(next);
        }

        Ok(Self {
            cluster_size,
            extents,
        })
    }

    /// A table with no extents.
    pub fn empty(cluster_size: u64) -> Self {
        Self {
            cluster_size,
            extents: Vec::new(),
        }
    }

    /// Cluster size of the volume the table was resolved on.
    pub fn cluster_size(&self) -> u64 {
        self.cluster_size
    }

    /// The extents in ascending VCN order.
    pub fn extents(&self) -> &[Extent] {
        &self.extents
    }

    /// Number of extents, holes included.
    pub fn len(&self) -> usize {
        self.extents.len()
    }

    /// Whether the table has no extents.
    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    /// Number of hole extents.
    pub fn hole_count(&self) -> usize {
        self.extents.iter().filter(|e| e.is_hole()).count()
    }

    /// Sum of the cluster counts of every extent.
    pub fn total_clusters(&self) -> u64 {
        self.extents.iter().map(|e| e.cluster_count).sum()
    }

    /// Allocated size of the file in bytes.
    pub fn allocated_bytes(&self) -> u64 {
        self.total_clusters() * self.cluster_size
    }

    /// Iterate over the extents.
    pub fn iter(&self) -> std::slice::Iter<'_, Extent> {
        self.extents.iter()
    }
}

impl<'a> IntoIterator for &'a ExtentTable {
    type Item = &'a Extent;
    type IntoIter = std::slice::Iter<'a, Extent>;

    fn into_iter(self) -> Self::IntoIter {
        self.extents.iter()
    }
}

/// One `(next VCN, LCN)` pair of a retrieval pointer response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrievalRun {
    pub next_vcn: u64,
    pub lcn: Option<u64>,
}

/// Decoded `RETRIEVAL_POINTERS_BUFFER`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievalPointers {
    pub starting_vcn: u64,
    pub runs: Vec<RetrievalRun>,
}

impl RetrievalPointers {
    /// Size of the fixed header.
    pub const HEADER_LEN: usize = 16;

    /// Size of one `(next VCN, LCN)` pair.
    pub const RUN_LEN: usize = 16;

    /// Decode a driver response, rejecting truncated or inconsistent data.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::HEADER_LEN {
            return Err(Error::malformed(format!(
                "retrieval pointer response is {} bytes, shorter than its {} byte header",
                buf.len(),
                Self::HEADER_LEN
            )));
        }

        let count = LittleEndian::read_u32(&buf[0..4]) as usize;
        let starting_vcn = LittleEndian::read_i64(&buf[8..16]);
        if starting_vcn < 0 {
            return Err(Error::malformed(format!(
                "negative starting VCN {}",
                starting_vcn
            )));
        }

        let needed = count
            .checked_mul(Self::RUN_LEN)
            .and_then(|runs| runs.checked_add(Self::HEADER_LEN))
            .ok_or_else(|| Error::malformed(format!("extent count {} overflows", count)))?;
        if buf.len() < needed {
            return Err(Error::malformed(format!(
                "response declares {} extents ({} bytes) but only {} bytes were returned",
                count,
                needed,
                buf.len()
            )));
        }

        let mut runs = Vec::with_capacity(count);
        let mut previous = starting_vcn as u64;
        for index in 0..count {
            let at = Self::HEADER_LEN + index * Self::RUN_LEN;
            let next_vcn = LittleEndian::read_i64(&buf[at..at + 8]);
            let lcn = LittleEndian::read_i64(&buf[at + 8..at + 16]);

            if next_vcn < 0 || (next_vcn as u64) <= previous {
                return Err(Error::malformed(format!(
                    "extent {} ends at VCN {} which does not follow VCN {}",
                    index, next_vcn, previous
                )));
            }
            let lcn = match lcn {
                UNMAPPED_LCN => None,
                lcn if lcn >= 0 => Some(lcn as u64),
                lcn => {
                    return Err(Error::malformed(format!(
                        "extent {} has invalid LCN {}",
                        index, lcn
                    )))
                }
            };

            previous = next_vcn as u64;
            runs.push(RetrievalRun {
                next_vcn: previous,
                lcn,
            });
        }

        Ok(Self {
            starting_vcn: starting_vcn as u64,
            runs,
        })
    }

    /// Convert the runs into extents, deriving each cluster count from the
    /// previous run's next VCN.
    pub fn extents(&self) -> Vec<Extent> {
        let mut vcn = self.starting_vcn;
        self.runs
            .iter()
            .map(|run| {
                let extent = Extent {
                    starting_vcn: vcn,
                    lcn: run.lcn,
                    cluster_count: run.next_vcn - vcn,
                };
                vcn = run.next_vcn;
                extent
            })
            .collect()
    }
}

/// Outcome of one retrieval pointer request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    /// The response (of this many bytes) maps the rest of the file.
    Complete(usize),
    /// The response (of this many bytes) filled the buffer; ask again from
    /// its last next VCN.
    MoreData(usize),
    /// The starting VCN is past the allocated data, or the file has none.
    EndOfFile,
}

/// Source of raw retrieval pointer responses, usually an open file handle.
pub trait RetrievalPointerQuery {
    /// Fill `buf` with the mapping that starts at `starting_vcn`.
    fn query(&mut self, starting_vcn: u64, buf: &mut [u8]) -> Result<QueryStatus>;
}

/// Resolve the full extent table of a file, following "more data" replies
/// until the driver has mapped every cluster.
pub fn resolve_extents<Q>(query: &mut Q, cluster_size: u64) -> Result<ExtentTable>
where
    Q: RetrievalPointerQuery + ?Sized,
{
    let mut buf = AlignedBuffer::new(QUERY_BUFFER_LEN, 8);
    let mut extents: Vec<Extent> = Vec::new();
    let mut vcn = 0u64;

    loop {
        let (len, more) = match query.query(vcn, &mut buf)? {
            QueryStatus::Complete(len) => (len, false),
            QueryStatus::MoreData(len) => (len, true),
            QueryStatus::EndOfFile => break,
        };
        if len > buf.len() {
            return Err(Error::malformed(format!(
                "driver reported {} bytes for a {} byte buffer",
                len,
                buf.len()
            )));
        }

        let batch = RetrievalPointers::decode(&buf[..len])?;
        if !extents.is_empty() && batch.starting_vcn != vcn {
            return Err(Error::malformed(format!(
                "continuation starts at VCN {} instead of VCN {}",
                batch.starting_vcn, vcn
            )));
        }
        debug!(
            starting_vcn = batch.starting_vcn,
            runs = batch.runs.len(),
            more,
            "retrieval pointer batch"
        );

        match batch.runs.last() {
            Some(last) => vcn = last.next_vcn,
            None if more => {
                return Err(Error::malformed(
                    "driver reported more data but returned no extents",
                ))
            }
            None => {}
        }
        extents.extend(batch.extents());

        if !more {
            break;
        }
    }

    ExtentTable::new(cluster_size, extents)
}
