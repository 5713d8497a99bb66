//! Block-row partitioning of the dense system across workers.
//!
//! Rows are split into contiguous blocks: every worker but the last gets
//! `rows / W` rows, the last absorbs the remainder. The matrix descriptor
//! counts elements (`n` per row), the vector descriptor counts rows, and the
//! two always agree on which rows a worker owns.

use crate::error::{DmresError, Result};

/// Per-worker lengths and offsets of a contiguous split.
///
/// Invariants: one entry per worker, every length is at least one,
/// `offsets[0] == 0` and `offsets[w] == offsets[w - 1] + lengths[w - 1]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionDescriptor {
    lengths: Vec<usize>,
    offsets: Vec<usize>,
}

impl PartitionDescriptor {
    /// Build a descriptor from per-worker lengths, computing the offsets.
    pub fn from_lengths(lengths: Vec<usize>) -> Result<Self> {
        if lengths.is_empty() {
            return Err(DmresError::Partition("worker count must be at least 1".into()));
        }
        if let Some(w) = lengths.iter().position(|&len| len == 0) {
            return Err(DmresError::Partition(format!(
                "worker {w} would own an empty block"
            )));
        }

        let mut offsets = Vec::with_capacity(lengths.len());
        let mut running = 0;
        for &len in &lengths {
            offsets.push(running);
            running += len;
        }

        Ok(Self { lengths, offsets })
    }

    /// Row-aligned split of an `n x n` matrix over `worker_count` workers.
    pub fn rows(worker_count: usize, n: usize) -> Result<Self> {
        let capacity = n
            .checked_mul(n)
            .ok_or_else(|| DmresError::Partition(format!("{n}x{n} matrix does not fit in memory")))?;
        partition(worker_count, capacity, n, None)
    }

    /// Vector split derived from a row split: worker `w` gets as many
    /// elements as it owns full rows.
    pub fn vector_from_rows(rows: &PartitionDescriptor, n: usize) -> Result<Self> {
        partition(rows.num_workers(), n, n, Some(rows))
    }

    pub fn lengths(&self) -> &[usize] {
        &self.lengths
    }

    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    pub fn len_of(&self, worker: usize) -> usize {
        self.lengths[worker]
    }

    pub fn offset_of(&self, worker: usize) -> usize {
        self.offsets[worker]
    }

    /// Index range owned by `worker`.
    pub fn range_of(&self, worker: usize) -> std::ops::Range<usize> {
        let start = self.offsets[worker];
        start..start + self.lengths[worker]
    }

    pub fn num_workers(&self) -> usize {
        self.lengths.len()
    }

    /// Total number of elements covered.
    pub fn capacity(&self) -> usize {
        self.lengths.iter().sum()
    }
}

/// Split `capacity` elements among `worker_count` workers.
///
/// With `capacity == n` and a previous row split, this is the vector case:
/// each worker's length is the number of full rows it owns in `previous`.
/// Otherwise `capacity` is treated as matrix storage with rows of `n`
/// elements and split at row granularity.
pub fn partition(
    worker_count: usize,
    capacity: usize,
    n: usize,
    previous: Option<&PartitionDescriptor>,
) -> Result<PartitionDescriptor> {
    if n == 0 {
        return Err(DmresError::Partition("row length must be at least 1".into()));
    }
    if worker_count == 0 {
        return Err(DmresError::Partition("worker count must be at least 1".into()));
    }

    if let (true, Some(rows)) = (capacity == n, previous) {
        if rows.num_workers() != worker_count {
            return Err(DmresError::Partition(format!(
                "row split has {} workers, expected {worker_count}",
                rows.num_workers()
            )));
        }
        if let Some(w) = rows.lengths().iter().position(|len| len % n != 0) {
            return Err(DmresError::Partition(format!(
                "worker {w} owns a partial row ({} elements, row length {n})",
                rows.len_of(w)
            )));
        }
        let lengths = rows.lengths().iter().map(|len| len / n).collect();
        return PartitionDescriptor::from_lengths(lengths);
    }

    if capacity % n != 0 {
        return Err(DmresError::Partition(format!(
            "capacity {capacity} is not a whole number of rows of length {n}"
        )));
    }
    let total_rows = capacity / n;
    if worker_count > total_rows {
        return Err(DmresError::Partition(format!(
            "{worker_count} workers for {total_rows} rows: every worker needs at least one row"
        )));
    }

    let chunk = n * (total_rows / worker_count);
    let mut lengths = vec![chunk; worker_count - 1];
    lengths.push(capacity - chunk * (worker_count - 1));
    PartitionDescriptor::from_lengths(lengths)
}

/// Row and vector splits for one run, computed once and shared by every
/// operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    n: usize,
    rows: PartitionDescriptor,
    vector: PartitionDescriptor,
}

impl Layout {
    pub fn new(worker_count: usize, n: usize) -> Result<Self> {
        let rows = PartitionDescriptor::rows(worker_count, n)?;
        let vector = PartitionDescriptor::vector_from_rows(&rows, n)?;
        tracing::debug!(worker_count, n, rows = ?vector.lengths(), "layout computed");
        Ok(Self { n, rows, vector })
    }

    /// System dimension (matrix is `n x n`).
    pub fn n(&self) -> usize {
        self.n
    }

    /// Split of the `n * n` matrix elements.
    pub fn rows(&self) -> &PartitionDescriptor {
        &self.rows
    }

    /// Split of length-`n` vectors.
    pub fn vector(&self) -> &PartitionDescriptor {
        &self.vector
    }

    pub fn num_workers(&self) -> usize {
        self.rows.num_workers()
    }

    /// Number of rows owned by `rank`.
    pub fn local_rows(&self, rank: usize) -> usize {
        self.vector.len_of(rank)
    }

    /// Global index of the first row owned by `rank`.
    pub fn row_offset(&self, rank: usize) -> usize {
        self.vector.offset_of(rank)
    }
}
