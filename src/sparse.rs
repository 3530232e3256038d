//! Row-partitioned sparse matrix and vector storage with ghost-row
//! accumulation.
//!
//! Every partition owns a contiguous range of global rows. Local assembly
//! may contribute to any row; contributions to rows owned elsewhere are
//! buffered as ghost entries and merged into the owner's storage by the
//! collective `global_assemble`, which sums (never overwrites) entries from
//! all contributing partitions. The sparsity pattern itself is built the
//! same way: each partition inserts the dense connectivity blocks of its
//! elements, and foreign rows are routed to their owners when the graph is
//! finalized.
use crate::comm::Communicator;
use crate::error::{Error, Result};
use rustc_hash::FxHashMap;
use std::collections::BTreeSet;

/// The contiguous row ranges of all partitions.
#[derive(Debug, Clone)]
pub struct RowLayout {
    /// `offsets[r]..offsets[r + 1]` is the row range of rank `r`.
    offsets: Vec<usize>,
}

impl RowLayout {
    /// Gathers every partition's local row count into the shared layout.
    /// Collective: must be called by all ranks.
    pub fn gather(comm: &dyn Communicator, local_size: usize) -> Self {
        let sizes = comm.all_gather_usize(local_size);
        let mut offsets = Vec::with_capacity(sizes.len() + 1);
        offsets.push(0);
        for size in sizes {
            offsets.push(offsets.last().unwrap() + size);
        }
        Self { offsets }
    }

    pub fn num_ranks(&self) -> usize {
        self.offsets.len() - 1
    }

    pub fn global_size(&self) -> usize {
        *self.offsets.last().unwrap()
    }

    pub fn first_row(&self, rank: usize) -> usize {
        self.offsets[rank]
    }

    pub fn local_size(&self, rank: usize) -> usize {
        self.offsets[rank + 1] - self.offsets[rank]
    }

    pub fn owner(&self, row: usize) -> usize {
        debug_assert!(row < self.global_size(), "row {row} out of range");
        self.offsets.partition_point(|&offset| offset <= row) - 1
    }
}

/// A globally addressed vector whose rows are partitioned by ownership.
#[derive(Debug, Clone)]
pub struct DistributedVector {
    layout: RowLayout,
    rank: usize,
    values: Vec<f64>,
    ghost: FxHashMap<usize, f64>,
}

impl DistributedVector {
    pub fn new(layout: RowLayout, rank: usize) -> Self {
        let local_size = layout.local_size(rank);
        Self {
            layout,
            rank,
            values: vec![0.0; local_size],
            ghost: FxHashMap::default(),
        }
    }

    pub fn layout(&self) -> &RowLayout {
        &self.layout
    }

    pub fn first_row(&self) -> usize {
        self.layout.first_row(self.rank)
    }

    pub fn local_size(&self) -> usize {
        self.values.len()
    }

    /// Adds a contribution to a global row, buffering it as a ghost entry if
    /// the row is owned by another partition.
    pub fn add(&mut self, row: usize, value: f64) {
        if self.layout.owner(row) == self.rank {
            let local = row - self.first_row();
            self.values[local] += value;
        } else {
            *self.ghost.entry(row).or_insert(0.0) += value;
        }
    }

    pub fn fill(&mut self, value: f64) {
        self.values.fill(value);
        self.ghost.clear();
    }

    pub fn owned(&self) -> &[f64] {
        &self.values
    }

    pub fn owned_mut(&mut self) -> &mut [f64] {
        &mut self.values
    }

    /// Routes buffered ghost contributions to their owners and sums them
    /// into the owned storage. Collective.
    pub fn global_assemble(&mut self, comm: &dyn Communicator) {
        let size = comm.size();
        let mut rows: Vec<Vec<u64>> = vec![Vec::new(); size];
        let mut values: Vec<Vec<f64>> = vec![Vec::new(); size];
        for (&row, &value) in &self.ghost {
            let owner = self.layout.owner(row);
            rows[owner].push(row as u64);
            values[owner].push(value);
        }
        self.ghost.clear();

        let incoming_rows = comm.all_to_all_u64(&rows);
        let incoming_values = comm.all_to_all_f64(&values);
        let first = self.first_row();
        for (rows, values) in incoming_rows.iter().zip(&incoming_values) {
            for (&row, &value) in rows.iter().zip(values) {
                self.values[row as usize - first] += value;
            }
        }
    }

    /// Fetches the values of arbitrary global rows from their owners.
    /// Collective; the result is ordered like `wanted`.
    pub fn import(&self, wanted: &[usize], comm: &dyn Communicator) -> Result<Vec<f64>> {
        let size = comm.size();
        let mut requests: Vec<Vec<u64>> = vec![Vec::new(); size];
        let mut positions: Vec<Vec<usize>> = vec![Vec::new(); size];
        for (at, &row) in wanted.iter().enumerate() {
            if row >= self.layout.global_size() {
                return Err(Error::Consistency(format!(
                    "import of row {row} outside the global size {}",
                    self.layout.global_size()
                )));
            }
            let owner = self.layout.owner(row);
            requests[owner].push(row as u64);
            positions[owner].push(at);
        }

        let incoming = comm.all_to_all_u64(&requests);
        let first = self.first_row();
        let replies: Vec<Vec<f64>> = incoming
            .iter()
            .map(|request| {
                request
                    .iter()
                    .map(|&row| self.values[row as usize - first])
                    .collect()
            })
            .collect();
        let answers = comm.all_to_all_f64(&replies);

        let mut result = vec![0.0; wanted.len()];
        for (owner, positions) in positions.iter().enumerate() {
            for (&at, &value) in positions.iter().zip(&answers[owner]) {
                result[at] = value;
            }
        }
        Ok(result)
    }

    /// Global Euclidean norm. Collective; every rank accumulates partial
    /// sums in rank order, so all ranks agree bitwise.
    pub fn two_norm(&self, comm: &dyn Communicator) -> f64 {
        let local: f64 = self.values.iter().map(|v| v * v).sum();
        comm.sum_all_f64(local).sqrt()
    }

    pub fn dot(&self, other: &DistributedVector, comm: &dyn Communicator) -> f64 {
        debug_assert_eq!(self.local_size(), other.local_size());
        let local: f64 = self
            .values
            .iter()
            .zip(&other.values)
            .map(|(a, b)| a * b)
            .sum();
        comm.sum_all_f64(local)
    }
}

/// Accumulates the sparsity pattern of the distributed matrix.
#[derive(Debug)]
pub struct GraphBuilder {
    layout: RowLayout,
    rank: usize,
    // A BTreeSet stores each entry exactly once and yields them sorted,
    // which is what the CSR construction needs anyway.
    entries: BTreeSet<(usize, usize)>,
}

impl GraphBuilder {
    pub fn new(layout: RowLayout, rank: usize) -> Self {
        Self {
            layout,
            rank,
            entries: BTreeSet::new(),
        }
    }

    /// Inserts the dense block formed by the Cartesian product of the given
    /// equation ids.
    pub fn insert_connectivity(&mut self, equation_ids: &[usize]) {
        for &row in equation_ids {
            for &col in equation_ids {
                self.entries.insert((row, col));
            }
        }
    }

    /// Routes foreign-row entries to their owners and builds the final
    /// matrix with an all-zero value array. Collective.
    pub fn global_assemble(mut self, comm: &dyn Communicator) -> DistributedCsr {
        let size = comm.size();
        let mut outgoing: Vec<Vec<u64>> = vec![Vec::new(); size];
        let mut owned_entries = BTreeSet::new();
        for (row, col) in std::mem::take(&mut self.entries) {
            let owner = self.layout.owner(row);
            if owner == self.rank {
                owned_entries.insert((row, col));
            } else {
                outgoing[owner].push(row as u64);
                outgoing[owner].push(col as u64);
            }
        }
        for buffer in comm.all_to_all_u64(&outgoing) {
            for pair in buffer.chunks_exact(2) {
                owned_entries.insert((pair[0] as usize, pair[1] as usize));
            }
        }

        let first = self.layout.first_row(self.rank);
        let local_size = self.layout.local_size(self.rank);
        let mut row_offsets = Vec::with_capacity(local_size + 1);
        let mut col_indices = Vec::with_capacity(owned_entries.len());
        row_offsets.push(0);
        for (row, col) in owned_entries {
            let local_row = row - first;
            while local_row + 1 > row_offsets.len() {
                row_offsets.push(col_indices.len());
            }
            col_indices.push(col);
        }
        while row_offsets.len() < local_size + 1 {
            row_offsets.push(col_indices.len());
        }

        let nnz = col_indices.len();
        DistributedCsr {
            layout: self.layout,
            rank: self.rank,
            row_offsets,
            col_indices,
            values: vec![0.0; nnz],
            ghost: FxHashMap::default(),
        }
    }
}

/// The row-partitioned sparse matrix: CSR storage of the owned rows with
/// global column indices, plus a buffer of ghost contributions.
#[derive(Debug, Clone)]
pub struct DistributedCsr {
    layout: RowLayout,
    rank: usize,
    row_offsets: Vec<usize>,
    col_indices: Vec<usize>,
    values: Vec<f64>,
    ghost: FxHashMap<(usize, usize), f64>,
}

impl DistributedCsr {
    pub fn layout(&self) -> &RowLayout {
        &self.layout
    }

    pub fn first_row(&self) -> usize {
        self.layout.first_row(self.rank)
    }

    pub fn local_size(&self) -> usize {
        self.row_offsets.len() - 1
    }

    pub fn fill_zero(&mut self) {
        self.values.fill(0.0);
        self.ghost.clear();
    }

    /// Column indices and values of an owned row (local index).
    pub fn row(&self, local_row: usize) -> (&[usize], &[f64]) {
        let range = self.row_offsets[local_row]..self.row_offsets[local_row + 1];
        (&self.col_indices[range.clone()], &self.values[range])
    }

    pub fn row_mut(&mut self, local_row: usize) -> (&[usize], &mut [f64]) {
        let range = self.row_offsets[local_row]..self.row_offsets[local_row + 1];
        (&self.col_indices[range.clone()], &mut self.values[range])
    }

    /// Adds a contribution to a global entry. Owned rows require the entry
    /// to exist in the assembled sparsity pattern; a missing entry means the
    /// graph and the assembly loop disagree, which is fatal.
    pub fn add(&mut self, row: usize, col: usize, value: f64) -> Result<()> {
        if self.layout.owner(row) == self.rank {
            self.add_owned(row, col, value)
        } else {
            *self.ghost.entry((row, col)).or_insert(0.0) += value;
            Ok(())
        }
    }

    fn add_owned(&mut self, row: usize, col: usize, value: f64) -> Result<()> {
        let local_row = row - self.first_row();
        let range = self.row_offsets[local_row]..self.row_offsets[local_row + 1];
        let columns = &self.col_indices[range.clone()];
        match columns.binary_search(&col) {
            Ok(position) => {
                self.values[range.start + position] += value;
                Ok(())
            }
            Err(_) => Err(Error::Consistency(format!(
                "entry ({row}, {col}) lies outside the assembled sparsity pattern"
            ))),
        }
    }

    /// Routes ghost contributions to their owners and sums them in place.
    /// Collective.
    pub fn global_assemble(&mut self, comm: &dyn Communicator) -> Result<()> {
        let size = comm.size();
        let mut coordinates: Vec<Vec<u64>> = vec![Vec::new(); size];
        let mut contributions: Vec<Vec<f64>> = vec![Vec::new(); size];
        for (&(row, col), &value) in &self.ghost {
            let owner = self.layout.owner(row);
            coordinates[owner].push(row as u64);
            coordinates[owner].push(col as u64);
            contributions[owner].push(value);
        }
        self.ghost.clear();

        let incoming_coordinates = comm.all_to_all_u64(&coordinates);
        let incoming_contributions = comm.all_to_all_f64(&contributions);
        for (coordinates, contributions) in
            incoming_coordinates.iter().zip(&incoming_contributions)
        {
            for (pair, &value) in coordinates.chunks_exact(2).zip(contributions) {
                self.add_owned(pair[0] as usize, pair[1] as usize, value)?;
            }
        }
        Ok(())
    }

    /// The diagonal entries of the owned rows; absent entries read as zero.
    pub fn diagonal(&self) -> Vec<f64> {
        let first = self.first_row();
        (0..self.local_size())
            .map(|local_row| {
                let (columns, values) = self.row(local_row);
                columns
                    .binary_search(&(first + local_row))
                    .map(|position| values[position])
                    .unwrap_or(0.0)
            })
            .collect()
    }

    /// Owned-rows matrix-vector product `y = A x`. Ghost column values must
    /// be supplied by a prior [`ColumnImporter::import`].
    pub fn spmv(&self, x: &DistributedVector, ghost_x: &[f64], importer: &ColumnImporter, y: &mut [f64]) {
        assert_eq!(y.len(), self.local_size());
        let first_col = x.first_row();
        let owned_x = x.owned();
        for (local_row, out) in y.iter_mut().enumerate() {
            let (columns, values) = self.row(local_row);
            let mut sum = 0.0;
            for (&col, &value) in columns.iter().zip(values) {
                let x_value = if self.layout.owner(col) == self.rank {
                    owned_x[col - first_col]
                } else {
                    ghost_x[importer
                        .position(col)
                        .expect("ghost column missing from importer")]
                };
                sum += value * x_value;
            }
            *out = sum;
        }
    }

    /// Owned rows as a standard CSR matrix (rows local, columns global),
    /// e.g. for interop with direct solvers or comparison in tests.
    pub fn to_csr(&self) -> nalgebra_sparse::CsrMatrix<f64> {
        nalgebra_sparse::CsrMatrix::try_from_csr_data(
            self.local_size(),
            self.layout.global_size(),
            self.row_offsets.clone(),
            self.col_indices.clone(),
            self.values.clone(),
        )
        .expect("owned CSR block is well-formed by construction")
    }
}

/// Precomputed lookup of the non-owned columns of a matrix, used to fetch
/// their vector values before each matrix-vector product.
#[derive(Debug, Clone)]
pub struct ColumnImporter {
    wanted: Vec<usize>,
}

impl ColumnImporter {
    pub fn from_matrix(matrix: &DistributedCsr) -> Self {
        let mut wanted: Vec<usize> = matrix
            .col_indices
            .iter()
            .copied()
            .filter(|&col| matrix.layout.owner(col) != matrix.rank)
            .collect();
        wanted.sort_unstable();
        wanted.dedup();
        Self { wanted }
    }

    pub fn ghost_columns(&self) -> &[usize] {
        &self.wanted
    }

    pub fn position(&self, col: usize) -> Option<usize> {
        self.wanted.binary_search(&col).ok()
    }

    /// Collective: fetches the values of all ghost columns.
    pub fn import(&self, x: &DistributedVector, comm: &dyn Communicator) -> Result<Vec<f64>> {
        x.import(&self.wanted, comm)
    }
}
