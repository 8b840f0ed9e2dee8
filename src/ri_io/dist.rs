use std::sync::Arc;

use mpi::collective::SystemOperation;

use crate::mpi_io::{average_distribution, mpi_broadcast_vector, mpi_reduce, MPIOperator};

/// Distributed backend: the auxiliary axis is sliced evenly across the MPI
/// ranks and each rank keeps only its own q range, stored by-q. Generation is
/// replicated on every rank, so writes are purely local (each rank retains
/// the intersection with its slice and drops the rest); the memory win, not
/// the flop count, is what the backend buys.
///
/// Reads are collective: every rank must issue the same read with the same
/// arguments, and every rank receives the full result (owner contributions
/// are summed across ranks and broadcast back).
pub struct DistQTensor {
    naux: usize,
    ndim12: usize,
    mpi_op: Arc<MPIOperator>,
    distribution: Vec<std::ops::Range<usize>>,
    // the owned q slices, [loc_naux, ndim12], q-major
    local: Vec<f64>,
}

impl DistQTensor {
    pub fn new(naux: usize, ndim12: usize, mpi_op: Arc<MPIOperator>) -> DistQTensor {
        let distribution = average_distribution(naux, mpi_op.size);
        let loc_naux = distribution[mpi_op.rank].len();
        DistQTensor {
            naux, ndim12, mpi_op, distribution,
            local: vec![0.0; loc_naux*ndim12],
        }
    }

    fn owned(&self) -> std::ops::Range<usize> {
        self.distribution[self.mpi_op.rank].clone()
    }

    /// `data` holds `nij` pair slices of `naux` values; keep the owned q entries.
    pub fn write(&mut self, data: &[f64], nij: usize, ijstart: usize) {
        let owned = self.owned();
        for ij0 in 0..nij {
            for q in owned.clone() {
                self.local[(q - owned.start)*self.ndim12 + ijstart + ij0] = data[ij0*self.naux + q];
            }
        }
    }

    /// `data` holds `nq` q slices of `ndim12` values; keep the owned ones.
    pub fn write_by_q(&mut self, data: &[f64], nq: usize, qstart: usize) {
        let owned = self.owned();
        for q0 in 0..nq {
            let q = qstart + q0;
            if q >= owned.start && q < owned.end {
                self.local[(q - owned.start)*self.ndim12..(q - owned.start + 1)*self.ndim12]
                    .copy_from_slice(&data[q0*self.ndim12..(q0+1)*self.ndim12]);
            }
        }
    }

    /// Collective: sums the zero-filled per-rank contributions and hands the
    /// complete batch to every rank.
    pub fn read(&mut self, data: &mut [f64], nij: usize, ijstart: usize) {
        let owned = self.owned();
        let mut contrib = vec![0.0_f64; nij*self.naux];
        for ij0 in 0..nij {
            for q in owned.clone() {
                contrib[ij0*self.naux + q] = self.local[(q - owned.start)*self.ndim12 + ijstart + ij0];
            }
        }
        let mut summed = mpi_reduce(&self.mpi_op.world, &contrib, 0, &SystemOperation::sum());
        mpi_broadcast_vector(&self.mpi_op.world, &mut summed, 0);
        data[..nij*self.naux].copy_from_slice(&summed);
    }

    /// Collective, with the same call-on-every-rank contract as `read`.
    pub fn read_by_q(&mut self, data: &mut [f64], nq: usize, qstart: usize) {
        let owned = self.owned();
        let mut contrib = vec![0.0_f64; nq*self.ndim12];
        for q0 in 0..nq {
            let q = qstart + q0;
            if q >= owned.start && q < owned.end {
                contrib[q0*self.ndim12..(q0+1)*self.ndim12]
                    .copy_from_slice(&self.local[(q - owned.start)*self.ndim12..(q - owned.start + 1)*self.ndim12]);
            }
        }
        let mut summed = mpi_reduce(&self.mpi_op.world, &contrib, 0, &SystemOperation::sum());
        mpi_broadcast_vector(&self.mpi_op.world, &mut summed, 0);
        data[..nq*self.ndim12].copy_from_slice(&summed);
    }

    pub fn clear(&mut self) {
        self.local = Vec::new();
    }
}
