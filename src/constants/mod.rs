/// Eigenvalue threshold used when forming the (pseudo-)inverse square root of
/// the auxiliary coulomb metric. Eigenvectors below the threshold are projected out.
pub const AUXBAS_THRESHOLD: f64 = 1.0e-12;

/// Number of q slices handed to each worker per round while transforming Qso
/// into the derived tensors. Bounds the transform scratch memory.
pub const TRANS_QBATCH_PER_THREAD: usize = 4;

/// Highest angular momentum for which a basis-function reordering table can be defined.
pub const MAX_REORDER_AM: usize = 8;
