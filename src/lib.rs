#![allow(unused)]
extern crate rest_tensors as tensors;
extern crate chrono as time;
extern crate anyhow;

pub mod basis_io;
pub mod constants;
pub mod df_io;
pub mod integral_io;
#[cfg(feature = "mpi-rt")]
pub mod mpi_io;
pub mod ri_io;
pub mod utilities;

pub use crate::basis_io::reorder::BasOrder;
pub use crate::basis_io::{BasShell, BasisInfo};
pub use crate::df_io::{DFTensor, FittingMetric};
pub use crate::integral_io::{GridModelDriver, IntDriver, IntEngine};
pub use crate::ri_io::{IJIterator, QIterator, StoredQTensor};
pub use crate::ri_io::{QGEN_QSO, QGEN_QMO, QGEN_QOO, QGEN_QOV, QGEN_QVV};
pub use crate::ri_io::{QSTORAGE_INMEM, QSTORAGE_ONDISK, QSTORAGE_ONDIST, QSTORAGE_BYQ, QSTORAGE_PACKED};
