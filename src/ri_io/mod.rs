use anyhow::{anyhow, bail};

use crate::utilities::CumulTimer;

pub mod batch;
pub mod disk;
#[cfg(feature = "mpi-rt")]
pub mod dist;
pub mod memory;

pub use batch::{IJIterator, QIterator};
use disk::DiskQTensor;
#[cfg(feature = "mpi-rt")]
use dist::DistQTensor;
use memory::MemQTensor;

// How a tensor is stored: packed lower triangle or full, contiguous by q or
// by orbital pair, and which backend owns the data.
pub const QSTORAGE_PACKED: usize = 1;
pub const QSTORAGE_BYQ: usize = 2;
pub const QSTORAGE_INMEM: usize = 4;
pub const QSTORAGE_ONDISK: usize = 8;
pub const QSTORAGE_ONDIST: usize = 16;

// Which tensors a generation call should produce.
pub const QGEN_QSO: usize = 1;
pub const QGEN_QMO: usize = 2;
pub const QGEN_QOO: usize = 4;
pub const QGEN_QOV: usize = 8;
pub const QGEN_QVV: usize = 16;

enum QStore {
    InMem(MemQTensor),
    OnDisk(DiskQTensor),
    #[cfg(feature = "mpi-rt")]
    OnDist(DistQTensor),
}

/// A stored three-index tensor indexed by (q, i, j), polymorphic over the
/// backend and fixed at construction to one physical layout. Reads on either
/// axis are always served; off-axis access just costs more. Reads clamp to
/// the remaining extent and report the number of slices delivered, with 0
/// signalling exhaustion.
pub struct StoredQTensor {
    naux: usize,
    ndim1: usize,
    ndim2: usize,
    ndim12: usize,
    storeflags: usize,
    name: String,
    filled: bool,
    store: QStore,
    pub gen_timer: CumulTimer,
    pub getq_timer: CumulTimer,
    pub getij_timer: CumulTimer,
}

impl StoredQTensor {
    pub fn create(naux: usize, ndim1: usize, ndim2: usize, storeflags: usize,
                  name: &str, directory: &str) -> anyhow::Result<StoredQTensor> {
        let (ndim12, byq) = Self::check_flags(naux, ndim1, ndim2, storeflags)?;

        let store = if storeflags & QSTORAGE_INMEM != 0 {
            QStore::InMem(MemQTensor::new(naux, ndim12, byq))
        } else if storeflags & QSTORAGE_ONDISK != 0 {
            QStore::OnDisk(DiskQTensor::new(naux, ndim12, byq, directory, name)?)
        } else if storeflags & QSTORAGE_ONDIST != 0 {
            bail!("Error: distributed storage requested; use create_dist within an MPI context");
        } else {
            bail!("Error: no storage backend selected for tensor {}", name);
        };

        Ok(StoredQTensor {
            naux, ndim1, ndim2, ndim12, storeflags,
            name: name.to_string(),
            filled: false,
            store,
            gen_timer: CumulTimer::new(),
            getq_timer: CumulTimer::new(),
            getij_timer: CumulTimer::new(),
        })
    }

    #[cfg(feature = "mpi-rt")]
    pub fn create_dist(naux: usize, ndim1: usize, ndim2: usize, storeflags: usize,
                       name: &str, mpi_op: &std::sync::Arc<crate::mpi_io::MPIOperator>)
                       -> anyhow::Result<StoredQTensor> {
        // distributed tensors are sliced over the auxiliary axis; the stored
        // layout is by-q regardless of the caller's layout flag
        let storeflags = (storeflags & !QSTORAGE_ONDISK & !QSTORAGE_INMEM) | QSTORAGE_ONDIST | QSTORAGE_BYQ;
        let (ndim12, _byq) = Self::check_flags(naux, ndim1, ndim2, storeflags)?;
        Ok(StoredQTensor {
            naux, ndim1, ndim2, ndim12, storeflags,
            name: name.to_string(),
            filled: false,
            store: QStore::OnDist(DistQTensor::new(naux, ndim12, mpi_op.clone())),
            gen_timer: CumulTimer::new(),
            getq_timer: CumulTimer::new(),
            getij_timer: CumulTimer::new(),
        })
    }

    fn check_flags(naux: usize, ndim1: usize, ndim2: usize, storeflags: usize) -> anyhow::Result<(usize,bool)> {
        if naux == 0 || ndim1 == 0 || ndim2 == 0 {
            bail!("Error: tensor with a zero dimension ({},{},{})", naux, ndim1, ndim2);
        }
        let packed = storeflags & QSTORAGE_PACKED != 0;
        if packed && ndim1 != ndim2 {
            bail!("Error: packed storage requested for a non-square ({} x {}) tensor", ndim1, ndim2);
        }
        let ndim12 = if packed {ndim1*(ndim1+1)/2} else {ndim1*ndim2};
        Ok((ndim12, storeflags & QSTORAGE_BYQ != 0))
    }

    pub fn naux(&self) -> usize { self.naux }
    pub fn ndim1(&self) -> usize { self.ndim1 }
    pub fn ndim2(&self) -> usize { self.ndim2 }
    pub fn ndim12(&self) -> usize { self.ndim12 }
    pub fn store_size(&self) -> usize { self.naux*self.ndim12 }
    pub fn name(&self) -> &str { &self.name }
    pub fn store_flags(&self) -> usize { self.storeflags }

    pub fn packed(&self) -> bool {
        self.storeflags & QSTORAGE_PACKED != 0
    }

    pub fn byq(&self) -> bool {
        self.storeflags & QSTORAGE_BYQ != 0
    }

    pub fn filled(&self) -> bool {
        self.filled
    }

    pub fn set_filled(&mut self) {
        self.filled = true;
    }

    /// Linear pair index of (i,j). Packed tensors canonicalize to the lower
    /// triangle; full tensors use the column-major linearization of their
    /// dense slices, i running fastest.
    pub fn calc_index(&self, i: usize, j: usize) -> usize {
        if !self.packed() {
            j*self.ndim1 + i
        } else if i >= j {
            i*(i+1)/2 + j
        } else {
            j*(j+1)/2 + i
        }
    }

    /// Write `nij` pair slices (naux values each) starting at pair `ijstart`.
    pub fn write(&mut self, data: &[f64], nij: usize, ijstart: usize) -> anyhow::Result<()> {
        if ijstart + nij > self.ndim12 {
            bail!("Error: write of {} pair slices at {} runs past {} pairs of tensor {}",
                  nij, ijstart, self.ndim12, self.name);
        }
        if data.len() < nij*self.naux {
            bail!("Error: write buffer holds {} values but {} are needed", data.len(), nij*self.naux);
        }
        match &mut self.store {
            QStore::InMem(mem) => mem.write(data, nij, ijstart),
            QStore::OnDisk(disk) => disk.write(data, nij, ijstart)?,
            #[cfg(feature = "mpi-rt")]
            QStore::OnDist(dist) => dist.write(data, nij, ijstart),
        }
        Ok(())
    }

    /// Write `nq` q slices (ndim12 values each) starting at slice `qstart`.
    pub fn write_by_q(&mut self, data: &[f64], nq: usize, qstart: usize) -> anyhow::Result<()> {
        if qstart + nq > self.naux {
            bail!("Error: write of {} q slices at {} runs past {} slices of tensor {}",
                  nq, qstart, self.naux, self.name);
        }
        if data.len() < nq*self.ndim12 {
            bail!("Error: write buffer holds {} values but {} are needed", data.len(), nq*self.ndim12);
        }
        match &mut self.store {
            QStore::InMem(mem) => mem.write_by_q(data, nq, qstart),
            QStore::OnDisk(disk) => disk.write_by_q(data, nq, qstart)?,
            #[cfg(feature = "mpi-rt")]
            QStore::OnDist(dist) => dist.write_by_q(data, nq, qstart),
        }
        Ok(())
    }

    /// Read up to `nij` pair slices starting at `ijstart`; returns the number
    /// delivered, clamped to the remaining extent. 0 signals exhaustion.
    pub fn read(&mut self, data: &mut [f64], nij: usize, ijstart: usize) -> anyhow::Result<usize> {
        if ijstart >= self.ndim12 {
            return Ok(0);
        }
        let nij = nij.min(self.ndim12 - ijstart);
        if data.len() < nij*self.naux {
            bail!("Error: read buffer holds {} values but {} are needed", data.len(), nij*self.naux);
        }
        match &mut self.store {
            QStore::InMem(mem) => mem.read(data, nij, ijstart),
            QStore::OnDisk(disk) => disk.read(data, nij, ijstart)?,
            #[cfg(feature = "mpi-rt")]
            QStore::OnDist(dist) => dist.read(data, nij, ijstart),
        }
        Ok(nij)
    }

    /// Read up to `nq` q slices starting at `qstart`; returns the number
    /// delivered, clamped to the remaining extent. 0 signals exhaustion.
    pub fn read_by_q(&mut self, data: &mut [f64], nq: usize, qstart: usize) -> anyhow::Result<usize> {
        if qstart >= self.naux {
            return Ok(0);
        }
        let nq = nq.min(self.naux - qstart);
        if data.len() < nq*self.ndim12 {
            bail!("Error: read buffer holds {} values but {} are needed", data.len(), nq*self.ndim12);
        }
        match &mut self.store {
            QStore::InMem(mem) => mem.read_by_q(data, nq, qstart),
            QStore::OnDisk(disk) => disk.read_by_q(data, nq, qstart)?,
            #[cfg(feature = "mpi-rt")]
            QStore::OnDist(dist) => dist.read_by_q(data, nq, qstart),
        }
        Ok(nq)
    }

    /// Release the backing storage. Safe to call more than once.
    pub fn clear(&mut self) -> anyhow::Result<()> {
        self.filled = false;
        match &mut self.store {
            QStore::InMem(mem) => mem.clear(),
            QStore::OnDisk(disk) => disk.clear()?,
            #[cfg(feature = "mpi-rt")]
            QStore::OnDist(dist) => dist.clear(),
        }
        Ok(())
    }
}

#[cfg(test)]
fn reference_value(q: usize, ij: usize) -> f64 {
    1000.0*(q as f64) + ij as f64
}

#[cfg(test)]
fn fill_by_q(qt: &mut StoredQTensor) {
    let ndim12 = qt.ndim12();
    for q in 0..qt.naux() {
        let row: Vec<f64> = (0..ndim12).map(|ij| reference_value(q, ij)).collect();
        qt.write_by_q(&row, 1, q).unwrap();
    }
    qt.set_filled();
}

#[cfg(test)]
fn fill_by_pair(qt: &mut StoredQTensor) {
    let naux = qt.naux();
    for ij in 0..qt.ndim12() {
        let row: Vec<f64> = (0..naux).map(|q| reference_value(q, ij)).collect();
        qt.write(&row, 1, ij).unwrap();
    }
    qt.set_filled();
}

#[cfg(test)]
fn check_roundtrip(mut qt: StoredQTensor, write_by_q: bool) {
    if write_by_q {
        fill_by_q(&mut qt);
    } else {
        fill_by_pair(&mut qt);
    }

    // read back on the pair axis
    let naux = qt.naux();
    let mut pair_buf = vec![0.0; 3*naux];
    let mut ij = 0;
    loop {
        let got = qt.read(&mut pair_buf, 3, ij).unwrap();
        if got == 0 {
            break;
        }
        for ij0 in 0..got {
            for q in 0..naux {
                assert_eq!(pair_buf[ij0*naux + q], reference_value(q, ij+ij0));
            }
        }
        ij += got;
    }
    assert_eq!(ij, qt.ndim12());

    // and on the q axis
    let ndim12 = qt.ndim12();
    let mut q_buf = vec![0.0; 2*ndim12];
    let mut q = 0;
    loop {
        let got = qt.read_by_q(&mut q_buf, 2, q).unwrap();
        if got == 0 {
            break;
        }
        for q0 in 0..got {
            for ij0 in 0..ndim12 {
                assert_eq!(q_buf[q0*ndim12 + ij0], reference_value(q+q0, ij0));
            }
        }
        q += got;
    }
    assert_eq!(q, qt.naux());
}

#[test]
fn test_mem_roundtrip_all_layouts() {
    for &packed in &[false, true] {
        for &byq in &[false, true] {
            for &fill_q in &[false, true] {
                let mut flags = QSTORAGE_INMEM;
                if packed { flags |= QSTORAGE_PACKED; }
                if byq { flags |= QSTORAGE_BYQ; }
                let qt = StoredQTensor::create(5, 4, 4, flags, "t", "").unwrap();
                check_roundtrip(qt, fill_q);
            }
        }
    }
}

#[test]
fn test_disk_roundtrip_all_layouts() {
    let dir = std::env::temp_dir().join("dfq_disk_roundtrip");
    let dir = dir.to_str().unwrap();
    for (case, &(packed, byq, fill_q)) in [
        (false,false,false), (false,true,true), (true,false,true), (true,true,false),
    ].iter().enumerate() {
        let mut flags = QSTORAGE_ONDISK;
        if packed { flags |= QSTORAGE_PACKED; }
        if byq { flags |= QSTORAGE_BYQ; }
        let name = format!("t{}", case);
        let qt = StoredQTensor::create(5, 4, 4, flags, &name, dir).unwrap();
        check_roundtrip(qt, fill_q);
    }
}

#[test]
fn test_disk_matches_memory() {
    let dir = std::env::temp_dir().join("dfq_disk_vs_mem");
    let dir = dir.to_str().unwrap();
    let mut mem = StoredQTensor::create(6, 3, 3, QSTORAGE_INMEM | QSTORAGE_BYQ | QSTORAGE_PACKED, "m", "").unwrap();
    let mut disk = StoredQTensor::create(6, 3, 3, QSTORAGE_ONDISK | QSTORAGE_BYQ | QSTORAGE_PACKED, "d", dir).unwrap();
    fill_by_q(&mut mem);
    fill_by_q(&mut disk);

    let mut buf_m = vec![0.0; mem.store_size()];
    let mut buf_d = vec![0.0; disk.store_size()];
    assert_eq!(mem.read_by_q(&mut buf_m, 6, 0).unwrap(), 6);
    assert_eq!(disk.read_by_q(&mut buf_d, 6, 0).unwrap(), 6);
    assert_eq!(buf_m, buf_d);
}

#[test]
fn test_read_clamps_and_exhausts() {
    let mut qt = StoredQTensor::create(5, 3, 3, QSTORAGE_INMEM | QSTORAGE_BYQ, "t", "").unwrap();
    fill_by_q(&mut qt);
    let mut buf = vec![0.0; 3*qt.ndim12()];
    assert_eq!(qt.read_by_q(&mut buf, 3, 0).unwrap(), 3);
    assert_eq!(qt.read_by_q(&mut buf, 3, 3).unwrap(), 2);
    assert_eq!(qt.read_by_q(&mut buf, 3, 5).unwrap(), 0);
    assert_eq!(qt.read_by_q(&mut buf, 3, 50).unwrap(), 0);
}

#[test]
fn test_calc_index_bijection() {
    let qt = StoredQTensor::create(2, 5, 5, QSTORAGE_INMEM | QSTORAGE_PACKED | QSTORAGE_BYQ, "t", "").unwrap();
    let mut seen = vec![false; qt.ndim12()];
    for i in 0..5 {
        for j in 0..=i {
            let ij = qt.calc_index(i, j);
            assert_eq!(ij, qt.calc_index(j, i));
            assert!(ij < qt.ndim12());
            assert!(!seen[ij]);
            seen[ij] = true;
        }
    }
    assert!(seen.iter().all(|&x| x));
}

#[test]
fn test_packed_nonsquare_rejected() {
    let res = StoredQTensor::create(4, 3, 5, QSTORAGE_INMEM | QSTORAGE_PACKED, "t", "");
    assert!(res.is_err());
}

#[test]
fn test_clear_is_idempotent() {
    let dir = std::env::temp_dir().join("dfq_clear");
    let dir = dir.to_str().unwrap();
    let mut qt = StoredQTensor::create(2, 2, 2, QSTORAGE_ONDISK | QSTORAGE_BYQ, "t", dir).unwrap();
    fill_by_q(&mut qt);
    qt.clear().unwrap();
    qt.clear().unwrap();
    assert!(!qt.filled());
}
