use std::sync::mpsc::channel;
use std::time::Instant;

use anyhow::{anyhow, bail};
use rayon::prelude::*;
use tensors::matrix_blas_lapack::{_dgemm, _dsymm};
use tensors::MatrixFull;

use crate::basis_io::reorder::{get_ordering, perm_as_matrix, reorder_mat_rows, shell_perms, BasOrder};
use crate::basis_io::BasisInfo;
use crate::constants::TRANS_QBATCH_PER_THREAD;
use crate::integral_io::{IntDriver, IntEngine};
use crate::ri_io::{StoredQTensor,
    QGEN_QMO, QGEN_QOO, QGEN_QOV, QGEN_QSO, QGEN_QVV,
    QSTORAGE_BYQ, QSTORAGE_INMEM, QSTORAGE_ONDISK, QSTORAGE_ONDIST, QSTORAGE_PACKED};
use crate::utilities;

pub mod metric;
pub use metric::FittingMetric;

/// One destination of the per-slice transform: C_left^T * Qslice * C_right.
struct TransTask<'a> {
    flag: usize,
    left: &'a MatrixFull<f64>,
    right: &'a MatrixFull<f64>,
    packed: bool,
}

/// The density-fitting tensor engine. Owns the fitting metric, the stored
/// tensors and the coefficient matrices, drives the integral evaluator over
/// shell blocks, and serves batched reads over either axis.
///
/// `Qso` is generated on first demand and stored by-q, packed; the derived
/// tensors (`Qmo`, `Qoo`, `Qov`, `Qvv`) are produced per request from `Qso`
/// slices and coefficient matrices. Generation is run-to-completion; a
/// failed generation leaves the destination tensor absent and must be
/// restarted from scratch.
pub struct DFTensor<D: IntDriver> {
    pub primary: BasisInfo,
    pub auxiliary: BasisInfo,
    pub driver: D,
    pub directory: String,
    pub num_threads: usize,
    pub print_level: usize,

    pub metric: FittingMetric,

    pub nso: usize,
    pub nso2: usize,
    pub nsotri: usize,
    pub naux: usize,

    pub nmo: usize,
    pub nocc: usize,
    pub nfroz: usize,
    pub nvir: usize,

    pub cmo: Option<MatrixFull<f64>>,
    pub cmo_occ: Option<MatrixFull<f64>>,
    pub cmo_vir: Option<MatrixFull<f64>>,
    pub bs_order: BasOrder,
    // the convention the stored Qso currently sits in
    qso_bs_order: BasOrder,

    pub qso: Option<StoredQTensor>,
    pub qmo: Option<StoredQTensor>,
    pub qoo: Option<StoredQTensor>,
    pub qov: Option<StoredQTensor>,
    pub qvv: Option<StoredQTensor>,

    #[cfg(feature = "mpi-rt")]
    pub mpi_op: Option<std::sync::Arc<crate::mpi_io::MPIOperator>>,
}

impl<D: IntDriver> DFTensor<D> {
    /// Build the engine and the fitting metric. `num_threads == 0` picks one
    /// worker per available core.
    pub fn new(primary: BasisInfo, auxiliary: BasisInfo, driver: D,
               directory: &str, num_threads: usize) -> anyhow::Result<DFTensor<D>> {
        let mut directory = directory.to_string();
        while directory.len() > 1 && directory.ends_with('/') {
            directory.pop();
        }
        let num_threads = if num_threads == 0 {rayon::current_num_threads()} else {num_threads};

        let nso = primary.num_func();
        let naux = auxiliary.num_func();

        let pool = utilities::create_pool(num_threads)?;
        let metric = pool.install(|| FittingMetric::form_eig_inverse(&driver, &auxiliary))?;

        Ok(DFTensor {
            primary, auxiliary, driver, directory,
            num_threads,
            print_level: 0,
            metric,
            nso,
            nso2: nso*nso,
            nsotri: nso*(nso+1)/2,
            naux,
            nmo: 0, nocc: 0, nfroz: 0, nvir: 0,
            cmo: None, cmo_occ: None, cmo_vir: None,
            bs_order: BasOrder::Native,
            qso_bs_order: BasOrder::Native,
            qso: None, qmo: None, qoo: None, qov: None, qvv: None,
            #[cfg(feature = "mpi-rt")]
            mpi_op: None,
        })
    }

    pub fn set_num_threads(&mut self, num_threads: usize) {
        self.num_threads = if num_threads == 0 {rayon::current_num_threads()} else {num_threads};
    }

    pub fn set_print_level(&mut self, print_level: usize) {
        self.print_level = print_level;
    }

    #[cfg(feature = "mpi-rt")]
    pub fn set_mpi_operator(&mut self, mpi_op: std::sync::Arc<crate::mpi_io::MPIOperator>) {
        self.mpi_op = Some(mpi_op);
    }

    /// Ingest the coefficient matrix. The caller buffer is column-major
    /// [nso, nmo] (one column per orbital), or [nmo, nso] when
    /// `cmo_is_trans`; either way it lands in the canonical orientation, with
    /// its basis-function rows permuted into the internal convention when the
    /// caller convention differs.
    pub fn set_c_matrix(&mut self, cmo: &[f64], nmo: usize, cmo_is_trans: bool,
                        order: BasOrder) -> anyhow::Result<()> {
        if self.cmo.is_some() {
            bail!("Error: the c matrix has already been set");
        }
        if cmo.len() != self.nso*nmo {
            bail!("Error: the c matrix buffer holds {} values but {}x{} are expected",
                  cmo.len(), self.nso, nmo);
        }

        let mut mat = if cmo_is_trans {
            let mut mat = MatrixFull::new([self.nso,nmo],0.0);
            for p in 0..nmo {
                for i in 0..self.nso {
                    mat[(i,p)] = cmo[i*nmo + p];
                }
            }
            mat
        } else {
            MatrixFull::from_vec([self.nso,nmo], cmo.to_vec()).unwrap()
        };

        let ord = get_ordering(order)?;
        let perms = shell_perms(&self.primary, &ord, true)?;
        reorder_mat_rows(&mut mat, &perms)?;

        self.nmo = nmo;
        self.bs_order = order;
        self.cmo = Some(mat);
        Ok(())
    }

    /// Record the occupation counts and split the coefficient matrix into its
    /// occupied block (skipping the frozen columns) and its virtual block.
    pub fn set_nocc(&mut self, nocc: usize, nfroz: usize) -> anyhow::Result<()> {
        if nocc == 0 {
            bail!("Error: nocc must be positive");
        }
        let cmo = self.cmo.as_ref()
            .ok_or(anyhow!("Error: the c matrix must be set before the occupations"))?;
        if nocc + nfroz > self.nmo {
            bail!("Error: nocc {} + nfroz {} exceeds nmo {}", nocc, nfroz, self.nmo);
        }

        self.nocc = nocc;
        self.nfroz = nfroz;
        self.nvir = self.nmo - nocc - nfroz;

        let nso = self.nso;
        let mut cmo_occ = MatrixFull::new([nso,nocc],0.0);
        cmo_occ.copy_from_matr(0..nso, 0..nocc, cmo, 0..nso, nfroz..nfroz+nocc);
        let mut cmo_vir = MatrixFull::new([nso,self.nvir],0.0);
        cmo_vir.copy_from_matr(0..nso, 0..self.nvir, cmo, 0..nso, nfroz+nocc..self.nmo);

        self.cmo_occ = Some(cmo_occ);
        self.cmo_vir = Some(cmo_vir);
        Ok(())
    }

    fn backend_store(&self, name: &str, naux: usize, ndim1: usize, ndim2: usize,
                     storeflags: usize) -> anyhow::Result<StoredQTensor> {
        if storeflags & QSTORAGE_ONDIST != 0 {
            #[cfg(feature = "mpi-rt")]
            {
                let mpi_op = self.mpi_op.as_ref()
                    .ok_or(anyhow!("Error: distributed storage requested but no MPI context is set"))?;
                return StoredQTensor::create_dist(naux, ndim1, ndim2, storeflags, name, mpi_op);
            }
            #[cfg(not(feature = "mpi-rt"))]
            bail!("Error: distributed storage requested but the crate was built without the mpi-rt feature");
        }
        StoredQTensor::create(naux, ndim1, ndim2, storeflags, name, &self.directory)
    }

    /// Ensure the raw Qso tensor exists: generating twice is a no-op. The
    /// tensor is stored by-q and packed whatever the caller layout flags say;
    /// only the backend selection is taken from `storeflags`.
    pub fn gen_qso(&mut self, storeflags: usize) -> anyhow::Result<()> {
        if let Some(qso) = &self.qso {
            if qso.filled() {
                return Ok(());
            }
        }

        let flags = (storeflags & (QSTORAGE_INMEM | QSTORAGE_ONDISK | QSTORAGE_ONDIST))
            | QSTORAGE_PACKED | QSTORAGE_BYQ;
        let mut qso_store = self.backend_store("qso", self.naux, self.nso, self.nso, flags)?;

        let mut time_records = utilities::TimeRecords::new();
        time_records.new_item("prim ri", "for the three-center integrals and the metric contraction");
        time_records.count_start("prim ri");

        let tim = Instant::now();
        let pool = utilities::create_pool(self.num_threads)?;
        let default_omp_num_threads = utilities::omp_get_num_threads_wrapper();
        utilities::omp_set_num_threads_wrapper(1);

        let primary = &self.primary;
        let auxiliary = &self.auxiliary;
        let driver = &self.driver;
        let metric = &self.metric.matrix;
        let naux = self.naux;

        let par_shellpair = primary.shell_pairs();

        let (sender, receiver) = channel();
        pool.install(|| {
            par_shellpair.par_iter().for_each_with(sender, |s, shell_pair| {
                let bas_m = shell_pair[0];
                let bas_n = shell_pair[1];
                let shell_m = &primary.shells[bas_m];
                let shell_n = &primary.shells[bas_n];
                let (mstart, nm) = (shell_m.start_func, shell_m.num_func);
                let (nstart, nn) = (shell_n.start_func, shell_n.num_func);

                let mut engine = driver.init_engine();

                // collect the raw (mn|P) columns for this shell pair
                let mut loc_b = MatrixFull::new([nm*nn,naux],0.0);
                for (bas_p, shell_p) in auxiliary.shells.iter().enumerate() {
                    let (pstart, np) = (shell_p.start_func, shell_p.num_func);
                    let buf = engine.int_3c2e(bas_m, bas_n, bas_p);
                    if buf.len() != nm*nn*np {
                        panic!("Error: the 3-center block ({},{},{}) holds {} values instead of {}",
                               bas_m, bas_n, bas_p, buf.len(), nm*nn*np);
                    }
                    loc_b.data[pstart*nm*nn..pstart*nm*nn + nm*nn*np].copy_from_slice(&buf);
                }

                // contract the auxiliary index with the metric; the result
                // holds one contiguous naux column per (m,n) pair
                let mut loc_a = MatrixFull::new([naux,nm*nn],0.0);
                _dgemm(
                    metric, (0..naux,0..naux), 'N',
                    &loc_b, (0..nm*nn,0..naux), 'T',
                    &mut loc_a, (0..naux,0..nm*nn), 1.0, 0.0);

                s.send((loc_a, mstart, nm, nstart, nn)).unwrap();
            });
        });

        receiver.into_iter().try_for_each(|(loc_a, mstart, nm, nstart, nn)| -> anyhow::Result<()> {
            if mstart != nstart {
                for n0 in 0..nn {
                    for m0 in 0..nm {
                        let r = m0 + n0*nm;
                        let ij = qso_store.calc_index(mstart+m0, nstart+n0);
                        qso_store.write(&loc_a.data[r*naux..(r+1)*naux], 1, ij)?;
                    }
                }
            } else {
                // diagonal shell block: the tensor is symmetric in (i,j), so
                // only the lower triangle m >= n is written
                for n0 in 0..nn {
                    for m0 in n0..nm {
                        let r = m0 + n0*nm;
                        let ij = qso_store.calc_index(mstart+m0, nstart+n0);
                        qso_store.write(&loc_a.data[r*naux..(r+1)*naux], 1, ij)?;
                    }
                }
            }
            Ok(())
        })?;

        utilities::omp_set_num_threads_wrapper(default_omp_num_threads);

        qso_store.set_filled();
        qso_store.gen_timer.add(tim);
        self.qso = Some(qso_store);
        self.qso_bs_order = BasOrder::Native;

        time_records.count("prim ri");
        if self.print_level >= 2 {
            println!("qso generated: {} auxiliary slices of {} packed pairs", self.naux, self.nsotri);
            time_records.report_all();
        }
        Ok(())
    }

    /// Generate the requested tensors. `qflags` is any combination of the
    /// QGEN_* selectors; `storeflags` picks the backend and, for the derived
    /// tensors, the physical layout. Tensors already generated are left
    /// untouched. Qso is always produced first (and kept) since every
    /// derived tensor streams from it.
    pub fn generate_q_tensors(&mut self, qflags: usize, storeflags: usize) -> anyhow::Result<()> {
        if qflags == 0 {
            return Ok(());
        }
        let dt0 = utilities::init_timing();

        // packing is decided per tensor here, not by the caller
        let storeflags = storeflags & !QSTORAGE_PACKED;

        let derived = qflags & (QGEN_QMO | QGEN_QOO | QGEN_QOV | QGEN_QVV);
        if derived != 0 && self.cmo.is_none() {
            bail!("Error: set the c matrix first");
        }
        if (derived & (QGEN_QOO | QGEN_QOV | QGEN_QVV)) != 0 && self.nocc == 0 {
            bail!("Error: set the occupations first");
        }

        self.gen_qso(storeflags)?;

        if derived != 0 && self.qso_bs_order != BasOrder::Native {
            bail!("Error: Qso has been reordered to the caller convention; coefficient transforms must be generated before or alongside the Qso export");
        }

        let mut dests: Vec<(usize, StoredQTensor)> = vec![];
        if qflags & QGEN_QMO != 0 && !self.tensor_filled(QGEN_QMO) {
            dests.push((QGEN_QMO,
                self.backend_store("qmo", self.naux, self.nmo, self.nmo, storeflags | QSTORAGE_PACKED)?));
        }
        if qflags & QGEN_QOO != 0 && !self.tensor_filled(QGEN_QOO) {
            dests.push((QGEN_QOO,
                self.backend_store("qoo", self.naux, self.nocc, self.nocc, storeflags | QSTORAGE_PACKED)?));
        }
        if qflags & QGEN_QOV != 0 && !self.tensor_filled(QGEN_QOV) {
            dests.push((QGEN_QOV,
                self.backend_store("qov", self.naux, self.nocc, self.nvir, storeflags)?));
        }
        if qflags & QGEN_QVV != 0 && !self.tensor_filled(QGEN_QVV) {
            dests.push((QGEN_QVV,
                self.backend_store("qvv", self.naux, self.nvir, self.nvir, storeflags | QSTORAGE_PACKED)?));
        }

        if !dests.is_empty() {
            let mut tasks: Vec<TransTask> = vec![];
            for (flag, dest) in dests.iter() {
                let (left, right) = match *flag {
                    QGEN_QMO => (self.cmo.as_ref().unwrap(), self.cmo.as_ref().unwrap()),
                    QGEN_QOO => (self.cmo_occ.as_ref().unwrap(), self.cmo_occ.as_ref().unwrap()),
                    QGEN_QOV => (self.cmo_occ.as_ref().unwrap(), self.cmo_vir.as_ref().unwrap()),
                    QGEN_QVV => (self.cmo_vir.as_ref().unwrap(), self.cmo_vir.as_ref().unwrap()),
                    _ => unreachable!(),
                };
                tasks.push(TransTask { flag: *flag, left, right, packed: dest.packed() });
            }

            let tim = Instant::now();
            let nso = self.nso;
            let nsotri = self.nsotri;
            let num_threads = self.num_threads;
            let qso = self.qso.as_mut().unwrap();

            let pool = utilities::create_pool(num_threads)?;
            let default_omp_num_threads = utilities::omp_get_num_threads_wrapper();
            utilities::omp_set_num_threads_wrapper(1);

            let nq_batch = num_threads*TRANS_QBATCH_PER_THREAD;
            let mut bufq = vec![0.0; nq_batch*nsotri];
            let mut qstart = 0_usize;
            loop {
                let got = qso.read_by_q(&mut bufq, nq_batch, qstart)?;
                if got == 0 {
                    break;
                }

                let (sender, receiver) = channel();
                pool.install(|| {
                    bufq[..got*nsotri].par_chunks_exact(nsotri).enumerate().for_each_with(sender, |s, (iq, m)| {
                        let rows = transform_slice(nso, m, &tasks);
                        s.send((qstart + iq, rows)).unwrap();
                    });
                });

                receiver.into_iter().try_for_each(|(q, rows)| -> anyhow::Result<()> {
                    for (flag, row) in rows {
                        let dest = dests.iter_mut().find(|d| d.0 == flag).unwrap();
                        dest.1.write_by_q(&row, 1, q)?;
                    }
                    Ok(())
                })?;

                qstart += got;
            }

            utilities::omp_set_num_threads_wrapper(default_omp_num_threads);

            for (_, dest) in dests.iter_mut() {
                dest.set_filled();
                dest.gen_timer.add(tim);
            }
            for (flag, dest) in dests {
                match flag {
                    QGEN_QMO => self.qmo = Some(dest),
                    QGEN_QOO => self.qoo = Some(dest),
                    QGEN_QOV => self.qov = Some(dest),
                    QGEN_QVV => self.qvv = Some(dest),
                    _ => unreachable!(),
                }
            }
        }

        // an exported Qso follows the caller convention
        if qflags & QGEN_QSO != 0 && self.bs_order != BasOrder::Native
            && self.qso_bs_order == BasOrder::Native {
            self.reorder_qso()?;
        }

        utilities::timing(&dt0, Some("generate_q_tensors"));
        if self.print_level >= 2 {
            self.print_timings();
        }
        Ok(())
    }

    /// Rewrite the stored Qso with both dimensions carried into the caller
    /// basis ordering, as a similarity transform with the permutation matrix.
    fn reorder_qso(&mut self) -> anyhow::Result<()> {
        let ord = get_ordering(self.bs_order)?;
        let perms = shell_perms(&self.primary, &ord, false)?;
        if perms.is_empty() {
            // nothing to permute for these shells; Qso stays usable for
            // further coefficient transforms
            return Ok(());
        }
        let tmat = perm_as_matrix(&self.primary, &perms);

        let nso = self.nso;
        let nsotri = self.nsotri;
        let num_threads = self.num_threads;
        let qso = self.qso.as_mut()
            .ok_or(anyhow!("Error: qso has not been generated"))?;
        let tasks = [TransTask { flag: QGEN_QSO, left: &tmat, right: &tmat, packed: true }];

        let pool = utilities::create_pool(num_threads)?;
        let default_omp_num_threads = utilities::omp_get_num_threads_wrapper();
        utilities::omp_set_num_threads_wrapper(1);

        let nq_batch = num_threads*TRANS_QBATCH_PER_THREAD;
        let mut bufq = vec![0.0; nq_batch*nsotri];
        let mut qstart = 0_usize;
        loop {
            let got = qso.read_by_q(&mut bufq, nq_batch, qstart)?;
            if got == 0 {
                break;
            }

            let (sender, receiver) = channel();
            pool.install(|| {
                bufq[..got*nsotri].par_chunks_exact(nsotri).enumerate().for_each_with(sender, |s, (iq, m)| {
                    let rows = transform_slice(nso, m, &tasks);
                    s.send((qstart + iq, rows)).unwrap();
                });
            });

            // collect first: the batch is rewritten into the same store
            let permuted: Vec<(usize, Vec<(usize, Vec<f64>)>)> = receiver.into_iter().collect();
            for (q, rows) in permuted {
                for (_, row) in rows {
                    qso.write_by_q(&row, 1, q)?;
                }
            }

            qstart += got;
        }

        utilities::omp_set_num_threads_wrapper(default_omp_num_threads);
        self.qso_bs_order = self.bs_order;
        Ok(())
    }

    fn tensor_filled(&self, tensorflag: usize) -> bool {
        match self.resolve_tensor_flag(tensorflag) {
            Ok(qt) => qt.filled(),
            Err(_) => false,
        }
    }

    fn resolve_tensor_flag(&self, tensorflag: usize) -> anyhow::Result<&StoredQTensor> {
        let qt = match tensorflag {
            QGEN_QSO => &self.qso,
            QGEN_QMO => &self.qmo,
            QGEN_QOO => &self.qoo,
            QGEN_QOV => &self.qov,
            QGEN_QVV => &self.qvv,
            _ => bail!("Error: unknown tensor flag {}", tensorflag),
        };
        qt.as_ref().ok_or(anyhow!("Error: the requested tensor has not been generated"))
    }

    fn resolve_tensor_flag_mut(&mut self, tensorflag: usize) -> anyhow::Result<&mut StoredQTensor> {
        let qt = match tensorflag {
            QGEN_QSO => &mut self.qso,
            QGEN_QMO => &mut self.qmo,
            QGEN_QOO => &mut self.qoo,
            QGEN_QOV => &mut self.qov,
            QGEN_QVV => &mut self.qvv,
            _ => bail!("Error: unknown tensor flag {}", tensorflag),
        };
        qt.as_mut().ok_or(anyhow!("Error: the requested tensor has not been generated"))
    }

    /// Read a batch of whole q slices into `outbuf`, starting at `qstart`.
    /// The batch size is outbuf.len()/ndim12 slices; the returned count is
    /// clamped to the remaining extent and 0 signals exhaustion. Callers
    /// loop, advancing `qstart` by the returned count.
    pub fn get_qbatch(&mut self, tensorflag: usize, outbuf: &mut [f64], qstart: usize) -> anyhow::Result<usize> {
        let tim = Instant::now();
        let qt = self.resolve_tensor_flag_mut(tensorflag)?;
        let nq = outbuf.len()/qt.ndim12();
        if nq == 0 {
            bail!("Error: the output buffer is too small to hold even one batch");
        }
        let gotten = qt.read_by_q(outbuf, nq, qstart)?;
        qt.getq_timer.add(tim);
        Ok(gotten)
    }

    /// Read a batch of whole orbital-pair slices (naux values each), starting
    /// at pair `ijstart`. Same looping contract as `get_qbatch`.
    pub fn get_batch(&mut self, tensorflag: usize, outbuf: &mut [f64], ijstart: usize) -> anyhow::Result<usize> {
        let tim = Instant::now();
        let qt = self.resolve_tensor_flag_mut(tensorflag)?;
        let nij = outbuf.len()/qt.naux();
        if nij == 0 {
            bail!("Error: the output buffer is too small to hold even one batch");
        }
        let gotten = qt.read(outbuf, nij, ijstart)?;
        qt.getij_timer.add(tim);
        Ok(gotten)
    }

    pub fn tensor_dimensions(&self, tensorflag: usize) -> anyhow::Result<(usize,usize,usize)> {
        let qt = self.resolve_tensor_flag(tensorflag)?;
        Ok((qt.naux(), qt.ndim1(), qt.ndim2()))
    }

    pub fn is_packed(&self, tensorflag: usize) -> anyhow::Result<bool> {
        Ok(self.resolve_tensor_flag(tensorflag)?.packed())
    }

    pub fn calc_index(&self, tensorflag: usize, i: usize, j: usize) -> anyhow::Result<usize> {
        Ok(self.resolve_tensor_flag(tensorflag)?.calc_index(i, j))
    }

    /// Number of values in one q slice of the tensor.
    pub fn qbatch_size(&self, tensorflag: usize) -> anyhow::Result<usize> {
        Ok(self.resolve_tensor_flag(tensorflag)?.ndim12())
    }

    /// Number of values in one orbital-pair slice of the tensor.
    pub fn batch_size(&self, tensorflag: usize) -> anyhow::Result<usize> {
        Ok(self.resolve_tensor_flag(tensorflag)?.naux())
    }

    /// Drop the selected tensors and release their backing storage.
    pub fn delete(&mut self, qflags: usize) -> anyhow::Result<()> {
        for (flag, slot) in [
            (QGEN_QSO, &mut self.qso),
            (QGEN_QMO, &mut self.qmo),
            (QGEN_QOO, &mut self.qoo),
            (QGEN_QOV, &mut self.qov),
            (QGEN_QVV, &mut self.qvv),
        ] {
            if qflags & flag != 0 {
                if let Some(mut qt) = slot.take() {
                    qt.clear()?;
                }
            }
        }
        Ok(())
    }

    /// Release everything the engine holds on to.
    pub fn cleanup(&mut self) -> anyhow::Result<()> {
        self.delete(QGEN_QSO | QGEN_QMO | QGEN_QOO | QGEN_QOV | QGEN_QVV)
    }

    pub fn print_timings(&self) {
        println!("{:6}  {:>22}  {:>22}  {:>22}", "tensor", "generation s (calls)", "get_batch s (calls)", "get_qbatch s (calls)");
        for (name, qt) in [
            ("qso", &self.qso), ("qmo", &self.qmo), ("qoo", &self.qoo),
            ("qov", &self.qov), ("qvv", &self.qvv),
        ] {
            if let Some(qt) = qt {
                println!("{:6}  {:14.6} ({:5})  {:14.6} ({:5})  {:14.6} ({:5})", name,
                    qt.gen_timer.secs, qt.gen_timer.calls,
                    qt.getij_timer.secs, qt.getij_timer.calls,
                    qt.getq_timer.secs, qt.getq_timer.calls);
            } else {
                println!("{:6}  {:>22}  {:>22}  {:>22}", name, "N/A", "N/A", "N/A");
            }
        }
    }
}

/// Transform one packed Qso slice into every requested destination: expand
/// the lower triangle into a full square once, then per destination a
/// symmetric-aware multiply with the left matrix and a plain product with
/// the right one. Returns one (flag, q-slice) row per destination.
fn transform_slice(nso: usize, packed_slice: &[f64], tasks: &[TransTask]) -> Vec<(usize, Vec<f64>)> {
    let mut reduced_q = MatrixFull::new([nso,nso],0.0);
    reduced_q.iter_matrixupper_mut().unwrap().zip(packed_slice.iter())
        .for_each(|(to,from)| {*to = *from});

    let mut rows: Vec<(usize, Vec<f64>)> = vec![];
    for task in tasks.iter() {
        let n_left = task.left.size[1];
        let n_right = task.right.size[1];

        let mut tmp_mat = MatrixFull::new([nso,n_left],0.0);
        _dsymm(&reduced_q, task.left, &mut tmp_mat, 'L', 'U', 1.0, 0.0);

        let mut out = MatrixFull::new([n_left,n_right],0.0);
        _dgemm(
            &tmp_mat, (0..nso,0..n_left), 'T',
            task.right, (0..nso,0..n_right), 'N',
            &mut out, (0..n_left,0..n_right), 1.0, 0.0);

        let row: Vec<f64> = if task.packed {
            out.iter_matrixupper().unwrap().map(|x| *x).collect()
        } else {
            out.data
        };
        rows.push((task.flag, row));
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use itertools::iproduct;
    use crate::integral_io::{GridModelDriver, IntEngine};
    use crate::ri_io::{QSTORAGE_INMEM, QSTORAGE_ONDISK};

    fn model_bases() -> (BasisInfo, BasisInfo) {
        // nso = 7, naux = 10
        let primary = BasisInfo::from_shell_list(&[(0,true),(1,true),(1,true)]).unwrap();
        let auxiliary = BasisInfo::from_shell_list(&[(0,true),(1,true),(2,false)]).unwrap();
        (primary, auxiliary)
    }

    fn model_dftensor(directory: &str) -> DFTensor<GridModelDriver> {
        let (primary, auxiliary) = model_bases();
        let driver = GridModelDriver::new(&primary, &auxiliary);
        DFTensor::new(primary, auxiliary, driver, directory, 2).unwrap()
    }

    // brute-force reference: Qso[q](i,j) = sum_P metric[q,P] * (P|ij)
    fn reference_qso(dft: &DFTensor<GridModelDriver>) -> Vec<MatrixFull<f64>> {
        let nso = dft.nso;
        let naux = dft.naux;
        let mut engine = dft.driver.init_engine();

        let mut raw = MatrixFull::new([nso*nso,naux],0.0);
        for (bas_p, shell_p) in dft.auxiliary.shells.iter().enumerate() {
            for (bas_n, shell_n) in dft.primary.shells.iter().enumerate() {
                for (bas_m, shell_m) in dft.primary.shells.iter().enumerate() {
                    let buf = engine.int_3c2e(bas_m, bas_n, bas_p);
                    for (pi, ni, mi) in iproduct!(0..shell_p.num_func, 0..shell_n.num_func, 0..shell_m.num_func) {
                        let gi = shell_m.start_func + mi;
                        let gj = shell_n.start_func + ni;
                        let gp = shell_p.start_func + pi;
                        raw[(gj*nso + gi, gp)] =
                            buf[mi + ni*shell_m.num_func + pi*shell_m.num_func*shell_n.num_func];
                    }
                }
            }
        }

        let mut per_q: Vec<MatrixFull<f64>> = vec![];
        for q in 0..naux {
            let mut slice = MatrixFull::new([nso,nso],0.0);
            for j in 0..nso {
                for i in 0..nso {
                    let mut val = 0.0;
                    for p in 0..naux {
                        val += dft.metric.matrix[(q,p)]*raw[(j*nso + i, p)];
                    }
                    slice[(i,j)] = val;
                }
            }
            per_q.push(slice);
        }
        per_q
    }

    #[test]
    fn test_qso_scenario_and_content() {
        let mut dft = model_dftensor("");
        dft.generate_q_tensors(QGEN_QSO, QSTORAGE_INMEM).unwrap();

        let (naux, ndim1, ndim2) = dft.tensor_dimensions(QGEN_QSO).unwrap();
        assert_eq!((naux, ndim1, ndim2), (10, 7, 7));
        assert!(dft.is_packed(QGEN_QSO).unwrap());
        let ndim12 = dft.qbatch_size(QGEN_QSO).unwrap();
        assert_eq!(ndim12, 28);

        let refq = reference_qso(&dft);
        // the reference slices are symmetric
        for q in 0..10 {
            for i in 0..7 {
                for j in 0..7 {
                    assert!((refq[q][(i,j)] - refq[q][(j,i)]).abs() < 1.0e-12);
                }
            }
        }

        // a buffer sized for exactly 3 q slices delivers 3,3,3,1, then 0
        let mut buf = vec![0.0; 3*ndim12];
        let mut counts: Vec<usize> = vec![];
        let mut q = 0_usize;
        loop {
            let got = dft.get_qbatch(QGEN_QSO, &mut buf, q).unwrap();
            counts.push(got);
            if got == 0 {
                break;
            }
            for q0 in 0..got {
                for i in 0..7 {
                    for j in 0..=i {
                        let ij = dft.calc_index(QGEN_QSO, i, j).unwrap();
                        assert!((buf[q0*ndim12 + ij] - refq[q+q0][(i,j)]).abs() < 1.0e-8,
                                "q {} i {} j {}", q+q0, i, j);
                    }
                }
            }
            q += got;
        }
        assert_eq!(counts, vec![3,3,3,1,0]);
        assert_eq!(q, 10);
    }

    #[test]
    fn test_qso_generation_is_idempotent() {
        let mut dft = model_dftensor("");
        dft.generate_q_tensors(QGEN_QSO, QSTORAGE_INMEM).unwrap();
        let evals_first = dft.driver.num_eval();
        assert!(evals_first > 0);

        let ndim12 = dft.qbatch_size(QGEN_QSO).unwrap();
        let mut before = vec![0.0; 10*ndim12];
        dft.get_qbatch(QGEN_QSO, &mut before, 0).unwrap();

        dft.generate_q_tensors(QGEN_QSO, QSTORAGE_INMEM).unwrap();
        assert_eq!(dft.driver.num_eval(), evals_first);

        let mut after = vec![0.0; 10*ndim12];
        dft.get_qbatch(QGEN_QSO, &mut after, 0).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_get_batch_pair_axis() {
        let mut dft = model_dftensor("");
        dft.generate_q_tensors(QGEN_QSO, QSTORAGE_INMEM).unwrap();
        let refq = reference_qso(&dft);

        let naux = dft.batch_size(QGEN_QSO).unwrap();
        let ndim12 = dft.qbatch_size(QGEN_QSO).unwrap();
        let mut buf = vec![0.0; 5*naux];
        let mut it = crate::ri_io::IJIterator::new(7, 7, true);
        let mut ij = 0_usize;
        loop {
            let got = dft.get_batch(QGEN_QSO, &mut buf, ij).unwrap();
            if got == 0 {
                break;
            }
            for ij0 in 0..got {
                let (i, j) = (it.i(), it.j());
                for q in 0..naux {
                    assert!((buf[ij0*naux + q] - refq[q][(i,j)]).abs() < 1.0e-8);
                }
                it.advance(1);
            }
            ij += got;
        }
        assert_eq!(ij, ndim12);
    }

    #[test]
    fn test_buffer_too_small_is_an_error() {
        let mut dft = model_dftensor("");
        dft.generate_q_tensors(QGEN_QSO, QSTORAGE_INMEM).unwrap();
        let ndim12 = dft.qbatch_size(QGEN_QSO).unwrap();
        let naux = dft.batch_size(QGEN_QSO).unwrap();

        let mut small = vec![0.0; ndim12 - 1];
        assert!(dft.get_qbatch(QGEN_QSO, &mut small, 0).is_err());
        let mut small = vec![0.0; naux - 1];
        assert!(dft.get_batch(QGEN_QSO, &mut small, 0).is_err());
    }

    #[test]
    fn test_transforms_match_brute_force() {
        let mut dft = model_dftensor("");
        let nso = 7;
        let nmo = 5;
        let cmo: Vec<f64> = (0..nso*nmo)
            .map(|k| (0.3*((k%nso) as f64) - 0.1*((k/nso) as f64)).cos())
            .collect();
        dft.set_c_matrix(&cmo, nmo, false, BasOrder::Native).unwrap();
        dft.set_nocc(2, 0).unwrap();
        dft.generate_q_tensors(QGEN_QMO | QGEN_QOO | QGEN_QOV | QGEN_QVV, QSTORAGE_INMEM).unwrap();

        let refq = reference_qso(&dft);
        let c = |i: usize, p: usize| cmo[i + p*nso];
        let (nocc, nvir) = (2, 3);

        let mo_ref = |q: usize, p: usize, r: usize| {
            let mut val = 0.0;
            for i in 0..nso {
                for j in 0..nso {
                    val += c(i,p)*refq[q][(i,j)]*c(j,r);
                }
            }
            val
        };

        // Qmo, packed nmo x nmo
        let ndim12 = dft.qbatch_size(QGEN_QMO).unwrap();
        assert_eq!(ndim12, nmo*(nmo+1)/2);
        let mut buf = vec![0.0; 10*ndim12];
        assert_eq!(dft.get_qbatch(QGEN_QMO, &mut buf, 0).unwrap(), 10);
        for q in 0..10 {
            for p in 0..nmo {
                for r in 0..=p {
                    let ij = dft.calc_index(QGEN_QMO, p, r).unwrap();
                    assert!((buf[q*ndim12 + ij] - mo_ref(q,p,r)).abs() < 1.0e-8,
                            "qmo q {} p {} r {}", q, p, r);
                }
            }
        }

        // Qoo, packed nocc x nocc
        let ndim12 = dft.qbatch_size(QGEN_QOO).unwrap();
        let mut buf = vec![0.0; 10*ndim12];
        assert_eq!(dft.get_qbatch(QGEN_QOO, &mut buf, 0).unwrap(), 10);
        for q in 0..10 {
            for p in 0..nocc {
                for r in 0..=p {
                    let ij = dft.calc_index(QGEN_QOO, p, r).unwrap();
                    assert!((buf[q*ndim12 + ij] - mo_ref(q,p,r)).abs() < 1.0e-8);
                }
            }
        }

        // Qov, full nocc x nvir; column-major pair linearization
        let (_, d1, d2) = dft.tensor_dimensions(QGEN_QOV).unwrap();
        assert_eq!((d1,d2), (nocc,nvir));
        assert!(!dft.is_packed(QGEN_QOV).unwrap());
        let ndim12 = dft.qbatch_size(QGEN_QOV).unwrap();
        assert_eq!(ndim12, nocc*nvir);
        let mut buf = vec![0.0; 10*ndim12];
        assert_eq!(dft.get_qbatch(QGEN_QOV, &mut buf, 0).unwrap(), 10);
        for q in 0..10 {
            for o in 0..nocc {
                for v in 0..nvir {
                    let ij = dft.calc_index(QGEN_QOV, o, v).unwrap();
                    assert!((buf[q*ndim12 + ij] - mo_ref(q, o, nocc+v)).abs() < 1.0e-8,
                            "qov q {} o {} v {}", q, o, v);
                }
            }
        }

        // Qvv, packed nvir x nvir
        let ndim12 = dft.qbatch_size(QGEN_QVV).unwrap();
        let mut buf = vec![0.0; 10*ndim12];
        assert_eq!(dft.get_qbatch(QGEN_QVV, &mut buf, 0).unwrap(), 10);
        for q in 0..10 {
            for p in 0..nvir {
                for r in 0..=p {
                    let ij = dft.calc_index(QGEN_QVV, p, r).unwrap();
                    assert!((buf[q*ndim12 + ij] - mo_ref(q, nocc+p, nocc+r)).abs() < 1.0e-8);
                }
            }
        }
    }

    #[test]
    fn test_cmat_split_with_frozen_orbitals() {
        let mut dft = model_dftensor("");
        let nso = 7;
        let nmo = 10;
        let cmo: Vec<f64> = (0..nso*nmo).map(|k| k as f64).collect();
        dft.set_c_matrix(&cmo, nmo, false, BasOrder::Native).unwrap();
        dft.set_nocc(4, 1).unwrap();
        assert_eq!(dft.nvir, 5);

        // occupied block: columns 1..=4 of cmo, skipping the frozen column 0
        let cmo_occ = dft.cmo_occ.as_ref().unwrap();
        assert_eq!(cmo_occ.size, [7,4]);
        assert_eq!(cmo_occ.data, cmo[1*nso..5*nso].to_vec());
        // virtual block: columns 5..=9
        let cmo_vir = dft.cmo_vir.as_ref().unwrap();
        assert_eq!(cmo_vir.size, [7,5]);
        assert_eq!(cmo_vir.data, cmo[5*nso..10*nso].to_vec());
    }

    #[test]
    fn test_disk_generation_matches_memory() {
        let dir = std::env::temp_dir().join("dfq_df_disk");
        let dir = dir.to_str().unwrap();

        let mut mem = model_dftensor("");
        mem.generate_q_tensors(QGEN_QSO, QSTORAGE_INMEM).unwrap();
        let mut disk = model_dftensor(dir);
        disk.generate_q_tensors(QGEN_QSO, QSTORAGE_ONDISK).unwrap();

        let ndim12 = mem.qbatch_size(QGEN_QSO).unwrap();
        let mut buf_m = vec![0.0; 10*ndim12];
        let mut buf_d = vec![0.0; 10*ndim12];
        assert_eq!(mem.get_qbatch(QGEN_QSO, &mut buf_m, 0).unwrap(), 10);
        assert_eq!(disk.get_qbatch(QGEN_QSO, &mut buf_d, 0).unwrap(), 10);
        assert_eq!(buf_m, buf_d);

        disk.cleanup().unwrap();
        assert!(disk.get_qbatch(QGEN_QSO, &mut buf_d, 0).is_err());
    }

    #[test]
    fn test_delete_and_regenerate() {
        let mut dft = model_dftensor("");
        dft.generate_q_tensors(QGEN_QSO, QSTORAGE_INMEM).unwrap();
        let evals_first = dft.driver.num_eval();

        dft.delete(QGEN_QSO).unwrap();
        let mut buf = vec![0.0; 28];
        assert!(dft.get_qbatch(QGEN_QSO, &mut buf, 0).is_err());

        // a deleted tensor is regenerated from scratch
        dft.generate_q_tensors(QGEN_QSO, QSTORAGE_INMEM).unwrap();
        assert!(dft.driver.num_eval() > evals_first);
        assert_eq!(dft.get_qbatch(QGEN_QSO, &mut buf, 0).unwrap(), 1);
    }

    #[test]
    fn test_missing_cmat_is_an_error() {
        let mut dft = model_dftensor("");
        assert!(dft.generate_q_tensors(QGEN_QMO, QSTORAGE_INMEM).is_err());

        let cmo: Vec<f64> = (0..7*5).map(|k| k as f64).collect();
        dft.set_c_matrix(&cmo, 5, false, BasOrder::Native).unwrap();
        // occupations still missing for the split tensors
        assert!(dft.generate_q_tensors(QGEN_QOV, QSTORAGE_INMEM).is_err());
        // Qmo needs no occupations
        dft.generate_q_tensors(QGEN_QMO, QSTORAGE_INMEM).unwrap();
    }

    #[test]
    fn test_transposed_cmat_ingestion() {
        let mut dft = model_dftensor("");
        let (nso, nmo) = (7, 3);
        let cmo: Vec<f64> = (0..nso*nmo).map(|k| (k as f64)*0.25).collect();
        // the same matrix handed over in [nmo, nso] orientation
        let mut cmo_t = vec![0.0; nso*nmo];
        for p in 0..nmo {
            for i in 0..nso {
                cmo_t[p + i*nmo] = cmo[i + p*nso];
            }
        }
        dft.set_c_matrix(&cmo_t, nmo, true, BasOrder::Native).unwrap();
        assert_eq!(dft.cmo.as_ref().unwrap().data, cmo);
        // a second ingestion is rejected
        assert!(dft.set_c_matrix(&cmo, nmo, false, BasOrder::Native).is_err());
    }

    #[test]
    fn test_qso_export_in_gamess_order() {
        // a cartesian d shell behind an s shell; nso = 7
        let primary = BasisInfo::from_shell_list(&[(0,true),(2,false)]).unwrap();
        let auxiliary = BasisInfo::from_shell_list(&[(0,true),(1,true),(2,false)]).unwrap();
        let ident: Vec<f64> = {
            let mut v = vec![0.0; 49];
            for i in 0..7 { v[i + i*7] = 1.0; }
            v
        };

        let driver = GridModelDriver::new(&primary, &auxiliary);
        let mut native = DFTensor::new(primary.clone(), auxiliary.clone(), driver, "", 2).unwrap();
        native.set_c_matrix(&ident, 7, false, BasOrder::Native).unwrap();
        native.generate_q_tensors(QGEN_QSO, QSTORAGE_INMEM).unwrap();

        let driver = GridModelDriver::new(&primary, &auxiliary);
        let mut gamess = DFTensor::new(primary.clone(), auxiliary.clone(), driver, "", 2).unwrap();
        gamess.set_c_matrix(&ident, 7, false, BasOrder::Gamess).unwrap();
        gamess.generate_q_tensors(QGEN_QSO, QSTORAGE_INMEM).unwrap();

        let ndim12 = native.qbatch_size(QGEN_QSO).unwrap();
        let mut buf_n = vec![0.0; 10*ndim12];
        let mut buf_g = vec![0.0; 10*ndim12];
        assert_eq!(native.get_qbatch(QGEN_QSO, &mut buf_n, 0).unwrap(), 10);
        assert_eq!(gamess.get_qbatch(QGEN_QSO, &mut buf_g, 0).unwrap(), 10);

        // d-shell functions 1..7 permuted by the GAMESS table on both axes
        let table = [0_usize, 3, 5, 1, 2, 4];
        let gorder = |f: usize| if f == 0 {0} else {1 + table[f-1]};
        for q in 0..10 {
            for i in 0..7 {
                for j in 0..=i {
                    let ij_g = native.calc_index(QGEN_QSO, i, j).unwrap();
                    let ij_n = native.calc_index(QGEN_QSO, gorder(i), gorder(j)).unwrap();
                    assert!((buf_g[q*ndim12 + ij_g] - buf_n[q*ndim12 + ij_n]).abs() < 1.0e-9,
                            "q {} i {} j {}", q, i, j);
                }
            }
        }

        // once Qso sits in the caller convention, further coefficient
        // transforms are refused
        gamess.set_nocc(2, 0).unwrap();
        assert!(gamess.generate_q_tensors(QGEN_QOV, QSTORAGE_INMEM).is_err());
    }
}
