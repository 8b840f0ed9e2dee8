use std::sync::mpsc::channel;

use rayon::prelude::*;
use tensors::MatrixFull;

use crate::basis_io::BasisInfo;
use crate::constants::AUXBAS_THRESHOLD;
use crate::integral_io::{IntDriver, IntEngine};

/// The auxiliary-basis coulomb metric, eigendecomposed into its
/// numerically-stabilized inverse square root. Built once per calculation,
/// read-only afterwards, and consumed as a plain dense buffer by the
/// shell-pair assembler.
pub struct FittingMetric {
    pub matrix: MatrixFull<f64>,
    pub naux: usize,
}

impl FittingMetric {
    /// Evaluate the 2-center coulomb matrix V = (p|q) over the auxiliary
    /// shells, one worker per shell column block, then filter and invert:
    /// the returned matrix is V^{-1/2} with eigenvectors below the threshold
    /// projected out. A metric that is not positive definite past the
    /// threshold aborts the calculation.
    pub fn form_eig_inverse<D: IntDriver>(driver: &D, auxiliary: &BasisInfo) -> anyhow::Result<FittingMetric> {
        let mut aux_v = Self::form_raw(driver, auxiliary);
        let naux = auxiliary.num_func();

        let aux_v = aux_v.lapack_power(-0.5, AUXBAS_THRESHOLD).unwrap();

        Ok(FittingMetric { matrix: aux_v, naux })
    }

    /// The plain coulomb matrix, before inversion.
    pub fn form_raw<D: IntDriver>(driver: &D, auxiliary: &BasisInfo) -> MatrixFull<f64> {
        let naux = auxiliary.num_func();
        let mut aux_v = MatrixFull::new([naux,naux],0.0);

        let (sender, receiver) = channel();
        auxiliary.shells.par_iter().enumerate().for_each_with(sender, |s, (l, shell_l)| {
            let mut engine = driver.init_engine();
            let basis_start_l = shell_l.start_func;
            let basis_len_l = shell_l.num_func;
            let mut loc_aux_v = MatrixFull::new([naux,basis_len_l],0.0);
            for (k, shell_k) in auxiliary.shells.iter().enumerate() {
                let basis_start_k = shell_k.start_func;
                let basis_len_k = shell_k.num_func;
                let buf = engine.int_2c2e(k, l);
                if buf.len() != basis_len_k*basis_len_l {
                    panic!("Error: the 2-center block ({},{}) holds {} values instead of {}",
                           k, l, buf.len(), basis_len_k*basis_len_l);
                }
                let mut tmp_slices = loc_aux_v.iter_submatrix_mut(
                    basis_start_k..basis_start_k+basis_len_k,
                    0..basis_len_l);
                tmp_slices.zip(buf.iter()).for_each(|value| {*value.0 = *value.1});
            }
            s.send((loc_aux_v, basis_start_l, basis_len_l)).unwrap()
        });
        receiver.into_iter().for_each(|(loc_aux_v, basis_start_l, basis_len_l)| {
            aux_v.copy_from_matr(0..naux, basis_start_l..basis_start_l+basis_len_l,
                &loc_aux_v, 0..naux, 0..basis_len_l);
        });

        aux_v
    }

    pub fn get_metric(&self) -> &MatrixFull<f64> {
        &self.matrix
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integral_io::GridModelDriver;
    use tensors::matrix_blas_lapack::_dgemm_full_new;

    #[test]
    fn test_metric_is_inverse_sqrt() {
        let primary = BasisInfo::from_shell_list(&[(0,true),(1,true),(1,true)]).unwrap();
        let auxiliary = BasisInfo::from_shell_list(&[(0,true),(1,true),(2,false)]).unwrap();
        let driver = GridModelDriver::new(&primary, &auxiliary);

        let raw = FittingMetric::form_raw(&driver, &auxiliary);
        let naux = auxiliary.num_func();
        // the raw metric is symmetric
        for p in 0..naux {
            for q in 0..naux {
                assert!((raw[(p,q)] - raw[(q,p)]).abs() < 1.0e-12);
            }
        }

        let metric = FittingMetric::form_eig_inverse(&driver, &auxiliary).unwrap();
        // V^{-1/2} * V * V^{-1/2} recovers the identity
        let vm = _dgemm_full_new(&metric.matrix, 'N', &raw, 'N', 1.0, 0.0);
        let unit = _dgemm_full_new(&vm, 'N', &metric.matrix, 'N', 1.0, 0.0);
        for p in 0..naux {
            for q in 0..naux {
                let expect = if p == q {1.0} else {0.0};
                assert!((unit[(p,q)] - expect).abs() < 1.0e-6,
                        "({},{}) = {}", p, q, unit[(p,q)]);
            }
        }
    }
}
