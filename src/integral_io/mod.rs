use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::basis_io::BasisInfo;

/// The contract of the external integral evaluator. One engine instance is
/// owned by one worker; the returned buffer is the dense block for the
/// requested shells and stays valid until the next call on the same engine.
///
/// Block layouts, with the first index running fastest:
///  - `int_3c2e(m,n,p)`: `[num_func_m, num_func_n, num_func_p]`
///  - `int_2c2e(p,q)`:   `[num_func_p, num_func_q]`
pub trait IntEngine {
    fn int_3c2e(&mut self, bas_m: usize, bas_n: usize, bas_p: usize) -> Vec<f64>;
    fn int_2c2e(&mut self, bas_p: usize, bas_q: usize) -> Vec<f64>;
}

/// Hands out one engine per worker, so that each rayon task owns its
/// evaluator instance and scratch.
pub trait IntDriver: Send + Sync {
    type Engine: IntEngine;
    fn init_engine(&self) -> Self::Engine;
}

struct ModelTables {
    weights: Vec<f64>,
    // [npts, num_func], one column per basis function
    prim: Vec<f64>,
    aux: Vec<f64>,
    npts: usize,
    primary: BasisInfo,
    auxiliary: BasisInfo,
}

/// A self-contained stand-in for the external integral engine: every basis
/// function gets a gaussian profile tabulated on a quadrature grid, and the
/// "repulsion" integrals are plain weighted products on that grid,
///     (p|q)   = sum_t w_t f_p(t) f_q(t)
///     (mn|p)  = sum_t w_t f_m(t) f_n(t) f_p(t)
/// The 2-center block is a Gram matrix of independent profiles, hence
/// symmetric positive definite, and every block is deterministic. Evaluation
/// calls are counted, which lets tests observe that a regeneration was a no-op.
pub struct GridModelDriver {
    tables: Arc<ModelTables>,
    num_eval: Arc<AtomicUsize>,
}

pub struct GridModelEngine {
    tables: Arc<ModelTables>,
    num_eval: Arc<AtomicUsize>,
}

const MODEL_NPTS: usize = 64;
const MODEL_RANGE: f64 = 4.0;

fn tabulate(basis: &BasisInfo, npts: usize, grid: &[f64]) -> Vec<f64> {
    let num_func = basis.num_func();
    let mut tab = vec![0.0; npts*num_func];
    for shell in basis.shells.iter() {
        for fi in 0..shell.num_func {
            let f = shell.start_func + fi;
            let center = -3.0 + 6.0*(f as f64 + 0.5)/(num_func as f64);
            let alpha = 1.2 + 0.35*((shell.ang_mom + fi) % 4) as f64;
            for (g,&t) in grid.iter().enumerate() {
                tab[f*npts + g] = (-alpha*(t-center)*(t-center)).exp();
            }
        }
    }
    tab
}

impl GridModelDriver {
    pub fn new(primary: &BasisInfo, auxiliary: &BasisInfo) -> GridModelDriver {
        let npts = MODEL_NPTS;
        let dt = 2.0*MODEL_RANGE/(npts as f64);
        let grid: Vec<f64> = (0..npts).map(|g| -MODEL_RANGE + dt*(g as f64 + 0.5)).collect();
        let weights = vec![dt; npts];
        let prim = tabulate(primary, npts, &grid);
        let aux = tabulate(auxiliary, npts, &grid);
        GridModelDriver {
            tables: Arc::new(ModelTables {
                weights, prim, aux, npts,
                primary: primary.clone(),
                auxiliary: auxiliary.clone(),
            }),
            num_eval: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of shell-block evaluations served so far, over all engines.
    pub fn num_eval(&self) -> usize {
        self.num_eval.load(Ordering::SeqCst)
    }
}

impl IntDriver for GridModelDriver {
    type Engine = GridModelEngine;
    fn init_engine(&self) -> GridModelEngine {
        GridModelEngine {
            tables: self.tables.clone(),
            num_eval: self.num_eval.clone(),
        }
    }
}

impl IntEngine for GridModelEngine {
    fn int_3c2e(&mut self, bas_m: usize, bas_n: usize, bas_p: usize) -> Vec<f64> {
        self.num_eval.fetch_add(1, Ordering::SeqCst);
        let tab = &self.tables;
        let npts = tab.npts;
        let shell_m = &tab.primary.shells[bas_m];
        let shell_n = &tab.primary.shells[bas_n];
        let shell_p = &tab.auxiliary.shells[bas_p];
        let (nm,nn,np) = (shell_m.num_func, shell_n.num_func, shell_p.num_func);
        let mut buf = vec![0.0; nm*nn*np];
        for pi in 0..np {
            let fp = &tab.aux[(shell_p.start_func+pi)*npts..(shell_p.start_func+pi+1)*npts];
            for ni in 0..nn {
                let fn_ = &tab.prim[(shell_n.start_func+ni)*npts..(shell_n.start_func+ni+1)*npts];
                for mi in 0..nm {
                    let fm = &tab.prim[(shell_m.start_func+mi)*npts..(shell_m.start_func+mi+1)*npts];
                    let mut val = 0.0;
                    for g in 0..npts {
                        val += tab.weights[g]*fm[g]*fn_[g]*fp[g];
                    }
                    buf[mi + ni*nm + pi*nm*nn] = val;
                }
            }
        }
        buf
    }

    fn int_2c2e(&mut self, bas_p: usize, bas_q: usize) -> Vec<f64> {
        self.num_eval.fetch_add(1, Ordering::SeqCst);
        let tab = &self.tables;
        let npts = tab.npts;
        let shell_p = &tab.auxiliary.shells[bas_p];
        let shell_q = &tab.auxiliary.shells[bas_q];
        let (np,nq) = (shell_p.num_func, shell_q.num_func);
        let mut buf = vec![0.0; np*nq];
        for qi in 0..nq {
            let fq = &tab.aux[(shell_q.start_func+qi)*npts..(shell_q.start_func+qi+1)*npts];
            for pi in 0..np {
                let fp = &tab.aux[(shell_p.start_func+pi)*npts..(shell_p.start_func+pi+1)*npts];
                let mut val = 0.0;
                for g in 0..npts {
                    val += tab.weights[g]*fp[g]*fq[g];
                }
                buf[pi + qi*np] = val;
            }
        }
        buf
    }
}

#[cfg(test)]
fn model_bases() -> (BasisInfo, BasisInfo) {
    // nso = 7, naux = 10
    let primary = BasisInfo::from_shell_list(&[(0,true),(1,true),(1,true)]).unwrap();
    let auxiliary = BasisInfo::from_shell_list(&[(0,true),(1,true),(2,false)]).unwrap();
    (primary, auxiliary)
}

#[test]
fn test_model_2c2e_symmetric() {
    let (primary, auxiliary) = model_bases();
    let driver = GridModelDriver::new(&primary, &auxiliary);
    let mut engine = driver.init_engine();
    let b01 = engine.int_2c2e(1, 2);
    let b10 = engine.int_2c2e(2, 1);
    // (p|q) block against the transpose of the (q|p) block
    for pi in 0..3 {
        for qi in 0..6 {
            assert!((b01[pi + qi*3] - b10[qi + pi*6]).abs() < 1.0e-14);
        }
    }
    // diagonal blocks carry positive diagonals
    let diag = engine.int_2c2e(2, 2);
    for pi in 0..6 {
        assert!(diag[pi + pi*6] > 0.0);
    }
}

#[test]
fn test_model_3c2e_symmetric_in_mn() {
    let (primary, auxiliary) = model_bases();
    let driver = GridModelDriver::new(&primary, &auxiliary);
    let mut engine = driver.init_engine();
    let bmn = engine.int_3c2e(1, 2, 0);
    let bnm = engine.int_3c2e(2, 1, 0);
    for mi in 0..3 {
        for ni in 0..3 {
            assert!((bmn[mi + ni*3] - bnm[ni + mi*3]).abs() < 1.0e-14);
        }
    }
}

#[test]
fn test_model_eval_counter() {
    let (primary, auxiliary) = model_bases();
    let driver = GridModelDriver::new(&primary, &auxiliary);
    assert_eq!(driver.num_eval(), 0);
    let mut engine = driver.init_engine();
    engine.int_2c2e(0, 0);
    engine.int_3c2e(0, 0, 0);
    let mut engine2 = driver.init_engine();
    engine2.int_2c2e(1, 1);
    assert_eq!(driver.num_eval(), 3);
}
