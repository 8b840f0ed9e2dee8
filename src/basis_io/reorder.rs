use anyhow::{anyhow, bail};
use tensors::MatrixFull;

use crate::basis_io::BasisInfo;
use crate::constants::MAX_REORDER_AM;

/// Basis-function ordering conventions a caller may supply coefficient data in.
/// `Native` is the convention of the integral engine itself and needs no reordering.
#[derive(Debug,Clone,Copy,PartialEq,Eq)]
pub enum BasOrder {
    Native,
    Gamess,
}

/// Per-angular-momentum reordering tables. A table maps internal function
/// position k within a shell to the caller-convention position order[k].
/// An empty table means the ordering agrees with the native one for that
/// angular momentum.
pub struct Orderings {
    orders: Vec<Vec<usize>>,
}

impl Orderings {
    pub fn new() -> Orderings {
        Orderings { orders: vec![vec![]; MAX_REORDER_AM+1] }
    }

    pub fn set_order(&mut self, ang_mom: usize, order: Vec<usize>) -> anyhow::Result<()> {
        if ang_mom > MAX_REORDER_AM {
            bail!("Error: cannot set a reordering table for angular momentum {}", ang_mom);
        }
        // the table must be a permutation of 0..len
        let mut seen = vec![false; order.len()];
        for &p in order.iter() {
            if p >= order.len() || seen[p] {
                bail!("Error: reordering table for angular momentum {} is not a permutation", ang_mom);
            }
            seen[p] = true;
        }
        self.orders[ang_mom] = order;
        Ok(())
    }

    pub fn needs_reordering(&self, ang_mom: usize) -> bool {
        ang_mom <= MAX_REORDER_AM && !self.orders[ang_mom].is_empty()
    }

    /// internal position -> caller position
    pub fn get_order(&self, ang_mom: usize) -> anyhow::Result<&Vec<usize>> {
        if ang_mom > MAX_REORDER_AM {
            bail!("Error: no reordering table for angular momentum {}", ang_mom);
        }
        Ok(&self.orders[ang_mom])
    }

    /// caller position -> internal position
    pub fn get_inv_order(&self, ang_mom: usize) -> anyhow::Result<Vec<usize>> {
        let order = self.get_order(ang_mom)?;
        let mut inv = vec![0_usize; order.len()];
        order.iter().enumerate().for_each(|(k,&p)| {inv[p] = k});
        Ok(inv)
    }
}

/// The GAMESS cartesian ordering relative to the native one, for d, f and g
/// shells. No tables are defined above g; such shells pass through unchanged.
pub fn gamess_ordering() -> Orderings {
    let mut ord = Orderings::new();
    ord.set_order(2, vec![0, 3, 5, 1, 2, 4]).unwrap();
    ord.set_order(3, vec![0, 6, 9, 1, 2, 3, 7, 5, 8, 4]).unwrap();
    ord.set_order(4, vec![0, 10, 14, 1, 2, 6, 11, 9, 13, 3, 5, 12, 4, 7, 8]).unwrap();
    ord
}

pub fn get_ordering(order: BasOrder) -> anyhow::Result<Orderings> {
    match order {
        BasOrder::Native => Ok(Orderings::new()),
        BasOrder::Gamess => Ok(gamess_ordering()),
    }
}

/// One shell whose functions must be permuted: the global index of its first
/// function together with the permutation to apply.
pub struct ShellPerm {
    pub start: usize,
    pub order: Vec<usize>,
}

/// Collect the per-shell permutations needed to map between the caller
/// convention and the internal one. With `inverse` set the returned
/// permutations convert caller-ordered data into internal order, which is the
/// direction used when a coefficient matrix is ingested.
pub fn shell_perms(basis: &BasisInfo, ord: &Orderings, inverse: bool) -> anyhow::Result<Vec<ShellPerm>> {
    let mut perms: Vec<ShellPerm> = vec![];
    for shell in basis.shells.iter() {
        if !ord.needs_reordering(shell.ang_mom) {
            if shell.ang_mom > MAX_REORDER_AM {
                bail!("Error: no reordering is defined for angular momentum {}", shell.ang_mom);
            }
            continue;
        }
        let order = if inverse {
            ord.get_inv_order(shell.ang_mom)?
        } else {
            ord.get_order(shell.ang_mom)?.clone()
        };
        if order.len() != shell.num_func {
            bail!("Error: the reordering table for angular momentum {} covers {} functions but the shell carries {}",
                  shell.ang_mom, order.len(), shell.num_func);
        }
        perms.push(ShellPerm{start: shell.start_func, order});
    }
    Ok(perms)
}

/// Swap two basis-function rows of a column-major matrix in place. Rows are
/// strided, so the swap walks the columns and needs no scratch buffer.
pub fn swap_rows(mat: &mut MatrixFull<f64>, row_a: usize, row_b: usize) {
    let num_rows = mat.size[0];
    let num_cols = mat.size[1];
    for col in 0..num_cols {
        mat.data.swap(col*num_rows + row_a, col*num_rows + row_b);
    }
}

/// Apply one shell permutation to the rows of `mat` as a sequence of pairwise
/// swaps, with the bookkeeping needed to catch a malformed table: an index
/// that never appears, or a swap that would overwrite a row already placed.
fn apply_perm_rows(mat: &mut MatrixFull<f64>, start: usize, order: &[usize]) -> anyhow::Result<()> {
    let num_func = order.len();
    let mut current: Vec<usize> = (0..num_func).collect();

    for i in 0..num_func {
        let cindex = current.iter().position(|&x| x == order[i])
            .ok_or(anyhow!("Error: reordering index {} not found", order[i]))?;
        if cindex < i {
            bail!("Error: reordering would overwrite an already-placed row");
        }
        if cindex != i {
            swap_rows(mat, start+i, start+cindex);
            current.swap(i, cindex);
        }
    }

    for i in 0..num_func {
        if current[i] != order[i] {
            bail!("Error: row reordering failed verification");
        }
    }
    Ok(())
}

/// Permute the basis-function rows of a matrix for every shell that needs it.
pub fn reorder_mat_rows(mat: &mut MatrixFull<f64>, perms: &[ShellPerm]) -> anyhow::Result<()> {
    for perm in perms.iter() {
        if perm.start + perm.order.len() > mat.size[0] {
            bail!("Error: shell permutation at function {} runs past the {} rows of the matrix",
                  perm.start, mat.size[0]);
        }
        apply_perm_rows(mat, perm.start, &perm.order)?;
    }
    Ok(())
}

/// The permutation expressed as a matrix: an identity with its shell blocks
/// rearranged, such that tmat^T * Q * tmat carries both dimensions of a Q
/// slice from internal order into the caller order.
pub fn perm_as_matrix(basis: &BasisInfo, perms: &[ShellPerm]) -> MatrixFull<f64> {
    let num_func = basis.num_func();
    let mut tmat = MatrixFull::new([num_func,num_func],0.0);
    for i in 0..num_func {
        tmat[(i,i)] = 1.0;
    }
    for perm in perms.iter() {
        for k in 0..perm.order.len() {
            tmat[(perm.start+k, perm.start+k)] = 0.0;
        }
        for (k,&p) in perm.order.iter().enumerate() {
            tmat[(perm.start+p, perm.start+k)] = 1.0;
        }
    }
    tmat
}

#[test]
fn test_gamess_d_row_reorder() {
    // a single cartesian d shell; two columns of markers
    let bas = BasisInfo::from_shell_list(&[(2,false)]).unwrap();
    let ord = gamess_ordering();
    let mut mat = MatrixFull::from_vec([6,2],
        vec![0.0,1.0,2.0,3.0,4.0,5.0, 10.0,11.0,12.0,13.0,14.0,15.0]).unwrap();

    let perms = shell_perms(&bas, &ord, false).unwrap();
    reorder_mat_rows(&mut mat, &perms).unwrap();

    // new[i] = old[order[i]] with order = [0,3,5,1,2,4]
    assert_eq!(mat.data[0..6], [0.0,3.0,5.0,1.0,2.0,4.0]);
    assert_eq!(mat.data[6..12], [10.0,13.0,15.0,11.0,12.0,14.0]);
}

#[test]
fn test_inverse_then_forward_is_identity() {
    let bas = BasisInfo::from_shell_list(&[(0,true),(2,false)]).unwrap();
    let ord = gamess_ordering();
    let orig: Vec<f64> = (0..7).map(|x| x as f64).collect();
    let mut mat = MatrixFull::from_vec([7,1], orig.clone()).unwrap();

    let inv_perms = shell_perms(&bas, &ord, true).unwrap();
    reorder_mat_rows(&mut mat, &inv_perms).unwrap();
    let fwd_perms = shell_perms(&bas, &ord, false).unwrap();
    reorder_mat_rows(&mut mat, &fwd_perms).unwrap();

    assert_eq!(mat.data, orig);
}

#[test]
fn test_perm_matrix_matches_row_reorder() {
    let bas = BasisInfo::from_shell_list(&[(2,false)]).unwrap();
    let ord = gamess_ordering();
    let perms = shell_perms(&bas, &ord, false).unwrap();
    let tmat = perm_as_matrix(&bas, &perms);

    // column k of tmat must be the unit vector at order[k]
    let order = ord.get_order(2).unwrap();
    for k in 0..6 {
        for r in 0..6 {
            let expect = if r == order[k] {1.0} else {0.0};
            assert_eq!(tmat[(r,k)], expect);
        }
    }
}

#[test]
fn test_malformed_table_rejected() {
    let mut ord = Orderings::new();
    assert!(ord.set_order(2, vec![0,0,1,2,3,4]).is_err());
    assert!(ord.set_order(2, vec![0,1,2,3,4,6]).is_err());
    assert!(ord.set_order(2, vec![0,3,5,1,2,4]).is_ok());
}

#[test]
fn test_unsupported_ang_mom_rejected() {
    // an h shell has no GAMESS table; it is left untouched
    let bas = BasisInfo::from_shell_list(&[(5,false)]).unwrap();
    let ord = gamess_ordering();
    let perms = shell_perms(&bas, &ord, false).unwrap();
    assert!(perms.is_empty());
}
