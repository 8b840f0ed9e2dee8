use anyhow::bail;

pub mod reorder;

/// #BasShell
/// A read-only descriptor of one basis shell, the natural unit of integral evaluation.
///  - BasShell.ang_mom:     the angular momentum of the shell
///  - BasShell.num_func:    the number of basis functions carried by the shell
///  - BasShell.start_func:  the global index of the first basis function of the shell
///  - BasShell.is_pure:     pure (spheric) or cartesian functions
#[derive(Debug,Clone,PartialEq,Eq)]
pub struct BasShell {
    pub ang_mom: usize,
    pub num_func: usize,
    pub start_func: usize,
    pub is_pure: bool,
}

impl BasShell {
    /// Number of functions for the given angular momentum in the given representation.
    pub fn func_count(ang_mom: usize, is_pure: bool) -> usize {
        if is_pure {
            2*ang_mom + 1
        } else {
            (ang_mom+1)*(ang_mom+2)/2
        }
    }
}

/// Shell-by-shell description of a basis set, consumed read-only by the
/// integral assembler and the transform machinery. The actual exponents and
/// contraction coefficients stay with the integral engine.
#[derive(Debug,Clone)]
pub struct BasisInfo {
    pub shells: Vec<BasShell>,
    pub num_func: usize,
}

impl BasisInfo {
    pub fn new(shells: Vec<BasShell>) -> anyhow::Result<BasisInfo> {
        let mut num_func = 0_usize;
        for (i,shell) in shells.iter().enumerate() {
            if shell.start_func != num_func {
                bail!("Error: shell {} starts at function {} but {} functions precede it", i, shell.start_func, num_func);
            }
            if shell.num_func == 0 {
                bail!("Error: shell {} carries no basis function", i);
            }
            num_func += shell.num_func;
        }
        Ok(BasisInfo{shells, num_func})
    }

    /// Assemble a basis from (ang_mom, is_pure) pairs, assigning the function offsets.
    pub fn from_shell_list(shell_list: &[(usize,bool)]) -> anyhow::Result<BasisInfo> {
        let mut shells: Vec<BasShell> = vec![];
        let mut start_func = 0_usize;
        for &(ang_mom, is_pure) in shell_list {
            let num_func = BasShell::func_count(ang_mom, is_pure);
            shells.push(BasShell{ang_mom, num_func, start_func, is_pure});
            start_func += num_func;
        }
        BasisInfo::new(shells)
    }

    pub fn num_shell(&self) -> usize {
        self.shells.len()
    }

    pub fn num_func(&self) -> usize {
        self.num_func
    }

    /// Number of unique (i,j) basis-function pairs with i>=j.
    pub fn num_pair(&self) -> usize {
        self.num_func*(self.num_func+1)/2
    }

    pub fn max_func_per_shell(&self) -> usize {
        self.shells.iter().fold(0, |acc, shell| acc.max(shell.num_func))
    }

    /// The lower-triangle shell-pair list [m,n] with n<=m, gathered for parallel
    /// dispatch over shell pairs.
    pub fn shell_pairs(&self) -> Vec<[usize;2]> {
        let mut par_shellpair: Vec<[usize;2]> = vec![];
        for m in 0..self.num_shell() {
            for n in 0..m+1 {
                par_shellpair.push([m,n]);
            }
        }
        par_shellpair
    }
}

#[test]
fn test_basis_layout() {
    let bas = BasisInfo::from_shell_list(&[(0,true),(1,true),(2,true)]).unwrap();
    assert_eq!(bas.num_shell(), 3);
    assert_eq!(bas.num_func(), 1+3+5);
    assert_eq!(bas.shells[2].start_func, 4);
    assert_eq!(bas.max_func_per_shell(), 5);
    assert_eq!(bas.num_pair(), 9*10/2);

    let cart = BasisInfo::from_shell_list(&[(2,false)]).unwrap();
    assert_eq!(cart.num_func(), 6);
}

#[test]
fn test_shell_pairs_cover_lower_triangle() {
    let bas = BasisInfo::from_shell_list(&[(0,true),(0,true),(1,true)]).unwrap();
    let pairs = bas.shell_pairs();
    assert_eq!(pairs.len(), 3*4/2);
    assert!(pairs.iter().all(|p| p[1] <= p[0]));
    assert_eq!(pairs[0], [0,0]);
    assert_eq!(*pairs.last().unwrap(), [2,2]);
}

#[test]
fn test_inconsistent_shell_offsets() {
    let shells = vec![
        BasShell{ang_mom: 0, num_func: 1, start_func: 0, is_pure: true},
        BasShell{ang_mom: 1, num_func: 3, start_func: 2, is_pure: true},
    ];
    assert!(BasisInfo::new(shells).is_err());
}
