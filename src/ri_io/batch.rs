/// Stateless-arithmetic cursors over the two iteration axes of a stored
/// tensor. Callers stream a tensor through bounded memory by asking for a
/// batch at the cursor position, then advancing by the number of slices the
/// read delivered. Both cursors support arbitrary forward and backward
/// steps and recover their composite position from the linear index alone.

/// Cursor over the auxiliary axis.
#[derive(Debug,Clone,Copy)]
pub struct QIterator {
    naux: usize,
    curq: usize,
}

impl QIterator {
    pub fn new(naux: usize) -> QIterator {
        QIterator { naux, curq: 0 }
    }

    pub fn index(&self) -> usize {
        self.curq
    }

    /// False once the cursor has run off either end.
    pub fn valid(&self) -> bool {
        self.curq < self.naux
    }

    /// Step by `delta` slices; saturates at `naux` (exhausted) and rejects
    /// stepping before the first slice by saturating at the exhausted state
    /// as well, so a runaway backward loop terminates.
    pub fn advance(&mut self, delta: isize) {
        let pos = self.curq as isize + delta;
        if pos < 0 || pos > self.naux as isize {
            self.curq = self.naux;
        } else {
            self.curq = pos as usize;
        }
    }
}

impl Iterator for QIterator {
    type Item = usize;
    fn next(&mut self) -> Option<usize> {
        if !self.valid() {
            return None;
        }
        let q = self.curq;
        self.curq += 1;
        Some(q)
    }
}

/// Cursor over the combined orbital-pair axis, tracking the (i,j) position
/// alongside the linear pair index. For a packed tensor the walk covers the
/// lower triangle (i >= j) in index order; otherwise all ndim1*ndim2 pairs
/// in the storage linearization (i fastest).
#[derive(Debug,Clone,Copy)]
pub struct IJIterator {
    ndim1: usize,
    ndim2: usize,
    ndim12: usize,
    packed: bool,
    ij: usize,
    i: usize,
    j: usize,
}

impl IJIterator {
    pub fn new(ndim1: usize, ndim2: usize, packed: bool) -> IJIterator {
        let ndim12 = if packed {ndim1*(ndim1+1)/2} else {ndim1*ndim2};
        IJIterator { ndim1, ndim2, ndim12, packed, ij: 0, i: 0, j: 0 }
    }

    pub fn index(&self) -> usize {
        self.ij
    }

    pub fn i(&self) -> usize {
        self.i
    }

    pub fn j(&self) -> usize {
        self.j
    }

    pub fn valid(&self) -> bool {
        self.ij < self.ndim12
    }

    fn decompose(&mut self) {
        if self.ij >= self.ndim12 {
            return;
        }
        if self.packed {
            // the row holding pair index ij: largest i with i*(i+1)/2 <= ij
            let mut i = ((((8*self.ij + 1) as f64).sqrt() - 1.0)/2.0) as usize;
            while (i+1)*(i+2)/2 <= self.ij {
                i += 1;
            }
            while i*(i+1)/2 > self.ij {
                i -= 1;
            }
            self.i = i;
            self.j = self.ij - i*(i+1)/2;
        } else {
            self.i = self.ij % self.ndim1;
            self.j = self.ij / self.ndim1;
        }
    }

    /// Step by `delta` pairs, recomputing the (i,j) position. Runs off the
    /// end (in either direction) into the exhausted state.
    pub fn advance(&mut self, delta: isize) {
        let pos = self.ij as isize + delta;
        if pos < 0 || pos > self.ndim12 as isize {
            self.ij = self.ndim12;
        } else {
            self.ij = pos as usize;
        }
        self.decompose();
    }
}

impl Iterator for IJIterator {
    type Item = (usize, usize, usize);
    fn next(&mut self) -> Option<(usize, usize, usize)> {
        if !self.valid() {
            return None;
        }
        let out = (self.ij, self.i, self.j);
        self.advance(1);
        Some(out)
    }
}

#[test]
fn test_q_iterator_covers_axis() {
    let collected: Vec<usize> = QIterator::new(5).collect();
    assert_eq!(collected, vec![0,1,2,3,4]);

    let mut it = QIterator::new(5);
    it.advance(3);
    assert_eq!(it.index(), 3);
    it.advance(-2);
    assert_eq!(it.index(), 1);
    it.advance(10);
    assert!(!it.valid());
}

#[test]
fn test_ij_iterator_packed_bijection() {
    let ndim1 = 6;
    let mut seen = vec![false; ndim1*(ndim1+1)/2];
    for (ij, i, j) in IJIterator::new(ndim1, ndim1, true) {
        assert!(j <= i);
        assert_eq!(ij, i*(i+1)/2 + j);
        assert!(!seen[ij]);
        seen[ij] = true;
    }
    assert!(seen.iter().all(|&x| x));
}

#[test]
fn test_ij_iterator_unpacked_positions() {
    let (ndim1, ndim2) = (3, 4);
    let all: Vec<(usize,usize,usize)> = IJIterator::new(ndim1, ndim2, false).collect();
    assert_eq!(all.len(), 12);
    // i runs fastest in the storage linearization
    assert_eq!(all[0], (0,0,0));
    assert_eq!(all[1], (1,1,0));
    assert_eq!(all[3], (3,0,1));
    assert_eq!(all[11], (11,2,3));
}

#[test]
fn test_ij_iterator_arbitrary_steps() {
    let mut it = IJIterator::new(5, 5, true);
    it.advance(7);
    assert_eq!(it.index(), 7);
    assert_eq!((it.i(), it.j()), (3, 1));
    it.advance(-4);
    assert_eq!(it.index(), 3);
    assert_eq!((it.i(), it.j()), (2, 0));
    it.advance(-10);
    assert!(!it.valid());
}
