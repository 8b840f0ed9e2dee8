/// In-memory backend: one contiguous owned buffer of naux*ndim12 doubles in
/// the tensor's native layout. Non-native-axis calls degrade to an
/// element-at-a-time scatter or gather.
pub struct MemQTensor {
    naux: usize,
    ndim12: usize,
    byq: bool,
    data: Vec<f64>,
}

impl MemQTensor {
    pub fn new(naux: usize, ndim12: usize, byq: bool) -> MemQTensor {
        MemQTensor {
            naux, ndim12, byq,
            data: vec![0.0; naux*ndim12],
        }
    }

    /// `data` holds `nij` pair slices of `naux` values each.
    pub fn write(&mut self, data: &[f64], nij: usize, ijstart: usize) {
        if self.byq {
            for ij0 in 0..nij {
                for q in 0..self.naux {
                    self.data[q*self.ndim12 + ijstart + ij0] = data[ij0*self.naux + q];
                }
            }
        } else {
            self.data[ijstart*self.naux..(ijstart+nij)*self.naux]
                .copy_from_slice(&data[..nij*self.naux]);
        }
    }

    /// `data` holds `nq` q slices of `ndim12` values each.
    pub fn write_by_q(&mut self, data: &[f64], nq: usize, qstart: usize) {
        if self.byq {
            self.data[qstart*self.ndim12..(qstart+nq)*self.ndim12]
                .copy_from_slice(&data[..nq*self.ndim12]);
        } else {
            for q0 in 0..nq {
                for ij in 0..self.ndim12 {
                    self.data[ij*self.naux + qstart + q0] = data[q0*self.ndim12 + ij];
                }
            }
        }
    }

    pub fn read(&self, data: &mut [f64], nij: usize, ijstart: usize) {
        if self.byq {
            for ij0 in 0..nij {
                for q in 0..self.naux {
                    data[ij0*self.naux + q] = self.data[q*self.ndim12 + ijstart + ij0];
                }
            }
        } else {
            data[..nij*self.naux]
                .copy_from_slice(&self.data[ijstart*self.naux..(ijstart+nij)*self.naux]);
        }
    }

    pub fn read_by_q(&self, data: &mut [f64], nq: usize, qstart: usize) {
        if self.byq {
            data[..nq*self.ndim12]
                .copy_from_slice(&self.data[qstart*self.ndim12..(qstart+nq)*self.ndim12]);
        } else {
            for q0 in 0..nq {
                for ij in 0..self.ndim12 {
                    data[q0*self.ndim12 + ij] = self.data[ij*self.naux + qstart + q0];
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.data = Vec::new();
    }
}
