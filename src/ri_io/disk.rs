use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context};

/// On-disk backend: one headerless file per tensor holding raw doubles at
/// byte offset element_index * 8 in the tensor's native layout, truncated and
/// rewritten on each generation. Native-axis batches are single seek+IO
/// calls; the other axis degrades to element-at-a-time access.
///
/// All calls come from a single writer/reader thread; the file cursor is not
/// shared across threads.
pub struct DiskQTensor {
    naux: usize,
    ndim12: usize,
    byq: bool,
    path: PathBuf,
    file: Option<File>,
}

fn write_doubles(file: &mut File, vals: &[f64]) -> std::io::Result<()> {
    let mut bytes: Vec<u8> = Vec::with_capacity(8*vals.len());
    vals.iter().for_each(|v| bytes.extend_from_slice(&v.to_ne_bytes()));
    file.write_all(&bytes)
}

fn read_doubles(file: &mut File, vals: &mut [f64]) -> std::io::Result<()> {
    let mut bytes = vec![0_u8; 8*vals.len()];
    file.read_exact(&mut bytes)?;
    vals.iter_mut().zip(bytes.chunks_exact(8)).for_each(|(v,chunk)| {
        *v = f64::from_ne_bytes(chunk.try_into().unwrap());
    });
    Ok(())
}

impl DiskQTensor {
    pub fn new(naux: usize, ndim12: usize, byq: bool, directory: &str, name: &str) -> anyhow::Result<DiskQTensor> {
        if name.is_empty() {
            bail!("Error: no file name specified for the on-disk tensor");
        }
        let mut path = PathBuf::from(directory);
        std::fs::create_dir_all(&path)
            .with_context(|| format!("cannot create the storage directory {:?}", &path))?;
        path.push(format!("{}.qdat", name));

        let file = OpenOptions::new()
            .read(true).write(true).create(true).truncate(true)
            .open(&path)
            .with_context(|| format!("cannot open the tensor file {:?}", &path))?;
        file.set_len((naux*ndim12*8) as u64)
            .with_context(|| format!("cannot size the tensor file {:?}", &path))?;

        Ok(DiskQTensor { naux, ndim12, byq, path, file: Some(file) })
    }

    fn file_mut(&mut self) -> anyhow::Result<&mut File> {
        self.file.as_mut()
            .ok_or(anyhow!("Error: the tensor file {:?} has been cleared", &self.path))
    }

    fn seek_element(file: &mut File, index: usize) -> std::io::Result<()> {
        file.seek(SeekFrom::Start((index*8) as u64)).map(|_| ())
    }

    pub fn write(&mut self, data: &[f64], nij: usize, ijstart: usize) -> anyhow::Result<()> {
        let (naux, ndim12, byq) = (self.naux, self.ndim12, self.byq);
        let path = self.path.clone();
        let file = self.file_mut()?;
        if byq {
            // gather each q row of the incoming pair slices, one seek per q
            let mut row = vec![0.0; nij];
            for q in 0..naux {
                for ij0 in 0..nij {
                    row[ij0] = data[ij0*naux + q];
                }
                Self::seek_element(file, q*ndim12 + ijstart)?;
                write_doubles(file, &row)
                    .with_context(|| format!("write failed on {:?}", &path))?;
            }
        } else {
            Self::seek_element(file, ijstart*naux)?;
            write_doubles(file, &data[..nij*naux])
                .with_context(|| format!("write failed on {:?}", &path))?;
        }
        Ok(())
    }

    pub fn write_by_q(&mut self, data: &[f64], nq: usize, qstart: usize) -> anyhow::Result<()> {
        let (naux, ndim12, byq) = (self.naux, self.ndim12, self.byq);
        let path = self.path.clone();
        let file = self.file_mut()?;
        if byq {
            Self::seek_element(file, qstart*ndim12)?;
            write_doubles(file, &data[..nq*ndim12])
                .with_context(|| format!("write failed on {:?}", &path))?;
        } else {
            for q0 in 0..nq {
                for ij in 0..ndim12 {
                    Self::seek_element(file, ij*naux + qstart + q0)?;
                    write_doubles(file, &data[q0*ndim12 + ij..q0*ndim12 + ij + 1])
                        .with_context(|| format!("write failed on {:?}", &path))?;
                }
            }
        }
        Ok(())
    }

    pub fn read(&mut self, data: &mut [f64], nij: usize, ijstart: usize) -> anyhow::Result<()> {
        let (naux, ndim12, byq) = (self.naux, self.ndim12, self.byq);
        let path = self.path.clone();
        let file = self.file_mut()?;
        if byq {
            let mut row = vec![0.0; nij];
            for q in 0..naux {
                Self::seek_element(file, q*ndim12 + ijstart)?;
                read_doubles(file, &mut row)
                    .with_context(|| format!("read failed on {:?}", &path))?;
                for ij0 in 0..nij {
                    data[ij0*naux + q] = row[ij0];
                }
            }
        } else {
            Self::seek_element(file, ijstart*naux)?;
            read_doubles(file, &mut data[..nij*naux])
                .with_context(|| format!("read failed on {:?}", &path))?;
        }
        Ok(())
    }

    pub fn read_by_q(&mut self, data: &mut [f64], nq: usize, qstart: usize) -> anyhow::Result<()> {
        let (naux, ndim12, byq) = (self.naux, self.ndim12, self.byq);
        let path = self.path.clone();
        let file = self.file_mut()?;
        if byq {
            Self::seek_element(file, qstart*ndim12)?;
            read_doubles(file, &mut data[..nq*ndim12])
                .with_context(|| format!("read failed on {:?}", &path))?;
        } else {
            let mut val = [0.0_f64; 1];
            for q0 in 0..nq {
                for ij in 0..ndim12 {
                    Self::seek_element(file, ij*naux + qstart + q0)?;
                    read_doubles(file, &mut val)
                        .with_context(|| format!("read failed on {:?}", &path))?;
                    data[q0*ndim12 + ij] = val[0];
                }
            }
        }
        Ok(())
    }

    /// Close and remove the backing file. Safe to call more than once.
    pub fn clear(&mut self) -> anyhow::Result<()> {
        if self.file.take().is_some() {
            std::fs::remove_file(&self.path)
                .with_context(|| format!("cannot remove the tensor file {:?}", &self.path))?;
        }
        Ok(())
    }
}
