use crate::error::{EpistasisError, Result};
use log::{debug, info};
use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};

/// Bytes taken by the fixed header in front of the genotype matrix
pub const HEADER_LEN: usize = std::mem::size_of::<PackedHeader>();

/// Fixed header of a packed genotype file, in native byte order.
#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct PackedHeader {
    num_variants: u64,
    num_affected: u32,
    num_unaffected: u32,
}

enum Backing {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl Backing {
    fn bytes(&self) -> &[u8] {
        match self {
            Backing::Mapped(mmap) => &mmap[..],
            Backing::Owned(bytes) => bytes,
        }
    }
}

/// Read-only genotype matrix: one row per variant, one byte (0, 1 or 2) per sample.
/// Samples are ordered affected first, then unaffected.
pub struct GenotypeDataset {
    path: PathBuf,
    backing: Option<Backing>,
    num_variants: usize,
    num_affected: usize,
    num_unaffected: usize,
}

/// Serializable description of a loaded dataset, kept in the experiment record
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DatasetSummary {
    pub path: String,
    pub num_variants: usize,
    pub num_affected: usize,
    pub num_unaffected: usize,
    pub fingerprint: String,
}

impl GenotypeDataset {
    /// Maps a packed genotype file.
    ///
    /// Fails with `FileNotFound` if it cannot be opened, `Format` if the header is truncated or
    /// the byte length disagrees with it, and `InvalidGenotype` on any call outside {0,1,2}.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<GenotypeDataset> {
        let path = path.as_ref();
        info!("Loading dataset {}...", path.display());

        let file = File::open(path).map_err(|_| EpistasisError::FileNotFound {
            path: path.to_path_buf(),
        })?;
        let file_len = file.metadata()?.len();
        if file_len < HEADER_LEN as u64 {
            return Err(EpistasisError::format(
                path,
                format!(
                    "file holds {} bytes but the header alone needs {}",
                    file_len, HEADER_LEN
                ),
            ));
        }

        // The mapping is only read, and the size was checked against the header length above.
        let mmap = unsafe { Mmap::map(&file)? };
        Self::from_backing(path.to_path_buf(), Backing::Mapped(mmap))
    }

    /// Builds a dataset from packed bytes already in memory (header included).
    pub fn from_packed(label: &str, bytes: Vec<u8>) -> Result<GenotypeDataset> {
        if bytes.len() < HEADER_LEN {
            return Err(EpistasisError::format(
                label,
                format!(
                    "buffer holds {} bytes but the header alone needs {}",
                    bytes.len(),
                    HEADER_LEN
                ),
            ));
        }
        Self::from_backing(PathBuf::from(label), Backing::Owned(bytes))
    }

    fn from_backing(path: PathBuf, backing: Backing) -> Result<GenotypeDataset> {
        let bytes = backing.bytes();
        let header: PackedHeader = bytemuck::pod_read_unaligned(&bytes[..HEADER_LEN]);

        let num_variants = usize::try_from(header.num_variants).map_err(|_| {
            EpistasisError::format(
                &path,
                format!("variant count {} does not fit in memory", header.num_variants),
            )
        })?;
        let num_affected = header.num_affected as usize;
        let num_unaffected = header.num_unaffected as usize;
        let num_samples = num_affected + num_unaffected;

        let expected = num_variants
            .checked_mul(num_samples)
            .and_then(|cells| cells.checked_add(HEADER_LEN))
            .ok_or_else(|| {
                EpistasisError::format(
                    &path,
                    format!(
                        "header declares {} variants x {} samples, which overflows",
                        num_variants, num_samples
                    ),
                )
            })?;
        if bytes.len() != expected {
            return Err(EpistasisError::format(
                &path,
                format!(
                    "expected {} bytes ({} header + {} variants x {} samples), found {}",
                    expected,
                    HEADER_LEN,
                    num_variants,
                    num_samples,
                    bytes.len()
                ),
            ));
        }

        let matrix = &bytes[HEADER_LEN..];
        if let Some(offset) = matrix.iter().position(|&g| g > 2) {
            return Err(EpistasisError::InvalidGenotype {
                path,
                variant: offset / num_samples,
                sample: offset % num_samples,
                value: matrix[offset],
            });
        }

        debug!(
            "{}: {} variants, {} affected, {} unaffected",
            path.display(),
            num_variants,
            num_affected,
            num_unaffected
        );

        Ok(GenotypeDataset {
            path,
            backing: Some(backing),
            num_variants,
            num_affected,
            num_unaffected,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn num_variants(&self) -> usize {
        self.num_variants
    }

    pub fn num_affected(&self) -> usize {
        self.num_affected
    }

    pub fn num_unaffected(&self) -> usize {
        self.num_unaffected
    }

    pub fn num_samples(&self) -> usize {
        self.num_affected + self.num_unaffected
    }

    pub fn is_affected(&self, sample: usize) -> bool {
        sample < self.num_affected
    }

    pub fn is_closed(&self) -> bool {
        self.backing.is_none()
    }

    fn matrix(&self) -> &[u8] {
        match &self.backing {
            Some(backing) => &backing.bytes()[HEADER_LEN..],
            None => &[],
        }
    }

    /// Genotype calls of one variant, all samples. Empty once the dataset is closed.
    pub fn row(&self, variant: usize) -> &[u8] {
        let n = self.num_samples();
        let start = variant * n;
        self.matrix().get(start..start + n).unwrap_or(&[])
    }

    /// Releases the mapping. Calling it again is a no-op.
    pub fn close(&mut self) {
        if self.backing.take().is_some() {
            debug!("Released dataset {}", self.path.display());
        }
    }

    /// SHA-256 of the packed bytes, header included
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        if let Some(backing) = &self.backing {
            hasher.update(backing.bytes());
        }
        format!("{:x}", hasher.finalize())
    }

    pub fn summary(&self) -> DatasetSummary {
        DatasetSummary {
            path: self.path.display().to_string(),
            num_variants: self.num_variants,
            num_affected: self.num_affected,
            num_unaffected: self.num_unaffected,
            fingerprint: self.fingerprint(),
        }
    }
}

/// Encodes rows (one per variant, affected samples first) into the packed file layout.
pub fn pack(num_affected: u32, num_unaffected: u32, rows: &[Vec<u8>]) -> Vec<u8> {
    let header = PackedHeader {
        num_variants: rows.len() as u64,
        num_affected,
        num_unaffected,
    };
    let mut bytes = Vec::with_capacity(
        HEADER_LEN + rows.len() * (num_affected + num_unaffected) as usize,
    );
    bytes.extend_from_slice(bytemuck::bytes_of(&header));
    for row in rows {
        bytes.extend_from_slice(row);
    }
    bytes
}

impl fmt::Display for GenotypeDataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Variants: {}   Samples: {} ({} affected, {} unaffected)",
            self.num_variants,
            self.num_samples(),
            self.num_affected,
            self.num_unaffected
        )?;
        // Limit to the first 20 rows
        for variant in (0..self.num_variants).take(20) {
            let row: String = self.row(variant).iter().map(|g| (b'0' + g) as char).collect();
            let truncated_row = if row.len() > 80 {
                format!("{}...", &row[..77])
            } else {
                row
            };
            writeln!(f, "{:>8}  {}", variant, truncated_row)?;
        }
        Ok(())
    }
}

impl fmt::Debug for GenotypeDataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenotypeDataset")
            .field("path", &self.path)
            .field("num_variants", &self.num_variants)
            .field("num_affected", &self.num_affected)
            .field("num_unaffected", &self.num_unaffected)
            .field("closed", &self.is_closed())
            .finish()
    }
}
