//! Server checkpoint
//!
//! Binary snapshot of the DP store: a parameter header, then every
//! non-empty bucket. Rewritten atomically (write to temp, rename) at the
//! configured interval so a crash never leaves a torn file. A header that
//! does not match the running search parameters is a fatal mismatch: the
//! stored distances would be meaningless.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use log::info;

use crate::net::protocol::{MAGIC, VERSION};
use crate::store::{DpRecord, DpStore};
use crate::types::{Dist, XCoord, DIST_BYTES, X_BYTES};

/// Search parameters a checkpoint is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub interval_bits: u8,
    pub dp_bits: u8,
    pub target_x: [u8; 32],
    pub target_y: [u8; 32],
    pub wild_offset: [u8; 32],
}

impl Header {
    fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&MAGIC.to_be_bytes())?;
        w.write_all(&VERSION.to_be_bytes())?;
        w.write_all(&[self.interval_bits, self.dp_bits])?;
        w.write_all(&self.target_x)?;
        w.write_all(&self.target_y)?;
        w.write_all(&self.wild_offset)?;
        Ok(())
    }

    fn read_from<R: Read>(r: &mut R) -> Result<Header> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if u32::from_be_bytes(magic) != MAGIC {
            return Err(anyhow!("checkpoint has wrong magic"));
        }
        let mut version = [0u8; 2];
        r.read_exact(&mut version)?;
        let version = u16::from_be_bytes(version);
        if version != VERSION {
            return Err(anyhow!("checkpoint version {version} unsupported"));
        }
        let mut params = [0u8; 2];
        r.read_exact(&mut params)?;
        let mut header = Header {
            interval_bits: params[0],
            dp_bits: params[1],
            target_x: [0; 32],
            target_y: [0; 32],
            wild_offset: [0; 32],
        };
        r.read_exact(&mut header.target_x)?;
        r.read_exact(&mut header.target_y)?;
        r.read_exact(&mut header.wild_offset)?;
        Ok(header)
    }
}

/// Write the store snapshot to `path` via a temp file and atomic rename.
pub fn save(path: &Path, header: &Header, store: &DpStore) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let buckets = store.snapshot();
    {
        let file = File::create(&tmp)
            .with_context(|| format!("creating checkpoint temp {}", tmp.display()))?;
        let mut w = BufWriter::new(file);
        header.write_to(&mut w)?;
        w.write_all(&(buckets.len() as u32).to_be_bytes())?;
        let mut entries_written = 0u64;
        for (bucket_idx, entries) in &buckets {
            w.write_all(&bucket_idx.to_be_bytes())?;
            w.write_all(&(entries.len() as u32).to_be_bytes())?;
            for e in entries {
                w.write_all(&e.x.to_be_bytes())?;
                w.write_all(&e.dist.to_be_bytes())?;
                w.write_all(&e.kidx.to_be_bytes())?;
                entries_written += 1;
            }
        }
        w.flush()?;
        info!(
            "checkpoint: {} entries in {} buckets -> {}",
            entries_written,
            buckets.len(),
            path.display()
        );
    }
    fs::rename(&tmp, path)
        .with_context(|| format!("renaming checkpoint into {}", path.display()))?;
    Ok(())
}

/// Load a checkpoint, enforcing that its header matches `expected`.
/// Entries come back with origin 0; the caller re-adds them to the store.
pub fn load(path: &Path, expected: &Header) -> Result<Vec<DpRecord>> {
    let file =
        File::open(path).with_context(|| format!("opening checkpoint {}", path.display()))?;
    let mut r = BufReader::new(file);
    let header = Header::read_from(&mut r)?;
    if header != *expected {
        return Err(anyhow!(
            "checkpoint {} was written for different search parameters",
            path.display()
        ));
    }
    let mut count = [0u8; 4];
    r.read_exact(&mut count)?;
    let bucket_count = u32::from_be_bytes(count);
    let mut out = Vec::new();
    for _ in 0..bucket_count {
        let mut head = [0u8; 8];
        r.read_exact(&mut head)?;
        let entry_count = u32::from_be_bytes([head[4], head[5], head[6], head[7]]);
        for _ in 0..entry_count {
            let mut x = [0u8; X_BYTES];
            r.read_exact(&mut x)?;
            let mut dist = [0u8; DIST_BYTES];
            r.read_exact(&mut dist)?;
            let mut kidx = [0u8; 8];
            r.read_exact(&mut kidx)?;
            out.push(DpRecord {
                x: XCoord::from_be_bytes(&x),
                dist: Dist::from_be_bytes(&dist),
                kidx: u64::from_be_bytes(kidx),
                origin: 0,
            });
        }
    }
    info!("resumed {} DP entries from {}", out.len(), path.display());
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Dp;

    fn header() -> Header {
        Header {
            interval_bits: 24,
            dp_bits: 4,
            target_x: [1; 32],
            target_y: [2; 32],
            wild_offset: [3; 32],
        }
    }

    fn filled_store() -> DpStore {
        let store = DpStore::new(18, 0);
        for i in 0..40u64 {
            let dp = Dp {
                x: XCoord([i << 40, i, i * 3, i << 4]),
                dist: Dist::from_u64(i * 1000 + 1),
                kidx: i,
            };
            store.add(&dp, (i % 4) as u32);
        }
        store
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("work.ckpt");
        let store = filled_store();
        save(&path, &header(), &store).unwrap();

        let records = load(&path, &header()).unwrap();
        assert_eq!(records.len(), 40);

        // re-adding into a fresh store reproduces the population
        let fresh = DpStore::new(18, 0);
        for rec in &records {
            let dp = Dp {
                x: rec.x,
                dist: rec.dist,
                kidx: rec.kidx,
            };
            fresh.add(&dp, rec.origin);
        }
        assert_eq!(fresh.len(), store.len());
        // and resending the checkpoint is idempotent
        for rec in &records {
            fresh.add(
                &Dp {
                    x: rec.x,
                    dist: rec.dist,
                    kidx: rec.kidx,
                },
                0,
            );
        }
        assert_eq!(fresh.len(), store.len());
        assert_eq!(fresh.resend_count(), 40);
    }

    #[test]
    fn mismatched_header_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("work.ckpt");
        save(&path, &header(), &filled_store()).unwrap();
        let mut other = header();
        other.dp_bits = 9;
        assert!(load(&path, &other).is_err());
    }

    #[test]
    fn rewrite_replaces_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("work.ckpt");
        save(&path, &header(), &filled_store()).unwrap();
        let empty = DpStore::new(18, 0);
        save(&path, &header(), &empty).unwrap();
        assert!(load(&path, &header()).unwrap().is_empty());
        assert!(!path.with_extension("tmp").exists());
    }
}
