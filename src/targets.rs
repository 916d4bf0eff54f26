//! Target file loader
//!
//! The positional target file carries the interval width and the public
//! point: first non-comment line is N (decimal interval bits), second is the
//! SEC1 public key in hex (compressed 02/03 or uncompressed 04).

use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use k256::ProjectivePoint;
use log::info;

use crate::curve::parse_pubkey;

pub struct Target {
    pub interval_bits: u32,
    pub point: ProjectivePoint,
}

pub fn load_target(path: &Path) -> Result<Target> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading target file {}", path.display()))?;
    let target = parse_target(&text)?;
    info!(
        "target loaded from {}: interval [0, 2^{})",
        path.display(),
        target.interval_bits
    );
    Ok(target)
}

pub fn parse_target(text: &str) -> Result<Target> {
    let mut lines = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'));
    let bits_line = lines.next().ok_or_else(|| anyhow!("target file is empty"))?;
    let interval_bits: u32 = bits_line
        .parse()
        .map_err(|_| anyhow!("bad interval bits line: {bits_line:?}"))?;
    if !(8..=192).contains(&interval_bits) {
        return Err(anyhow!(
            "interval bits {interval_bits} outside supported range 8..=192"
        ));
    }
    let key_line = lines
        .next()
        .ok_or_else(|| anyhow!("target file is missing the public key line"))?;
    let point = parse_pubkey(key_line)?;
    Ok(Target {
        interval_bits,
        point,
    })
}
