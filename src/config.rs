//! Configuration
//!
//! clap::Parser struct covering both roles. The classic short option names
//! survive as aliases where clap allows them (`--sp`, `--wi`, `--gpu-id`);
//! everything validates before any thread starts.

use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::Parser;

/// Distributed Pollard kangaroo solver for the secp256k1 interval DLP
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Run as the coordination server
    #[arg(short = 's', long = "server")]
    pub server: bool,

    /// Server listen port
    #[arg(long = "sp", value_name = "PORT", default_value = "17403")]
    pub server_port: u16,

    /// Distinguished point bits (low zero bits of x)
    #[arg(short = 'd', long = "dp-bits", default_value = "16")]
    pub dp_bits: u32,

    /// Hash table bits: the store holds 2^H buckets
    #[arg(long, default_value = "20")]
    pub hash_bits: u32,

    /// Checkpoint file (server writes, and resumes from it on start)
    #[arg(short = 'w', long = "work-file", value_name = "FILE")]
    pub work_file: Option<PathBuf>,

    /// Seconds between checkpoint rewrites
    #[arg(long = "wi", value_name = "SECONDS", default_value = "300")]
    pub work_interval: u64,

    /// Result file for the recovered key
    #[arg(short = 'o', long = "output", value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Connect to a server (client mode)
    #[arg(short = 'c', long = "connect", value_name = "HOST[:PORT]")]
    pub connect: Option<String>,

    /// CPU compute lanes
    #[arg(short = 't', long = "threads", default_value = "4")]
    pub threads: u32,

    /// Kangaroos per lane
    #[arg(long, default_value = "512")]
    pub cohort: usize,

    /// Use GPU lanes (requires a GPU-enabled build)
    #[arg(long)]
    pub gpu: bool,

    /// GPU device id
    #[arg(long = "gpu-id", value_name = "ID", default_value = "0")]
    pub gpu_id: u32,

    /// Worker count the partitioner sizes ranges for
    #[arg(long, default_value = "4")]
    pub expected_workers: u32,

    /// Extra log2 factor of ranges beyond the worker count
    #[arg(long, default_value = "2")]
    pub overshoot: u32,

    /// Target file: interval bits line, then the SEC1 public key in hex
    #[arg(value_name = "TARGET_FILE")]
    pub target_file: Option<PathBuf>,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.server == self.connect.is_some() {
            return Err(anyhow!("pick exactly one of --server or --connect"));
        }
        if self.server && self.target_file.is_none() {
            return Err(anyhow!("server mode needs a target file"));
        }
        if !(1..=48).contains(&self.dp_bits) {
            return Err(anyhow!("dp bits must be in 1..=48"));
        }
        if !(18..=22).contains(&self.hash_bits) {
            return Err(anyhow!("hash bits must be in 18..=22"));
        }
        if self.threads == 0 {
            return Err(anyhow!("at least one compute lane is required"));
        }
        if self.cohort < 2 {
            return Err(anyhow!("cohort must hold at least one tame and one wild"));
        }
        if self.work_interval == 0 {
            return Err(anyhow!("checkpoint interval must be positive"));
        }
        if !(1..=1024).contains(&self.expected_workers) {
            return Err(anyhow!("expected workers must be in 1..=1024"));
        }
        if self.overshoot > 8 {
            return Err(anyhow!("overshoot factor must be in 0..=8"));
        }
        Ok(())
    }

    /// `host[:port]` with the default port filled in.
    pub fn server_addr(&self) -> Result<String> {
        let host = self
            .connect
            .as_deref()
            .ok_or_else(|| anyhow!("not in client mode"))?;
        Ok(if host.contains(':') {
            host.to_string()
        } else {
            format!("{host}:{}", self.server_port)
        })
    }
}
