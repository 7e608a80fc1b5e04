//! Scenario configuration
//!
//! Scenario files are TOML: nodes with interfaces and routes, segments
//! connecting them, listeners and timed flows driving traffic.

mod types;
mod validation;

pub use types::*;
pub use validation::{validate, ValidationResult};

use crate::protocol::Ipv4Mask;
use crate::{Error, Result};
use std::net::Ipv4Addr;
use std::path::Path;

/// Load a scenario from a TOML file
pub fn load<P: AsRef<Path>>(path: P) -> Result<Scenario> {
    let content = std::fs::read_to_string(path).map_err(Error::Io)?;
    let scenario: Scenario =
        toml::from_str(&content).map_err(|e| Error::Scenario(e.to_string()))?;
    Ok(scenario)
}

/// Parse "a.b.c.d/len" into an address and mask
pub fn parse_cidr(cidr: &str) -> Result<(Ipv4Addr, Ipv4Mask)> {
    let (addr, prefix) = cidr
        .split_once('/')
        .ok_or_else(|| Error::Parse(format!("invalid CIDR: {cidr}")))?;
    let addr: Ipv4Addr = addr
        .parse()
        .map_err(|_| Error::Parse(format!("invalid address: {addr}")))?;
    let prefix: u8 = prefix
        .parse()
        .map_err(|_| Error::Parse(format!("invalid prefix: {prefix}")))?;
    if prefix > 32 {
        return Err(Error::Parse(format!("invalid prefix: {prefix}")));
    }
    Ok((addr, Ipv4Mask::from_prefix(prefix)))
}
