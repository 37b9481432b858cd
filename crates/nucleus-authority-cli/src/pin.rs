//! Pin command - print the pins of CA certificates
//!
//! Hosts joining a cluster pass one of these pins to prove they reached the
//! genuine authority.

use anyhow::{bail, Context, Result};
use clap::Args;
use nucleus_authority::calculate_pin;
use std::path::{Path, PathBuf};

/// Print the CA pins of a PEM certificate file
#[derive(Args, Debug)]
pub struct PinArgs {
    /// PEM file with one or more CA certificates
    pub cert: PathBuf,
}

pub fn execute(args: PinArgs) -> Result<()> {
    for pin in pins_of(&args.cert)? {
        println!("{pin}");
    }
    Ok(())
}

fn pins_of(path: &Path) -> Result<Vec<String>> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let pins: Vec<String> = pem::parse_many(&contents)
        .with_context(|| format!("failed to parse {}", path.display()))?
        .iter()
        .filter(|p| p.tag() == "CERTIFICATE")
        .map(|p| calculate_pin(p.contents()))
        .collect();
    if pins.is_empty() {
        bail!("{} holds no certificates", path.display());
    }
    Ok(pins)
}
