//! Keygen command implementation

use anyhow::{Context, Result};
use clap::Args;
use hashweave_protocol::{KeyPair, Signer};
use std::fs;
use std::path::{Path, PathBuf};

/// File holding the hex-encoded private key inside a data directory
pub const PRIV_KEY_FILE: &str = "priv_key";

#[derive(Args)]
pub struct KeygenArgs {
    /// Directory to write the private key to
    #[arg(long, default_value = ".hashweave")]
    pub datadir: PathBuf,
    /// Overwrite an existing key
    #[arg(long)]
    pub force: bool,
}

/// Execute the keygen command
pub fn execute_keygen_command(args: KeygenArgs) -> Result<()> {
    let key = write_new_key(&args.datadir, args.force)?;
    println!("🔑 Private key written to {}", args.datadir.join(PRIV_KEY_FILE).display());
    println!("🪪 Public key: {}", key.public_key_hex());
    println!("🆔 Peer id: {}", key.peer_id());
    Ok(())
}

pub fn write_new_key(datadir: &Path, force: bool) -> Result<KeyPair> {
    let path = datadir.join(PRIV_KEY_FILE);
    if path.exists() && !force {
        anyhow::bail!("{} already exists, pass --force to replace it", path.display());
    }
    fs::create_dir_all(datadir)
        .with_context(|| format!("Failed to create data directory: {}", datadir.display()))?;
    let key = KeyPair::generate();
    fs::write(&path, key.secret_hex())
        .with_context(|| format!("Failed to write key file: {}", path.display()))?;
    Ok(key)
}

pub fn read_key(datadir: &Path) -> Result<KeyPair> {
    let path = datadir.join(PRIV_KEY_FILE);
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read key file: {}", path.display()))?;
    Ok(KeyPair::from_hex(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_key_round_trips_through_datadir() {
        let temp_dir = TempDir::new().unwrap();
        let key = write_new_key(temp_dir.path(), false).unwrap();
        let loaded = read_key(temp_dir.path()).unwrap();
        assert_eq!(loaded.public_key_hex(), key.public_key_hex());

        // refuses to clobber without --force
        assert!(write_new_key(temp_dir.path(), false).is_err());
        let replaced = write_new_key(temp_dir.path(), true).unwrap();
        assert_ne!(replaced.public_key_hex(), key.public_key_hex());
    }
}
