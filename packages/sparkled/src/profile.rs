//! Profile storage: `~/.sparkle/<profile>/` holds the node's RSA key file
//! and nothing else. No peer state is persisted; the overlay is rebuilt by
//! rejoining on every start.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use rand::rngs::OsRng;
use sparkle_crypto::{KeyError, RsaKeyPair};
use thiserror::Error;

const KEY_FILE: &str = "rsa_key";
const DEFAULT_KEY_BITS: usize = 1024;

pub fn profile_dir(profile: &str) -> Result<PathBuf, ProfileError> {
    let home = dirs::home_dir().ok_or(ProfileError::NoHome)?;
    let dir = home.join(".sparkle").join(profile);
    fs::create_dir_all(&dir).map_err(ProfileError::CreateDir)?;
    Ok(dir)
}

/// Load the profile's key pair; it must already exist.
pub fn load_keypair(dir: &Path) -> Result<RsaKeyPair, ProfileError> {
    RsaKeyPair::read_from_file(&dir.join(KEY_FILE)).map_err(ProfileError::Key)
}

/// Load the profile's key pair, generating (and persisting) a fresh one
/// when the file is missing or regeneration was requested.
pub fn load_or_generate(
    dir: &Path,
    generate_bits: Option<usize>,
) -> Result<RsaKeyPair, ProfileError> {
    let path = dir.join(KEY_FILE);

    if generate_bits.is_none() && path.exists() {
        return RsaKeyPair::read_from_file(&path).map_err(ProfileError::Key);
    }

    let bits = generate_bits.unwrap_or(DEFAULT_KEY_BITS);
    log::debug!("generating new RSA key pair ({bits} bits)");

    let pair = RsaKeyPair::generate(&mut OsRng, bits).map_err(ProfileError::Key)?;
    pair.write_to_file(&path).map_err(ProfileError::Key)?;
    Ok(pair)
}

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("cannot determine the home directory")]
    NoHome,

    #[error("cannot create the profile directory")]
    CreateDir(#[source] io::Error),

    #[error("cannot access the RSA key pair")]
    Key(#[source] KeyError),
}
