// Password hash schemes stored in `userpassword`
//
// {MD5}      base64(md5(password))
// {SSHA256}  base64(sha256(password || salt) || salt)
// {SSHA512}  base64(sha512(password || salt) || salt)

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use md5::Md5;
use rand::Rng;
use sha2::{Digest, Sha256, Sha512};

const MD5_PREFIX: &str = "{MD5}";
const SSHA256_PREFIX: &str = "{SSHA256}";
const SSHA512_PREFIX: &str = "{SSHA512}";

const SALT_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashScheme {
    Md5,
    Ssha256,
    Ssha512,
}

impl HashScheme {
    fn prefix(self) -> &'static str {
        match self {
            HashScheme::Md5 => MD5_PREFIX,
            HashScheme::Ssha256 => SSHA256_PREFIX,
            HashScheme::Ssha512 => SSHA512_PREFIX,
        }
    }

    fn split(hash: &str) -> Result<(HashScheme, &str)> {
        for scheme in [HashScheme::Md5, HashScheme::Ssha256, HashScheme::Ssha512] {
            if let Some(rest) = hash.strip_prefix(scheme.prefix()) {
                return Ok((scheme, rest));
            }
        }
        bail!("no valid hash scheme prefix found")
    }
}

fn salted_digest<D: Digest>(password: &[u8], salt: &[u8]) -> Vec<u8> {
    let mut hasher = D::new();
    hasher.update(password);
    hasher.update(salt);
    hasher.finalize().to_vec()
}

fn encode_salted<D: Digest>(prefix: &str, password: &[u8], salt: &[u8]) -> String {
    let mut raw = salted_digest::<D>(password, salt);
    raw.extend_from_slice(salt);
    format!("{}{}", prefix, STANDARD.encode(raw))
}

/// Hash `password` with `scheme`. Salted schemes draw a fresh 16-byte salt.
pub fn hash_password(scheme: HashScheme, password: &[u8]) -> String {
    let mut salt = [0u8; SALT_LEN];
    rand::rng().fill(&mut salt);
    match scheme {
        HashScheme::Md5 => format!("{}{}", MD5_PREFIX, STANDARD.encode(Md5::digest(password))),
        HashScheme::Ssha256 => encode_salted::<Sha256>(SSHA256_PREFIX, password, &salt),
        HashScheme::Ssha512 => encode_salted::<Sha512>(SSHA512_PREFIX, password, &salt),
    }
}

/// Hash with the strongest supported scheme.
pub fn hash_default(password: &[u8]) -> String {
    hash_password(HashScheme::Ssha512, password)
}

fn verify_salted<D: Digest>(decoded: &[u8], password: &[u8]) -> Result<bool> {
    let digest_len = <D as Digest>::output_size();
    if decoded.len() < digest_len {
        bail!("salted hash shorter than its digest ({} < {})", decoded.len(), digest_len);
    }
    let (expected, salt) = decoded.split_at(digest_len);
    Ok(salted_digest::<D>(password, salt) == expected)
}

/// Check `password` against a stored `{SCHEME}base64` hash.
/// Errors when the stored value is not a hash this server understands.
pub fn verify_password(hash: &str, password: &[u8]) -> Result<bool> {
    let (scheme, encoded) = HashScheme::split(hash)?;
    let decoded = STANDARD
        .decode(encoded)
        .with_context(|| format!("invalid base64 in {} hash", scheme.prefix()))?;
    match scheme {
        HashScheme::Md5 => Ok(Md5::digest(password).as_slice() == decoded.as_slice()),
        HashScheme::Ssha256 => verify_salted::<Sha256>(&decoded, password),
        HashScheme::Ssha512 => verify_salted::<Sha512>(&decoded, password),
    }
}
