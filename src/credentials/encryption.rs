//! AES-GCM sealing for credential and token files.
//!
//! A sealed file is the standard base64 encoding of `nonce || ciphertext`.
//! Every record is sealed with an associated-data tag naming its schema, so a
//! token file can never be opened as a credentials file and vice versa.
//!
//! The key lives in a separate file: base64 of 16, 24 or 32 raw bytes
//! (AES-128/192/256), readable by its owner only (mode `0400`).

use aes_gcm::{
    aead::{consts::U12, Aead, AeadCore, KeyInit, OsRng, Payload},
    aes::Aes192,
    Aes128Gcm, Aes256Gcm, AesGcm,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{de::DeserializeOwned, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

type Aes192Gcm = AesGcm<Aes192, U12>;

/// Size of the nonce in bytes (96 bits, standard for GCM)
const NONCE_SIZE: usize = 12;

/// Required permission bits on the key file.
const KEY_FILE_MODE: u32 = 0o400;

/// Secret codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("unable to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("key file {path} must have perms set to 0400 (found {mode:o})")]
    KeyPermissions { path: PathBuf, mode: u32 },

    #[error("unable to base64 decode key file {path}: {source}")]
    KeyEncoding {
        path: PathBuf,
        #[source]
        source: base64::DecodeError,
    },

    #[error("key must be 16, 24, or 32 bytes long (got {0})")]
    KeySize(usize),

    #[error("unable to base64 decode sealed file: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("malformed ciphertext")]
    Malformed,

    #[error("unable to seal payload")]
    Seal,

    #[error("unable to open sealed payload (wrong key, wrong schema, or corrupted data)")]
    Open,

    #[error("unable to encode or decode payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Reads and validates the symmetric key from `path`.
///
/// The returned bytes are wiped when dropped.
pub fn read_key(path: &Path) -> Result<Zeroizing<Vec<u8>>, CodecError> {
    let metadata = fs::metadata(path).map_err(|source| CodecError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    check_key_permissions(path, &metadata)?;

    let content = Zeroizing::new(fs::read_to_string(path).map_err(|source| CodecError::Io {
        path: path.to_path_buf(),
        source,
    })?);

    let key = Zeroizing::new(BASE64.decode(content.trim()).map_err(|source| {
        CodecError::KeyEncoding {
            path: path.to_path_buf(),
            source,
        }
    })?);

    match key.len() {
        16 | 24 | 32 => Ok(key),
        n => Err(CodecError::KeySize(n)),
    }
}

#[cfg(unix)]
fn check_key_permissions(path: &Path, metadata: &fs::Metadata) -> Result<(), CodecError> {
    use std::os::unix::fs::PermissionsExt;

    let mode = metadata.permissions().mode() & 0o777;
    if mode != KEY_FILE_MODE {
        return Err(CodecError::KeyPermissions {
            path: path.to_path_buf(),
            mode,
        });
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_key_permissions(_path: &Path, _metadata: &fs::Metadata) -> Result<(), CodecError> {
    Ok(())
}

/// Seals `plaintext` under `key`, returning `nonce || ciphertext`.
pub fn seal(key: &[u8], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CodecError> {
    match key.len() {
        16 => seal_with::<Aes128Gcm>(key, aad, plaintext),
        24 => seal_with::<Aes192Gcm>(key, aad, plaintext),
        32 => seal_with::<Aes256Gcm>(key, aad, plaintext),
        n => Err(CodecError::KeySize(n)),
    }
}

/// Opens data produced by [`seal`] with the same key and tag.
pub fn open(key: &[u8], aad: &[u8], data: &[u8]) -> Result<Vec<u8>, CodecError> {
    match key.len() {
        16 => open_with::<Aes128Gcm>(key, aad, data),
        24 => open_with::<Aes192Gcm>(key, aad, data),
        32 => open_with::<Aes256Gcm>(key, aad, data),
        n => Err(CodecError::KeySize(n)),
    }
}

fn seal_with<C>(key: &[u8], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CodecError>
where
    C: Aead + AeadCore + KeyInit,
{
    let cipher = C::new_from_slice(key).map_err(|_| CodecError::KeySize(key.len()))?;

    // Fresh random nonce for every seal
    let nonce = C::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, Payload { msg: plaintext, aad })
        .map_err(|_| CodecError::Seal)?;

    let mut sealed = Vec::with_capacity(nonce.len() + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

fn open_with<C>(key: &[u8], aad: &[u8], data: &[u8]) -> Result<Vec<u8>, CodecError>
where
    C: Aead + AeadCore + KeyInit,
{
    if data.len() < NONCE_SIZE {
        return Err(CodecError::Malformed);
    }

    let cipher = C::new_from_slice(key).map_err(|_| CodecError::KeySize(key.len()))?;
    let (nonce, ciphertext) = data.split_at(NONCE_SIZE);

    cipher
        .decrypt(
            aes_gcm::aead::Nonce::<C>::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CodecError::Open)
}

/// Serializes `payload`, seals it with the key from `key_path` and writes the
/// base64 result to `path`.
pub fn encrypt_to_file<T: Serialize>(
    key_path: &Path,
    path: &Path,
    aad: &[u8],
    payload: &T,
) -> Result<(), CodecError> {
    let key = read_key(key_path)?;

    let plaintext = Zeroizing::new(serde_json::to_vec(payload)?);
    let sealed = seal(&key, aad, &plaintext)?;

    write_private(path, BASE64.encode(sealed).as_bytes()).map_err(|source| CodecError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Reads `path`, opens it with the key from `key_path` and deserializes the record.
pub fn decrypt_from_file<T: DeserializeOwned>(
    key_path: &Path,
    path: &Path,
    aad: &[u8],
) -> Result<T, CodecError> {
    let key = read_key(key_path)?;

    let encoded = fs::read_to_string(path).map_err(|source| CodecError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let sealed = BASE64.decode(encoded.trim())?;

    let plaintext = Zeroizing::new(open(&key, aad, &sealed)?);
    Ok(serde_json::from_slice(&plaintext)?)
}

fn write_private(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Writes a base64 key of `len` bytes with owner-only read permission.
    pub fn write_key(dir: &Path, len: usize) -> PathBuf {
        let path = dir.join("test.key");
        let key: Vec<u8> = (0..len as u8).collect();
        fs::write(&path, BASE64.encode(key)).unwrap();
        set_mode(&path, 0o400);
        path
    }

    #[cfg(unix)]
    pub fn set_mode(path: &Path, mode: u32) {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode)).unwrap();
    }

    #[cfg(not(unix))]
    pub fn set_mode(_path: &Path, _mode: u32) {}
}
