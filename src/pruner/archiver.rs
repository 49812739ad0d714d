//! Archive-before-delete: serializes a batch of messages to a file under
//! `<rootFolder>/<channelId>/<date>/messages_<timestamp>.<ext>[.gz][.enc]`,
//! optionally gzipped and/or AES-256-GCM encrypted. Only messages that made it
//! into a successfully written archive file are eligible for the pruner to
//! then delete.

use std::io::{Read, Write};
use std::path::PathBuf;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;
use tracing::instrument;

use crate::domain::pruning::{ArchiveFormat, ArchiverOptions};
use crate::domain_types::ChannelId;
use crate::storage::MessageBundle;

const PBKDF2_ROUNDS: u32 = 100_000;
const SALT_LEN: usize = 16;
const IV_LEN: usize = 12;
const RESERVED_LEN: usize = 4;

/// Failure modes writing or reading an archive file.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    /// Underlying filesystem failure.
    #[error("archive io error: {0}")]
    Io(#[from] std::io::Error),
    /// `encrypt` was set but no password was configured.
    #[error("encryption requested without a password")]
    MissingPassword,
    /// AES-GCM encryption or decryption failed (e.g. wrong password, truncated file).
    #[error("encryption error")]
    Crypto,
    /// The envelope is too short to contain a valid header.
    #[error("archive envelope is truncated")]
    TruncatedEnvelope,
}

/// Builds the destination path for a new archive file, without creating it.
#[must_use]
pub fn archive_path(
    root_folder: &str,
    channel: &ChannelId,
    now: DateTime<Utc>,
    options: &ArchiverOptions,
) -> PathBuf {
    let mut path = PathBuf::from(root_folder);
    path.push(channel.as_ref());
    path.push(now.format("%Y-%m-%d").to_string());

    let mut filename = format!("messages_{}.{}", now.timestamp_millis(), options.format.extension());
    if options.gzip {
        filename.push_str(".gz");
    }
    if options.encrypt {
        filename.push_str(".enc");
    }
    path.push(filename);
    path
}

/// Serializes `bundles` per `options.format`, gzips and/or encrypts as
/// configured, and writes the result to `archive_path`.
///
/// # Errors
///
/// Returns [`ArchiveError::MissingPassword`] if `options.encrypt` is set
/// without a password, or [`ArchiveError::Io`] if the file cannot be written.
#[instrument(skip(bundles, options), fields(channel = %channel.as_ref(), count = bundles.len()))]
pub fn write_archive_batch(
    channel: &ChannelId,
    bundles: &[MessageBundle],
    now: DateTime<Utc>,
    options: &ArchiverOptions,
) -> Result<PathBuf, ArchiveError> {
    let path = archive_path(&options.root_folder, channel, now, options);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut serialized = serialize_batch(bundles, options.format);

    if options.gzip {
        serialized = gzip_bytes(&serialized)?;
    }
    if options.encrypt {
        let password = options.password.as_deref().ok_or(ArchiveError::MissingPassword)?;
        serialized = encrypt_bytes(&serialized, password)?;
    }

    std::fs::write(&path, serialized)?;
    Ok(path)
}

/// Reads and reverses whatever of gzip/encryption `options` declares, for
/// operator-facing archive inspection.
///
/// # Errors
///
/// Returns [`ArchiveError::MissingPassword`] if `options.encrypt` is set
/// without a password, or [`ArchiveError::Crypto`]/[`ArchiveError::Io`] on
/// decode failure.
pub fn read_archive_batch(path: &std::path::Path, options: &ArchiverOptions) -> Result<Vec<u8>, ArchiveError> {
    let mut bytes = std::fs::read(path)?;

    if options.encrypt {
        let password = options.password.as_deref().ok_or(ArchiveError::MissingPassword)?;
        bytes = decrypt_bytes(&bytes, password)?;
    }
    if options.gzip {
        bytes = gunzip_bytes(&bytes)?;
    }
    Ok(bytes)
}

/// Serializes the full bundle (message, every connector message, and content
/// when the caller fetched it) so that reading the row back reconstructs an
/// equivalent `MessageBundle`, modulo whatever encryption the archiver itself
/// applied to `content`.
fn serialize_batch(bundles: &[MessageBundle], format: ArchiveFormat) -> Vec<u8> {
    let mut out = Vec::new();
    for bundle in bundles {
        match format {
            ArchiveFormat::Json => {
                if let Ok(line) = serde_json::to_string(bundle) {
                    out.extend_from_slice(line.as_bytes());
                    out.push(b'\n');
                }
            }
            ArchiveFormat::Xml => {
                out.extend_from_slice(
                    format!(
                        "<message id=\"{}\" server=\"{}\" received=\"{}\" connectors=\"{}\"/>\n",
                        bundle.message.id.into_inner(),
                        bundle.message.server_id.as_ref(),
                        bundle.message.received_date.timestamp(),
                        bundle.connector_messages.len()
                    )
                    .as_bytes(),
                );
            }
        }
    }
    out
}

fn gzip_bytes(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

fn gunzip_bytes(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

fn derive_key(password: &str, salt: &[u8; SALT_LEN]) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ROUNDS, &mut key);
    key
}

/// Envelope: `[16B salt][12B IV][4B reserved][ciphertext][16B GCM tag]`.
fn encrypt_bytes(plaintext: &[u8], password: &str) -> Result<Vec<u8>, ArchiveError> {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);

    let key = derive_key(password, &salt);
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| ArchiveError::Crypto)?;
    let ciphertext = cipher.encrypt(Nonce::from_slice(&iv), plaintext).map_err(|_| ArchiveError::Crypto)?;

    let mut envelope = Vec::with_capacity(SALT_LEN + IV_LEN + RESERVED_LEN + ciphertext.len());
    envelope.extend_from_slice(&salt);
    envelope.extend_from_slice(&iv);
    envelope.extend_from_slice(&[0u8; RESERVED_LEN]);
    envelope.extend_from_slice(&ciphertext);
    Ok(envelope)
}

fn decrypt_bytes(envelope: &[u8], password: &str) -> Result<Vec<u8>, ArchiveError> {
    let header_len = SALT_LEN + IV_LEN + RESERVED_LEN;
    if envelope.len() < header_len {
        return Err(ArchiveError::TruncatedEnvelope);
    }
    let salt: [u8; SALT_LEN] = envelope[..SALT_LEN].try_into().unwrap();
    let iv: [u8; IV_LEN] = envelope[SALT_LEN..SALT_LEN + IV_LEN].try_into().unwrap();
    let ciphertext = &envelope[header_len..];

    let key = derive_key(password, &salt);
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| ArchiveError::Crypto)?;
    cipher.decrypt(Nonce::from_slice(&iv), ciphertext).map_err(|_| ArchiveError::Crypto)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_then_decrypt_round_trips() {
        let plaintext = b"{\"messageId\":1}\n";
        let envelope = encrypt_bytes(plaintext, "hunter2").unwrap();
        assert!(envelope.len() > SALT_LEN + IV_LEN + RESERVED_LEN);
        let decrypted = decrypt_bytes(&envelope, "hunter2").unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn decrypt_with_wrong_password_fails() {
        let envelope = encrypt_bytes(b"data", "correct").unwrap();
        assert!(matches!(decrypt_bytes(&envelope, "wrong"), Err(ArchiveError::Crypto)));
    }

    #[test]
    fn gzip_then_gunzip_round_trips() {
        let data = b"some archive content repeated ".repeat(10);
        let compressed = gzip_bytes(&data).unwrap();
        let decompressed = gunzip_bytes(&compressed).unwrap();
        assert_eq!(decompressed, data);
    }

    #[test]
    fn archive_path_includes_channel_and_extension() {
        let channel = ChannelId::try_new("lab_results").unwrap();
        let now = Utc::now();
        let options = ArchiverOptions { gzip: true, encrypt: true, ..ArchiverOptions::default() };
        let path = archive_path("archive", &channel, now, &options);
        let rendered = path.to_string_lossy();
        assert!(rendered.contains("lab_results"));
        assert!(rendered.ends_with(".json.gz.enc"));
    }
}
