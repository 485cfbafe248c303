//! Record framing
//!
//! One record on the byte stream carries exactly one envelope. Layout,
//! all integers little-endian:
//!
//! ```text
//! +--------+--------+--------+------------------+------------------+
//! | secure |    len (u16)    |  payload[len]    | nonce[12] if     |
//! | (u8)   |                 |                  | secure == 1      |
//! +--------+--------+--------+------------------+------------------+
//! ```
//!
//! With `secure == 0` the payload is the envelope plaintext; with
//! `secure == 1` it is AES-GCM ciphertext plus tag, and the fresh
//! per-record nonce follows the payload. Putting the length before the
//! payload keeps the reader allocation-free; putting the nonce after it
//! keeps the writer to a single buffered flush.

use crate::codec::errors::RecordError;
use crate::crypto::{Cipher, NONCE_LEN};
use aes_gcm::aead::{OsRng, rand_core::RngCore};
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Largest payload a record can carry.
pub const MAX_RECORD: usize = u16::MAX as usize;

/// Capacity of the buffered reader in front of the stream.
const READ_BUF_SIZE: usize = 64 * 1024;

/// Plaintext sizes above this get a warning; the emitter is expected to
/// stay near the TUN MTU.
const OVERSIZE_WARN: usize = 1600;

/// Writes framed records to a byte stream.
///
/// Owns a scratch buffer that is reset per record so each record goes
/// out as a single write.
pub struct RecordWriter<W> {
    io: W,
    buf: BytesMut,
    cipher: Option<Cipher>,
}

impl<W: AsyncWrite + Unpin> RecordWriter<W> {
    pub fn new(io: W, cipher: Option<Cipher>) -> Self {
        Self {
            io,
            buf: BytesMut::with_capacity(4096),
            cipher,
        }
    }

    /// Frames and writes one record containing `plain`.
    pub async fn write_record(&mut self, plain: &[u8]) -> Result<(), RecordError> {
        if plain.len() > OVERSIZE_WARN {
            tracing::warn!("write data size {} gt {}", plain.len(), OVERSIZE_WARN);
        }

        self.buf.clear();
        match &self.cipher {
            None => {
                if plain.len() > MAX_RECORD {
                    return Err(RecordError::TooLarge(plain.len()));
                }
                self.buf.put_u8(0);
                self.buf.put_u16_le(plain.len() as u16);
                self.buf.extend_from_slice(plain);
            }
            Some(cipher) => {
                let mut nonce = [0u8; NONCE_LEN];
                OsRng.fill_bytes(&mut nonce);
                let sealed = cipher.seal(plain, &nonce).map_err(RecordError::Crypto)?;
                if sealed.len() > MAX_RECORD {
                    return Err(RecordError::TooLarge(sealed.len()));
                }
                self.buf.put_u8(1);
                self.buf.put_u16_le(sealed.len() as u16);
                self.buf.extend_from_slice(&sealed);
                self.buf.extend_from_slice(&nonce);
            }
        }

        self.io.write_all(&self.buf).await?;
        self.io.flush().await?;
        Ok(())
    }

    /// Shuts down the underlying stream for writing.
    pub async fn shutdown(&mut self) {
        let _ = self.io.shutdown().await;
    }
}

/// Reads framed records from a byte stream.
///
/// Both the ciphertext buffer and the plaintext buffer are reused
/// across records; the returned slice is only valid until the next
/// `read_record` call.
pub struct RecordReader<R> {
    io: BufReader<R>,
    buf: Vec<u8>,
    plain: Vec<u8>,
    cipher: Option<Cipher>,
}

impl<R: AsyncRead + Unpin> RecordReader<R> {
    pub fn new(io: R, cipher: Option<Cipher>) -> Self {
        Self {
            io: BufReader::with_capacity(READ_BUF_SIZE, io),
            buf: vec![0u8; MAX_RECORD],
            plain: Vec::new(),
            cipher,
        }
    }

    /// Reads one record and returns its plaintext payload.
    ///
    /// # Errors
    /// - `KeyMismatch` when a sealed record fails authentication, or a
    ///   sealed record arrives while encryption is disabled locally
    /// - `Io` on any short read, EOF, or transport failure
    pub async fn read_record(&mut self) -> Result<&[u8], RecordError> {
        let mut header = [0u8; 3];
        self.io.read_exact(&mut header).await?;
        let secure = header[0];
        let len = u16::from_le_bytes([header[1], header[2]]) as usize;

        self.io.read_exact(&mut self.buf[..len]).await?;
        if secure == 0 {
            return Ok(&self.buf[..len]);
        }

        let mut nonce = [0u8; NONCE_LEN];
        self.io.read_exact(&mut nonce).await?;
        let cipher = self.cipher.as_ref().ok_or(RecordError::KeyMismatch)?;
        self.plain = cipher
            .open(&self.buf[..len], &nonce)
            .map_err(|_| RecordError::KeyMismatch)?;
        Ok(&self.plain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::make_cipher;

    #[tokio::test]
    async fn test_plain_round_trip() {
        let (a, b) = tokio::io::duplex(READ_BUF_SIZE);
        let mut writer = RecordWriter::new(a, None);
        let mut reader = RecordReader::new(b, None);

        writer.write_record(b"first").await.unwrap();
        writer.write_record(b"").await.unwrap();
        writer.write_record(b"third record").await.unwrap();

        assert_eq!(reader.read_record().await.unwrap(), b"first");
        assert_eq!(reader.read_record().await.unwrap(), b"");
        assert_eq!(reader.read_record().await.unwrap(), b"third record");
    }

    #[tokio::test]
    async fn test_sealed_round_trip() {
        let (a, b) = tokio::io::duplex(READ_BUF_SIZE);
        let mut writer = RecordWriter::new(a, make_cipher("shared"));
        let mut reader = RecordReader::new(b, make_cipher("shared"));

        let payload = vec![0xabu8; 1400];
        writer.write_record(&payload).await.unwrap();
        assert_eq!(reader.read_record().await.unwrap(), payload.as_slice());
    }

    #[tokio::test]
    async fn test_key_mismatch() {
        let (a, b) = tokio::io::duplex(READ_BUF_SIZE);
        let mut writer = RecordWriter::new(a, make_cipher("key-one"));
        let mut reader = RecordReader::new(b, make_cipher("key-two"));

        writer.write_record(b"opaque").await.unwrap();
        match reader.read_record().await {
            Err(RecordError::KeyMismatch) => {}
            other => panic!("expected KeyMismatch, got {:?}", other.map(|b| b.to_vec())),
        }
    }

    #[tokio::test]
    async fn test_sealed_record_without_local_key() {
        let (a, b) = tokio::io::duplex(READ_BUF_SIZE);
        let mut writer = RecordWriter::new(a, make_cipher("some-key"));
        let mut reader = RecordReader::new(b, None);

        writer.write_record(b"opaque").await.unwrap();
        assert!(matches!(
            reader.read_record().await,
            Err(RecordError::KeyMismatch)
        ));
    }

    #[tokio::test]
    async fn test_truncated_record_fails() {
        let (a, b) = tokio::io::duplex(READ_BUF_SIZE);
        let mut reader = RecordReader::new(b, None);

        // secure=0, len=100, but only 3 payload bytes before EOF
        let mut half = tokio::io::BufWriter::new(a);
        half.write_all(&[0u8, 100, 0, 1, 2, 3]).await.unwrap();
        half.flush().await.unwrap();
        drop(half);

        assert!(matches!(reader.read_record().await, Err(RecordError::Io(_))));
    }

    #[tokio::test]
    async fn test_oversize_payload_rejected() {
        let (a, _b) = tokio::io::duplex(READ_BUF_SIZE);
        let mut writer = RecordWriter::new(a, None);
        let huge = vec![0u8; MAX_RECORD + 1];
        assert!(matches!(
            writer.write_record(&huge).await,
            Err(RecordError::TooLarge(_))
        ));
    }
}
