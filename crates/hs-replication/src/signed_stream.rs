//! Signed replication streams.
//!
//! A stream starts with a mode byte. In [`StreamMode::Signed`] the header
//! also names the signer, and the sender calls
//! [`SignedWriter::sign_block`] at record boundaries. Each call appends a
//! length-prefixed signature over the SHA-256 digest of every byte written
//! since the previous one. The receiver calls
//! [`SignedReader::verify_block`] at the same boundaries; any mismatch
//! means the stream was altered.
//!
//! [`StreamMode::Tls`] marks streams whose integrity comes from the
//! connection. Blocks carry no signatures, and a reader that expects
//! signatures accepts it only when told the connection is trusted.

use bytes::{BufMut, Bytes, BytesMut};
use hs_core::crypto::{PrivateKey, PublicKey, SignatureAlgorithm};
use hs_core::encoding::{read_byte_array, write_byte_array};
use hs_core::{WireDecode, WireEncode};
use hs_proto::ValueReference;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{trace, warn};

use crate::error::{ReplicationError, ReplicationResult};

/// Largest signature record accepted.
pub const MAX_SIGNATURE_LEN: usize = 16 * 1024;

/// Largest length-prefixed field accepted inside a stream.
pub const MAX_FIELD_LEN: usize = 4 * 1024 * 1024;

/// How a stream is protected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamMode {
    /// No protection.
    Unsigned = 0,
    /// A signature per block.
    Signed = 1,
    /// Protected by the connection.
    Tls = 2,
}

impl StreamMode {
    fn from_u8(tag: u8) -> ReplicationResult<Self> {
        match tag {
            0 => Ok(Self::Unsigned),
            1 => Ok(Self::Signed),
            2 => Ok(Self::Tls),
            other => Err(ReplicationError::Compromised(format!("unknown stream mode {other}"))),
        }
    }
}

/// Key and identity a writer signs blocks with.
#[derive(Clone)]
pub struct StreamSigner {
    /// Signing key.
    pub key: PrivateKey,
    /// Where the matching public key is published.
    pub identity: ValueReference,
}

/// Key and identity a reader expects blocks to be signed by.
#[derive(Debug, Clone)]
pub struct StreamVerifier {
    /// Signer's public key.
    pub key: PublicKey,
    /// Signer's identity.
    pub identity: ValueReference,
}

/// Writes a stream, signing blocks.
pub struct SignedWriter<W> {
    inner: W,
    mode: StreamMode,
    signer: Option<StreamSigner>,
    hasher: Sha256,
    blocks: u64,
}

impl<W: AsyncWrite + Unpin> SignedWriter<W> {
    /// Starts a signed stream.
    pub async fn signed(inner: W, signer: StreamSigner) -> ReplicationResult<Self> {
        let mut header = BytesMut::new();
        header.put_u8(StreamMode::Signed as u8);
        write_byte_array(&mut header, &signer.identity.to_bytes());
        Self::start(inner, StreamMode::Signed, Some(signer), header.freeze()).await
    }

    /// Starts an unsigned stream, or a TLS one when `tls` is set.
    pub async fn unsigned(inner: W, tls: bool) -> ReplicationResult<Self> {
        let mode = if tls { StreamMode::Tls } else { StreamMode::Unsigned };
        Self::start(inner, mode, None, Bytes::copy_from_slice(&[mode as u8])).await
    }

    async fn start(
        inner: W,
        mode: StreamMode,
        signer: Option<StreamSigner>,
        header: Bytes,
    ) -> ReplicationResult<Self> {
        let mut writer = Self {
            inner,
            mode,
            signer,
            hasher: Sha256::new(),
            blocks: 0,
        };
        writer.write_all(&header).await?;
        Ok(writer)
    }

    /// Stream mode.
    pub fn mode(&self) -> StreamMode {
        self.mode
    }

    /// Writes bytes into the current block.
    pub async fn write_all(&mut self, data: &[u8]) -> ReplicationResult<()> {
        self.hasher.update(data);
        self.inner.write_all(data).await?;
        Ok(())
    }

    /// Ends the current block. In signed mode, appends its signature.
    pub async fn sign_block(&mut self) -> ReplicationResult<()> {
        let digest = self.hasher.finalize_reset();
        let Some(signer) = &self.signer else {
            return Ok(());
        };
        let (alg, signature) = signer.key.sign(&digest, signer.identity.handle.as_bytes())?;
        let mut record = BytesMut::new();
        alg.name().to_string().encode(&mut record);
        write_byte_array(&mut record, &signature);
        self.inner.write_all(&(record.len() as u32).to_be_bytes()).await?;
        self.inner.write_all(&record).await?;
        self.blocks += 1;
        trace!(block = self.blocks, "signed stream block");
        Ok(())
    }

    /// Flushes the underlying writer.
    pub async fn flush(&mut self) -> ReplicationResult<()> {
        self.inner.flush().await?;
        Ok(())
    }

    /// Blocks signed so far.
    pub fn blocks(&self) -> u64 {
        self.blocks
    }

    /// Returns the underlying writer.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Reads a stream, verifying blocks.
pub struct SignedReader<R> {
    inner: R,
    mode: StreamMode,
    verifier: Option<StreamVerifier>,
    hasher: Sha256,
    blocks: u64,
}

impl<R: AsyncRead + Unpin> SignedReader<R> {
    /// Reads the stream header.
    ///
    /// With a verifier, only a signed stream by that identity is accepted,
    /// or a TLS stream when `trust_tls` is set. Without one, signatures are
    /// read and skipped.
    pub async fn open(
        inner: R,
        verifier: Option<StreamVerifier>,
        trust_tls: bool,
    ) -> ReplicationResult<Self> {
        let mut reader = Self {
            inner,
            mode: StreamMode::Unsigned,
            verifier,
            hasher: Sha256::new(),
            blocks: 0,
        };
        reader.mode = StreamMode::from_u8(reader.read_u8().await?)?;
        let expected = reader.verifier.as_ref().map(|v| v.identity.clone());
        match reader.mode {
            StreamMode::Signed => {
                let identity = ValueReference::from_bytes(&reader.read_field().await?)?;
                if let Some(expected) = expected {
                    if identity != expected {
                        return Err(ReplicationError::Compromised(format!(
                            "stream signed by {identity}, expected {expected}"
                        )));
                    }
                }
            }
            StreamMode::Tls if expected.is_none() || trust_tls => {}
            StreamMode::Unsigned if expected.is_none() => {}
            mode => {
                return Err(ReplicationError::Compromised(format!(
                    "expected a signed stream, got {mode:?}"
                )));
            }
        }
        Ok(reader)
    }

    /// Stream mode.
    pub fn mode(&self) -> StreamMode {
        self.mode
    }

    /// Reads exactly `buf.len()` bytes of the current block.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> ReplicationResult<()> {
        match self.inner.read_exact(buf).await {
            Ok(_) => {
                self.hasher.update(&buf[..]);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(ReplicationError::Truncated),
            Err(e) => Err(e.into()),
        }
    }

    /// Reads one byte.
    pub async fn read_u8(&mut self) -> ReplicationResult<u8> {
        let mut b = [0u8; 1];
        self.read_exact(&mut b).await?;
        Ok(b[0])
    }

    /// Reads a big-endian u32.
    pub async fn read_u32(&mut self) -> ReplicationResult<u32> {
        let mut b = [0u8; 4];
        self.read_exact(&mut b).await?;
        Ok(u32::from_be_bytes(b))
    }

    /// Reads a u32 length and that many bytes, returned with the length
    /// prefix so they decode as a byte array.
    pub async fn read_field(&mut self) -> ReplicationResult<Bytes> {
        let len = self.read_u32().await? as usize;
        if len > MAX_FIELD_LEN {
            return Err(ReplicationError::Compromised(format!("field of {len} bytes")));
        }
        let mut buf = vec![0u8; 4 + len];
        buf[..4].copy_from_slice(&(len as u32).to_be_bytes());
        self.read_exact(&mut buf[4..]).await?;
        let mut framed = Bytes::from(buf);
        Ok(read_byte_array(&mut framed)?)
    }

    /// Ends the current block, checking its signature in signed mode.
    pub async fn verify_block(&mut self) -> ReplicationResult<()> {
        let digest = self.hasher.finalize_reset();
        if self.mode != StreamMode::Signed {
            return Ok(());
        }
        let mut len = [0u8; 4];
        self.inner.read_exact(&mut len).await.map_err(|_| ReplicationError::Truncated)?;
        let len = u32::from_be_bytes(len) as usize;
        if len > MAX_SIGNATURE_LEN {
            return Err(ReplicationError::Compromised(format!("signature of {len} bytes")));
        }
        let mut record = vec![0u8; len];
        self.inner.read_exact(&mut record).await.map_err(|_| ReplicationError::Truncated)?;
        self.blocks += 1;

        let Some(verifier) = &self.verifier else {
            trace!(block = self.blocks, "skipping unverified block signature");
            return Ok(());
        };
        let mut record = Bytes::from(record);
        let alg_name = String::decode(&mut record)?;
        let signature = read_byte_array(&mut record)?;
        let alg = SignatureAlgorithm::from_name(&alg_name)
            .map_err(|e| ReplicationError::Compromised(e.to_string()))?;
        if let Err(e) = verifier.key.verify(
            alg,
            &digest,
            &signature,
            verifier.identity.handle.as_bytes(),
        ) {
            warn!(block = self.blocks, signer = %verifier.identity, "block signature rejected");
            return Err(ReplicationError::Compromised(format!(
                "block {} signature: {e}",
                self.blocks
            )));
        }
        trace!(block = self.blocks, "verified stream block");
        Ok(())
    }

    /// Blocks verified (or skipped) so far.
    pub fn blocks(&self) -> u64 {
        self.blocks
    }
}

/// Records signed together in one block.
pub const RECORDS_PER_BLOCK: usize = 64;

/// A record carried on a signed stream: a type byte and a length-prefixed
/// body.
pub trait StreamRecord: Sized {
    /// Type byte.
    fn tag(&self) -> u8;

    /// Encodes the body.
    fn encode_body(&self, buf: &mut BytesMut);

    /// Decodes a body of type `tag`.
    fn decode_body(tag: u8, body: Bytes) -> ReplicationResult<Self>;

    /// True for the terminator record.
    fn is_end(&self) -> bool;
}

/// Writes records, ending a block every [`RECORDS_PER_BLOCK`] records and
/// after the terminator.
pub struct RecordWriter<W> {
    out: SignedWriter<W>,
    in_block: usize,
    written: u64,
}

impl<W: AsyncWrite + Unpin> RecordWriter<W> {
    /// Writes records onto `out`.
    pub fn new(out: SignedWriter<W>) -> Self {
        Self {
            out,
            in_block: 0,
            written: 0,
        }
    }

    /// Writes one record.
    pub async fn write<T: StreamRecord>(&mut self, record: &T) -> ReplicationResult<()> {
        let mut body = BytesMut::new();
        record.encode_body(&mut body);
        let mut framed = BytesMut::with_capacity(body.len() + 5);
        framed.put_u8(record.tag());
        write_byte_array(&mut framed, &body);
        self.out.write_all(&framed).await?;
        self.written += 1;
        self.in_block += 1;
        if self.in_block == RECORDS_PER_BLOCK || record.is_end() {
            self.out.sign_block().await?;
            self.in_block = 0;
        }
        if record.is_end() {
            self.out.flush().await?;
        }
        Ok(())
    }

    /// Records written.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Returns the signed writer.
    pub fn into_inner(self) -> SignedWriter<W> {
        self.out
    }
}

/// Reads records written by a [`RecordWriter`].
pub struct RecordReader<R> {
    input: SignedReader<R>,
    in_block: usize,
    done: bool,
}

impl<R: AsyncRead + Unpin> RecordReader<R> {
    /// Reads records from `input`.
    pub fn new(input: SignedReader<R>) -> Self {
        Self {
            input,
            in_block: 0,
            done: false,
        }
    }

    /// Next record. After the terminator, fails with
    /// [`ReplicationError::Truncated`].
    pub async fn next<T: StreamRecord>(&mut self) -> ReplicationResult<T> {
        if self.done {
            return Err(ReplicationError::Truncated);
        }
        let tag = self.input.read_u8().await?;
        let body = self.input.read_field().await?;
        let record = T::decode_body(tag, body)?;
        self.in_block += 1;
        if self.in_block == RECORDS_PER_BLOCK || record.is_end() {
            self.input.verify_block().await?;
            self.in_block = 0;
        }
        self.done = record.is_end();
        Ok(record)
    }
}
