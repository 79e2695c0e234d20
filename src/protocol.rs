//! Wire format shared by server and client.
//!
//! All integers are big-endian. Strings are a `u16` byte length followed by
//! UTF-8 bytes.
//!
//! ```text
//! request:  [u8 opcode=123][str repository][u32 n] n x [i32 iteration][str source][str target][str conflict]
//! response: [u32 n] n x [u8 linked][i32 iteration_hint]
//! ```
//!
//! An empty conflict string encodes "no conflict".

use crate::model::{ClaimRequest, ClaimResponse};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Opcode of a claim batch frame.
pub const OP_CLAIM_BATCH: u8 = 123;

/// Largest number of requests accepted in one batch.
pub const MAX_BATCH_SIZE: u32 = 1_000_000;

/// Handshake status byte: authenticated.
pub const AUTH_OK: u8 = 1;
/// Handshake status byte: rejected, the server closes the connection.
pub const AUTH_REJECTED: u8 = 2;

// Upper bound on speculative preallocation while decoding a batch.
const PREALLOCATE_LIMIT: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown opcode {0}")]
    UnknownOpcode(u8),
    #[error("batch of {0} entries exceeds the limit of 1000000")]
    BatchTooLarge(u32),
    #[error("negative iteration {0}")]
    NegativeIteration(i32),
    #[error("iteration {0} does not fit in a signed 32-bit field")]
    IterationOverflow(u32),
    #[error("string of {0} bytes exceeds the 65535 byte limit")]
    StringTooLong(usize),
    #[error("invalid UTF-8 in string field")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    #[error("invalid linked flag {0}")]
    InvalidFlag(u8),
    #[error("unexpected handshake status {0}")]
    UnexpectedStatus(u8),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A decoded claim batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimBatch {
    pub repository: String,
    pub requests: Vec<ClaimRequest>,
}

pub fn encode_string(buf: &mut Vec<u8>, value: &str) -> Result<(), ProtocolError> {
    let len = u16::try_from(value.len()).map_err(|_| ProtocolError::StringTooLong(value.len()))?;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(value.as_bytes());
    Ok(())
}

pub async fn read_string<R>(reader: &mut R) -> Result<String, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u16().await? as usize;
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes).await?;
    Ok(String::from_utf8(bytes)?)
}

pub async fn write_string<W>(writer: &mut W, value: &str) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(2 + value.len());
    encode_string(&mut buf, value)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Encode a full request frame, opcode included.
pub fn encode_batch_request(
    repository: &str,
    requests: &[ClaimRequest],
) -> Result<Vec<u8>, ProtocolError> {
    let count = u32::try_from(requests.len())
        .ok()
        .filter(|count| *count <= MAX_BATCH_SIZE)
        .ok_or(ProtocolError::BatchTooLarge(
            requests.len().min(u32::MAX as usize) as u32,
        ))?;

    let mut buf = Vec::with_capacity(64 + requests.len() * 48);
    buf.push(OP_CLAIM_BATCH);
    encode_string(&mut buf, repository)?;
    buf.extend_from_slice(&count.to_be_bytes());
    for request in requests {
        let iteration = i32::try_from(request.iteration)
            .map_err(|_| ProtocolError::IterationOverflow(request.iteration))?;
        buf.extend_from_slice(&iteration.to_be_bytes());
        encode_string(&mut buf, &request.source)?;
        encode_string(&mut buf, &request.target)?;
        encode_string(&mut buf, request.conflict.as_deref().unwrap_or(""))?;
    }
    Ok(buf)
}

/// Read the opcode that starts the next frame. `None` means the peer closed
/// the connection cleanly between frames.
pub async fn read_opcode<R>(reader: &mut R) -> Result<Option<u8>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    match reader.read_u8().await {
        Ok(opcode) => Ok(Some(opcode)),
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Decode the remainder of a frame whose opcode has been read.
pub async fn read_batch_body<R>(reader: &mut R, opcode: u8) -> Result<ClaimBatch, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    if opcode != OP_CLAIM_BATCH {
        return Err(ProtocolError::UnknownOpcode(opcode));
    }
    let repository = read_string(reader).await?;
    let count = read_batch_count(reader).await?;

    let mut requests = Vec::with_capacity(count.min(PREALLOCATE_LIMIT));
    for _ in 0..count {
        let raw_iteration = reader.read_i32().await?;
        let iteration = u32::try_from(raw_iteration)
            .map_err(|_| ProtocolError::NegativeIteration(raw_iteration))?;
        let source = read_string(reader).await?;
        let target = read_string(reader).await?;
        let conflict = read_string(reader).await?;
        requests.push(ClaimRequest {
            source,
            target,
            conflict: (!conflict.is_empty()).then_some(conflict),
            iteration,
        });
    }
    Ok(ClaimBatch {
        repository,
        requests,
    })
}

pub fn encode_batch_response(responses: &[ClaimResponse]) -> Result<Vec<u8>, ProtocolError> {
    let count = u32::try_from(responses.len())
        .map_err(|_| ProtocolError::BatchTooLarge(u32::MAX))?;
    let mut buf = Vec::with_capacity(4 + responses.len() * 5);
    buf.extend_from_slice(&count.to_be_bytes());
    for response in responses {
        buf.push(u8::from(response.is_linked()));
        buf.extend_from_slice(&response.iteration_hint().to_be_bytes());
    }
    Ok(buf)
}

pub async fn read_batch_response<R>(reader: &mut R) -> Result<Vec<ClaimResponse>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let count = read_batch_count(reader).await?;
    let mut responses = Vec::with_capacity(count.min(PREALLOCATE_LIMIT));
    for _ in 0..count {
        let linked = match reader.read_u8().await? {
            0 => false,
            1 => true,
            other => return Err(ProtocolError::InvalidFlag(other)),
        };
        let hint = reader.read_i32().await?;
        responses.push(ClaimResponse::from_wire(linked, hint));
    }
    Ok(responses)
}

async fn read_batch_count<R>(reader: &mut R) -> Result<usize, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let count = reader.read_u32().await?;
    if count > MAX_BATCH_SIZE {
        return Err(ProtocolError::BatchTooLarge(count));
    }
    Ok(count as usize)
}
