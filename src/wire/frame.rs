use byteorder::{ByteOrder, LittleEndian};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{tag::Tag, Buffer};
use crate::{
    error::{Error, Result},
    net::ParticipantId,
};

/// Upper bound on a single frame's payload.
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// tag (1) | source (4) | len (4)
const HEADER_LEN: usize = 1 + 4 + 4;

/// A tagged message addressed from one participant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub tag: Tag,
    pub source: ParticipantId,
    pub buf: Buffer,
}

impl Envelope {
    pub fn new(tag: Tag, source: ParticipantId, buf: Buffer) -> Self {
        Self { tag, source, buf }
    }
}

/// Writes `env` as a single length-prefixed frame.
pub async fn write_frame<W>(stream: &mut W, env: &Envelope) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = env.buf.len();
    if len as u64 > u64::from(MAX_FRAME_LEN) {
        return Err(Error::FrameTooLarge(len as u64));
    }
    let mut frame = vec![0u8; HEADER_LEN + len];
    frame[0] = env.tag.byte();
    LittleEndian::write_u32(&mut frame[1..5], env.source);
    LittleEndian::write_u32(&mut frame[5..HEADER_LEN], len as u32);
    frame[HEADER_LEN..].copy_from_slice(&env.buf);
    stream.write_all(&frame).await?;
    Ok(())
}

/// Reads the next frame. A peer that closed its end between frames yields
/// `Ok(None)`.
pub async fn read_frame<R>(stream: &mut R) -> Result<Option<Envelope>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    match stream.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Ok(None)
        }
        Err(e) => return Err(e.into()),
    }

    let tag = Tag::try_from(header[0])?;
    let source = LittleEndian::read_u32(&header[1..5]);
    let len = LittleEndian::read_u32(&header[5..]);
    if len > MAX_FRAME_LEN {
        return Err(Error::FrameTooLarge(u64::from(len)));
    }

    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    Ok(Some(Envelope::new(tag, source, Buffer::from(buf))))
}
