//! The wire codec.
//!
//! Values are packed as an untyped, ordered concatenation of little-endian
//! primitives. Strings, double vectors and blobs carry a `u32` length prefix;
//! nothing else is tagged, so whoever unpacks a buffer has to read it back in
//! exactly the order and types it was packed in. The codec only guarantees
//! that a bad read can never run off the end of a buffer.

pub mod frame;
pub mod tag;

use std::{fmt, ops::Deref, sync::Arc};

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

use crate::error::{Error, Result};

/// An immutable packed message.
///
/// Cloning a buffer adds a holder rather than copying the bytes, which is how
/// a buffer is handed between the client, the transport and the board. The
/// bytes are freed once the last holder drops it.
#[derive(Clone, PartialEq, Eq)]
pub struct Buffer(Arc<[u8]>);

impl Buffer {
    pub fn empty() -> Self {
        Self::from(Vec::new())
    }

    /// Number of live holders of these bytes.
    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(bytes: Vec<u8>) -> Self {
        Self(Arc::from(bytes))
    }
}

impl From<&[u8]> for Buffer {
    fn from(bytes: &[u8]) -> Self {
        Self(Arc::from(bytes))
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Buffer({} bytes, {} holders)", self.len(), self.holders())
    }
}

/// Builds a [`Buffer`] one primitive at a time.
///
/// Length prefixes are `u32`, so a single string, vector or blob must stay
/// under 4 GiB. Frames are capped well below that anyway.
#[derive(Default)]
pub struct Packer {
    buf: Vec<u8>,
}

impl Packer {
    /// Starts a fresh buffer.
    pub fn begin() -> Self {
        Self::default()
    }

    pub fn int(&mut self, value: i64) -> &mut Self {
        // writing into a Vec cannot fail
        let _ = self.buf.write_i64::<LittleEndian>(value);
        self
    }

    pub fn double(&mut self, value: f64) -> &mut Self {
        let _ = self.buf.write_f64::<LittleEndian>(value);
        self
    }

    pub fn doubles(&mut self, values: &[f64]) -> &mut Self {
        self.len(values.len());
        for value in values {
            self.double(*value);
        }
        self
    }

    pub fn string(&mut self, value: &str) -> &mut Self {
        self.blob(value.as_bytes())
    }

    pub fn blob(&mut self, value: &[u8]) -> &mut Self {
        self.len(value.len());
        self.buf.extend_from_slice(value);
        self
    }

    fn len(&mut self, len: usize) {
        debug_assert!(
            u32::try_from(len).is_ok(),
            "length {len} does not fit a u32 prefix"
        );
        let _ = self.buf.write_u32::<LittleEndian>(len as u32);
    }

    /// Finalizes the buffer.
    pub fn finish(self) -> Buffer {
        Buffer::from(self.buf)
    }
}

/// A read cursor over a [`Buffer`].
pub struct Unpacker<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Unpacker<'a> {
    /// Positions a cursor at the start of `buf`.
    pub fn begin(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or(Error::Decode { what })?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn len(&mut self, what: &'static str) -> Result<usize> {
        Ok(LittleEndian::read_u32(self.take(4, what)?) as usize)
    }

    pub fn int(&mut self) -> Result<i64> {
        Ok(LittleEndian::read_i64(self.take(8, "int")?))
    }

    pub fn double(&mut self) -> Result<f64> {
        Ok(LittleEndian::read_f64(self.take(8, "double")?))
    }

    pub fn doubles(&mut self) -> Result<Vec<f64>> {
        let n = self.len("double vector")?;
        let bytes = self.take(
            n.checked_mul(8).ok_or(Error::Decode {
                what: "double vector",
            })?,
            "double vector",
        )?;
        Ok(bytes.chunks_exact(8).map(LittleEndian::read_f64).collect())
    }

    pub fn string(&mut self) -> Result<String> {
        let n = self.len("string")?;
        let bytes = self.take(n, "string")?;
        String::from_utf8(bytes.to_vec()).map_err(|_| Error::Decode {
            what: "string",
        })
    }

    pub fn blob(&mut self) -> Result<Vec<u8>> {
        let n = self.len("blob")?;
        Ok(self.take(n, "blob")?.to_vec())
    }

    /// Bytes not yet read.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}
