// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! TLS-style `opaque<0..2^(8*n)-1>` vectors: big-endian length prefix
//! followed by that many bytes.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Error, ErrorKind, Read, Result, Write};

pub trait ReadLengthPrefixedBytesExt: Read {
    /// Read big-endian length-prefixed bytes from the reader.
    ///
    /// The buffer grows as data arrives, so a bogus length on a short input
    /// fails with [`ErrorKind::UnexpectedEof`] instead of allocating the
    /// claimed size up front.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::UnexpectedEof`] if the reader ends before the
    /// announced number of bytes, or any error from the underlying reader.
    ///
    /// # Panics
    ///
    /// `read_uint` requires that `1 <= nbytes <= 8`, and will panic otherwise.
    fn read_length_prefixed(&mut self, nbytes: usize) -> Result<Vec<u8>> {
        let length = self.read_uint::<BigEndian>(nbytes)?;
        let mut buffer = Vec::new();
        Read::take(&mut *self, length).read_to_end(&mut buffer)?;
        if buffer.len() as u64 != length {
            return Err(Error::new(
                ErrorKind::UnexpectedEof,
                format!("expected {length} bytes, got {}", buffer.len()),
            ));
        }
        Ok(buffer)
    }
}

impl<R: Read + ?Sized> ReadLengthPrefixedBytesExt for R {}

pub trait WriteLengthPrefixedBytesExt: Write {
    /// Write big-endian length-prefixed bytes to the writer.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidInput`] if `data` does not fit in an
    /// `nbytes` length prefix, or any error from the underlying writer.
    fn write_length_prefixed(&mut self, data: &[u8], nbytes: usize) -> Result<()> {
        let length = data.len() as u64;
        if nbytes < 8 && length >> (8 * nbytes) != 0 {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!("{length} bytes do not fit in a {nbytes}-byte length prefix"),
            ));
        }
        self.write_uint::<BigEndian>(length, nbytes)?;
        self.write_all(data)
    }
}

impl<W: Write + ?Sized> WriteLengthPrefixedBytesExt for W {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_read_short_input() {
        // Claims 0x010000 bytes but only has three.
        let mut r = Cursor::new(vec![1, 0, 0, 1, 2, 3]);
        let err = r.read_length_prefixed(3).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_write_too_long() {
        let mut w = Vec::new();
        let err = w.write_length_prefixed(&[0; 256], 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(w.is_empty());

        w.write_length_prefixed(&[9; 255], 1).unwrap();
        assert_eq!(w.len(), 256);
        assert_eq!(Cursor::new(w).read_length_prefixed(1).unwrap(), vec![9; 255]);
    }
}
