//! Codec implementations for ASCII strings.
//!
//! Strings are written verbatim. A string containing a NUL byte (or any non-ASCII byte) cannot be
//! represented as a token: [RecordBuffer::put](crate::RecordBuffer::put) rejects it.

use crate::{Encode, Error, Read, Write};
use bytes::{Buf, BufMut};

impl Write for str {
    #[inline]
    fn write(&self, buf: &mut impl BufMut) {
        buf.put_slice(self.as_bytes());
    }
}

impl Encode for str {
    #[inline]
    fn len_encoded(&self) -> usize {
        self.len()
    }
}

impl Write for String {
    #[inline]
    fn write(&self, buf: &mut impl BufMut) {
        self.as_str().write(buf);
    }
}

impl Encode for String {
    #[inline]
    fn len_encoded(&self) -> usize {
        self.len()
    }
}

impl Read for String {
    fn read(buf: &mut impl Buf) -> Result<Self, Error> {
        let mut bytes = vec![0u8; buf.remaining()];
        buf.copy_to_slice(&mut bytes);
        if !is_token(&bytes) {
            return Err(Error::InvalidToken);
        }
        String::from_utf8(bytes).map_err(|_| Error::InvalidToken)
    }
}

/// Returns true if `bytes` can be stored as a single token.
pub(crate) fn is_token(bytes: &[u8]) -> bool {
    bytes.iter().all(|byte| byte.is_ascii() && *byte != 0)
}
