//! Core codec traits

use crate::error::Error;
use bytes::{Buf, BufMut};

/// Trait for types that can be written (encoded) as a single token.
///
/// The terminating NUL is not part of the token: it is appended by the
/// [RecordBuffer](crate::RecordBuffer).
pub trait Write {
    /// Encodes this value by writing to a buffer.
    ///
    /// Implementations should panic if the buffer doesn't have enough capacity.
    fn write(&self, buf: &mut impl BufMut);
}

/// Trait for types that know the length of their token.
pub trait Encode: Write {
    /// Returns the encoded length of this value (excluding the terminating NUL).
    ///
    /// This method MUST return the exact number of bytes that will be written by `write()`.
    fn len_encoded(&self) -> usize;
}

/// Trait for types that can be read back from a single token.
pub trait Read: Sized {
    /// Reads a value from `buf`, which holds exactly one token (without its terminating NUL).
    ///
    /// Implementations must consume the whole token.
    fn read(buf: &mut impl Buf) -> Result<Self, Error>;
}

impl<T: Write + ?Sized> Write for &T {
    #[inline]
    fn write(&self, buf: &mut impl BufMut) {
        (**self).write(buf)
    }
}

impl<T: Encode + ?Sized> Encode for &T {
    #[inline]
    fn len_encoded(&self) -> usize {
        (**self).len_encoded()
    }
}
