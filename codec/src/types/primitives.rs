//! Codec implementations for Rust integer types.
//!
//! Integers are written as ASCII decimal with a leading `-` for negative values and no padding,
//! so the token for `0` is a single `'0'` byte. Reading accepts exactly that grammar and rejects
//! values that do not fit the target type.

use crate::{Encode, Error, Read, Write};
use bytes::{Buf, BufMut};

/// Maximum number of decimal digits of any supported integer.
const MAX_DIGITS: usize = 10;

/// Parses a complete decimal token.
fn read_decimal(buf: &mut impl Buf) -> Result<i64, Error> {
    if !buf.has_remaining() {
        return Err(Error::EmptyToken);
    }
    let negative = buf.chunk()[0] == b'-';
    if negative {
        buf.advance(1);
        if !buf.has_remaining() {
            return Err(Error::InvalidDigit(b'-'));
        }
    }

    let mut value: i64 = 0;
    while buf.has_remaining() {
        let byte = buf.get_u8();
        if !byte.is_ascii_digit() {
            return Err(Error::InvalidDigit(byte));
        }
        value = value
            .checked_mul(10)
            .and_then(|value| value.checked_add(i64::from(byte - b'0')))
            .ok_or(Error::NumberOutOfRange)?;
    }
    Ok(if negative { -value } else { value })
}

macro_rules! impl_decimal {
    ($type:ty) => {
        impl Write for $type {
            #[inline]
            fn write(&self, buf: &mut impl BufMut) {
                let value = i64::from(*self);
                let mut magnitude = value.unsigned_abs();
                let mut digits = [0u8; MAX_DIGITS];
                let mut start = MAX_DIGITS;
                loop {
                    start -= 1;
                    digits[start] = b'0' + (magnitude % 10) as u8;
                    magnitude /= 10;
                    if magnitude == 0 {
                        break;
                    }
                }
                if value < 0 {
                    buf.put_u8(b'-');
                }
                buf.put_slice(&digits[start..]);
            }
        }

        impl Encode for $type {
            #[inline]
            fn len_encoded(&self) -> usize {
                let value = i64::from(*self);
                let mut magnitude = value.unsigned_abs();
                let mut len = 1;
                while magnitude >= 10 {
                    magnitude /= 10;
                    len += 1;
                }
                len + usize::from(value < 0)
            }
        }

        impl Read for $type {
            #[inline]
            fn read(buf: &mut impl Buf) -> Result<Self, Error> {
                let value = read_decimal(buf)?;
                <$type>::try_from(value).map_err(|_| Error::NumberOutOfRange)
            }
        }
    };
}

impl_decimal!(u8);
impl_decimal!(u16);
impl_decimal!(u32);
impl_decimal!(i16);
impl_decimal!(i32);
