//! Serialize records as NUL-terminated ASCII tokens.
//!
//! # Overview
//!
//! Records persisted by the trace store are not packed binary structures. Every field is written
//! as a decimal (or verbatim ASCII) token terminated by a NUL byte at a fixed offset inside a
//! small staging area, the [RecordBuffer]. This keeps a raw card image readable with nothing more
//! than a hex dump.
//!
//! ```text
//! +---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+
//! | 4 |\0 | 1 | 2 |\0 |   | - | 1 | 7 |\0 |   |   |   |   |   |...|
//! +---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+
//! | type  | entry id      | x offset                             ...
//! ```
//!
//! Any unused byte (including the tail of the sector beyond the populated length) is zero. The
//! read side relies on this to recover the populated length of a sector (see
//! [RecordBuffer::from_sector]).
//!
//! # Supported Types
//!
//! Natively supports `u8`, `u16`, `u32`, `i16`, `i32` (ASCII decimal, optional leading `-`) and
//! `str`/`String` (verbatim ASCII without NUL bytes). Other types can be stored by implementing
//! [Write], [Encode] and [Read].
//!
//! # Example
//!
//! ```
//! use quadtrail_codec::RecordBuffer;
//!
//! let mut buffer = RecordBuffer::new();
//! buffer.put(&4u8, 0).unwrap();
//! buffer.put(&-17i32, 6).unwrap();
//! assert_eq!(buffer.len(), 10);
//!
//! assert_eq!(buffer.get::<u8>(0).unwrap(), 4);
//! assert_eq!(buffer.get::<i32>(6).unwrap(), -17);
//! assert!(buffer.is_blank(2));
//! ```

pub mod buffer;
pub mod codec;
pub mod error;
pub mod types;

pub use buffer::{RecordBuffer, SECTOR_SIZE};
pub use codec::{Encode, Read, Write};
pub use error::Error;
