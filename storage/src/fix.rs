//! Position fixes delivered by the satellite receiver.
//!
//! The sentence parser that produces fixes lives outside this crate; it hands over a complete
//! [PositionFix] per update. [DebugGps] produces synthetic fixes when the receiver is replaced by
//! the debug source.

use bytes::{Buf, BufMut};
use quadtrail_codec::{Encode, Error as CodecError, Read, Write};

/// A position in grid units (longitude on `x`, latitude on `y`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Returns `None` if either coordinate overflows.
    pub fn checked_add(self, rhs: Point) -> Option<Point> {
        Some(Point::new(
            self.x.checked_add(rhs.x)?,
            self.y.checked_add(rhs.y)?,
        ))
    }

    /// Returns `None` if either coordinate overflows.
    pub fn checked_sub(self, rhs: Point) -> Option<Point> {
        Some(Point::new(
            self.x.checked_sub(rhs.x)?,
            self.y.checked_sub(rhs.y)?,
        ))
    }
}

/// Validity reported by the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Valid,
    Invalid,
}

/// Parse two ASCII digits.
fn two_digits(buf: &mut impl Buf) -> Result<u8, CodecError> {
    let mut value = 0;
    for _ in 0..2 {
        let byte = buf.get_u8();
        if !byte.is_ascii_digit() {
            return Err(CodecError::InvalidDigit(byte));
        }
        value = value * 10 + (byte - b'0');
    }
    Ok(value)
}

/// Parse three two-digit groups separated by `separator`.
fn triple(buf: &mut impl Buf, separator: u8) -> Result<[u8; 3], CodecError> {
    if buf.remaining() != 8 {
        return Err(CodecError::InvalidLength {
            expected: 8,
            found: buf.remaining(),
        });
    }
    let first = two_digits(buf)?;
    let mut rest = [0u8; 2];
    for value in rest.iter_mut() {
        let byte = buf.get_u8();
        if byte != separator {
            return Err(CodecError::InvalidDigit(byte));
        }
        *value = two_digits(buf)?;
    }
    Ok([first, rest[0], rest[1]])
}

fn write_triple(buf: &mut impl BufMut, values: [u8; 3], separator: u8) {
    for (i, value) in values.into_iter().enumerate() {
        if i > 0 {
            buf.put_u8(separator);
        }
        buf.put_u8(b'0' + value / 10);
        buf.put_u8(b'0' + value % 10);
    }
}

/// UTC time of day, stored as `HH:MM:SS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct UtcTime {
    hour: u8,
    minute: u8,
    second: u8,
}

impl UtcTime {
    /// Returns `None` if any component is out of range.
    pub fn new(hour: u8, minute: u8, second: u8) -> Option<Self> {
        if hour > 23 || minute > 59 || second > 59 {
            return None;
        }
        Some(Self {
            hour,
            minute,
            second,
        })
    }

    pub fn hour(&self) -> u8 {
        self.hour
    }

    pub fn minute(&self) -> u8 {
        self.minute
    }

    pub fn second(&self) -> u8 {
        self.second
    }

    /// Advance by one second, wrapping at midnight. Returns true if the day rolled over.
    pub fn tick(&mut self) -> bool {
        self.second += 1;
        if self.second < 60 {
            return false;
        }
        self.second = 0;
        self.minute += 1;
        if self.minute < 60 {
            return false;
        }
        self.minute = 0;
        self.hour += 1;
        if self.hour < 24 {
            return false;
        }
        self.hour = 0;
        true
    }
}

impl Write for UtcTime {
    fn write(&self, buf: &mut impl BufMut) {
        write_triple(buf, [self.hour, self.minute, self.second], b':');
    }
}

impl Encode for UtcTime {
    fn len_encoded(&self) -> usize {
        8
    }
}

impl Read for UtcTime {
    fn read(buf: &mut impl Buf) -> Result<Self, CodecError> {
        let [hour, minute, second] = triple(buf, b':')?;
        Self::new(hour, minute, second).ok_or(CodecError::NumberOutOfRange)
    }
}

/// UTC calendar date, stored as `DD/MM/YY`.
///
/// A receiver without a fix (and the debug source before it is set) reports `00/00/00`, so zero
/// day and month are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct UtcDate {
    day: u8,
    month: u8,
    year: u8,
}

impl UtcDate {
    /// Returns `None` if any component is out of range.
    pub fn new(day: u8, month: u8, year: u8) -> Option<Self> {
        if day > 31 || month > 12 || year > 99 {
            return None;
        }
        Some(Self { day, month, year })
    }

    pub fn day(&self) -> u8 {
        self.day
    }

    pub fn month(&self) -> u8 {
        self.month
    }

    pub fn year(&self) -> u8 {
        self.year
    }
}

impl Write for UtcDate {
    fn write(&self, buf: &mut impl BufMut) {
        write_triple(buf, [self.day, self.month, self.year], b'/');
    }
}

impl Encode for UtcDate {
    fn len_encoded(&self) -> usize {
        8
    }
}

impl Read for UtcDate {
    fn read(buf: &mut impl Buf) -> Result<Self, CodecError> {
        let [day, month, year] = triple(buf, b'/')?;
        Self::new(day, month, year).ok_or(CodecError::NumberOutOfRange)
    }
}

/// One update from the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionFix {
    pub time: UtcTime,
    pub date: UtcDate,
    pub status: Status,
    pub position: Point,
    /// Ground speed, as reported.
    pub speed: u16,
    /// Course over ground, in degrees.
    pub course: u16,
}

impl PositionFix {
    /// A valid fix at `position` with every other field zeroed.
    pub fn at(position: Point) -> Self {
        Self {
            time: UtcTime::default(),
            date: UtcDate::default(),
            status: Status::Valid,
            position,
            speed: 0,
            course: 0,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.status == Status::Valid
    }
}

/// Synthetic fix source used in place of the receiver.
///
/// Every fix it yields is valid. Time advances only through [DebugGps::tick].
#[derive(Debug, Clone)]
pub struct DebugGps {
    fix: PositionFix,
}

impl DebugGps {
    pub fn new() -> Self {
        Self {
            fix: PositionFix::at(Point::default()),
        }
    }

    pub fn set_time(&mut self, time: UtcTime) {
        self.fix.time = time;
    }

    pub fn set_date(&mut self, date: UtcDate) {
        self.fix.date = date;
    }

    pub fn set_location(&mut self, position: Point) {
        self.fix.position = position;
    }

    /// Set the course, normalized into `[0, 360)`.
    pub fn set_course(&mut self, course: u16) {
        self.fix.course = course % 360;
    }

    /// Advance the clock by one second (the date is left unchanged at midnight).
    pub fn tick(&mut self) {
        self.fix.time.tick();
    }

    pub fn fix(&self) -> PositionFix {
        self.fix
    }
}

impl Default for DebugGps {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quadtrail_codec::RecordBuffer;
    use test_case::test_case;

    #[test]
    fn test_time_token() {
        let time = UtcTime::new(9, 5, 42).unwrap();
        let mut buffer = RecordBuffer::new();
        buffer.put(&time, 30).unwrap();
        assert_eq!(buffer.token(30).unwrap(), b"09:05:42");
        assert_eq!(buffer.get::<UtcTime>(30).unwrap(), time);
    }

    #[test]
    fn test_date_token() {
        let date = UtcDate::new(31, 12, 99).unwrap();
        let mut buffer = RecordBuffer::new();
        buffer.put(&date, 39).unwrap();
        assert_eq!(buffer.token(39).unwrap(), b"31/12/99");
        assert_eq!(buffer.get::<UtcDate>(39).unwrap(), date);
    }

    #[test_case("09:05" => CodecError::InvalidLength { expected: 8, found: 5 }; "short")]
    #[test_case("09-05-42" => CodecError::InvalidDigit(b'-'); "separator")]
    #[test_case("0x:05:42" => CodecError::InvalidDigit(b'x'); "digit")]
    #[test_case("24:00:00" => CodecError::NumberOutOfRange; "hour")]
    fn test_time_rejects(token: &str) -> CodecError {
        let mut buf = token.as_bytes();
        UtcTime::read(&mut buf).unwrap_err()
    }

    #[test]
    fn test_tick_carries() {
        let mut time = UtcTime::new(12, 59, 59).unwrap();
        assert!(!time.tick());
        assert_eq!(time, UtcTime::new(13, 0, 0).unwrap());

        let mut time = UtcTime::new(23, 59, 59).unwrap();
        assert!(time.tick());
        assert_eq!(time, UtcTime::default());
    }

    #[test]
    fn test_debug_gps() {
        let mut gps = DebugGps::new();
        let fix = gps.fix();
        assert!(fix.is_valid());
        assert_eq!(fix.position, Point::default());
        assert_eq!(fix.date, UtcDate::default());

        gps.set_time(UtcTime::new(10, 0, 58).unwrap());
        gps.set_date(UtcDate::new(4, 7, 25).unwrap());
        gps.set_location(Point::new(-120, 35));
        gps.set_course(450);
        gps.tick();
        gps.tick();

        let fix = gps.fix();
        assert_eq!(fix.time, UtcTime::new(10, 1, 0).unwrap());
        assert_eq!(fix.date.month(), 7);
        assert_eq!(fix.position, Point::new(-120, 35));
        assert_eq!(fix.course, 90);
    }

    #[test]
    fn test_point_arithmetic() {
        let reference = Point::new(128, 0);
        let position = Point::new(70, -3);
        let offset = reference.checked_sub(position).unwrap();
        assert_eq!(offset, Point::new(58, 3));
        assert_eq!(reference.checked_sub(offset), Some(position));
        assert_eq!(
            position.checked_add(Point::new(1, 1)),
            Some(Point::new(71, -2))
        );
    }

    #[test]
    fn test_point_overflow() {
        let far = Point::new(i32::MIN, 0);
        assert_eq!(Point::new(1000, 0).checked_sub(far), None);
        assert_eq!(Point::new(0, i32::MAX).checked_add(Point::new(0, 1)), None);
        assert_eq!(
            Point::new(i32::MAX, 0).checked_sub(Point::new(1, 0)),
            Some(Point::new(i32::MAX - 1, 0))
        );
    }
}
