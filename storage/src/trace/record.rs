//! Records persisted by the trace store.

use super::{
    layout::{self, manifest, node, router, signature, DataType, ROUTER_SLOTS, TYPE},
    Error, Quadrant,
};
use crate::fix::{Point, UtcDate, UtcTime};
use quadtrail_codec::RecordBuffer;

/// Read the type token of a record.
fn data_type(buffer: &RecordBuffer, sector: u32) -> Result<DataType, Error> {
    let token: u8 = TYPE.get(buffer)?;
    DataType::try_from(token).map_err(|found| Error::UnexpectedRecord { sector, found })
}

/// Build a record starting with the type token of `kind`.
fn start(kind: DataType) -> Result<RecordBuffer, Error> {
    let mut buffer = RecordBuffer::new();
    TYPE.put(&mut buffer, &(kind as u8))?;
    Ok(buffer)
}

/// Write the card signature.
pub fn encode_signature() -> Result<RecordBuffer, Error> {
    let mut buffer = start(DataType::Signature)?;
    signature::MAGIC.put(&mut buffer, layout::SIGNATURE_MAGIC)?;
    Ok(buffer)
}

/// Returns true if `buffer` holds the card signature.
pub fn is_signature(buffer: &RecordBuffer) -> bool {
    matches!(data_type(buffer, layout::SIGNATURE_SECTOR), Ok(DataType::Signature))
        && signature::MAGIC.get::<String>(buffer).ok().as_deref()
            == Some(layout::SIGNATURE_MAGIC)
}

/// Kind of session recorded in the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// A trail indexed by quadrant.
    Trace,
    /// A standalone marked coordinate.
    Singular,
}

impl SessionKind {
    fn data_type(self) -> DataType {
        match self {
            SessionKind::Trace => DataType::Trace,
            SessionKind::Singular => DataType::Singular,
        }
    }
}

/// One session in the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManifestEntry {
    pub kind: SessionKind,
    /// First sector of the session's node log (just past its router grid).
    pub start: u32,
}

impl ManifestEntry {
    pub fn encode(&self) -> Result<RecordBuffer, Error> {
        let mut buffer = start(self.kind.data_type())?;
        manifest::START.put(&mut buffer, &self.start)?;
        Ok(buffer)
    }

    pub fn decode(buffer: &RecordBuffer, sector: u32) -> Result<Self, Error> {
        let kind = match data_type(buffer, sector)? {
            DataType::Trace => SessionKind::Trace,
            DataType::Singular => SessionKind::Singular,
            other => {
                return Err(Error::UnexpectedRecord {
                    sector,
                    found: other as u8,
                })
            }
        };
        let start = manifest::START.get(buffer)?;
        Ok(Self { kind, start })
    }
}

/// Index of the runs written while inside one quadrant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Router {
    /// Manifest entry of the session that created the router.
    pub entry: u16,
    addresses: Vec<u32>,
}

impl Router {
    /// A router whose first run starts at `address`.
    pub fn new(entry: u16, address: u32) -> Self {
        Self {
            entry,
            addresses: vec![address],
        }
    }

    /// First sector of every run, oldest first.
    pub fn addresses(&self) -> &[u32] {
        &self.addresses
    }

    /// Append the first sector of a new run. Returns false if every slot is taken.
    pub fn push(&mut self, address: u32) -> bool {
        if self.addresses.len() >= ROUTER_SLOTS {
            return false;
        }
        self.addresses.push(address);
        true
    }

    pub fn encode(&self) -> Result<RecordBuffer, Error> {
        let mut buffer = start(DataType::Router)?;
        router::ENTRY.put(&mut buffer, &self.entry)?;
        for (i, address) in self.addresses.iter().enumerate() {
            router::address(i).put(&mut buffer, address)?;
        }
        Ok(buffer)
    }

    /// Decode a router. The address list ends at the first blank (or zero) slot.
    pub fn decode(buffer: &RecordBuffer, sector: u32) -> Result<Self, Error> {
        match data_type(buffer, sector)? {
            DataType::Router => {}
            other => {
                return Err(Error::UnexpectedRecord {
                    sector,
                    found: other as u8,
                })
            }
        }
        let entry = router::ENTRY.get(buffer)?;
        let mut addresses = Vec::with_capacity(ROUTER_SLOTS);
        for i in 0..ROUTER_SLOTS {
            let field = router::address(i);
            if field.is_blank(buffer) {
                break;
            }
            let address: u32 = field.get(buffer)?;
            if address == 0 {
                break;
            }
            addresses.push(address);
        }
        Ok(Self { entry, addresses })
    }
}

/// Kind of a node record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// An ordinary fix, relative to the quadrant reference.
    Normal,
    /// A checkpoint, relative to the quadrant reference.
    Super,
    /// First node of a session, absolute.
    Origin,
    /// First node of a quadrant other than the origin, absolute.
    Reference,
}

impl NodeKind {
    /// Returns true if the node stores its absolute position (rather than an offset).
    pub fn is_absolute(&self) -> bool {
        matches!(self, NodeKind::Origin | NodeKind::Reference)
    }

    fn data_type(self) -> DataType {
        match self {
            NodeKind::Normal => DataType::Normal,
            NodeKind::Super => DataType::Super,
            NodeKind::Origin => DataType::Origin,
            NodeKind::Reference => DataType::Reference,
        }
    }
}

/// A single logged position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Node {
    pub kind: NodeKind,
    pub entry: u16,
    /// As stored: the absolute position for [NodeKind::is_absolute] kinds, `reference - position`
    /// otherwise.
    pub coordinates: Point,
    pub time: UtcTime,
    pub date: UtcDate,
    pub quadrant: Quadrant,
}

impl Node {
    /// Absolute position of the node, given the reference point of its quadrant. Returns `None`
    /// if the position cannot be represented.
    pub fn position(&self, reference: Point) -> Option<Point> {
        if self.kind.is_absolute() {
            Some(self.coordinates)
        } else {
            reference.checked_sub(self.coordinates)
        }
    }

    pub fn encode(&self) -> Result<RecordBuffer, Error> {
        let mut buffer = start(self.kind.data_type())?;
        node::ENTRY.put(&mut buffer, &self.entry)?;
        node::X.put(&mut buffer, &self.coordinates.x)?;
        node::Y.put(&mut buffer, &self.coordinates.y)?;
        node::TIME.put(&mut buffer, &self.time)?;
        node::DATE.put(&mut buffer, &self.date)?;
        node::QX.put(&mut buffer, &self.quadrant.x)?;
        node::QY.put(&mut buffer, &self.quadrant.y)?;
        Ok(buffer)
    }

    pub fn decode(buffer: &RecordBuffer, sector: u32) -> Result<Self, Error> {
        let kind = match data_type(buffer, sector)? {
            DataType::Normal => NodeKind::Normal,
            DataType::Super => NodeKind::Super,
            DataType::Origin => NodeKind::Origin,
            DataType::Reference => NodeKind::Reference,
            other => {
                return Err(Error::UnexpectedRecord {
                    sector,
                    found: other as u8,
                })
            }
        };
        Ok(Self {
            kind,
            entry: node::ENTRY.get(buffer)?,
            coordinates: Point::new(node::X.get(buffer)?, node::Y.get(buffer)?),
            time: node::TIME.get(buffer)?,
            date: node::DATE.get(buffer)?,
            quadrant: Quadrant::new(node::QX.get(buffer)?, node::QY.get(buffer)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quadtrail_codec::Error as CodecError;

    fn node(kind: NodeKind) -> Node {
        Node {
            kind,
            entry: 12,
            coordinates: Point::new(-17, 2_500_000),
            time: UtcTime::new(23, 1, 9).unwrap(),
            date: UtcDate::new(1, 2, 3).unwrap(),
            quadrant: Quadrant::new(-16, 15),
        }
    }

    #[test]
    fn test_node_layout() {
        let buffer = node(NodeKind::Normal).encode().unwrap();
        let mut expected = [0u8; 56];
        expected[..2].copy_from_slice(b"4\0");
        expected[2..5].copy_from_slice(b"12\0");
        expected[6..10].copy_from_slice(b"-17\0");
        expected[18..26].copy_from_slice(b"2500000\0");
        expected[30..39].copy_from_slice(b"23:01:09\0");
        expected[39..48].copy_from_slice(b"01/02/03\0");
        expected[48..52].copy_from_slice(b"-16\0");
        expected[52..55].copy_from_slice(b"15\0");
        assert_eq!(buffer.as_slice(), &expected[..55]);

        let decoded = Node::decode(&buffer, 300).unwrap();
        assert_eq!(decoded, node(NodeKind::Normal));
    }

    #[test]
    fn test_node_position() {
        let reference = Point::new(128, 0);
        let mut normal = node(NodeKind::Super);
        normal.coordinates = Point::new(58, -3);
        assert_eq!(normal.position(reference), Some(Point::new(70, 3)));

        let mut reference_node = node(NodeKind::Reference);
        reference_node.coordinates = Point::new(40, 0);
        assert_eq!(reference_node.position(reference), Some(Point::new(40, 0)));

        normal.coordinates = Point::new(i32::MIN, 0);
        assert_eq!(normal.position(reference), None);
    }

    #[test]
    fn test_node_rejects_other_records() {
        let buffer = ManifestEntry {
            kind: SessionKind::Trace,
            start: 1280,
        }
        .encode()
        .unwrap();
        assert_eq!(
            Node::decode(&buffer, 1),
            Err(Error::UnexpectedRecord {
                sector: 1,
                found: 1
            })
        );
    }

    #[test]
    fn test_manifest_layout() {
        let entry = ManifestEntry {
            kind: SessionKind::Singular,
            start: 1280,
        };
        let buffer = entry.encode().unwrap();
        assert_eq!(buffer.as_slice(), b"2\01280\0");
        assert_eq!(ManifestEntry::decode(&buffer, 3).unwrap(), entry);
    }

    #[test]
    fn test_router_slots() {
        let mut router = Router::new(3, 1280);
        for i in 1..ROUTER_SLOTS as u32 {
            assert!(router.push(1280 + i * 10));
        }
        assert!(!router.push(99_999));
        assert_eq!(router.addresses().len(), ROUTER_SLOTS);

        let buffer = router.encode().unwrap();
        assert_eq!(buffer.len(), RecordBuffer::CAPACITY - 4);
        assert_eq!(Router::decode(&buffer, 784).unwrap(), router);
    }

    #[test]
    fn test_router_address_too_wide() {
        let router = Router::new(1, 100_000_000);
        assert_eq!(
            router.encode(),
            Err(Error::Codec(CodecError::Overflow {
                offset: 6,
                len: 9,
                capacity: 9
            }))
        );
    }

    #[test]
    fn test_signature() {
        let buffer = encode_signature().unwrap();
        assert_eq!(buffer.as_slice(), b"0\0QTRL\0");
        assert!(is_signature(&buffer));
        assert!(!is_signature(&RecordBuffer::new()));

        let mut wrong = RecordBuffer::new();
        wrong.put(&0u8, 0).unwrap();
        wrong.put("QTRX", 2).unwrap();
        assert!(!is_signature(&wrong));
    }
}
