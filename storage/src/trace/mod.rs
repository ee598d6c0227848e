//! A spatially-indexed, append-only trail of position fixes on a raw block device.
//!
//! [Store] turns a stream of [position fixes](crate::fix::PositionFix) into node records written
//! at strictly increasing sectors, grouped by the quadrant of a fixed grid centered on the
//! session's first fix. Each quadrant owns a router sector listing the first sector of every run
//! of nodes written while the trail stayed inside it, so the trail around any quadrant can be
//! redrawn without scanning the log.
//!
//! # Format
//!
//! Every record is a sequence of NUL-terminated ASCII tokens at fixed offsets (see [layout]):
//!
//! ```text
//! sector 0          signature   | type | "QTRL" |
//! sectors 1..=255   manifest    | type | start  |
//! per session:
//!   router grid     router      | type | entry  | run 0 | run 1 | ... | run 7 |
//!   node log        node        | type | entry  |   x   |   y   | time | date | qx | qy |
//! ```
//!
//! Starting a session reserves `grid_cols * grid_rows` router sectors at the write cursor (the
//! "live sector") and records the first sector past them in the next manifest slot. Routers are
//! stored row-major with the origin quadrant at the grid center:
//!
//! ```text
//! sector = grid_start + (qx + grid_cols / 2) + (qy + grid_rows / 2) * grid_cols
//! ```
//!
//! _Normal and super nodes store `reference - position`, where `reference` is the center of the
//! quadrant they were written in. Origin and reference nodes store the absolute position._
//!
//! # Recording
//!
//! Each fix passed to [Store::record_fix] is either:
//!
//! * skipped (the receiver reported it invalid),
//! * coalesced (it moved less than `2 * node_size` from the last recorded position on both axes),
//! * or recorded as a node.
//!
//! Before a node is written, the position is checked against the quadrant bounds. At most one axis
//! can cross per fix (`+x`, then `-x`, then `+y`, then `-y`, first match wins). A crossing shifts
//! the reference by one pane and updates the router of the new quadrant: a fresh router starts with
//! the current live sector and is followed by an absolute node anchored at the last recorded
//! position (an origin node in the origin quadrant, a reference node elsewhere), while an existing
//! router is walked (returning its runs) and extended with a new run. The router grid is zeroed
//! when a session begins, so an empty router sector always means the quadrant was never visited.
//! Every `checkpoint_interval`-th recorded fix is written as a super node.
//!
//! # Recovery
//!
//! [Store::init] mounts a formatted device by scanning the manifest for its last entry and walking
//! that session's node log forward past its last node (skipping the empty sectors failed writes
//! leave behind, up to `recovery_gap` in a row). A device without a signature is formatted. The
//! in-memory session is never recovered: a restart always begins a new session.
//!
//! # Failures
//!
//! Device errors abort the operation in progress and are returned to the caller (and reported to
//! the [Indicator]). The sector a failed node write was aimed at is never reused. A quadrant outside
//! the grid is detected before any state changes.
//!
//! # Example
//!
//! ```rust
//! use quadtrail_sdmmc::memory;
//! use quadtrail_storage::{
//!     fix::{Point, PositionFix},
//!     trace::{Config, NodeKind, Outcome, Quadrant, Store},
//! };
//!
//! // Mount (and format) a blank device
//! let device = memory::Device::new(1 << 16);
//! let mut store = Store::init(device, Config::default(), ()).unwrap();
//!
//! // Start a trace at the origin
//! store.start_trace(&PositionFix::at(Point::new(0, 0))).unwrap();
//!
//! // Small movements are absorbed
//! let outcome = store.record_fix(&PositionFix::at(Point::new(3, 3))).unwrap();
//! assert_eq!(outcome, Outcome::Coalesced);
//!
//! // Crossing the quadrant bound moves the trail into quadrant (1, 0)
//! let outcome = store.record_fix(&PositionFix::at(Point::new(70, 0))).unwrap();
//! match outcome {
//!     Outcome::Recorded { kind, transition, .. } => {
//!         assert_eq!(kind, NodeKind::Normal);
//!         assert_eq!(transition.unwrap().quadrant, Quadrant::new(1, 0));
//!     }
//!     _ => panic!("fix not recorded"),
//! }
//! ```

pub mod layout;
pub mod record;
mod storage;

use crate::fix::Point;
use prometheus_client::registry::Registry;
pub use record::{ManifestEntry, Node, NodeKind, Router, SessionKind};
use std::sync::{Arc, Mutex};
pub use storage::Store;
use thiserror::Error;

/// Errors that can occur when interacting with [Store].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("device failure: {0}")]
    DeviceFailure(#[from] quadtrail_sdmmc::Error),
    #[error("quadrant outside router grid: ({0}, {1})")]
    GridOverflow(i16, i16),
    #[error("router full: ({0}, {1})")]
    RouterFull(i16, i16),
    #[error("manifest full")]
    ManifestFull,
    #[error("no session")]
    NoSession,
    #[error("invalid fix")]
    InvalidFix,
    #[error("codec error: {0}")]
    Codec(#[from] quadtrail_codec::Error),
    #[error("unexpected record at sector {sector}: type {found}")]
    UnexpectedRecord { sector: u32, found: u8 },
}

/// Configuration for [Store].
#[derive(Clone)]
pub struct Config {
    /// Registry for metrics.
    pub registry: Arc<Mutex<Registry>>,

    /// Number of quadrant columns in the router grid (must be even).
    pub grid_cols: u16,

    /// Number of quadrant rows in the router grid (must be even).
    pub grid_rows: u16,

    /// Width of a quadrant, in position units. A crossing is detected once the position is more
    /// than half of it away from the reference.
    pub pane_width: i32,

    /// Height of a quadrant, in position units.
    pub pane_height: i32,

    /// Fixes that moved less than twice this distance (on both axes) are coalesced.
    pub node_size: u32,

    /// Every `checkpoint_interval`-th recorded fix is written as a super node.
    pub checkpoint_interval: u32,

    /// Number of sectors of the data region zeroed by [Store::format].
    pub format_span: u32,

    /// Number of consecutive empty sectors that end a node log when mounting. Failed node writes
    /// leave empty sectors behind, so this bounds how many of them in a row can be recovered from.
    pub recovery_gap: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            grid_cols: 32,
            grid_rows: 32,
            pane_width: 128,
            pane_height: 128,
            node_size: 4,
            checkpoint_interval: 10,
            format_span: 2048,
            recovery_gap: 32,
        }
    }
}

/// A cell of the router grid, relative to the session origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Quadrant {
    pub x: i16,
    pub y: i16,
}

impl Quadrant {
    pub const ORIGIN: Quadrant = Quadrant::new(0, 0);

    pub const fn new(x: i16, y: i16) -> Self {
        Self { x, y }
    }

    pub fn is_origin(&self) -> bool {
        *self == Self::ORIGIN
    }

    fn step(self, dx: i16, dy: i16) -> Self {
        Self::new(self.x.saturating_add(dx), self.y.saturating_add(dy))
    }
}

/// What the device is being used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Idle,
    Tracing,
}

/// Persistent counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    /// Next free sector of the data region.
    pub live_sector: u32,

    /// Number of manifest slots in use.
    pub entry_count: u16,

    /// Whether fixes come from [crate::fix::DebugGps] instead of the receiver.
    pub debug_gps: bool,

    pub mode: Mode,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            live_sector: layout::DATA_SECTOR,
            entry_count: 0,
            debug_gps: false,
            mode: Mode::Idle,
        }
    }
}

/// State of the session in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Session {
    pub kind: SessionKind,
    /// Manifest slot of the session (stored in every record it writes).
    pub entry: u16,
    /// First sector of the session's router grid.
    pub grid_start: u32,
    /// Center of the current quadrant.
    pub reference: Point,
    /// Last recorded position.
    pub position: Point,
    /// Position of the last super node.
    pub checkpoint: Point,
    pub quadrant: Quadrant,
    /// Nodes recorded since the last super node.
    pub since_checkpoint: u32,
}

impl Session {
    fn new(kind: SessionKind, entry: u16, grid_start: u32, position: Point) -> Self {
        Self {
            kind,
            entry,
            grid_start,
            reference: position,
            position,
            checkpoint: position,
            quadrant: Quadrant::ORIGIN,
            since_checkpoint: 0,
        }
    }
}

/// Contiguous nodes written while inside one quadrant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Run {
    /// Sector of the first node (as listed in the router).
    pub start: u32,
    pub nodes: Vec<Node>,
}

/// A quadrant crossing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// The quadrant entered.
    pub quadrant: Quadrant,
    /// Runs previously written in the quadrant (empty on the first visit).
    pub runs: Vec<Run>,
}

/// Result of [Store::record_fix].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The fix was invalid.
    Skipped,
    /// The fix was too close to the last recorded position.
    Coalesced,
    /// The fix was written as a node.
    Recorded {
        sector: u32,
        kind: NodeKind,
        transition: Option<Transition>,
    },
}

/// Observer of storage activity (e.g. a busy icon).
pub trait Indicator {
    /// Called with `true` before a sequence of writes and `false` once it completes.
    fn set_busy(&mut self, busy: bool);

    /// Called when a sequence of writes fails.
    fn failed(&mut self, _err: &Error) {}
}

impl Indicator for () {
    fn set_busy(&mut self, _busy: bool) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fix::{PositionFix, UtcDate, UtcTime};
    use layout::{DATA_SECTOR, MANIFEST_SLOTS, ROUTER_SLOTS};
    use prometheus_client::encoding::text::encode;
    use quadtrail_codec::RecordBuffer;
    use quadtrail_macros::test_traced;
    use quadtrail_sdmmc::{memory, simulated, BlockDevice, Card, Config as CardConfig};
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use test_case::test_case;

    const CAPACITY: u32 = 1 << 16;

    /// First node sector of the first session with the default grid.
    const FIRST_NODE: u32 = DATA_SECTOR + 32 * 32;

    /// Sector of the origin router of the first session with the default grid.
    const ORIGIN_ROUTER: u32 = DATA_SECTOR + 16 + 16 * 32;

    fn fix(x: i32, y: i32) -> PositionFix {
        PositionFix::at(Point::new(x, y))
    }

    fn store() -> Store<memory::Device> {
        Store::init(memory::Device::new(CAPACITY), Config::default(), ()).unwrap()
    }

    fn node_at(store: &Store<memory::Device>, sector: u32) -> Node {
        let buffer = store.device().sector(sector).unwrap();
        Node::decode(buffer, sector).unwrap()
    }

    /// Sectors written at or past `from`, in order.
    fn writes_from(store: &Store<memory::Device>, from: u32) -> Vec<u32> {
        store
            .device()
            .writes()
            .iter()
            .copied()
            .filter(|sector| *sector >= from)
            .collect()
    }

    #[derive(Default)]
    struct Recorder {
        events: Vec<String>,
    }

    impl Indicator for Recorder {
        fn set_busy(&mut self, busy: bool) {
            self.events.push(format!("busy {busy}"));
        }

        fn failed(&mut self, err: &Error) {
            self.events.push(format!("failed {err}"));
        }
    }

    #[test_traced]
    fn test_init_formats_blank_device() {
        // Mount a blank device
        let store = store();

        // Format wiped the reserved regions and the head of the data region
        assert_eq!(store.device().erases(), &[(0, DATA_SECTOR), (DATA_SECTOR, 2048)]);
        assert_eq!(store.device().writes(), &[0]);
        assert_eq!(
            store.device().sector(0).unwrap().as_slice(),
            b"0\0QTRL\0"
        );

        // Settings are reset
        assert_eq!(store.settings(), &Settings::default());
        assert!(store.session().is_none());
    }

    #[test_traced]
    fn test_begin_session_records_twenty_five_nodes() {
        // Begin a session (manifest only)
        let mut store = store();
        store
            .begin_session(SessionKind::Trace, &fix(0, 0))
            .unwrap();
        assert_eq!(store.settings().entry_count, 1);
        assert_eq!(store.settings().live_sector, FIRST_NODE);
        assert_eq!(
            store.manifest(1).unwrap(),
            Some(ManifestEntry {
                kind: SessionKind::Trace,
                start: FIRST_NODE,
            })
        );

        // Record 25 fixes exactly one threshold apart, zigzagging inside the origin quadrant
        let mut supers = 0;
        for i in 1..=25 {
            let x = if i % 2 == 1 { 8 } else { 0 };
            match store.record_fix(&fix(x, 0)).unwrap() {
                Outcome::Recorded {
                    sector,
                    kind,
                    transition,
                } => {
                    assert_eq!(sector, FIRST_NODE + i - 1);
                    assert!(transition.is_none());
                    if kind == NodeKind::Super {
                        supers += 1;
                    }
                }
                outcome => panic!("unexpected outcome: {outcome:?}"),
            }
        }

        // Exactly 25 node sectors, 2 of them super nodes, and the grid reservation
        let nodes = writes_from(&store, FIRST_NODE);
        assert_eq!(nodes, (FIRST_NODE..FIRST_NODE + 25).collect::<Vec<_>>());
        assert_eq!(supers, 2);
        assert_eq!(node_at(&store, FIRST_NODE + 9).kind, NodeKind::Super);
        assert_eq!(node_at(&store, FIRST_NODE + 19).kind, NodeKind::Super);
        assert_eq!(store.settings().live_sector, DATA_SECTOR + 32 * 32 + 25);

        // No router was touched
        assert!(writes_from(&store, DATA_SECTOR)
            .iter()
            .all(|sector| *sector >= FIRST_NODE));
    }

    #[test_traced]
    fn test_start_trace_writes_origin() {
        let mut store = store();
        let mut start = fix(-500, 1_200);
        start.time = UtcTime::new(8, 30, 0).unwrap();
        start.date = UtcDate::new(14, 3, 24).unwrap();
        store.start_trace(&start).unwrap();
        assert_eq!(store.settings().mode, Mode::Tracing);

        // Manifest, origin router, origin node
        assert_eq!(store.device().writes(), &[0, 1, ORIGIN_ROUTER, FIRST_NODE]);
        assert_eq!(
            store.router(Quadrant::ORIGIN).unwrap(),
            Some(Router::new(1, FIRST_NODE))
        );
        let origin = node_at(&store, FIRST_NODE);
        assert_eq!(origin.kind, NodeKind::Origin);
        assert_eq!(origin.entry, 1);
        assert_eq!(origin.coordinates, Point::new(-500, 1_200));
        assert_eq!(origin.time, start.time);
        assert_eq!(origin.date, start.date);
        assert!(origin.quadrant.is_origin());

        // The session ends without touching the device
        let session = store.end_session().unwrap();
        assert_eq!(session.entry, 1);
        assert_eq!(store.settings().mode, Mode::Idle);
        assert_eq!(store.record_fix(&fix(0, 0)), Err(Error::NoSession));
        assert_eq!(store.device().writes().len(), 4);
    }

    #[test_traced]
    fn test_crossing_writes_reference_then_node() {
        let mut store = store();
        store.start_trace(&fix(0, 0)).unwrap();
        store.record_fix(&fix(40, 0)).unwrap();

        // Cross the +x bound
        let outcome = store.record_fix(&fix(70, 0)).unwrap();
        assert_eq!(
            outcome,
            Outcome::Recorded {
                sector: FIRST_NODE + 3,
                kind: NodeKind::Normal,
                transition: Some(Transition {
                    quadrant: Quadrant::new(1, 0),
                    runs: Vec::new(),
                }),
            }
        );

        // Router for the new quadrant, then the reference node, then the node for the fix
        assert_eq!(
            store.device().writes(),
            &[
                0,
                1,
                ORIGIN_ROUTER,
                FIRST_NODE,
                FIRST_NODE + 1,
                ORIGIN_ROUTER + 1,
                FIRST_NODE + 2,
                FIRST_NODE + 3,
            ]
        );
        assert_eq!(
            store.router(Quadrant::new(1, 0)).unwrap(),
            Some(Router::new(1, FIRST_NODE + 2))
        );
        let reference = node_at(&store, FIRST_NODE + 2);
        assert_eq!(reference.kind, NodeKind::Reference);
        assert_eq!(reference.coordinates, Point::new(40, 0));
        assert_eq!(reference.quadrant, Quadrant::new(1, 0));

        // The node is relative to the shifted reference
        let node = node_at(&store, FIRST_NODE + 3);
        assert_eq!(node.coordinates, Point::new(58, 0));
        assert_eq!(node.quadrant, Quadrant::new(1, 0));
        let session = store.session().unwrap();
        assert_eq!(session.reference, Point::new(128, 0));
        assert_eq!(node.position(session.reference), Some(Point::new(70, 0)));
    }

    #[test_traced]
    fn test_coalescing() {
        let mut store = store();
        store.start_trace(&fix(0, 0)).unwrap();
        let written = store.device().writes().len();

        // Movements under the threshold on both axes are absorbed
        for (x, y) in [(7, -7), (0, 7), (-7, 0), (3, 3)] {
            assert_eq!(store.record_fix(&fix(x, y)).unwrap(), Outcome::Coalesced);
        }
        assert_eq!(store.device().writes().len(), written);
        assert_eq!(store.session().unwrap().position, Point::new(0, 0));

        // Reaching the threshold on one axis is enough
        assert!(matches!(
            store.record_fix(&fix(-1, -8)).unwrap(),
            Outcome::Recorded { .. }
        ));
        assert_eq!(store.device().writes().len(), written + 1);

        // Invalid fixes are skipped
        let mut invalid = fix(500, 500);
        invalid.status = crate::fix::Status::Invalid;
        assert_eq!(store.record_fix(&invalid).unwrap(), Outcome::Skipped);
        assert_eq!(store.device().writes().len(), written + 1);
    }

    #[test_case(1; "one")]
    #[test_case(9; "nine")]
    #[test_case(10; "ten")]
    #[test_case(25; "twenty five")]
    #[test_case(31; "thirty one")]
    fn test_checkpoint_cadence(n: u32) {
        let mut store = store();
        store.start_trace(&fix(0, 0)).unwrap();
        let mut kinds = Vec::new();
        for i in 1..=n {
            let y = if i % 2 == 1 { -10 } else { 0 };
            match store.record_fix(&fix(0, y)).unwrap() {
                Outcome::Recorded { kind, .. } => kinds.push(kind),
                outcome => panic!("unexpected outcome: {outcome:?}"),
            }
        }
        let supers = kinds.iter().filter(|k| **k == NodeKind::Super).count();
        assert_eq!(supers as u32, n / 10);
        assert_eq!(kinds.len() as u32 - supers as u32, n - n / 10);
        if n >= 10 {
            assert_eq!(store.session().unwrap().checkpoint, Point::new(0, 0));
        }
    }

    #[test_traced]
    fn test_one_axis_per_fix() {
        let mut store = store();
        store.start_trace(&fix(0, 0)).unwrap();

        // A diagonal jump crosses x first
        let outcome = store.record_fix(&fix(100, 100)).unwrap();
        let Outcome::Recorded { transition, .. } = outcome else {
            panic!("fix not recorded");
        };
        assert_eq!(transition.unwrap().quadrant, Quadrant::new(1, 0));
        assert_eq!(store.session().unwrap().reference, Point::new(128, 0));

        // The pending y crossing is picked up by the next recorded fix
        store.record_fix(&fix(110, 100)).unwrap();
        let session = store.session().unwrap();
        assert_eq!(session.quadrant, Quadrant::new(1, 1));
        assert_eq!(session.reference, Point::new(128, 128));

        // Negative directions
        store.record_fix(&fix(40, 100)).unwrap();
        assert_eq!(store.session().unwrap().quadrant, Quadrant::new(0, 1));
        store.record_fix(&fix(40, 50)).unwrap();
        assert_eq!(store.session().unwrap().quadrant, Quadrant::ORIGIN);
    }

    #[test_traced]
    fn test_random_walk() {
        let mut store = store();
        store.start_trace(&fix(0, 0)).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        let mut position = Point::new(0, 0);
        for _ in 0..500 {
            position = Point::new(
                position.x + rng.gen_range(-40..=40),
                position.y + rng.gen_range(-40..=40),
            );
            let before = store.session().unwrap().quadrant;
            match store.record_fix(&fix(position.x, position.y)) {
                Ok(_) | Err(Error::RouterFull(_, _)) | Err(Error::GridOverflow(_, _)) => {}
                Err(err) => panic!("unexpected error: {err}"),
            }
            let after = store.session().unwrap().quadrant;

            // At most one axis moves, by exactly one
            let dx = (after.x - before.x).abs();
            let dy = (after.y - before.y).abs();
            assert!(dx + dy <= 1);
        }

        // Node sectors are strictly increasing
        let nodes = writes_from(&store, FIRST_NODE);
        assert!(nodes.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(
            nodes.last().copied(),
            Some(store.settings().live_sector - 1)
        );
    }

    #[test_traced]
    fn test_router_runs() {
        let mut store = store();
        store.start_trace(&fix(0, 0)).unwrap();

        // Visit quadrant (1, 0) three times
        let mut transitions = Vec::new();
        for _ in 0..3 {
            for x in [70, 90, 50] {
                if let Outcome::Recorded {
                    transition: Some(transition),
                    ..
                } = store.record_fix(&fix(x, 0)).unwrap()
                {
                    transitions.push(transition);
                }
            }
        }
        assert_eq!(transitions.len(), 6);

        // Every revisit reports the runs written before it
        let east = Quadrant::new(1, 0);
        let visits: Vec<_> = transitions.iter().filter(|t| t.quadrant == east).collect();
        assert_eq!(
            visits.iter().map(|t| t.runs.len()).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );

        // The router lists one run per visit
        let router = store.router(east).unwrap().unwrap();
        assert_eq!(
            router.addresses(),
            &[FIRST_NODE + 1, FIRST_NODE + 5, FIRST_NODE + 8]
        );
        let runs = store.runs(east).unwrap();
        assert_eq!(runs.len(), 3);
        for (run, address) in runs.iter().zip(router.addresses()) {
            assert_eq!(run.start, *address);
            assert!(run.nodes.iter().all(|node| node.quadrant == east));
        }
        assert_eq!(
            runs.iter().map(|run| run.nodes.len()).collect::<Vec<_>>(),
            vec![3, 2, 2]
        );
        assert_eq!(runs[0].nodes[0].kind, NodeKind::Reference);
        assert_eq!(runs[1].nodes[0].kind, NodeKind::Normal);

        // The origin quadrant was left and re-entered three times
        let runs = store.runs(Quadrant::ORIGIN).unwrap();
        assert_eq!(runs.len(), 4);
        assert_eq!(runs[0].nodes[0].kind, NodeKind::Origin);
        assert_eq!(runs[0].nodes.len(), 1);

        // Quadrants never visited have no runs
        assert!(store.runs(Quadrant::new(-3, 7)).unwrap().is_empty());
        assert_eq!(store.router(Quadrant::new(-3, 7)).unwrap(), None);
    }

    #[test_traced]
    fn test_router_full() {
        let mut store = store();
        store.start_trace(&fix(0, 0)).unwrap();

        // Bounce across the +x bound until a router runs out of slots
        let mut result = Ok(Outcome::Coalesced);
        for x in [70, 50].into_iter().cycle().take(64) {
            result = store.record_fix(&fix(x, 0));
            if result.is_err() {
                break;
            }
        }
        assert_eq!(result, Err(Error::RouterFull(0, 0)));
        let router = store.router(Quadrant::ORIGIN).unwrap().unwrap();
        assert_eq!(router.addresses().len(), ROUTER_SLOTS);
        let router = store.router(Quadrant::new(1, 0)).unwrap().unwrap();
        assert_eq!(router.addresses().len(), ROUTER_SLOTS);
    }

    #[test_traced]
    fn test_grid_overflow() {
        let cfg = Config {
            grid_cols: 2,
            grid_rows: 2,
            ..Default::default()
        };
        let mut store = Store::init(memory::Device::new(CAPACITY), cfg, ()).unwrap();
        store.start_trace(&fix(0, 0)).unwrap();
        assert_eq!(store.settings().live_sector, DATA_SECTOR + 4 + 1);
        assert_eq!(store.device().writes(), &[0, 1, DATA_SECTOR + 3, DATA_SECTOR + 4]);

        // A 2x2 grid spans quadrants -1..=0 on each axis
        let session = *store.session().unwrap();
        let live_sector = store.settings().live_sector;
        assert_eq!(
            store.record_fix(&fix(70, 0)),
            Err(Error::GridOverflow(1, 0))
        );
        assert_eq!(store.session(), Some(&session));
        assert_eq!(store.settings().live_sector, live_sector);

        // The other direction fits
        store.record_fix(&fix(-70, 0)).unwrap();
        assert_eq!(store.session().unwrap().quadrant, Quadrant::new(-1, 0));
        assert!(store.device().writes().contains(&(DATA_SECTOR + 2)));
        store.record_fix(&fix(-70, -70)).unwrap();
        assert_eq!(store.session().unwrap().quadrant, Quadrant::new(-1, -1));
        assert!(store.device().writes().contains(&DATA_SECTOR));
        assert_eq!(
            store.record_fix(&fix(-70, -200)),
            Err(Error::GridOverflow(-1, -2))
        );
    }

    #[test]
    fn test_session_preconditions() {
        let mut store = store();
        assert_eq!(store.record_fix(&fix(0, 0)), Err(Error::NoSession));
        assert_eq!(store.runs(Quadrant::ORIGIN), Err(Error::NoSession));

        let mut invalid = fix(0, 0);
        invalid.status = crate::fix::Status::Invalid;
        assert_eq!(
            store.begin_session(SessionKind::Trace, &invalid),
            Err(Error::InvalidFix)
        );
        assert_eq!(store.settings().entry_count, 0);
        assert_eq!(store.manifest(1).unwrap(), None);
        assert_eq!(store.manifest(0).unwrap(), None);
    }

    #[test]
    fn test_manifest_full() {
        let cfg = Config {
            grid_cols: 2,
            grid_rows: 2,
            ..Default::default()
        };
        let mut store = Store::init(memory::Device::new(CAPACITY), cfg, ()).unwrap();
        for entry in 1..=MANIFEST_SLOTS {
            store
                .begin_session(SessionKind::Singular, &fix(0, 0))
                .unwrap();
            assert_eq!(store.session().unwrap().entry, entry);
        }
        assert_eq!(
            store.begin_session(SessionKind::Trace, &fix(0, 0)),
            Err(Error::ManifestFull)
        );
        assert_eq!(
            store.manifest(MANIFEST_SLOTS).unwrap().unwrap().start,
            DATA_SECTOR + 4 * u32::from(MANIFEST_SLOTS)
        );
    }

    #[test_traced]
    fn test_mount_recovers_settings() {
        // Write a session
        let mut store = store();
        store.start_trace(&fix(0, 0)).unwrap();
        for x in [10, 20, 30, 70] {
            store.record_fix(&fix(x, 0)).unwrap();
        }
        let settings = *store.settings();
        let device = store.into_inner();

        // Remount: counters are recovered, the session is not
        let mut store = Store::init(device, Config::default(), ()).unwrap();
        assert_eq!(store.settings().entry_count, settings.entry_count);
        assert_eq!(store.settings().live_sector, settings.live_sector);
        assert_eq!(store.settings().mode, Mode::Idle);
        assert!(store.session().is_none());
        assert_eq!(store.device().erases().len(), 3);
        assert_eq!(store.device().erases().last(), Some(&(DATA_SECTOR, 32 * 32)));

        // A new session starts past the old log
        store.start_trace(&fix(0, 0)).unwrap();
        let entry = store.manifest(2).unwrap().unwrap();
        assert_eq!(entry.start, settings.live_sector + 32 * 32);
        assert_eq!(store.session().unwrap().grid_start, settings.live_sector);
    }

    #[test_traced]
    fn test_mount_empty_session() {
        let mut store = store();
        store
            .begin_session(SessionKind::Trace, &fix(0, 0))
            .unwrap();
        let device = store.into_inner();

        let store = Store::init(device, Config::default(), ()).unwrap();
        assert_eq!(store.settings().entry_count, 1);
        assert_eq!(store.settings().live_sector, FIRST_NODE);
    }

    #[test_traced]
    fn test_mount_skips_failed_writes() {
        let mut store = store();
        store.start_trace(&fix(0, 0)).unwrap();

        // Lose two node writes in a row
        store.device_mut().fail_writes_at(FIRST_NODE + 1);
        store.device_mut().fail_writes_at(FIRST_NODE + 2);
        assert!(store.record_fix(&fix(10, 0)).is_err());
        assert!(store.record_fix(&fix(20, 0)).is_err());
        store.device_mut().clear_failures();

        // Keep tracing past the gap
        for i in 1..=20 {
            let y = if i % 2 == 1 { 10 } else { 0 };
            store.record_fix(&fix(20, y)).unwrap();
        }
        let settings = *store.settings();
        assert_eq!(settings.live_sector, FIRST_NODE + 23);

        // Remount: the cursor is recovered past the gap
        let device = store.into_inner();
        let mut store = Store::init(device, Config::default(), ()).unwrap();
        assert_eq!(store.settings().live_sector, settings.live_sector);

        // A new session starts after the old log
        store.start_trace(&fix(0, 0)).unwrap();
        assert_eq!(store.session().unwrap().grid_start, settings.live_sector);
        let last = node_at(&store, settings.live_sector - 1);
        assert_eq!(last.entry, 1);
        assert_eq!(last.coordinates, Point::new(-20, 0));
    }

    #[test_traced]
    fn test_begin_session_zeroes_grid() {
        // Leave a stale node where the router of quadrant (1, 0) will be, past the formatted span
        let stale = Node {
            kind: NodeKind::Normal,
            entry: 9,
            coordinates: Point::new(1, 1),
            time: UtcTime::default(),
            date: UtcDate::default(),
            quadrant: Quadrant::new(3, 3),
        };
        let mut device = memory::Device::new(CAPACITY);
        device
            .write_sector(ORIGIN_ROUTER + 1, &stale.encode().unwrap())
            .unwrap();
        let cfg = Config {
            format_span: 16,
            ..Default::default()
        };
        let mut store = Store::init(device, cfg, ()).unwrap();
        assert!(store.device().sector(ORIGIN_ROUTER + 1).is_some());

        // Starting a session zeroes its router grid
        store.start_trace(&fix(0, 0)).unwrap();
        assert!(store.device().sector(ORIGIN_ROUTER + 1).is_none());
        assert_eq!(store.router(Quadrant::new(1, 0)).unwrap(), None);

        // The quadrant is entered as a fresh one
        let outcome = store.record_fix(&fix(70, 0)).unwrap();
        let Outcome::Recorded {
            transition: Some(transition),
            ..
        } = outcome
        else {
            panic!("fix did not cross");
        };
        assert!(transition.runs.is_empty());
        assert_eq!(
            store.router(Quadrant::new(1, 0)).unwrap(),
            Some(Router::new(1, FIRST_NODE + 1))
        );
    }

    #[test_traced]
    fn test_reentering_origin_writes_origin_node() {
        // Begin without the origin router
        let mut store = store();
        store
            .begin_session(SessionKind::Trace, &fix(0, 0))
            .unwrap();
        store.record_fix(&fix(40, 0)).unwrap();
        store.record_fix(&fix(70, 0)).unwrap();

        // Return to the origin quadrant
        let outcome = store.record_fix(&fix(50, 0)).unwrap();
        assert_eq!(
            outcome,
            Outcome::Recorded {
                sector: FIRST_NODE + 4,
                kind: NodeKind::Normal,
                transition: Some(Transition {
                    quadrant: Quadrant::ORIGIN,
                    runs: Vec::new(),
                }),
            }
        );

        // The fresh origin run opens with an origin node anchored before the crossing
        assert_eq!(
            store.router(Quadrant::ORIGIN).unwrap(),
            Some(Router::new(1, FIRST_NODE + 3))
        );
        let runs = store.runs(Quadrant::ORIGIN).unwrap();
        assert_eq!(runs.len(), 1);
        let kinds: Vec<_> = runs[0].nodes.iter().map(|node| node.kind).collect();
        assert_eq!(kinds, vec![NodeKind::Origin, NodeKind::Normal]);
        assert_eq!(runs[0].nodes[0].coordinates, Point::new(70, 0));
        assert_eq!(
            node_at(&store, FIRST_NODE + 1).kind,
            NodeKind::Reference
        );
    }

    #[test_traced]
    fn test_unrepresentable_fix() {
        let mut store = store();
        store.start_trace(&fix(1000, 0)).unwrap();
        let session = *store.session().unwrap();
        let writes = store.device().writes().len();

        // The offset from the shifted reference overflows
        assert_eq!(store.record_fix(&fix(i32::MIN, 0)), Err(Error::InvalidFix));
        assert_eq!(store.session(), Some(&session));
        assert_eq!(store.device().writes().len(), writes);

        // The shifted reference itself overflows
        store.end_session().unwrap();
        store.start_trace(&fix(i32::MAX - 100, 0)).unwrap();
        let session = *store.session().unwrap();
        assert_eq!(store.record_fix(&fix(i32::MAX, 0)), Err(Error::InvalidFix));
        assert_eq!(store.session(), Some(&session));

        // Large positions that can be represented are still recorded
        assert!(matches!(
            store.record_fix(&fix(i32::MAX - 80, 0)),
            Ok(Outcome::Recorded { .. })
        ));
    }

    #[test_traced]
    fn test_failed_node_write_consumes_sector() {
        let device = memory::Device::new(CAPACITY);
        let mut store = Store::init(device, Config::default(), Recorder::default()).unwrap();
        store.start_trace(&fix(0, 0)).unwrap();

        // Fail the next node write
        store.device_mut().fail_writes_at(FIRST_NODE + 1);
        assert_eq!(
            store.record_fix(&fix(10, 0)),
            Err(Error::DeviceFailure(quadtrail_sdmmc::Error::Rejected))
        );
        assert_eq!(store.settings().live_sector, FIRST_NODE + 2);
        assert_eq!(
            store.indicator().events.last().map(String::as_str),
            Some("busy false")
        );
        assert!(store
            .indicator()
            .events
            .contains(&"failed device failure: rejected".to_string()));

        // The next node goes to the following sector
        let outcome = store.record_fix(&fix(20, 0)).unwrap();
        assert!(matches!(
            outcome,
            Outcome::Recorded { sector, .. } if sector == FIRST_NODE + 2
        ));
        assert!(store.device().sector(FIRST_NODE + 1).is_none());
    }

    #[test]
    fn test_failed_manifest_write() {
        let mut store = store();
        store.device_mut().fail_writes_at(1);
        assert!(store.start_trace(&fix(0, 0)).is_err());
        assert_eq!(store.settings(), &Settings::default());
        assert!(store.session().is_none());

        store.device_mut().clear_failures();
        store.start_trace(&fix(0, 0)).unwrap();
        assert_eq!(store.session().unwrap().entry, 1);
    }

    #[test_traced]
    fn test_runs_stop_at_corrupt_node() {
        let mut store = store();
        store.start_trace(&fix(0, 0)).unwrap();
        store.record_fix(&fix(10, 0)).unwrap();
        store.record_fix(&fix(20, 0)).unwrap();

        // Overwrite the middle node with garbage
        let mut garbage = RecordBuffer::new();
        garbage.put("x", 0).unwrap();
        store
            .device_mut()
            .write_sector(FIRST_NODE + 1, &garbage)
            .unwrap();

        let runs = store.runs(Quadrant::ORIGIN).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].nodes.len(), 1);
    }

    #[test_traced]
    fn test_format_resets() {
        let mut store = store();
        store.set_debug_gps(true);
        store.start_trace(&fix(0, 0)).unwrap();
        store.record_fix(&fix(10, 0)).unwrap();

        store.format().unwrap();
        assert_eq!(store.settings(), &Settings::default());
        assert!(store.session().is_none());
        assert!(store.device().sector(1).is_none());
        assert!(store.device().sector(FIRST_NODE).is_none());
        assert_eq!(store.manifest(1).unwrap(), None);
    }

    #[test]
    fn test_metrics() {
        let cfg = Config::default();
        let registry = cfg.registry.clone();
        let mut store = Store::init(memory::Device::new(CAPACITY), cfg, ()).unwrap();
        store.start_trace(&fix(0, 0)).unwrap();
        store.record_fix(&fix(1, 1)).unwrap();
        store.record_fix(&fix(40, 0)).unwrap();
        store.record_fix(&fix(70, 0)).unwrap();

        let mut buffer = String::new();
        encode(&mut buffer, &registry.lock().unwrap()).unwrap();
        assert!(buffer.contains("nodes_total 4"), "{buffer}");
        assert!(buffer.contains("routers_total 2"), "{buffer}");
        assert!(buffer.contains("coalesced_total 1"), "{buffer}");
        assert!(buffer.contains("transitions_total 1"), "{buffer}");
        assert!(
            buffer.contains(&format!("live_sector {}", FIRST_NODE + 4)),
            "{buffer}"
        );
    }

    #[test_traced(level = "INFO")]
    fn test_simulated_card() {
        // Bring up a byte-addressed card
        let bus = simulated::Card::new(simulated::Config {
            generation: simulated::Generation::SdV2 {
                high_capacity: false,
            },
            ..Default::default()
        });
        let mut card = Card::new(bus, CardConfig::default());
        card.initialize().unwrap();

        // Trace across a boundary
        let mut store = Store::init(card, Config::default(), ()).unwrap();
        store.start_trace(&fix(0, 0)).unwrap();
        for x in [20, 40, 70, 90] {
            store.record_fix(&fix(x, 0)).unwrap();
        }
        let runs = store.runs(Quadrant::new(1, 0)).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].nodes.len(), 3);

        // Remount from the raw card contents
        let settings = *store.settings();
        let card = store.into_inner();
        let store = Store::init(card, Config::default(), ()).unwrap();
        assert_eq!(store.settings().live_sector, settings.live_sector);
        assert_eq!(store.settings().entry_count, 1);
    }
}
