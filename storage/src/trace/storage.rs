use super::{
    layout::{DATA_SECTOR, MANIFEST_SECTOR, MANIFEST_SLOTS, SIGNATURE_SECTOR},
    record::{self, ManifestEntry, Node, NodeKind, Router, SessionKind},
    Config, Error, Indicator, Mode, Outcome, Quadrant, Run, Session, Settings, Transition,
};
use crate::fix::{Point, PositionFix};
use prometheus_client::metrics::{counter::Counter, gauge::Gauge};
use quadtrail_sdmmc::{BlockDevice, Error as DeviceError, RecordBuffer};
use std::sync::PoisonError;
use tracing::{debug, trace, warn};

/// Implementation of a quadrant-indexed trail of position fixes.
pub struct Store<D: BlockDevice, I: Indicator = ()> {
    device: D,
    indicator: I,
    cfg: Config,

    settings: Settings,
    session: Option<Session>,

    nodes: Counter,
    routers: Counter,
    coalesced: Counter,
    transitions: Counter,
    sessions: Counter,
    live_sector: Gauge,
}

impl<D: BlockDevice, I: Indicator> Store<D, I> {
    /// Initialize a new `Store` instance.
    ///
    /// A device that carries a signature is mounted (recovering the manifest entry count and the
    /// live sector), any other device is formatted.
    ///
    /// # Panics
    ///
    /// Panics if the grid dimensions are zero or odd, or if any pane dimension, the node size, the
    /// checkpoint interval or the recovery gap is zero.
    pub fn init(device: D, cfg: Config, indicator: I) -> Result<Self, Error> {
        assert!(
            cfg.grid_cols > 0 && cfg.grid_cols % 2 == 0,
            "grid_cols must be even"
        );
        assert!(
            cfg.grid_rows > 0 && cfg.grid_rows % 2 == 0,
            "grid_rows must be even"
        );
        assert!(cfg.pane_width > 0 && cfg.pane_height > 0, "empty pane");
        assert!(cfg.node_size > 0, "node_size must be positive");
        assert!(cfg.checkpoint_interval > 0, "checkpoint_interval must be positive");
        assert!(cfg.recovery_gap > 0, "recovery_gap must be positive");

        // Initialize metrics
        let nodes = Counter::default();
        let routers = Counter::default();
        let coalesced = Counter::default();
        let transitions = Counter::default();
        let sessions = Counter::default();
        let live_sector = Gauge::default();
        {
            let mut registry = cfg.registry.lock().unwrap_or_else(PoisonError::into_inner);
            registry.register("nodes", "Number of nodes written", nodes.clone());
            registry.register("routers", "Number of routers written", routers.clone());
            registry.register("coalesced", "Number of fixes coalesced", coalesced.clone());
            registry.register(
                "transitions",
                "Number of quadrant crossings",
                transitions.clone(),
            );
            registry.register("sessions", "Number of sessions started", sessions.clone());
            registry.register("live_sector", "Next free sector", live_sector.clone());
        }

        // Mount the device
        let mut store = Self {
            device,
            indicator,
            cfg,

            settings: Settings::default(),
            session: None,

            nodes,
            routers,
            coalesced,
            transitions,
            sessions,
            live_sector,
        };
        store.mount()?;
        Ok(store)
    }

    /// Recover settings from the device, formatting it if it has no signature.
    fn mount(&mut self) -> Result<(), Error> {
        let signature = self.device.read_sector(SIGNATURE_SECTOR)?;
        if !record::is_signature(&signature) {
            debug!("no signature, formatting");
            return self.format();
        }

        // Find the last manifest entry
        let mut settings = Settings::default();
        let mut last = None;
        for entry in 1..=MANIFEST_SLOTS {
            let sector = MANIFEST_SECTOR + u32::from(entry) - 1;
            let buffer = self.device.read_sector(sector)?;
            if buffer.is_empty() {
                break;
            }
            last = Some(ManifestEntry::decode(&buffer, sector)?);
            settings.entry_count = entry;
        }

        // Walk the last session's node log past its last node
        if let Some(entry) = last {
            settings.live_sector = self.log_end(settings.entry_count, entry.start)?;
        }
        debug!(
            entries = settings.entry_count,
            live_sector = settings.live_sector,
            "mounted"
        );
        self.settings = settings;
        self.session = None;
        self.live_sector.set(settings.live_sector as i64);
        Ok(())
    }

    /// Returns the sector after the last node of session `entry`, whose log begins at `start`.
    ///
    /// Failed node writes leave empty sectors inside a log, so the walk only ends after
    /// `recovery_gap` consecutive empty sectors (or at a record that is not a node of `entry`).
    fn log_end(&mut self, entry: u16, start: u32) -> Result<u32, Error> {
        let mut end = start;
        let mut sector = start;
        let mut gap = 0;
        while gap < self.cfg.recovery_gap {
            let buffer = match self.device.read_sector(sector) {
                Ok(buffer) => buffer,
                Err(err) if gap > 0 => {
                    debug!(sector, ?err, "node log ends at unreadable sector");
                    break;
                }
                Err(err) => return Err(err.into()),
            };
            if buffer.is_empty() {
                gap += 1;
            } else {
                match Node::decode(&buffer, sector) {
                    Ok(node) if node.entry == entry => {
                        if gap > 0 {
                            debug!(sector, gap, "skipped gap in node log");
                        }
                        gap = 0;
                        end = next(sector)?;
                    }
                    _ => break,
                }
            }
            sector = next(sector)?;
        }
        Ok(end)
    }

    /// Erase the reserved regions and the head of the data region, then write the signature.
    ///
    /// Any session in progress is dropped and settings are reset.
    pub fn format(&mut self) -> Result<(), Error> {
        self.settings = Settings::default();
        self.session = None;
        self.live_sector.set(self.settings.live_sector as i64);
        let span = self.cfg.format_span;
        self.indicated(|store| {
            store.device.erase_range(SIGNATURE_SECTOR, DATA_SECTOR)?;
            store.device.erase_range(DATA_SECTOR, span)?;
            store
                .device
                .write_sector(SIGNATURE_SECTOR, &record::encode_signature()?)?;
            debug!(span, "formatted");
            Ok(())
        })
    }

    /// Start a session at `fix`: reserve (and zero) a router grid at the live sector and record
    /// the first sector past it in the next manifest slot.
    ///
    /// Nothing changes unless the manifest write succeeds.
    pub fn begin_session(&mut self, kind: SessionKind, fix: &PositionFix) -> Result<(), Error> {
        if !fix.is_valid() {
            return Err(Error::InvalidFix);
        }
        if self.settings.entry_count >= MANIFEST_SLOTS {
            return Err(Error::ManifestFull);
        }
        let grid_start = self.settings.live_sector;
        let grid = u32::from(self.cfg.grid_cols) * u32::from(self.cfg.grid_rows);
        let start = grid_start
            .checked_add(grid)
            .ok_or(DeviceError::AddressOverflow(grid_start))?;
        let entry = self.settings.entry_count + 1;
        let sector = MANIFEST_SECTOR + u32::from(entry) - 1;

        self.indicated(|store| {
            store.device.erase_range(grid_start, grid)?;
            let buffer = ManifestEntry { kind, start }.encode()?;
            store.device.write_sector(sector, &buffer)?;
            Ok(())
        })?;

        self.settings.entry_count = entry;
        self.settings.live_sector = start;
        self.live_sector.set(start as i64);
        self.session = Some(Session::new(kind, entry, grid_start, fix.position));
        self.sessions.inc();
        debug!(entry, ?kind, grid_start, start, "began session");
        Ok(())
    }

    /// Begin a [SessionKind::Trace] session and write the origin router and origin node.
    pub fn start_trace(&mut self, fix: &PositionFix) -> Result<(), Error> {
        self.begin_session(SessionKind::Trace, fix)?;
        self.settings.mode = Mode::Tracing;
        let Some(session) = self.session else {
            return Err(Error::NoSession);
        };
        self.indicated(|store| {
            let router = Router::new(session.entry, store.settings.live_sector);
            store.write_router(&session, Quadrant::ORIGIN, &router)?;
            store.write_node(&session, NodeKind::Origin, fix, fix.position)?;
            Ok(())
        })
    }

    /// Drop the session in progress. Nothing is written.
    pub fn end_session(&mut self) -> Result<Session, Error> {
        let session = self.session.take().ok_or(Error::NoSession)?;
        self.settings.mode = Mode::Idle;
        debug!(entry = session.entry, "ended session");
        Ok(session)
    }

    /// Record a fix in the session in progress.
    ///
    /// The session (position, quadrant and checkpoint counter) advances before anything is
    /// written, so a failed write loses the fix but not the trail. A crossing into a quadrant
    /// outside the grid is rejected without changing anything.
    pub fn record_fix(&mut self, fix: &PositionFix) -> Result<Outcome, Error> {
        let mut session = self.session.ok_or(Error::NoSession)?;
        if !fix.is_valid() {
            trace!("skipped invalid fix");
            return Ok(Outcome::Skipped);
        }

        // Absorb small movements
        let threshold = 2 * i64::from(self.cfg.node_size);
        let dx = i64::from(fix.position.x) - i64::from(session.position.x);
        let dy = i64::from(fix.position.y) - i64::from(session.position.y);
        if dx.abs() < threshold && dy.abs() < threshold {
            self.coalesced.inc();
            return Ok(Outcome::Coalesced);
        }

        // Check for a crossing (at most one axis per fix)
        let anchor = session.position;
        let crossing = self.crossing(&session, fix.position)?;
        if let Some((quadrant, _)) = crossing {
            self.router_sector(&session, quadrant)?;
        }
        let reference = crossing.map_or(session.reference, |(_, reference)| reference);
        let offset = reference
            .checked_sub(fix.position)
            .ok_or(Error::InvalidFix)?;

        // Advance the session
        if let Some((quadrant, _)) = crossing {
            session.quadrant = quadrant;
            session.reference = reference;
        }
        session.position = fix.position;
        session.since_checkpoint += 1;
        let kind = if session.since_checkpoint >= self.cfg.checkpoint_interval {
            session.since_checkpoint = 0;
            session.checkpoint = fix.position;
            NodeKind::Super
        } else {
            NodeKind::Normal
        };
        self.session = Some(session);

        self.indicated(|store| {
            let transition = match crossing {
                Some((quadrant, _)) => {
                    store.transitions.inc();
                    let runs = store.update_router(&session, fix, anchor)?;
                    debug!(qx = quadrant.x, qy = quadrant.y, runs = runs.len(), "crossed");
                    Some(Transition { quadrant, runs })
                }
                None => None,
            };
            let sector = store.write_node(&session, kind, fix, offset)?;
            Ok(Outcome::Recorded {
                sector,
                kind,
                transition,
            })
        })
    }

    /// Returns the quadrant (and its reference point) entered by moving to `position`, if any.
    ///
    /// A reference point that cannot be represented makes the fix invalid.
    fn crossing(
        &self,
        session: &Session,
        position: Point,
    ) -> Result<Option<(Quadrant, Point)>, Error> {
        let reference = session.reference;
        let half_width = i64::from(self.cfg.pane_width / 2);
        let half_height = i64::from(self.cfg.pane_height / 2);
        let dx = i64::from(position.x) - i64::from(reference.x);
        let dy = i64::from(position.y) - i64::from(reference.y);
        let (step_x, step_y) = if dx > half_width {
            (1, 0)
        } else if dx < -half_width {
            (-1, 0)
        } else if dy > half_height {
            (0, 1)
        } else if dy < -half_height {
            (0, -1)
        } else {
            return Ok(None);
        };
        let shift = Point::new(
            self.cfg.pane_width * i32::from(step_x),
            self.cfg.pane_height * i32::from(step_y),
        );
        let reference = reference.checked_add(shift).ok_or(Error::InvalidFix)?;
        Ok(Some((session.quadrant.step(step_x, step_y), reference)))
    }

    /// Sector of the router for `quadrant`.
    fn router_sector(&self, session: &Session, quadrant: Quadrant) -> Result<u32, Error> {
        let cols = i64::from(self.cfg.grid_cols);
        let rows = i64::from(self.cfg.grid_rows);
        let column = i64::from(quadrant.x) + cols / 2;
        let row = i64::from(quadrant.y) + rows / 2;
        if !(0..cols).contains(&column) || !(0..rows).contains(&row) {
            return Err(Error::GridOverflow(quadrant.x, quadrant.y));
        }
        let offset = u32::try_from(column + row * cols)
            .map_err(|_| Error::GridOverflow(quadrant.x, quadrant.y))?;
        Ok(session.grid_start + offset)
    }

    /// Extend the router of the session's (new) quadrant with a run starting at the live sector.
    ///
    /// A fresh router is followed by an absolute node anchored at `anchor` (an origin node in the
    /// origin quadrant, a reference node elsewhere). Returns the runs that were already listed.
    fn update_router(
        &mut self,
        session: &Session,
        fix: &PositionFix,
        anchor: Point,
    ) -> Result<Vec<Run>, Error> {
        let quadrant = session.quadrant;
        let sector = self.router_sector(session, quadrant)?;
        let buffer = self.device.read_sector(sector)?;
        if buffer.is_empty() {
            let router = Router::new(session.entry, self.settings.live_sector);
            self.write_router(session, quadrant, &router)?;
            let kind = if quadrant.is_origin() {
                NodeKind::Origin
            } else {
                NodeKind::Reference
            };
            self.write_node(session, kind, fix, anchor)?;
            return Ok(Vec::new());
        }

        let mut router = Router::decode(&buffer, sector)?;
        let runs = self.walk(session, quadrant, &router)?;
        if !router.push(self.settings.live_sector) {
            warn!(qx = quadrant.x, qy = quadrant.y, "router full");
            return Err(Error::RouterFull(quadrant.x, quadrant.y));
        }
        self.write_router(session, quadrant, &router)?;
        Ok(runs)
    }

    /// Read every run listed by `router`.
    ///
    /// A run ends at the first sector that is empty, is not a node of the session, lies outside
    /// `quadrant` or has not been reached by the live sector yet.
    fn walk(
        &mut self,
        session: &Session,
        quadrant: Quadrant,
        router: &Router,
    ) -> Result<Vec<Run>, Error> {
        let mut runs = Vec::with_capacity(router.addresses().len());
        for start in router.addresses() {
            let mut nodes = Vec::new();
            let mut sector = *start;
            while sector < self.settings.live_sector {
                let buffer = self.device.read_sector(sector)?;
                if buffer.is_empty() {
                    break;
                }
                let node = match Node::decode(&buffer, sector) {
                    Ok(node) => node,
                    Err(err) => {
                        warn!(sector, ?err, "run ended by unreadable node");
                        break;
                    }
                };
                if node.entry != session.entry || node.quadrant != quadrant {
                    break;
                }
                nodes.push(node);
                sector += 1;
            }
            trace!(start, nodes = nodes.len(), "walked run");
            runs.push(Run {
                start: *start,
                nodes,
            });
        }
        Ok(runs)
    }

    /// Write a node at the live sector and advance it. The sector is consumed even if the write
    /// fails.
    fn write_node(
        &mut self,
        session: &Session,
        kind: NodeKind,
        fix: &PositionFix,
        coordinates: Point,
    ) -> Result<u32, Error> {
        let node = Node {
            kind,
            entry: session.entry,
            coordinates,
            time: fix.time,
            date: fix.date,
            quadrant: session.quadrant,
        };
        let buffer = node.encode()?;
        let sector = self.settings.live_sector;
        self.settings.live_sector = next(sector)?;
        self.live_sector.set(self.settings.live_sector as i64);
        self.device.write_sector(sector, &buffer)?;
        self.nodes.inc();
        trace!(sector, ?kind, "wrote node");
        Ok(sector)
    }

    fn write_router(
        &mut self,
        session: &Session,
        quadrant: Quadrant,
        router: &Router,
    ) -> Result<(), Error> {
        let sector = self.router_sector(session, quadrant)?;
        self.device.write_sector(sector, &router.encode()?)?;
        self.routers.inc();
        trace!(sector, runs = router.addresses().len(), "wrote router");
        Ok(())
    }

    /// Run `op` between busy notifications, reporting any failure to the indicator.
    fn indicated<T>(
        &mut self,
        op: impl FnOnce(&mut Self) -> Result<T, Error>,
    ) -> Result<T, Error> {
        self.indicator.set_busy(true);
        let result = op(self);
        if let Err(err) = &result {
            warn!(?err, "storage operation failed");
            self.indicator.failed(err);
        }
        self.indicator.set_busy(false);
        result
    }

    /// Router of `quadrant` in the session in progress (`None` if never visited).
    pub fn router(&mut self, quadrant: Quadrant) -> Result<Option<Router>, Error> {
        let session = self.session.ok_or(Error::NoSession)?;
        let sector = self.router_sector(&session, quadrant)?;
        let buffer = self.device.read_sector(sector)?;
        if buffer.is_empty() {
            return Ok(None);
        }
        Ok(Some(Router::decode(&buffer, sector)?))
    }

    /// Every run written in `quadrant` during the session in progress, oldest first.
    pub fn runs(&mut self, quadrant: Quadrant) -> Result<Vec<Run>, Error> {
        let session = self.session.ok_or(Error::NoSession)?;
        match self.router(quadrant)? {
            Some(router) => self.walk(&session, quadrant, &router),
            None => Ok(Vec::new()),
        }
    }

    /// Manifest slot `entry` (1-based), or `None` if it is unused.
    pub fn manifest(&mut self, entry: u16) -> Result<Option<ManifestEntry>, Error> {
        if entry == 0 || entry > MANIFEST_SLOTS {
            return Ok(None);
        }
        let sector = MANIFEST_SECTOR + u32::from(entry) - 1;
        let buffer: RecordBuffer = self.device.read_sector(sector)?;
        if buffer.is_empty() {
            return Ok(None);
        }
        Ok(Some(ManifestEntry::decode(&buffer, sector)?))
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Select the debug fix source (cleared by [Store::format] and on restart).
    pub fn set_debug_gps(&mut self, enabled: bool) {
        self.settings.debug_gps = enabled;
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn indicator(&self) -> &I {
        &self.indicator
    }

    /// Consume the store, returning the device.
    pub fn into_inner(self) -> D {
        self.device
    }
}

/// The sector after `sector`.
fn next(sector: u32) -> Result<u32, Error> {
    sector
        .checked_add(1)
        .ok_or(Error::DeviceFailure(DeviceError::AddressOverflow(sector)))
}
