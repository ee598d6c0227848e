use crate::{
    command::{r1, token, Command, FILLER, HCS, OCR_CCS, VOLTAGE_CHECK},
    Addressing, BlockDevice, Bus, CardKind, Config, Error,
};
use quadtrail_codec::{RecordBuffer, SECTOR_SIZE};
use tracing::{debug, trace, warn};

/// Number of filler bytes clocked with chip select released to enter native mode (at least 74
/// clock cycles).
const WAKE_BYTES: usize = 10;

/// Milliseconds to let the card settle after a multi-block erase.
const ERASE_SETTLE_MS: u32 = 5;

/// An SD or MMC card attached to a [Bus].
pub struct Card<B: Bus> {
    bus: B,
    cfg: Config,
    kind: Option<CardKind>,
}

impl<B: Bus> Card<B> {
    /// Wrap `bus` without touching the card. Call [Card::initialize] before any sector access.
    pub fn new(bus: B, cfg: Config) -> Self {
        Self {
            bus,
            cfg,
            kind: None,
        }
    }

    /// The generation detected by the last successful [Card::initialize], if any.
    pub fn kind(&self) -> Option<CardKind> {
        self.kind
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    pub fn into_inner(self) -> B {
        self.bus
    }

    /// Reset the card into SPI mode and identify its generation.
    ///
    /// On success, the link is switched to its fast rate and subsequent sector accesses use the
    /// addressing mode of the detected [CardKind]. On failure, the card is left uninitialized.
    pub fn initialize(&mut self) -> Result<CardKind, Error> {
        self.kind = None;
        self.bus.delay_ms(self.cfg.settle_ms);
        self.bus.deselect();
        for _ in 0..WAKE_BYTES {
            self.bus.transfer(FILLER);
        }

        let result = self.identify();
        self.release();
        let kind = match result {
            Ok(kind) => kind,
            Err(err) => {
                warn!(?err, "card initialization failed");
                return Err(err);
            }
        };
        self.bus.set_fast();
        self.kind = Some(kind);
        debug!(?kind, "card initialized");
        Ok(kind)
    }

    fn identify(&mut self) -> Result<CardKind, Error> {
        // Software reset (only answered once the card is in SPI mode)
        match self.command(Command::GoIdleState, 0) {
            Ok(r1::IDLE) => {}
            Ok(response) => {
                debug!(response, "reset not acknowledged");
                return Err(Error::NoResponse);
            }
            Err(_) => return Err(Error::NoResponse),
        }

        // Second-generation cards echo the voltage probe
        if self.command(Command::SendIfCond, VOLTAGE_CHECK)? == r1::IDLE {
            let echo = self.receive::<4>();
            if u16::from_be_bytes([echo[2] & 0x0F, echo[3]]) as u32 != VOLTAGE_CHECK {
                debug!(?echo, "voltage probe mismatch");
                return Err(Error::Rejected);
            }
            self.await_ready(Command::SdSendOpCond, HCS)?;
            if self.command(Command::ReadOcr, 0)? != r1::READY {
                return Err(Error::Rejected);
            }
            let ocr = self.receive::<4>();
            return Ok(if ocr[0] & OCR_CCS != 0 {
                CardKind::SdV2Block
            } else {
                CardKind::SdV2Byte
            });
        }

        // Older cards: SD if the application-specific initialization is understood, MMC otherwise
        let kind = if self.command(Command::SdSendOpCond, 0)? <= r1::IDLE {
            self.await_ready(Command::SdSendOpCond, 0)?;
            CardKind::SdV1
        } else {
            self.await_ready(Command::SendOpCond, 0)?;
            CardKind::Mmc
        };
        if self.command(Command::SetBlockLen, SECTOR_SIZE as u32)? != r1::READY {
            return Err(Error::Rejected);
        }
        Ok(kind)
    }

    /// Repeat a start-initialization command until the card leaves the idle state.
    fn await_ready(&mut self, cmd: Command, arg: u32) -> Result<(), Error> {
        for _ in 0..self.cfg.init_attempts {
            match self.command(cmd, arg)? {
                r1::READY => return Ok(()),
                r1::IDLE => continue,
                response => {
                    debug!(?cmd, response, "initialization rejected");
                    return Err(Error::Rejected);
                }
            }
        }
        Err(Error::Timeout)
    }

    /// Send a command frame and return the card's R1 response.
    ///
    /// Application-specific commands are escaped automatically; if the escape itself is refused,
    /// its response is returned instead.
    fn command(&mut self, cmd: Command, arg: u32) -> Result<u8, Error> {
        if cmd.is_app() {
            let response = self.command(Command::AppCmd, 0)?;
            if response > r1::IDLE {
                return Ok(response);
            }
        }
        self.release();
        self.select()?;

        // Start bits and index, big-endian argument, checksum and end bit
        self.bus.transfer(0x40 | cmd.index());
        for byte in arg.to_be_bytes() {
            self.bus.transfer(byte);
        }
        self.bus.transfer(cmd.crc());

        for _ in 0..self.cfg.response_attempts {
            let response = self.bus.transfer(FILLER);
            if response & r1::PENDING == 0 {
                trace!(?cmd, arg, response, "command answered");
                return Ok(response);
            }
        }
        trace!(?cmd, arg, "command not answered");
        Err(Error::Timeout)
    }

    /// Assert chip select and wait for the card to release the line.
    fn select(&mut self) -> Result<(), Error> {
        self.bus.select();
        self.bus.transfer(FILLER);
        if self.wait_ready(self.cfg.ready_attempts) {
            return Ok(());
        }
        self.release();
        Err(Error::Timeout)
    }

    /// Release chip select and clock one extra byte so the card lets go of the line.
    fn release(&mut self) {
        self.bus.deselect();
        self.bus.transfer(FILLER);
    }

    fn wait_ready(&mut self, attempts: u32) -> bool {
        (0..attempts).any(|_| self.bus.transfer(FILLER) == FILLER)
    }

    fn receive<const N: usize>(&mut self) -> [u8; N] {
        let mut bytes = [0u8; N];
        for byte in bytes.iter_mut() {
            *byte = self.bus.transfer(FILLER);
        }
        bytes
    }

    /// Translate a sector number into the argument expected by the card.
    fn address(&self, sector: u32) -> Result<u32, Error> {
        let kind = self.kind.ok_or(Error::NotInitialized)?;
        match kind.addressing() {
            Addressing::Block => Ok(sector),
            Addressing::Byte => sector
                .checked_mul(SECTOR_SIZE as u32)
                .ok_or(Error::AddressOverflow(sector)),
        }
    }

    fn read_block(&mut self, arg: u32) -> Result<[u8; SECTOR_SIZE], Error> {
        if self.command(Command::ReadSingleBlock, arg)? != r1::READY {
            return Err(Error::Rejected);
        }

        // Wait for the start-of-data token
        let mut start = FILLER;
        for _ in 0..self.cfg.token_attempts {
            start = self.bus.transfer(FILLER);
            if start != FILLER {
                break;
            }
        }
        match start {
            token::START_BLOCK => {}
            FILLER => return Err(Error::Timeout),
            _ => {
                debug!(token = start, "read refused");
                return Err(Error::Rejected);
            }
        }

        let sector = self.receive::<SECTOR_SIZE>();

        // Checksum is not verified
        self.receive::<2>();
        Ok(sector)
    }

    /// Send one data packet: start token, a zero-padded sector, placeholder checksum.
    fn send_packet(&mut self, start: u8, data: &[u8]) -> Result<(), Error> {
        if !self.wait_ready(self.cfg.busy_attempts) {
            return Err(Error::Timeout);
        }
        self.bus.transfer(start);
        for byte in data {
            self.bus.transfer(*byte);
        }
        for _ in data.len()..SECTOR_SIZE {
            self.bus.transfer(0);
        }
        self.bus.transfer(FILLER);
        self.bus.transfer(FILLER);

        let response = self.bus.transfer(FILLER) & token::DATA_RESPONSE_MASK;
        if response != token::DATA_ACCEPTED {
            debug!(response, "data packet refused");
            return Err(Error::Rejected);
        }
        Ok(())
    }

    fn write_block(&mut self, arg: u32, buf: &RecordBuffer) -> Result<(), Error> {
        if self.command(Command::WriteBlock, arg)? != r1::READY {
            return Err(Error::Rejected);
        }
        self.send_packet(token::START_BLOCK, buf.as_slice())
    }

    fn erase_blocks(&mut self, kind: CardKind, arg: u32, count: u32) -> Result<(), Error> {
        if kind.is_sd() && self.command(Command::SetWrBlkEraseCount, count)? != r1::READY {
            return Err(Error::Rejected);
        }
        if self.command(Command::WriteMultipleBlock, arg)? != r1::READY {
            return Err(Error::Rejected);
        }
        let mut result = Ok(());
        for _ in 0..count {
            if let Err(err) = self.send_packet(token::START_MULTI, &[]) {
                result = Err(err);
                break;
            }
        }

        // The stop token is sent even after a refused packet so the card leaves the write state
        if self.wait_ready(self.cfg.busy_attempts) {
            self.bus.transfer(token::STOP_TRAN);
        } else if result.is_ok() {
            result = Err(Error::Timeout);
        }
        result
    }

    /// Poll until the card has finished programming.
    fn wait_for_completion(&mut self) -> Result<(), Error> {
        self.bus.select();
        let ready = self.wait_ready(self.cfg.busy_attempts);
        self.release();
        if ready {
            Ok(())
        } else {
            Err(Error::Timeout)
        }
    }
}

impl<B: Bus> BlockDevice for Card<B> {
    fn read_sector(&mut self, addr: u32) -> Result<RecordBuffer, Error> {
        let arg = self.address(addr)?;
        let result = self.read_block(arg);
        self.release();
        let buffer = RecordBuffer::from_sector(&result?);
        trace!(sector = addr, len = buffer.len(), "read sector");
        Ok(buffer)
    }

    fn write_sector(&mut self, addr: u32, buf: &RecordBuffer) -> Result<(), Error> {
        let arg = self.address(addr)?;
        let result = self.write_block(arg, buf);
        self.release();

        // Clock the card into its internal write cycle
        self.bus.transfer(FILLER);
        result?;
        if self.cfg.wait_for_write {
            self.wait_for_completion()?;
        }
        trace!(sector = addr, len = buf.len(), "wrote sector");
        Ok(())
    }

    fn erase_range(&mut self, addr: u32, count: u32) -> Result<(), Error> {
        if count == 0 {
            return Ok(());
        }
        let kind = self.kind.ok_or(Error::NotInitialized)?;
        let arg = self.address(addr)?;
        let last = addr
            .checked_add(count - 1)
            .ok_or(Error::AddressOverflow(addr))?;
        self.address(last)?;

        let result = self.erase_blocks(kind, arg, count);
        self.release();
        self.bus.transfer(FILLER);
        result?;
        if self.cfg.wait_for_write {
            self.wait_for_completion()?;
        } else {
            self.bus.delay_ms(ERASE_SETTLE_MS);
        }
        debug!(sector = addr, count, "erased range");
        Ok(())
    }
}
