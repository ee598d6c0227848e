//! Command set, response bits and data tokens of the SPI-mode protocol.

/// Byte clocked out while waiting on the card (and read back from an idle line).
pub(crate) const FILLER: u8 = 0xFF;

/// Argument of the voltage-range probe: 2.7-3.6V supply and the `0xAA` check pattern.
pub(crate) const VOLTAGE_CHECK: u32 = 0x1AA;

/// Host-capacity-support flag of the start-initialization argument.
pub(crate) const HCS: u32 = 1 << 30;

/// Card-capacity-status bit in the first byte of the operating-conditions register.
pub(crate) const OCR_CCS: u8 = 0x40;

/// Commands used by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Command {
    /// CMD0: software reset.
    GoIdleState,
    /// CMD1: start initialization (MMC).
    SendOpCond,
    /// CMD8: voltage-range probe.
    SendIfCond,
    /// CMD16: set block length.
    SetBlockLen,
    /// CMD17: read a single block.
    ReadSingleBlock,
    /// CMD24: write a single block.
    WriteBlock,
    /// CMD25: write multiple blocks.
    WriteMultipleBlock,
    /// CMD55: escape for application-specific commands.
    AppCmd,
    /// CMD58: read the operating-conditions register.
    ReadOcr,
    /// ACMD23: number of blocks to pre-erase before a multi-block write.
    SetWrBlkEraseCount,
    /// ACMD41: start initialization (SD).
    SdSendOpCond,
}

impl Command {
    /// Index transmitted in the command frame.
    pub(crate) fn index(self) -> u8 {
        match self {
            Command::GoIdleState => 0,
            Command::SendOpCond => 1,
            Command::SendIfCond => 8,
            Command::SetBlockLen => 16,
            Command::ReadSingleBlock => 17,
            Command::SetWrBlkEraseCount => 23,
            Command::WriteBlock => 24,
            Command::WriteMultipleBlock => 25,
            Command::SdSendOpCond => 41,
            Command::AppCmd => 55,
            Command::ReadOcr => 58,
        }
    }

    /// Returns true if the command must be preceded by [Command::AppCmd].
    pub(crate) fn is_app(self) -> bool {
        matches!(self, Command::SetWrBlkEraseCount | Command::SdSendOpCond)
    }

    /// Checksum byte (including the end bit) closing the command frame.
    ///
    /// Only the reset and the voltage probe are checked by the card in SPI mode; every other
    /// command carries a placeholder.
    pub(crate) fn crc(self) -> u8 {
        match self {
            Command::GoIdleState => 0x95,
            Command::SendIfCond => 0x87,
            _ => 0x01,
        }
    }

    /// Resolve a received frame index (`app` is set if it follows [Command::AppCmd]).
    pub(crate) fn decode(index: u8, app: bool) -> Option<Self> {
        let command = match (index, app) {
            (0, _) => Command::GoIdleState,
            (1, _) => Command::SendOpCond,
            (8, _) => Command::SendIfCond,
            (16, _) => Command::SetBlockLen,
            (17, _) => Command::ReadSingleBlock,
            (23, true) => Command::SetWrBlkEraseCount,
            (24, _) => Command::WriteBlock,
            (25, _) => Command::WriteMultipleBlock,
            (41, true) => Command::SdSendOpCond,
            (55, _) => Command::AppCmd,
            (58, _) => Command::ReadOcr,
            _ => return None,
        };
        Some(command)
    }
}

/// Bits of the single-byte (R1) command response.
pub(crate) mod r1 {
    pub(crate) const READY: u8 = 0x00;
    pub(crate) const IDLE: u8 = 0x01;
    pub(crate) const ILLEGAL_COMMAND: u8 = 0x04;
    pub(crate) const CRC_ERROR: u8 = 0x08;
    pub(crate) const ADDRESS_ERROR: u8 = 0x20;
    pub(crate) const PARAMETER_ERROR: u8 = 0x40;
    /// Always clear in a response; a set bit means the card has not answered yet.
    pub(crate) const PENDING: u8 = 0x80;
}

/// Data tokens framing block transfers.
pub(crate) mod token {
    pub(crate) const START_BLOCK: u8 = 0xFE;
    pub(crate) const START_MULTI: u8 = 0xFC;
    pub(crate) const STOP_TRAN: u8 = 0xFD;
    pub(crate) const DATA_RESPONSE_MASK: u8 = 0x1F;
    pub(crate) const DATA_ACCEPTED: u8 = 0x05;
    pub(crate) const DATA_WRITE_ERROR: u8 = 0x0D;
}
