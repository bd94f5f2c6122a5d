//! # SD/MMC low-level transaction contract
//!
//! The asynchronous command+payload primitive implemented by SD/MMC host
//! controller drivers. It generalizes the SPI master pattern: a
//! transaction sends a command with its argument, captures a response of
//! the indicated width and runs the attached data transfer, then reports
//! the terminal state through [`SdMmcCardObserver`] - either success, a
//! hardware error with the partial byte count, or [`Error::Timeout`] when
//! the per-block deadline expired.
//!
//! Command encoding, card state and everything above the transaction
//! primitive belong to the host controller driver and the card layer.

use crate::{Error, Result};

/// Highest command index of the SD/MMC command space.
pub const MAX_COMMAND: u8 = (1 << 6) - 1;

/// Data bus width used by the host controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusMode {
    OneBit,
    FourBit,
    EightBit,
}

/// View over the caller's storage for a command response.
///
/// The width of the expected response is encoded in the variant: none,
/// short (32 bits) or long (128 bits).
pub enum Response<'a> {
    /// No response is expected.
    None,
    /// Short response, one word.
    Short(&'a mut u32),
    /// Long response, four words.
    Long(&'a mut [u32; 4]),
}

impl Response<'_> {
    /// Number of response words that will be captured.
    pub fn len(&self) -> usize {
        match self {
            Response::None => 0,
            Response::Short(..) => 1,
            Response::Long(..) => 4,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Response::None)
    }
}

/// Data transfer attached to a transaction.
pub enum Transfer<'a> {
    /// Command-only transaction.
    None,
    /// Read transfer into `buffer`.
    Read {
        buffer: &'a mut [u8],
        /// Block size, bytes.
        block_size: usize,
        /// Timeout of the whole transfer, milliseconds.
        timeout_ms: u16,
    },
    /// Write transfer from `buffer`.
    Write {
        buffer: &'a [u8],
        /// Block size, bytes.
        block_size: usize,
        /// Timeout of the whole transfer, milliseconds.
        timeout_ms: u16,
    },
}

impl Transfer<'_> {
    /// Total size of the attached buffer, bytes.
    pub fn size(&self) -> usize {
        match self {
            Transfer::None => 0,
            Transfer::Read { buffer, .. } => buffer.len(),
            Transfer::Write { buffer, .. } => buffer.len(),
        }
    }

    /// Block size of the transfer, bytes; 0 when no transfer is attached.
    pub fn block_size(&self) -> usize {
        match self {
            Transfer::None => 0,
            Transfer::Read { block_size, .. } | Transfer::Write { block_size, .. } => *block_size,
        }
    }

    /// Timeout of the transfer, milliseconds.
    pub fn timeout_ms(&self) -> u16 {
        match self {
            Transfer::None => 0,
            Transfer::Read { timeout_ms, .. } | Transfer::Write { timeout_ms, .. } => *timeout_ms,
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(self, Transfer::Write { .. })
    }

    /// Checks the transfer invariant: a positive block size dividing the
    /// buffer size evenly.
    pub fn is_valid(&self) -> bool {
        match self {
            Transfer::None => true,
            _ => self.block_size() > 0 && self.size() % self.block_size() == 0,
        }
    }
}

/// Receives the completion event of an asynchronous SD/MMC transaction.
pub trait SdMmcCardObserver {
    /// Called from interrupt context when the transaction reached a
    /// terminal state.
    ///
    /// `result` carries `Err(Error::Timeout)` when the transfer deadline
    /// expired; `bytes_transferred` is the amount of payload actually
    /// moved, at most the size of the attached transfer.
    fn transaction_complete_event(&self, result: Result<()>, bytes_transferred: usize);
}

/// Common ABI of SD/MMC card low-level drivers.
///
/// Mirrors the SPI master lifecycle: `start` -> (`configure` |
/// `start_transaction`)* -> `stop`, with the same error taxonomy. Exactly
/// one completion event follows every successful `start_transaction`.
pub trait SdMmcCardLowLevel<'a> {
    /// Configures bus width and clock frequency.
    fn configure(&self, bus_mode: BusMode, clock_frequency: u32) -> Result<()>;

    /// Starts the driver, leaving the host controller enabled and idle.
    fn start(&'a self) -> Result<()>;

    /// Stops the driver, returning the host controller registers to their
    /// reset values.
    fn stop(&self) -> Result<()>;

    /// Starts an asynchronous transaction.
    ///
    /// Sends `command` (at most [`MAX_COMMAND`]) with `argument`, captures
    /// a response of the width selected by `response` and runs the
    /// attached `transfer` under its per-block timeout.
    fn start_transaction(
        &self,
        observer: &'a dyn SdMmcCardObserver,
        command: u8,
        argument: u32,
        response: Response<'a>,
        transfer: Transfer<'a>,
    ) -> Result<()>;
}
