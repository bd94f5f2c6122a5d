/*!
  # Serial Peripheral Interface

  Two low-level master drivers share the observer-based contract defined
  here: [`SpiMasterInterruptBased`] pumps the data register from the
  TXE/RXNE interrupts, [`SpiMasterDmaBased`] programs a pair of reserved
  DMA streams and lets the controller move the words. Both expose the same
  ABI (see [`SpiMasterLowLevel`]), so a board can pick either variant per
  peripheral at build time.

  A transfer is single-shot: `start_transfer` returns immediately and the
  registered observer receives exactly one `transfer_complete_event` from
  interrupt context, after which the driver is idle again. Slave select is
  the caller's responsibility.

  ```no_run
  use stm32f7_async_hal::spi::{SpiMasterObserver, MODE_0};
  use stm32f7_async_hal::spis;

  struct Eeprom;
  impl SpiMasterObserver for Eeprom {
      fn transfer_complete_event(&self, bytes_transferred: usize) {
          // interrupt context - record the result and get out
          let _ = bytes_transferred;
      }
  }

  static EEPROM: Eeprom = Eeprom;
  static COMMAND: [u8; 2] = [0x03, 0x00];

  let spi = &spis::SPI2;
  spi.start().unwrap();
  spi.configure(MODE_0, 1_000_000, 8, false, 0xffff).unwrap();
  unsafe { spi.start_transfer(&EEPROM, Some(COMMAND.as_ptr()), None, 2).unwrap() };
  ```
*/

use core::ops::Deref;
use core::ptr;

pub use crate::hal::spi::{Mode, Phase, Polarity, MODE_0, MODE_1, MODE_2, MODE_3};

use crate::time::Hertz;
use crate::{Error, Result};

use vcell::VolatileCell;

mod dma_based;
mod interrupt_based;

pub use dma_based::SpiMasterDmaBased;
pub use interrupt_based::SpiMasterInterruptBased;

/// Shortest supported frame, bits.
pub const MIN_WORD_LENGTH: u8 = 4;
/// Longest supported frame, bits.
pub const MAX_WORD_LENGTH: u8 = 16;

/// Register file of one SPI peripheral.
#[repr(C)]
pub struct SpiRegisterBlock {
    pub cr1: VolatileCell<u32>,
    pub cr2: VolatileCell<u32>,
    pub sr: VolatileCell<u32>,
    pub dr: VolatileCell<u32>,
    pub crcpr: VolatileCell<u32>,
    pub rxcrcr: VolatileCell<u32>,
    pub txcrcr: VolatileCell<u32>,
    pub i2scfgr: VolatileCell<u32>,
    pub i2spr: VolatileCell<u32>,
}

#[cfg(test)]
impl SpiRegisterBlock {
    pub(crate) const fn new() -> Self {
        SpiRegisterBlock {
            cr1: VolatileCell::new(0),
            cr2: VolatileCell::new(0),
            sr: VolatileCell::new(0),
            dr: VolatileCell::new(0),
            crcpr: VolatileCell::new(0),
            rxcrcr: VolatileCell::new(0),
            txcrcr: VolatileCell::new(0),
            i2scfgr: VolatileCell::new(0),
            i2spr: VolatileCell::new(0),
        }
    }
}

pub(crate) const CR1_CPHA: u32 = 1 << 0;
pub(crate) const CR1_CPOL: u32 = 1 << 1;
pub(crate) const CR1_MSTR: u32 = 1 << 2;
pub(crate) const CR1_BR_POS: u32 = 3;
pub(crate) const CR1_BR_MASK: u32 = 0b111 << CR1_BR_POS;
pub(crate) const CR1_SPE: u32 = 1 << 6;
pub(crate) const CR1_LSBFIRST: u32 = 1 << 7;
pub(crate) const CR1_SSI: u32 = 1 << 8;
pub(crate) const CR1_SSM: u32 = 1 << 9;

pub(crate) const CR2_RXDMAEN: u32 = 1 << 0;
pub(crate) const CR2_TXDMAEN: u32 = 1 << 1;
pub(crate) const CR2_ERRIE: u32 = 1 << 5;
pub(crate) const CR2_RXNEIE: u32 = 1 << 6;
pub(crate) const CR2_TXEIE: u32 = 1 << 7;
pub(crate) const CR2_DS_POS: u32 = 8;
pub(crate) const CR2_DS_MASK: u32 = 0b1111 << CR2_DS_POS;
pub(crate) const CR2_FRXTH: u32 = 1 << 12;

pub(crate) const SR_RXNE: u32 = 1 << 0;
pub(crate) const SR_TXE: u32 = 1 << 1;
pub(crate) const SR_OVR: u32 = 1 << 6;
pub(crate) const SR_BSY: u32 = 1 << 7;

/// CR1 value programmed by `start()`: master mode, software slave
/// management, minimum bit rate, peripheral enabled.
pub(crate) const INITIAL_CR1: u32 = CR1_SSM | CR1_SSI | CR1_SPE | CR1_BR_MASK | CR1_MSTR;
/// CR2 value programmed by `start()`: 8-bit frames, quarter-FIFO RX
/// threshold.
pub(crate) const INITIAL_CR2: u32 = CR2_FRXTH | (8 - 1) << CR2_DS_POS;

/// One SPI peripheral usable by the master drivers.
///
/// This singleton has exclusive access to the registers of the peripheral
/// and knows the frequency of the bus clock feeding it.
pub trait Instance: crate::Sealed + Deref<Target = SpiRegisterBlock> {
    /// Frequency of the bus clock feeding the peripheral.
    fn clock(&self) -> Hertz;
}

/// Receives the completion event of an asynchronous SPI transfer.
pub trait SpiMasterObserver {
    /// Called from interrupt context when the transfer is finished.
    ///
    /// The driver is idle again when this runs: starting another transfer
    /// from within the callback is legal. `bytes_transferred` is less than
    /// the requested size when the transfer was cut short by a hardware
    /// error.
    fn transfer_complete_event(&self, bytes_transferred: usize);
}

/// Common ABI of the SPI master low-level drivers.
pub trait SpiMasterLowLevel<'a> {
    /// Configures mode, clock frequency, word length, bit order and the
    /// dummy word clocked out when no write buffer is supplied.
    ///
    /// Returns the actually achieved clock frequency.
    fn configure(
        &self,
        mode: Mode,
        clock_frequency: u32,
        word_length: u8,
        lsb_first: bool,
        dummy_data: u16,
    ) -> Result<u32>;

    /// Starts the driver, leaving the peripheral enabled and idle.
    fn start(&'a self) -> Result<()>;

    /// Stops the driver, returning the peripheral registers to their reset
    /// values.
    fn stop(&self) -> Result<()>;

    /// Starts an asynchronous transfer of `size` bytes.
    ///
    /// # Safety
    ///
    /// Both buffers must stay valid - and the read buffer unaliased - until
    /// `observer.transfer_complete_event()` has been called.
    unsafe fn start_transfer(
        &self,
        observer: &'a dyn SpiMasterObserver,
        write_buffer: Option<*const u8>,
        read_buffer: Option<*mut u8>,
        size: usize,
    ) -> Result<()>;
}

/// Bytes occupied by one frame of `word_length` bits.
pub(crate) const fn word_size(word_length: u8) -> usize {
    ((word_length + 7) / 8) as usize
}

/// Reads the data register as a byte or a half-word.
///
/// The FIFO returns two frames on a half-word access when frames are
/// 8 bits or shorter, so narrow frames must use a byte access.
pub(crate) fn read_dr(spi: &SpiRegisterBlock, word_length: u8) -> u16 {
    let dr = spi.dr.as_ptr();
    if word_length <= 8 {
        // NOTE(read_volatile) see above
        unsafe { ptr::read_volatile(dr as *const u8) as u16 }
    } else {
        unsafe { ptr::read_volatile(dr as *const u16) }
    }
}

/// Writes the data register as a byte or a half-word.
pub(crate) fn write_dr(spi: &SpiRegisterBlock, word_length: u8, word: u16) {
    let dr = spi.dr.as_ptr();
    if word_length <= 8 {
        // NOTE(write_volatile) a half-word access would queue two frames
        unsafe { ptr::write_volatile(dr as *mut u8, word as u8) }
    } else {
        unsafe { ptr::write_volatile(dr as *mut u16, word) }
    }
}

/// Programs mode, bit order, baud rate divider and frame length.
///
/// Shared by both master drivers; lifecycle checks are the caller's
/// responsibility. Returns the actually achieved clock frequency,
/// `peripheral clock / 2^(br + 1)` for the smallest divider not above the
/// requested frequency.
pub(crate) fn configure_peripheral(
    spi: &SpiRegisterBlock,
    peripheral_frequency: Hertz,
    mode: Mode,
    clock_frequency: u32,
    word_length: u8,
    lsb_first: bool,
) -> Result<u32> {
    if word_length < MIN_WORD_LENGTH || word_length > MAX_WORD_LENGTH {
        return Err(Error::InvalidArgument);
    }

    let peripheral_frequency = peripheral_frequency.raw();
    if clock_frequency == 0 {
        return Err(Error::InvalidArgument);
    }
    let divider = peripheral_frequency.div_ceil(clock_frequency);
    if divider > 256 {
        return Err(Error::InvalidArgument);
    }
    let br = if divider <= 2 {
        0
    } else {
        31 - (divider - 1).leading_zeros()
    };

    let cpol = mode.polarity == Polarity::IdleHigh;
    let cpha = mode.phase == Phase::CaptureOnSecondTransition;
    let cr1 = spi.cr1.get();
    spi.cr1.set(
        cr1 & !(CR1_LSBFIRST | CR1_BR_MASK | CR1_CPOL | CR1_CPHA)
            | u32::from(lsb_first) * CR1_LSBFIRST
            | br << CR1_BR_POS
            | u32::from(cpol) * CR1_CPOL
            | u32::from(cpha) * CR1_CPHA,
    );
    let cr2 = spi.cr2.get();
    spi.cr2.set(
        cr2 & !(CR2_FRXTH | CR2_DS_MASK)
            | u32::from(word_length <= 8) * CR2_FRXTH
            | u32::from(word_length - 1) << CR2_DS_POS,
    );

    Ok(peripheral_frequency >> (br + 1))
}
