//! Interrupt-driven SPI master.

use core::cell::Cell;

use super::{
    configure_peripheral, read_dr, word_size, write_dr, Instance, Mode, SpiMasterLowLevel,
    SpiMasterObserver, CR2_DS_MASK, CR2_DS_POS, CR2_ERRIE, CR2_RXNEIE, CR2_TXEIE, INITIAL_CR1,
    INITIAL_CR2, MAX_WORD_LENGTH, MIN_WORD_LENGTH, SR_BSY, SR_OVR, SR_RXNE, SR_TXE,
};
use crate::{Error, Result};

/// SPI master low-level driver fed purely from the TXE/RXNE interrupts.
///
/// The interrupt handler runs an interleaved write-then-read pump: every
/// received word advances the read position and rearms TXE for the next
/// word, so at most one word is in flight and the receiver can never fall
/// behind by more than one frame.
pub struct SpiMasterInterruptBased<'a, SPI: Instance> {
    spi: SPI,
    started: Cell<bool>,
    observer: Cell<Option<&'a dyn SpiMasterObserver>>,
    write_buffer: Cell<Option<*const u8>>,
    read_buffer: Cell<Option<*mut u8>>,
    size: Cell<usize>,
    read_position: Cell<usize>,
    write_position: Cell<usize>,
    dummy_data: Cell<u16>,
}

// Shared between thread context and the SPI interrupt on a single core; the
// state machine keeps thread-context writes confined to the idle state and
// interrupt-context writes to the busy state.
unsafe impl<SPI: Instance> Sync for SpiMasterInterruptBased<'_, SPI> {}

impl<'a, SPI: Instance> SpiMasterInterruptBased<'a, SPI> {
    pub const fn new(spi: SPI) -> Self {
        SpiMasterInterruptBased {
            spi,
            started: Cell::new(false),
            observer: Cell::new(None),
            write_buffer: Cell::new(None),
            read_buffer: Cell::new(None),
            size: Cell::new(0),
            read_position: Cell::new(0),
            write_position: Cell::new(0),
            dummy_data: Cell::new(0),
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.get()
    }

    pub fn is_transfer_in_progress(&self) -> bool {
        self.size.get() != 0
    }

    /// Configures mode, clock frequency, word length, bit order and the
    /// dummy word. Returns the actually achieved clock frequency.
    pub fn configure(
        &self,
        mode: Mode,
        clock_frequency: u32,
        word_length: u8,
        lsb_first: bool,
        dummy_data: u16,
    ) -> Result<u32> {
        if word_length < MIN_WORD_LENGTH || word_length > MAX_WORD_LENGTH {
            return Err(Error::InvalidArgument);
        }
        if !self.started.get() {
            return Err(Error::WrongState);
        }
        if self.is_transfer_in_progress() {
            return Err(Error::Busy);
        }

        let real_frequency = configure_peripheral(
            &self.spi,
            self.spi.clock(),
            mode,
            clock_frequency,
            word_length,
            lsb_first,
        )?;
        self.dummy_data.set(dummy_data);
        Ok(real_frequency)
    }

    /// Starts the driver: master mode, software slave management, 8-bit
    /// words, minimum bit rate, peripheral enabled.
    pub fn start(&self) -> Result<()> {
        if self.started.get() {
            return Err(Error::WrongState);
        }

        self.spi.cr1.set(INITIAL_CR1);
        self.spi.cr2.set(INITIAL_CR2);
        self.started.set(true);
        Ok(())
    }

    /// Stops the driver, returning the control registers to their reset
    /// values.
    pub fn stop(&self) -> Result<()> {
        if !self.started.get() {
            return Err(Error::WrongState);
        }
        if self.is_transfer_in_progress() {
            return Err(Error::Busy);
        }

        self.spi.cr1.set(0);
        self.spi.cr2.set(0);
        self.started.set(false);
        Ok(())
    }

    /// Starts an asynchronous transfer of `size` bytes.
    ///
    /// The first word is pushed from this call; everything else happens in
    /// [`interrupt_handler`](Self::interrupt_handler). When `write_buffer`
    /// is `None` the configured dummy word is clocked out, when
    /// `read_buffer` is `None` incoming words are discarded. `size` must be
    /// a positive multiple of the configured word size.
    ///
    /// # Safety
    ///
    /// Both buffers must stay valid - and the read buffer unaliased - until
    /// `observer.transfer_complete_event()` has been called.
    pub unsafe fn start_transfer(
        &self,
        observer: &'a dyn SpiMasterObserver,
        write_buffer: Option<*const u8>,
        read_buffer: Option<*mut u8>,
        size: usize,
    ) -> Result<()> {
        if size == 0 {
            return Err(Error::InvalidArgument);
        }
        if !self.started.get() {
            return Err(Error::WrongState);
        }
        if self.is_transfer_in_progress() {
            return Err(Error::Busy);
        }

        let word_length = self.word_length();
        if size % word_size(word_length) != 0 {
            return Err(Error::InvalidArgument);
        }

        self.observer.set(Some(observer));
        self.write_buffer.set(write_buffer);
        self.read_buffer.set(read_buffer);
        self.size.set(size);
        self.read_position.set(0);
        self.write_position.set(0);

        let cr2 = self.spi.cr2.get();
        self.spi.cr2.set(cr2 | CR2_RXNEIE | CR2_ERRIE);
        self.write_next_word(word_length);

        Ok(())
    }

    /// Advances the transfer state machine.
    ///
    /// Must be called from the peripheral's interrupt handler; not user
    /// API.
    pub fn interrupt_handler(&self) {
        let sr = self.spi.sr.get();
        let cr2 = self.spi.cr2.get();
        let word_length = self.word_length();

        if sr & SR_OVR != 0 && cr2 & CR2_ERRIE != 0 {
            // reading DR and then SR clears the overrun condition
            let _ = read_dr(&self.spi, word_length);
            let sr = self.spi.sr.get();
            self.spi.cr2.set(cr2 & !CR2_TXEIE);
            if sr & SR_BSY == 0 {
                self.complete_transfer(self.read_position.get());
            }
            return;
        }

        if sr & SR_RXNE != 0 && cr2 & CR2_RXNEIE != 0 {
            let word = read_dr(&self.spi, word_length);
            let mut read_position = self.read_position.get();
            match self.read_buffer.get() {
                Some(read_buffer) => unsafe {
                    read_buffer.add(read_position).write(word as u8);
                    read_position += 1;
                    if word_length > 8 {
                        read_buffer.add(read_position).write((word >> 8) as u8);
                        read_position += 1;
                    }
                },
                None => read_position += word_size(word_length),
            }
            self.read_position.set(read_position);

            if read_position == self.size.get() {
                self.complete_transfer(read_position);
            } else {
                self.spi.cr2.set(cr2 | CR2_TXEIE);
            }
            return;
        }

        if sr & SR_TXE != 0 && cr2 & CR2_TXEIE != 0 {
            self.write_next_word(word_length);
            self.spi.cr2.set(cr2 & !CR2_TXEIE);
        }
    }

    /// Word length currently programmed into the peripheral, bits.
    fn word_length(&self) -> u8 {
        ((self.spi.cr2.get() & CR2_DS_MASK) >> CR2_DS_POS) as u8 + 1
    }

    fn write_next_word(&self, word_length: u8) {
        let mut write_position = self.write_position.get();
        let word = match self.write_buffer.get() {
            Some(write_buffer) => unsafe {
                let low = write_buffer.add(write_position).read() as u16;
                write_position += 1;
                let high = if word_length > 8 {
                    let high = write_buffer.add(write_position).read() as u16;
                    write_position += 1;
                    high
                } else {
                    0
                };
                low | high << 8
            },
            None => {
                write_position += word_size(word_length);
                self.dummy_data.get()
            }
        };
        self.write_position.set(write_position);
        write_dr(&self.spi, word_length, word);
    }

    fn complete_transfer(&self, bytes_transferred: usize) {
        let cr2 = self.spi.cr2.get();
        self.spi
            .cr2
            .set(cr2 & !(CR2_TXEIE | CR2_RXNEIE | CR2_ERRIE));

        self.write_buffer.set(None);
        self.read_buffer.set(None);
        self.size.set(0);
        self.read_position.set(0);
        self.write_position.set(0);

        // cleared before the callback so the observer may legally start a
        // new transfer from within it
        let observer = self.observer.take();
        if let Some(observer) = observer {
            observer.transfer_complete_event(bytes_transferred);
        }
    }
}

impl<'a, SPI: Instance> SpiMasterLowLevel<'a> for SpiMasterInterruptBased<'a, SPI> {
    fn configure(
        &self,
        mode: Mode,
        clock_frequency: u32,
        word_length: u8,
        lsb_first: bool,
        dummy_data: u16,
    ) -> Result<u32> {
        SpiMasterInterruptBased::configure(
            self,
            mode,
            clock_frequency,
            word_length,
            lsb_first,
            dummy_data,
        )
    }

    fn start(&'a self) -> Result<()> {
        SpiMasterInterruptBased::start(self)
    }

    fn stop(&self) -> Result<()> {
        SpiMasterInterruptBased::stop(self)
    }

    unsafe fn start_transfer(
        &self,
        observer: &'a dyn SpiMasterObserver,
        write_buffer: Option<*const u8>,
        read_buffer: Option<*mut u8>,
        size: usize,
    ) -> Result<()> {
        SpiMasterInterruptBased::start_transfer(self, observer, write_buffer, read_buffer, size)
    }
}

impl<SPI: Instance> Drop for SpiMasterInterruptBased<'_, SPI> {
    fn drop(&mut self) {
        if !self.started.get() {
            return;
        }

        self.spi.cr1.set(0);
        self.spi.cr2.set(0);
    }
}
