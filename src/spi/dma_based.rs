//! DMA-driven SPI master.

use core::cell::Cell;

use super::{
    configure_peripheral, word_size, Instance, Mode, SpiMasterLowLevel, SpiMasterObserver,
    CR2_RXDMAEN, CR2_TXDMAEN, INITIAL_CR1, INITIAL_CR2,
};
use crate::dma::{DmaChannel, DmaChannelHandle, DmaChannelObserver, Flags, StreamInstance};
use crate::{Error, Result};

/// SPI master low-level driver moving the words with two reserved DMA
/// streams.
///
/// The same external contract as
/// [`SpiMasterInterruptBased`](super::SpiMasterInterruptBased), but the data
/// register is fed and drained by the DMA controller. The RX stream's
/// transfer-complete interrupt is the authoritative end of the transfer -
/// on SPI the receiver necessarily drains last - while the TX stream runs
/// without a completion interrupt and only reports errors.
pub struct SpiMasterDmaBased<'a, SPI, RXSTREAM, TXSTREAM>
where
    SPI: Instance,
    RXSTREAM: StreamInstance,
    TXSTREAM: StreamInstance,
{
    spi: SPI,
    rx_channel: &'a DmaChannel<'a, RXSTREAM>,
    rx_request: u8,
    rx_handle: DmaChannelHandle<'a, RXSTREAM>,
    tx_channel: &'a DmaChannel<'a, TXSTREAM>,
    tx_request: u8,
    tx_handle: DmaChannelHandle<'a, TXSTREAM>,
    started: Cell<bool>,
    word_length: Cell<u8>,
    size: Cell<usize>,
    observer: Cell<Option<&'a dyn SpiMasterObserver>>,
    /// Clocked out repeatedly when the caller supplies no write buffer.
    tx_dummy_data: Cell<u16>,
    /// Sink for incoming words when the caller supplies no read buffer.
    rx_dummy_data: Cell<u16>,
}

// Shared between thread context and the DMA interrupts on a single core;
// thread-context writes are confined to the idle state, interrupt-context
// writes to the busy state.
unsafe impl<SPI, RXSTREAM, TXSTREAM> Sync for SpiMasterDmaBased<'_, SPI, RXSTREAM, TXSTREAM>
where
    SPI: Instance,
    RXSTREAM: StreamInstance,
    TXSTREAM: StreamInstance,
{
}

impl<'a, SPI, RXSTREAM, TXSTREAM> SpiMasterDmaBased<'a, SPI, RXSTREAM, TXSTREAM>
where
    SPI: Instance + 'a,
    RXSTREAM: StreamInstance + 'a,
    TXSTREAM: StreamInstance + 'a,
{
    /// Binds the driver to its peripheral and the two DMA channels it will
    /// reserve on `start()`.
    pub const fn new(
        spi: SPI,
        rx_channel: &'a DmaChannel<'a, RXSTREAM>,
        rx_request: u8,
        tx_channel: &'a DmaChannel<'a, TXSTREAM>,
        tx_request: u8,
    ) -> Self {
        SpiMasterDmaBased {
            spi,
            rx_channel,
            rx_request,
            rx_handle: DmaChannelHandle::new(),
            tx_channel,
            tx_request,
            tx_handle: DmaChannelHandle::new(),
            started: Cell::new(false),
            word_length: Cell::new(0),
            size: Cell::new(0),
            observer: Cell::new(None),
            tx_dummy_data: Cell::new(0),
            rx_dummy_data: Cell::new(0),
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
        self.tx_dummy_data.set(dummy_data);
        self.word_length.set(word_length);
        Ok(real_frequency)
    }

    /// Starts the driver: reserves both DMA channels, then enables the
    /// peripheral with the TX and RX DMA request lines active.
    pub fn start(&'a self) -> Result<()> {
        if self.started.get() {
            return Err(Error::WrongState);
        }

        self.rx_handle
            .reserve(self.rx_channel, self.rx_request, self)?;
        if let Err(error) = self.tx_handle.reserve(self.tx_channel, self.tx_request, self) {
            // roll back the RX reservation so a later start can retry
            self.rx_handle.release();
            return Err(error);
        }

        self.word_length.set(8);
        self.spi.cr1.set(INITIAL_CR1);
        self.spi.cr2.set(INITIAL_CR2 | CR2_TXDMAEN | CR2_RXDMAEN);
        self.started.set(true);
        Ok(())
    }

    /// Stops the driver, releasing both DMA channels and returning the
    /// control registers to their reset values.
    pub fn stop(&self) -> Result<()> {
        if !self.started.get() {
            return Err(Error::WrongState);
        }
        if self.is_transfer_in_progress() {
            return Err(Error::Busy);
        }

        self.rx_handle.release();
        self.tx_handle.release();

        self.spi.cr1.set(0);
        self.spi.cr2.set(0);
        self.started.set(false);
        Ok(())
    }

    /// Starts an asynchronous transfer of `size` bytes.
    ///
    /// Programs the RX stream first and starts the TX stream last - the
    /// first TX beat is what sets the SPI clock running. When
    /// `write_buffer` is `None` the dummy word is clocked from a fixed
    /// internal cell, when `read_buffer` is `None` incoming words land in
    /// one. `size` must be a positive multiple of the configured word size.
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

        let data_size = word_size(self.word_length.get());
        if size % data_size != 0 {
            return Err(Error::InvalidArgument);
        }
        let transactions = size / data_size;

        let common_flags = Flags::PERIPHERAL_FIXED
            | if data_size == 1 {
                Flags::DATA_SIZE_1
            } else {
                Flags::DATA_SIZE_2
            };
        let dr_address = self.spi.dr.as_ptr() as usize;

        {
            let memory_address = match read_buffer {
                Some(read_buffer) => read_buffer as usize,
                None => self.rx_dummy_data.as_ptr() as usize,
            };
            let rx_flags = Flags::TRANSFER_COMPLETE_INTERRUPT_ENABLE
                | Flags::PERIPHERAL_TO_MEMORY
                | if read_buffer.is_some() {
                    Flags::MEMORY_INCREMENT
                } else {
                    Flags::MEMORY_FIXED
                }
                | Flags::VERY_HIGH_PRIORITY;
            self.rx_handle.configure_transfer(
                memory_address,
                dr_address,
                transactions,
                common_flags | rx_flags,
            )?;
        }
        {
            let memory_address = match write_buffer {
                Some(write_buffer) => write_buffer as usize,
                None => self.tx_dummy_data.as_ptr() as usize,
            };
            let tx_flags = Flags::TRANSFER_COMPLETE_INTERRUPT_DISABLE
                | Flags::MEMORY_TO_PERIPHERAL
                | if write_buffer.is_some() {
                    Flags::MEMORY_INCREMENT
                } else {
                    Flags::MEMORY_FIXED
                }
                | Flags::LOW_PRIORITY;
            self.tx_handle.configure_transfer(
                memory_address,
                dr_address,
                transactions,
                common_flags | tx_flags,
            )?;
        }

        self.observer.set(Some(observer));
        self.size.set(size);

        // freshly configured streams cannot be busy; TX goes last as it
        // initiates the clocking
        let _ = self.rx_handle.start_transfer();
        let _ = self.tx_handle.start_transfer();

        Ok(())
    }

    fn event_handler(&self, transactions_left: usize) {
        // TX first so nothing more is pushed while RX drains
        let _ = self.tx_handle.stop_transfer();
        let _ = self.rx_handle.stop_transfer();

        let data_size = word_size(self.word_length.get());
        let bytes_transferred = self.size.get() - transactions_left * data_size;
        self.size.set(0);

        // cleared before the callback so the observer may legally start a
        // new transfer from within it
        let observer = self.observer.take();
        if let Some(observer) = observer {
            observer.transfer_complete_event(bytes_transferred);
        }
    }
}

impl<'a, SPI, RXSTREAM, TXSTREAM> DmaChannelObserver
    for SpiMasterDmaBased<'a, SPI, RXSTREAM, TXSTREAM>
where
    SPI: Instance + 'a,
    RXSTREAM: StreamInstance + 'a,
    TXSTREAM: StreamInstance + 'a,
{
    fn transfer_complete_event(&self) {
        // only the RX stream has its transfer-complete interrupt enabled
        self.event_handler(0);
    }

    fn transfer_error_event(&self, transactions_left: usize) {
        self.event_handler(transactions_left);
    }
}

impl<'a, SPI, RXSTREAM, TXSTREAM> SpiMasterLowLevel<'a>
    for SpiMasterDmaBased<'a, SPI, RXSTREAM, TXSTREAM>
where
    SPI: Instance + 'a,
    RXSTREAM: StreamInstance + 'a,
    TXSTREAM: StreamInstance + 'a,
{
    fn configure(
        &self,
        mode: Mode,
        clock_frequency: u32,
        word_length: u8,
        lsb_first: bool,
        dummy_data: u16,
    ) -> Result<u32> {
        SpiMasterDmaBased::configure(self, mode, clock_frequency, word_length, lsb_first, dummy_data)
    }

    fn start(&'a self) -> Result<()> {
        SpiMasterDmaBased::start(self)
    }

    fn stop(&self) -> Result<()> {
        SpiMasterDmaBased::stop(self)
    }

    unsafe fn start_transfer(
        &self,
        observer: &'a dyn SpiMasterObserver,
        write_buffer: Option<*const u8>,
        read_buffer: Option<*mut u8>,
        size: usize,
    ) -> Result<()> {
        SpiMasterDmaBased::start_transfer(self, observer, write_buffer, read_buffer, size)
    }
}

impl<SPI, RXSTREAM, TXSTREAM> Drop for SpiMasterDmaBased<'_, SPI, RXSTREAM, TXSTREAM>
where
    SPI: Instance,
    RXSTREAM: StreamInstance,
    TXSTREAM: StreamInstance,
{
    fn drop(&mut self) {
        if !self.started.get() {
            return;
        }

        // the handles release their channels on their own drop
        self.spi.cr1.set(0);
        self.spi.cr2.set(0);
    }
}
