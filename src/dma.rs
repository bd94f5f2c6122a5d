//! # Direct Memory Access
//!
//! Reservable stream engine for the dual DMA controllers. A [`DmaChannel`]
//! pairs one hardware stream with the observer that receives its completion
//! events; exclusive use is enforced through [`DmaChannelHandle`], which
//! releases the reservation when dropped.
//!
//! A channel performs one linear memory<->peripheral transfer per
//! `start_transfer` call. There is no queueing: the observer runs in the DMA
//! interrupt and may reconfigure and restart the stream from there.

use core::cell::Cell;
use core::ops::Deref;

use vcell::VolatileCell;

use crate::{Error, Result};

/// Highest request line identifier selectable for a stream.
pub const MAX_REQUEST: u8 = 15;

/// Hardware limit of the 16-bit remaining-transactions counter.
pub const MAX_TRANSACTIONS: usize = u16::MAX as usize;

/// Shared status and clear registers of one DMA controller.
#[repr(C)]
pub struct DmaRegisterBlock {
    pub lisr: VolatileCell<u32>,
    pub hisr: VolatileCell<u32>,
    pub lifcr: VolatileCell<u32>,
    pub hifcr: VolatileCell<u32>,
}

/// Register file of one DMA stream.
#[repr(C)]
pub struct StreamRegisterBlock {
    pub cr: VolatileCell<u32>,
    pub ndtr: VolatileCell<u32>,
    pub par: VolatileCell<u32>,
    pub m0ar: VolatileCell<u32>,
    pub m1ar: VolatileCell<u32>,
    pub fcr: VolatileCell<u32>,
}

#[cfg(test)]
impl DmaRegisterBlock {
    pub(crate) const fn new() -> Self {
        DmaRegisterBlock {
            lisr: VolatileCell::new(0),
            hisr: VolatileCell::new(0),
            lifcr: VolatileCell::new(0),
            hifcr: VolatileCell::new(0),
        }
    }
}

#[cfg(test)]
impl StreamRegisterBlock {
    pub(crate) const fn new() -> Self {
        StreamRegisterBlock {
            cr: VolatileCell::new(0),
            ndtr: VolatileCell::new(0),
            par: VolatileCell::new(0),
            m0ar: VolatileCell::new(0),
            m1ar: VolatileCell::new(0),
            fcr: VolatileCell::new(0),
        }
    }
}

pub(crate) const CR_EN: u32 = 1 << 0;
pub(crate) const CR_DMEIE: u32 = 1 << 1;
pub(crate) const CR_TEIE: u32 = 1 << 2;
pub(crate) const CR_HTIE: u32 = 1 << 3;
pub(crate) const CR_TCIE: u32 = 1 << 4;
pub(crate) const CR_CHSEL_POS: u32 = 25;
const CR_PSIZE_POS: u32 = 11;
const CR_MSIZE_POS: u32 = 13;
const CR_PBURST_POS: u32 = 21;
const CR_MBURST_POS: u32 = 23;

// per-stream interrupt flags, before the channel shift is applied
pub(crate) const FLAG_FEIF: u32 = 1 << 0;
pub(crate) const FLAG_DMEIF: u32 = 1 << 2;
pub(crate) const FLAG_TEIF: u32 = 1 << 3;
pub(crate) const FLAG_HTIF: u32 = 1 << 4;
pub(crate) const FLAG_TCIF: u32 = 1 << 5;
const FLAG_ALL: u32 = FLAG_FEIF | FLAG_DMEIF | FLAG_TEIF | FLAG_HTIF | FLAG_TCIF;

const FCR_FTH_MASK: u32 = 0b11;
const FCR_DMDIS: u32 = 1 << 2;

/// Shift of one stream's flags within the shared LISR/HISR/LIFCR/HIFCR
/// registers.
pub(crate) const fn channel_shift(stream_id: u8) -> u32 {
    [0, 6, 16, 22][(stream_id % 4) as usize]
}

bitflags::bitflags! {
    /// Per-transfer configuration of a DMA stream.
    ///
    /// The values mirror the stream configuration register, so a
    /// combination of flags is programmed verbatim. Symmetric pairs have
    /// `DATA_SIZE_*`/`BURST_SIZE_*` aliases covering both sides at once;
    /// the zero-valued defaults (`PERIPHERAL_TO_MEMORY`, `MEMORY_FIXED`,
    /// `LOW_PRIORITY`, size/burst 1, ...) are provided as named constants
    /// for readable call sites.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Flags: u32 {
        const HALF_TRANSFER_INTERRUPT_ENABLE = 1 << 3;
        const TRANSFER_COMPLETE_INTERRUPT_ENABLE = 1 << 4;
        const PERIPHERAL_FLOW_CONTROLLER = 1 << 5;
        const MEMORY_TO_PERIPHERAL = 0b01 << 6;
        const PERIPHERAL_INCREMENT = 1 << 9;
        const MEMORY_INCREMENT = 1 << 10;
        const PERIPHERAL_DATA_SIZE_2 = 0b01 << 11;
        const PERIPHERAL_DATA_SIZE_4 = 0b10 << 11;
        const MEMORY_DATA_SIZE_2 = 0b01 << 13;
        const MEMORY_DATA_SIZE_4 = 0b10 << 13;
        const DATA_SIZE_2 = Self::PERIPHERAL_DATA_SIZE_2.bits() | Self::MEMORY_DATA_SIZE_2.bits();
        const DATA_SIZE_4 = Self::PERIPHERAL_DATA_SIZE_4.bits() | Self::MEMORY_DATA_SIZE_4.bits();
        const MEDIUM_PRIORITY = 0b01 << 16;
        const HIGH_PRIORITY = 0b10 << 16;
        const VERY_HIGH_PRIORITY = 0b11 << 16;
        const PERIPHERAL_BURST_SIZE_4 = 0b01 << 21;
        const PERIPHERAL_BURST_SIZE_8 = 0b10 << 21;
        const PERIPHERAL_BURST_SIZE_16 = 0b11 << 21;
        const MEMORY_BURST_SIZE_4 = 0b01 << 23;
        const MEMORY_BURST_SIZE_8 = 0b10 << 23;
        const MEMORY_BURST_SIZE_16 = 0b11 << 23;
        const BURST_SIZE_4 = Self::PERIPHERAL_BURST_SIZE_4.bits() | Self::MEMORY_BURST_SIZE_4.bits();
        const BURST_SIZE_8 = Self::PERIPHERAL_BURST_SIZE_8.bits() | Self::MEMORY_BURST_SIZE_8.bits();
        const BURST_SIZE_16 = Self::PERIPHERAL_BURST_SIZE_16.bits() | Self::MEMORY_BURST_SIZE_16.bits();
    }
}

impl Flags {
    pub const TRANSFER_COMPLETE_INTERRUPT_DISABLE: Flags = Flags::empty();
    pub const HALF_TRANSFER_INTERRUPT_DISABLE: Flags = Flags::empty();
    pub const DMA_FLOW_CONTROLLER: Flags = Flags::empty();
    pub const PERIPHERAL_TO_MEMORY: Flags = Flags::empty();
    pub const PERIPHERAL_FIXED: Flags = Flags::empty();
    pub const MEMORY_FIXED: Flags = Flags::empty();
    pub const PERIPHERAL_DATA_SIZE_1: Flags = Flags::empty();
    pub const MEMORY_DATA_SIZE_1: Flags = Flags::empty();
    pub const DATA_SIZE_1: Flags = Flags::empty();
    pub const LOW_PRIORITY: Flags = Flags::empty();
    pub const PERIPHERAL_BURST_SIZE_1: Flags = Flags::empty();
    pub const MEMORY_BURST_SIZE_1: Flags = Flags::empty();
    pub const BURST_SIZE_1: Flags = Flags::empty();

    /// Memory-side data size, bytes.
    fn memory_data_size(self) -> usize {
        1 << (self.bits() >> CR_MSIZE_POS & 0b11)
    }

    /// Peripheral-side data size, bytes.
    fn peripheral_data_size(self) -> usize {
        1 << (self.bits() >> CR_PSIZE_POS & 0b11)
    }

    /// Memory-side burst length, beats.
    fn memory_burst_size(self) -> usize {
        burst_size(self.bits() >> CR_MBURST_POS & 0b11)
    }

    /// Peripheral-side burst length, beats.
    fn peripheral_burst_size(self) -> usize {
        burst_size(self.bits() >> CR_PBURST_POS & 0b11)
    }
}

const fn burst_size(bits: u32) -> usize {
    if bits == 0 {
        1
    } else {
        1 << (bits + 1)
    }
}

/// One DMA stream usable by [`DmaChannel`].
///
/// This singleton has exclusive access to the registers of the stream and
/// knows its index within the owning controller.
pub trait StreamInstance: crate::Sealed + Deref<Target = StreamRegisterBlock> {
    /// Shared status/clear registers of the owning controller.
    fn controller(&self) -> &DmaRegisterBlock;

    /// Index of the stream within the controller, [0; 7].
    fn stream_id(&self) -> u8;
}

/// Receives the terminal events of an asynchronous DMA transfer.
///
/// All methods run in the DMA interrupt and must not block. Exactly one of
/// them is invoked per physical completion.
pub trait DmaChannelObserver {
    /// The expected number of transactions was executed.
    fn transfer_complete_event(&self);

    /// Half of the transactions were executed. Delivered only when the
    /// transfer was configured with `HALF_TRANSFER_INTERRUPT_ENABLE`.
    fn half_transfer_event(&self) {}

    /// The transfer failed; `transactions_left` is the authoritative count
    /// of transactions that were not executed.
    fn transfer_error_event(&self, transactions_left: usize);
}

/// Low-level driver of one DMA stream.
///
/// The observer reference doubles as the reservation marker: it is present
/// exactly while some [`DmaChannelHandle`] holds the channel.
pub struct DmaChannel<'a, STREAM: StreamInstance> {
    stream: STREAM,
    observer: Cell<Option<&'a dyn DmaChannelObserver>>,
    request: Cell<u8>,
}

// Shared between thread context and the DMA interrupt on a single core; the
// observer cell is only written inside a critical section or while no
// transfer can be in flight.
unsafe impl<STREAM: StreamInstance> Sync for DmaChannel<'_, STREAM> {}

impl<'a, STREAM: StreamInstance> DmaChannel<'a, STREAM> {
    pub const fn new(stream: STREAM) -> Self {
        DmaChannel {
            stream,
            observer: Cell::new(None),
            request: Cell::new(0),
        }
    }

    /// Forwards the stream's interrupt to the reserved observer.
    ///
    /// Must be called from the stream's interrupt handler; not user API.
    /// The handled flag is cleared before dispatching, so the observer may
    /// stop and restart the channel from within the event.
    pub fn interrupt_handler(&self) {
        let stream_id = self.stream.stream_id();
        let shift = channel_shift(stream_id);
        let controller = self.stream.controller();
        let isr = if stream_id <= 3 {
            controller.lisr.get()
        } else {
            controller.hisr.get()
        };
        let cr = self.stream.cr.get();

        let mut enabled = 0;
        if isr & FLAG_TEIF << shift != 0 && cr & CR_TEIE != 0 {
            enabled |= FLAG_TEIF << shift;
        }
        if isr & FLAG_TCIF << shift != 0 && cr & CR_TCIE != 0 {
            enabled |= FLAG_TCIF << shift;
        }
        if isr & FLAG_HTIF << shift != 0 && cr & CR_HTIE != 0 {
            enabled |= FLAG_HTIF << shift;
        }
        if enabled == 0 {
            return;
        }

        self.write_ifcr(enabled);

        let Some(observer) = self.observer.get() else {
            // released between the hardware event and this handler
            return;
        };
        if enabled & FLAG_TEIF << shift != 0 {
            observer.transfer_error_event(self.stream.ndtr.get() as usize);
        } else if enabled & FLAG_TCIF << shift != 0 {
            observer.transfer_complete_event();
        } else {
            observer.half_transfer_event();
        }
    }

    fn write_ifcr(&self, flags: u32) {
        let controller = self.stream.controller();
        if self.stream.stream_id() <= 3 {
            controller.lifcr.set(flags);
        } else {
            controller.hifcr.set(flags);
        }
    }

    fn reserve(&self, request: u8, observer: &'a dyn DmaChannelObserver) -> Result<()> {
        if request > MAX_REQUEST {
            return Err(Error::InvalidArgument);
        }

        critical_section::with(|_| {
            if self.observer.get().is_some() {
                return Err(Error::Busy);
            }

            self.observer.set(Some(observer));
            self.request.set(request);
            Ok(())
        })
    }

    fn release(&self) {
        self.stop_transfer();
        self.observer.set(None);
    }

    fn transactions_left(&self) -> usize {
        self.stream.ndtr.get() as usize
    }

    fn configure_transfer(
        &self,
        memory_address: usize,
        peripheral_address: usize,
        transactions: usize,
        flags: Flags,
    ) -> Result<()> {
        let memory_data_size = flags.memory_data_size();
        let peripheral_data_size = flags.peripheral_data_size();
        if memory_data_size > 4 || peripheral_data_size > 4 {
            return Err(Error::InvalidArgument);
        }

        // a memory burst must not cross a 1 kB boundary, hence the 16-byte
        // alignment cap on the memory side
        let memory_alignment = (memory_data_size * flags.memory_burst_size()).min(16);
        let peripheral_alignment = peripheral_data_size * flags.peripheral_burst_size();
        if memory_address % memory_alignment != 0 || peripheral_address % peripheral_alignment != 0
        {
            return Err(Error::InvalidArgument);
        }

        if transactions == 0 {
            return Err(Error::InvalidArgument);
        }
        if transactions > MAX_TRANSACTIONS {
            return Err(Error::NotSupported);
        }

        if self.stream.cr.get() & CR_EN != 0 {
            return Err(Error::Busy);
        }

        self.stream
            .cr
            .set(u32::from(self.request.get()) << CR_CHSEL_POS | flags.bits() | CR_TEIE);
        self.stream.ndtr.set(transactions as u32);
        self.stream.par.set(peripheral_address as u32);
        self.stream.m0ar.set(memory_address as u32);
        self.stream.fcr.set(FCR_DMDIS | FCR_FTH_MASK);
        Ok(())
    }

    fn start_transfer(&self) -> Result<()> {
        let cr = self.stream.cr.get();
        if cr & CR_EN != 0 {
            return Err(Error::Busy);
        }

        self.stream.cr.set(cr | CR_EN);
        Ok(())
    }

    fn stop_transfer(&self) {
        let cr = self.stream.cr.get();
        self.stream
            .cr
            .set(cr & !(CR_TCIE | CR_HTIE | CR_TEIE | CR_DMEIE | CR_EN));
        // the stream keeps EN asserted until the outstanding beat finishes
        while self.stream.cr.get() & CR_EN != 0 {}
        self.write_ifcr(FLAG_ALL << channel_shift(self.stream.stream_id()));
    }
}

/// Exclusive handle to a reserved [`DmaChannel`].
///
/// A handle owns no reservation or exactly one; dropping it releases. At
/// any instant at most one handle references a given channel.
pub struct DmaChannelHandle<'a, STREAM: StreamInstance> {
    channel: Cell<Option<&'a DmaChannel<'a, STREAM>>>,
}

impl<'a, STREAM: StreamInstance> DmaChannelHandle<'a, STREAM> {
    pub const fn new() -> Self {
        DmaChannelHandle {
            channel: Cell::new(None),
        }
    }

    /// Reserves `channel` for exclusive use via this handle.
    ///
    /// Any previous reservation of this handle is released first. The
    /// observer is notified about transfer events from interrupt context
    /// for as long as the reservation is held.
    pub fn reserve(
        &self,
        channel: &'a DmaChannel<'a, STREAM>,
        request: u8,
        observer: &'a dyn DmaChannelObserver,
    ) -> Result<()> {
        self.release();

        channel.reserve(request, observer)?;
        self.channel.set(Some(channel));
        Ok(())
    }

    /// Releases the associated channel; no-op on an empty handle.
    ///
    /// Must not be called while a transfer is in flight.
    pub fn release(&self) {
        if let Some(channel) = self.channel.take() {
            channel.release();
        }
    }

    /// Programs the parameters of the next transfer without starting it.
    ///
    /// `memory_address` must be aligned to the memory data size times the
    /// memory burst length (capped at 16 bytes), `peripheral_address` to
    /// the peripheral data size times the peripheral burst length.
    ///
    /// # Safety
    ///
    /// Once the transfer is started the stream reads or writes
    /// `transactions` data items at `memory_address`; the caller must
    /// guarantee that memory stays valid - and unaliased for
    /// peripheral-to-memory transfers - until the transfer completes or is
    /// stopped.
    pub unsafe fn configure_transfer(
        &self,
        memory_address: usize,
        peripheral_address: usize,
        transactions: usize,
        flags: Flags,
    ) -> Result<()> {
        self.channel()?
            .configure_transfer(memory_address, peripheral_address, transactions, flags)
    }

    /// Enables the stream, starting the configured transfer.
    pub fn start_transfer(&self) -> Result<()> {
        self.channel()?.start_transfer()
    }

    /// Disables the stream and clears its pending flags.
    ///
    /// Idempotent; also legal after completion to drain leftover state.
    pub fn stop_transfer(&self) -> Result<()> {
        self.channel()?.stop_transfer();
        Ok(())
    }

    /// Current value of the hardware remaining-transactions counter.
    pub fn transactions_left(&self) -> Result<usize> {
        Ok(self.channel()?.transactions_left())
    }

    fn channel(&self) -> Result<&'a DmaChannel<'a, STREAM>> {
        self.channel.get().ok_or(Error::WrongState)
    }
}

impl<STREAM: StreamInstance> Default for DmaChannelHandle<'_, STREAM> {
    fn default() -> Self {
        Self::new()
    }
}

impl<STREAM: StreamInstance> Drop for DmaChannelHandle<'_, STREAM> {
    fn drop(&mut self) {
        self.release();
    }
}


#[cfg(test)]
mod tests {
    use super::mock::{FakeStream, RecordingDmaObserver};
    use super::*;

    const MEMORY_ADDRESS: usize = 0x2000_0040;
    const PERIPHERAL_ADDRESS: usize = 0x4001_300c;

    fn reserved_setup<'a>(
        channel: &'a DmaChannel<'a, FakeStream>,
        handle: &DmaChannelHandle<'a, FakeStream>,
        observer: &'a RecordingDmaObserver,
    ) {
        handle.reserve(channel, 3, observer).unwrap();
    }

    #[test]
    fn empty_handle_rejects_everything() {
        let handle: DmaChannelHandle<'_, FakeStream> = DmaChannelHandle::new();
        assert_eq!(
            unsafe { handle.configure_transfer(MEMORY_ADDRESS, PERIPHERAL_ADDRESS, 1, Flags::empty()) },
            Err(Error::WrongState)
        );
        assert_eq!(handle.start_transfer(), Err(Error::WrongState));
        assert_eq!(handle.stop_transfer(), Err(Error::WrongState));
        assert_eq!(handle.transactions_left(), Err(Error::WrongState));
        handle.release(); // no-op
    }

    #[test]
    fn reservation_is_exclusive() {
        let observer = RecordingDmaObserver::default();
        let other_observer = RecordingDmaObserver::default();
        let channel = DmaChannel::new(FakeStream::new(0));
        let handle = DmaChannelHandle::new();
        let other_handle = DmaChannelHandle::new();

        assert_eq!(
            handle.reserve(&channel, MAX_REQUEST + 1, &observer),
            Err(Error::InvalidArgument)
        );
        handle.reserve(&channel, 3, &observer).unwrap();
        assert_eq!(
            other_handle.reserve(&channel, 4, &other_observer),
            Err(Error::Busy)
        );

        handle.release();
        other_handle.reserve(&channel, 4, &other_observer).unwrap();
    }

    #[test]
    fn dropping_a_handle_releases_the_channel() {
        let observer = RecordingDmaObserver::default();
        let channel = DmaChannel::new(FakeStream::new(0));
        {
            let handle = DmaChannelHandle::new();
            handle.reserve(&channel, 0, &observer).unwrap();
        }
        let handle = DmaChannelHandle::new();
        handle.reserve(&channel, 0, &observer).unwrap();
    }

    #[test]
    fn configure_programs_the_stream() {
        let observer = RecordingDmaObserver::default();
        let channel = DmaChannel::new(FakeStream::new(0));
        let handle = DmaChannelHandle::new();
        reserved_setup(&channel, &handle, &observer);
        let regs = channel.stream.stream_regs();

        let flags = Flags::TRANSFER_COMPLETE_INTERRUPT_ENABLE
            | Flags::PERIPHERAL_TO_MEMORY
            | Flags::PERIPHERAL_FIXED
            | Flags::MEMORY_INCREMENT
            | Flags::DATA_SIZE_2
            | Flags::VERY_HIGH_PRIORITY;
        unsafe {
            handle
                .configure_transfer(MEMORY_ADDRESS, PERIPHERAL_ADDRESS, 5, flags)
                .unwrap();
        }

        assert_eq!(regs.cr.get(), 3 << CR_CHSEL_POS | flags.bits() | CR_TEIE);
        assert_eq!(regs.ndtr.get(), 5);
        assert_eq!(regs.par.get(), PERIPHERAL_ADDRESS as u32);
        assert_eq!(regs.m0ar.get(), MEMORY_ADDRESS as u32);
        assert_eq!(regs.fcr.get(), 0b111);
        // not started yet
        assert_eq!(regs.cr.get() & CR_EN, 0);
    }

    #[test]
    fn configure_validates_arguments() {
        let observer = RecordingDmaObserver::default();
        let channel = DmaChannel::new(FakeStream::new(0));
        let handle = DmaChannelHandle::new();
        reserved_setup(&channel, &handle, &observer);

        let cases: [(usize, usize, usize, Flags, Error); 6] = [
            // zero transactions
            (MEMORY_ADDRESS, PERIPHERAL_ADDRESS, 0, Flags::empty(), Error::InvalidArgument),
            // more than the 16-bit counter can hold
            (MEMORY_ADDRESS, PERIPHERAL_ADDRESS, 65536, Flags::empty(), Error::NotSupported),
            // memory address not aligned to the data size
            (MEMORY_ADDRESS + 1, PERIPHERAL_ADDRESS, 1, Flags::DATA_SIZE_2, Error::InvalidArgument),
            // peripheral address not aligned to data size x burst
            (
                MEMORY_ADDRESS,
                PERIPHERAL_ADDRESS + 2,
                1,
                Flags::DATA_SIZE_2 | Flags::PERIPHERAL_BURST_SIZE_4,
                Error::InvalidArgument,
            ),
            // memory alignment is capped at 16 bytes: +16 passes, +8 fails
            (
                MEMORY_ADDRESS + 8,
                PERIPHERAL_ADDRESS,
                1,
                Flags::MEMORY_DATA_SIZE_2 | Flags::MEMORY_BURST_SIZE_16,
                Error::InvalidArgument,
            ),
            // both data size fields at the reserved encoding
            (
                MEMORY_ADDRESS,
                PERIPHERAL_ADDRESS,
                1,
                Flags::DATA_SIZE_2 | Flags::DATA_SIZE_4,
                Error::InvalidArgument,
            ),
        ];
        for (memory_address, peripheral_address, transactions, flags, error) in cases {
            assert_eq!(
                unsafe {
                    handle.configure_transfer(memory_address, peripheral_address, transactions, flags)
                },
                Err(error)
            );
        }

        // the capped memory alignment accepts 16-byte aligned addresses
        unsafe {
            handle
                .configure_transfer(
                    MEMORY_ADDRESS + 16,
                    PERIPHERAL_ADDRESS,
                    1,
                    Flags::MEMORY_DATA_SIZE_2 | Flags::MEMORY_BURST_SIZE_16,
                )
                .unwrap();
        }
        assert_eq!(handle.transactions_left().unwrap(), 1);
    }

    #[test]
    fn transfer_lifecycle() {
        let observer = RecordingDmaObserver::default();
        let channel = DmaChannel::new(FakeStream::new(0));
        let handle = DmaChannelHandle::new();
        reserved_setup(&channel, &handle, &observer);
        let regs = channel.stream.stream_regs();

        unsafe {
            handle
                .configure_transfer(MEMORY_ADDRESS, PERIPHERAL_ADDRESS, 4, Flags::empty())
                .unwrap();
        }
        handle.start_transfer().unwrap();
        assert_ne!(regs.cr.get() & CR_EN, 0);

        // configuring or restarting a running stream fails
        assert_eq!(
            unsafe { handle.configure_transfer(MEMORY_ADDRESS, PERIPHERAL_ADDRESS, 4, Flags::empty()) },
            Err(Error::Busy)
        );
        assert_eq!(handle.start_transfer(), Err(Error::Busy));

        handle.stop_transfer().unwrap();
        assert_eq!(regs.cr.get() & (CR_EN | CR_TCIE | CR_HTIE | CR_TEIE | CR_DMEIE), 0);
        let lifcr = channel.stream.controller_regs().lifcr.get();
        assert_eq!(lifcr, FLAG_ALL << channel_shift(0));
        // stop is idempotent
        handle.stop_transfer().unwrap();
    }

    #[test]
    fn interrupt_dispatches_completion() {
        let observer = RecordingDmaObserver::default();
        let channel = DmaChannel::new(FakeStream::new(2));
        let handle = DmaChannelHandle::new();
        reserved_setup(&channel, &handle, &observer);

        unsafe {
            handle
                .configure_transfer(
                    MEMORY_ADDRESS,
                    PERIPHERAL_ADDRESS,
                    4,
                    Flags::TRANSFER_COMPLETE_INTERRUPT_ENABLE,
                )
                .unwrap();
        }
        handle.start_transfer().unwrap();

        let controller = channel.stream.controller_regs();
        let shift = channel_shift(2);
        channel.stream.stream_regs().ndtr.set(0);
        controller.lisr.set(FLAG_TCIF << shift);
        channel.interrupt_handler();

        assert_eq!(observer.completes.get(), 1);
        assert_eq!(observer.errors.get(), 0);
        assert_eq!(controller.lifcr.get(), FLAG_TCIF << shift);
    }

    #[test]
    fn interrupt_dispatches_error_with_remaining_count() {
        let observer = RecordingDmaObserver::default();
        // stream in the upper half uses HISR/HIFCR
        let channel = DmaChannel::new(FakeStream::new(5));
        let handle = DmaChannelHandle::new();
        reserved_setup(&channel, &handle, &observer);

        unsafe {
            handle
                .configure_transfer(MEMORY_ADDRESS, PERIPHERAL_ADDRESS, 7, Flags::empty())
                .unwrap();
        }
        handle.start_transfer().unwrap();

        let controller = channel.stream.controller_regs();
        let shift = channel_shift(5);
        channel.stream.stream_regs().ndtr.set(3);
        controller.hisr.set(FLAG_TEIF << shift);
        channel.interrupt_handler();

        assert_eq!(observer.errors.get(), 1);
        assert_eq!(observer.last_transactions_left.get(), 3);
        assert_eq!(controller.hifcr.get(), FLAG_TEIF << shift);
    }

    #[test]
    fn half_transfer_needs_explicit_enable() {
        let observer = RecordingDmaObserver::default();
        let channel = DmaChannel::new(FakeStream::new(0));
        let handle = DmaChannelHandle::new();
        reserved_setup(&channel, &handle, &observer);
        let controller = channel.stream.controller_regs();

        unsafe {
            handle
                .configure_transfer(MEMORY_ADDRESS, PERIPHERAL_ADDRESS, 4, Flags::empty())
                .unwrap();
        }
        handle.start_transfer().unwrap();
        controller.lisr.set(FLAG_HTIF);
        channel.interrupt_handler();
        assert_eq!(observer.halves.get(), 0);

        handle.stop_transfer().unwrap();
        unsafe {
            handle
                .configure_transfer(
                    MEMORY_ADDRESS,
                    PERIPHERAL_ADDRESS,
                    4,
                    Flags::HALF_TRANSFER_INTERRUPT_ENABLE,
                )
                .unwrap();
        }
        handle.start_transfer().unwrap();
        controller.lisr.set(FLAG_HTIF);
        channel.interrupt_handler();
        assert_eq!(observer.halves.get(), 1);
    }

    #[test]
    fn released_channel_stays_silent() {
        let observer = RecordingDmaObserver::default();
        let channel = DmaChannel::new(FakeStream::new(0));
        let handle = DmaChannelHandle::new();
        reserved_setup(&channel, &handle, &observer);

        unsafe {
            handle
                .configure_transfer(
                    MEMORY_ADDRESS,
                    PERIPHERAL_ADDRESS,
                    4,
                    Flags::TRANSFER_COMPLETE_INTERRUPT_ENABLE,
                )
                .unwrap();
        }
        handle.release();

        let controller = channel.stream.controller_regs();
        controller.lisr.set(FLAG_TCIF);
        channel.interrupt_handler();
        assert_eq!(observer.completes.get(), 0);
    }

    #[test]
    fn flags_are_cleared_before_dispatch() {
        struct IfcrObserver {
            controller: &'static DmaRegisterBlock,
            cleared_when_called: Cell<bool>,
        }
        impl DmaChannelObserver for IfcrObserver {
            fn transfer_complete_event(&self) {
                self.cleared_when_called
                    .set(self.controller.lifcr.get() & FLAG_TCIF != 0);
            }
            fn transfer_error_event(&self, _transactions_left: usize) {}
        }
        use core::cell::Cell;

        let stream = FakeStream::new(0);
        let controller = stream.controller_regs();
        let observer = IfcrObserver {
            controller,
            cleared_when_called: Cell::new(false),
        };
        let channel = DmaChannel::new(stream);
        let handle = DmaChannelHandle::new();
        handle.reserve(&channel, 0, &observer).unwrap();

        unsafe {
            handle
                .configure_transfer(
                    MEMORY_ADDRESS,
                    PERIPHERAL_ADDRESS,
                    1,
                    Flags::TRANSFER_COMPLETE_INTERRUPT_ENABLE,
                )
                .unwrap();
        }
        handle.start_transfer().unwrap();
        controller.lisr.set(FLAG_TCIF);
        channel.interrupt_handler();
        assert!(observer.cleared_when_called.get());
    }
}
