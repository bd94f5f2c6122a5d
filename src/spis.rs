//! Board-level SPI driver instances and their interrupt dispatch.
//!
//! The drivers and the DMA channels they reserve are process-wide statics,
//! fully constructed at compile time - nothing is initialized lazily, so
//! an interrupt can never observe a half-built instance. `start()` on a
//! driver is the explicit bring-up step, `stop()` the teardown.
//!
//! The vector table glue must forward the corresponding interrupts to the
//! `*_interrupt_handler` functions below.

use crate::chip::{dma2, Spi1, Spi2, Spi3};
use crate::dma::DmaChannel;
use crate::spi::{SpiMasterDmaBased, SpiMasterInterruptBased};

/// DMA2 stream 0: RX channel of SPI1 (request 3).
pub static DMA2_STREAM0: DmaChannel<'static, dma2::S0> =
    DmaChannel::new(unsafe { dma2::S0::steal() });

/// DMA2 stream 3: TX channel of SPI1 (request 3).
pub static DMA2_STREAM3: DmaChannel<'static, dma2::S3> =
    DmaChannel::new(unsafe { dma2::S3::steal() });

/// SPI1, DMA-based.
pub static SPI1: SpiMasterDmaBased<'static, Spi1, dma2::S0, dma2::S3> =
    SpiMasterDmaBased::new(unsafe { Spi1::steal() }, &DMA2_STREAM0, 3, &DMA2_STREAM3, 3);

/// SPI2, interrupt-based.
pub static SPI2: SpiMasterInterruptBased<'static, Spi2> =
    SpiMasterInterruptBased::new(unsafe { Spi2::steal() });

/// SPI3, interrupt-based.
pub static SPI3: SpiMasterInterruptBased<'static, Spi3> =
    SpiMasterInterruptBased::new(unsafe { Spi3::steal() });

/// Call from the DMA2 stream 0 interrupt handler.
pub fn dma2_stream0_interrupt_handler() {
    DMA2_STREAM0.interrupt_handler();
}

/// Call from the DMA2 stream 3 interrupt handler.
pub fn dma2_stream3_interrupt_handler() {
    DMA2_STREAM3.interrupt_handler();
}

/// Call from the SPI2 interrupt handler.
pub fn spi2_interrupt_handler() {
    SPI2.interrupt_handler();
}

/// Call from the SPI3 interrupt handler.
pub fn spi3_interrupt_handler() {
    SPI3.interrupt_handler();
}
