//! STM32F7 bindings: peripheral addresses, bus clocks and the SPI and DMA
//! stream singletons used by the drivers.

use core::ops::Deref;

use crate::spi::{Instance, SpiRegisterBlock};
use crate::time::Hertz;

/// Bus clock frequencies of the reference clock tree (216 MHz core).
///
/// Clock configuration itself happens in board bring-up, before any driver
/// is started; these constants must match it.
pub mod clocks {
    use crate::time::Hertz;

    /// APB1 peripheral clock, feeds SPI2 and SPI3.
    pub const PCLK1: Hertz = Hertz::from_raw(54_000_000);
    /// APB2 peripheral clock, feeds SPI1 and SPI4..SPI6.
    pub const PCLK2: Hertz = Hertz::from_raw(108_000_000);
}

macro_rules! spi_instance {
    ($(#[$meta:meta])* $SPIX:ident, $base:literal, $pclk:ident) => {
        $(#[$meta])*
        pub struct $SPIX {
            _0: (),
        }

        impl $SPIX {
            pub(crate) const unsafe fn steal() -> Self {
                $SPIX { _0: () }
            }
        }

        impl Deref for $SPIX {
            type Target = SpiRegisterBlock;

            fn deref(&self) -> &SpiRegisterBlock {
                unsafe { &*($base as usize as *const SpiRegisterBlock) }
            }
        }

        impl crate::Sealed for $SPIX {}

        impl Instance for $SPIX {
            fn clock(&self) -> Hertz {
                clocks::$pclk
            }
        }
    };
}

spi_instance! {
    /// SPI1 peripheral, APB2.
    Spi1, 0x4001_3000, PCLK2
}
spi_instance! {
    /// SPI2 peripheral, APB1.
    Spi2, 0x4000_3800, PCLK1
}
spi_instance! {
    /// SPI3 peripheral, APB1.
    Spi3, 0x4000_3c00, PCLK1
}
spi_instance! {
    /// SPI4 peripheral, APB2.
    Spi4, 0x4001_3400, PCLK2
}
spi_instance! {
    /// SPI5 peripheral, APB2.
    Spi5, 0x4001_5000, PCLK2
}
spi_instance! {
    /// SPI6 peripheral, APB2.
    Spi6, 0x4001_5400, PCLK2
}

macro_rules! dma_streams {
    ($($dmax:ident: ($base:literal, { $($SX:ident: $id:literal,)+ }),)+) => {
        $(
            pub mod $dmax {
                use core::ops::Deref;

                use crate::dma::{DmaRegisterBlock, StreamInstance, StreamRegisterBlock};

                $(
                    /// A singleton that represents a single stream of this
                    /// DMA controller, with exclusive access to its
                    /// register file.
                    pub struct $SX {
                        _0: (),
                    }

                    impl $SX {
                        pub(crate) const unsafe fn steal() -> Self {
                            $SX { _0: () }
                        }
                    }

                    impl Deref for $SX {
                        type Target = StreamRegisterBlock;

                        fn deref(&self) -> &StreamRegisterBlock {
                            // stream register files start at offset 0x10,
                            // 0x18 bytes apart
                            unsafe {
                                &*(($base + 0x10 + 0x18 * $id) as usize as *const StreamRegisterBlock)
                            }
                        }
                    }

                    impl crate::Sealed for $SX {}

                    impl StreamInstance for $SX {
                        fn controller(&self) -> &DmaRegisterBlock {
                            unsafe { &*($base as usize as *const DmaRegisterBlock) }
                        }

                        fn stream_id(&self) -> u8 {
                            $id
                        }
                    }
                )+
            }
        )+
    };
}

dma_streams! {
    dma1: (0x4002_6000, {
        S0: 0,
        S1: 1,
        S2: 2,
        S3: 3,
        S4: 4,
        S5: 5,
        S6: 6,
        S7: 7,
    }),
    dma2: (0x4002_6400, {
        S0: 0,
        S1: 1,
        S2: 2,
        S3: 3,
        S4: 4,
        S5: 5,
        S6: 6,
        S7: 7,
    }),
}
