// #![deny(warnings)]
#![no_std]

#[cfg(test)]
extern crate std;

pub extern crate embedded_hal as hal;

pub mod dma;
pub mod prelude;
pub mod sdmmc;
pub mod spi;
pub mod time;

#[cfg(feature = "stm32f7")]
pub mod chip;
#[cfg(feature = "stm32f7")]
pub mod spis;

mod sealed {
    pub trait Sealed {}
}

use sealed::Sealed;

/// Status codes returned by the low-level drivers.
///
/// Hardware failures (overrun, DMA transfer errors) are never reported
/// through these codes - they reach the caller through the observer
/// callback with a partial byte count instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// Operation issued in a lifecycle state that does not allow it
    /// (driver stopped when it must be started, or the other way around).
    WrongState,
    /// A transfer is in progress or the resource is already held.
    Busy,
    /// Parameter violates the operation's contract.
    InvalidArgument,
    /// Request exceeds a hardware limit.
    NotSupported,
    /// Transient allocation failed in an upper layer.
    OutOfMemory,
    /// Transaction did not finish within its deadline.
    Timeout,
}

impl Error {
    /// POSIX errno value of this status code.
    pub const fn errno(self) -> i32 {
        match self {
            Error::WrongState => 9,       // EBADF
            Error::Busy => 16,            // EBUSY
            Error::InvalidArgument => 22, // EINVAL
            Error::OutOfMemory => 12,     // ENOMEM
            Error::NotSupported => 95,    // ENOTSUP
            Error::Timeout => 110,        // ETIMEDOUT
        }
    }
}

pub type Result<T> = core::result::Result<T, Error>;
