//! Convenience re-exports of the driver traits.

pub use crate::dma::DmaChannelObserver as _;
pub use crate::sdmmc::{SdMmcCardLowLevel as _, SdMmcCardObserver as _};
pub use crate::spi::{SpiMasterLowLevel as _, SpiMasterObserver as _};
