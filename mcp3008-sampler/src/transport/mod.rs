//! Pin backends.
//!
//! Each backend implements [`Gpio`](crate::hw_trait::Gpio) on top of some
//! host facility for toggling and sampling digital lines.

pub mod sysfs;

pub use sysfs::SysfsGpio;
