#![no_std]
#![warn(clippy::pedantic)]
#![warn(clippy::style)]
#![warn(clippy::cargo)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::use_self)]

//! USB HID remapping engine
//!
//! The data plane of a USB HID remapper: a device that sits between one or
//! more HID input devices and a USB host, re-interpreting the input reports
//! it receives into the output reports the host sees, according to a
//! user-supplied mapping table. Mappings are many-to-many and cross-device,
//! gated by four layers, optionally sticky (rising-edge toggled latches),
//! scaled in milli-units with sub-unit accumulation across ticks, and wheel
//! targets support hi-res passthrough or lo-res tick synthesis with partial
//! scroll decay.
//!
//! The engine is hardware agnostic. The HID descriptor parser, persistence
//! medium, clock and USB stack are consumed through the seams in [`runner`]
//! and [`engine`]; [`runner::Runner`] drives the cooperative main loop one
//! iteration per call, paced by the USB start-of-frame tick through
//! [`runner::SofFlag`].

//Allow the use of std in tests
#[cfg(test)]
#[macro_use]
extern crate std;

use usb_device::UsbError;

pub mod bits;
pub mod descriptor;
pub mod engine;
pub mod mapping;
pub mod prelude;
pub mod queue;
pub mod runner;
pub mod usage;

#[derive(Debug)]
pub enum RemapperError {
    WouldBlock,
    UsbError(UsbError),
}

impl From<UsbError> for RemapperError {
    fn from(e: UsbError) -> Self {
        match e {
            UsbError::WouldBlock => Self::WouldBlock,
            _ => Self::UsbError(e),
        }
    }
}
