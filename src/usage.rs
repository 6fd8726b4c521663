//! HID usage identifiers and descriptor-derived usage records
//!
//! A usage is a 32 bit identifier, `(page << 16) | id`. The reserved page
//! `0xFFF1` carries the virtual layer usages that gate which mappings are
//! live; it never appears in a real HID descriptor.

use heapless::Vec;
use log::warn;
use packed_struct::prelude::*;

/// Number of mapping layers, including the default layer 0
pub const NLAYERS: usize = 4;

/// Usage page of the virtual layer usages: `LAYERS_USAGE_PAGE | layer`
pub const LAYERS_USAGE_PAGE: u32 = 0xFFF1_0000;

/// Generic Desktop / Wheel
pub const V_SCROLL_USAGE: u32 = 0x0001_0038;
/// Consumer / AC Pan
pub const H_SCROLL_USAGE: u32 = 0x000C_0238;

/// Resolution-multiplier feature bit for the vertical wheel
pub const V_RESOLUTION_BITMASK: u8 = 1 << 0;
/// Resolution-multiplier feature bit for the horizontal wheel
pub const H_RESOLUTION_BITMASK: u8 = 1 << 2;

/// Wheel resolution multiplier declared by the outgoing report descriptor:
/// one detent is 120 counts when a hi-res resolution bit is set.
pub const RESOLUTION_MULTIPLIER: i32 = 120;

/// Location and interpretation of one usage within a report, as derived
/// from a report descriptor.
///
/// Array items (`is_array`) are scanned as `count` consecutive fields of
/// `size` bits; the usage reads as 1 when any field holds `index`. Variable
/// items read the field at `bitpos` directly, sign-extended when
/// `logical_minimum` is negative.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UsageDef {
    pub report_id: u8,
    pub bitpos: u16,
    pub size: u8,
    pub count: u8,
    pub index: u32,
    pub logical_minimum: i32,
    pub is_relative: bool,
    pub is_array: bool,
}

/// One run of consecutive usages, the wire form published to host tooling
#[derive(Clone, Copy, Debug, PartialEq, Eq, PackedStruct)]
#[packed_struct(endian = "lsb", size_bytes = "8")]
pub struct UsageRle {
    #[packed_field]
    pub usage: u32,
    #[packed_field]
    pub count: u32,
}

/// Run-length encode an ascending usage list into `{start, count}` runs.
///
/// `usages` must be sorted ascending with no duplicates. Usage 0 is a
/// sentinel and never present. `output` is cleared first; runs that do not
/// fit are dropped with a log line.
pub fn rlencode<const N: usize>(usages: &[u32], output: &mut Vec<UsageRle, N>) {
    output.clear();
    let mut start_usage = 0;
    let mut count = 0;
    for &usage in usages {
        if start_usage == 0 {
            start_usage = usage;
            count = 1;
            continue;
        }
        if usage == start_usage + count {
            count += 1;
        } else {
            push_run(output, start_usage, count);
            start_usage = usage;
            count = 1;
        }
    }
    if start_usage != 0 {
        push_run(output, start_usage, count);
    }
}

fn push_run<const N: usize>(output: &mut Vec<UsageRle, N>, usage: u32, count: u32) {
    if output.push(UsageRle { usage, count }).is_err() {
        warn!("usage RLE table full, dropping run at {:08x}", usage);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rlencode_collapses_runs() {
        let usages = [0x0001_0030, 0x0001_0031, 0x0001_0032, 0x0009_0001, 0x0009_0002];
        let mut output: Vec<UsageRle, 8> = Vec::new();
        rlencode(&usages, &mut output);
        assert_eq!(
            output.as_slice(),
            &[
                UsageRle { usage: 0x0001_0030, count: 3 },
                UsageRle { usage: 0x0009_0001, count: 2 },
            ]
        );
    }

    #[test]
    fn rlencode_empty() {
        let mut output: Vec<UsageRle, 8> = Vec::new();
        rlencode(&[], &mut output);
        assert!(output.is_empty());
    }

    #[test]
    fn rlencode_single() {
        let mut output: Vec<UsageRle, 8> = Vec::new();
        rlencode(&[0x0001_0038], &mut output);
        assert_eq!(output.as_slice(), &[UsageRle { usage: 0x0001_0038, count: 1 }]);
    }

    #[test]
    fn usage_rle_wire_format() {
        let run = UsageRle { usage: 0x0001_0030, count: 3 };
        assert_eq!(run.pack(), Ok([0x30, 0x00, 0x01, 0x00, 0x03, 0x00, 0x00, 0x00]));
    }
}
