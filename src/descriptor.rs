//! Descriptor-derived lookup tables
//!
//! The report-descriptor parser runs outside this crate; it hands over a
//! [`ParsedDescriptor`] per descriptor. From that, [`OurTables`] derives
//! everything the data plane needs on the outgoing side (report buffers,
//! relative/absolute bit masks, the flat usage projection and the published
//! usage set), and [`TheirTables`] tracks the attached devices' usages per
//! interface together with the derived relative-usage sets.

use heapless::{FnvIndexMap, FnvIndexSet, Vec};
use log::warn;

use crate::bits::{put_bits, read_value};
use crate::usage::{rlencode, UsageDef, UsageRle};

pub const MAX_REPORTS: usize = 8;
pub const MAX_REPORT_BYTES: usize = 64;
pub const MAX_USAGES_PER_REPORT: usize = 64;
pub const MAX_USAGES: usize = 128;
pub const MAX_INTERFACES: usize = 8;
pub const MAX_RLE_RUNS: usize = 32;

pub type UsageMap = FnvIndexMap<u32, UsageDef, MAX_USAGES_PER_REPORT>;

/// Output of the external report-descriptor parser for one descriptor:
/// usages keyed by report id, report payload sizes, and whether reports on
/// the wire carry a leading report id byte.
#[derive(Default)]
pub struct ParsedDescriptor {
    pub usages: FnvIndexMap<u8, UsageMap, MAX_REPORTS>,
    pub report_sizes: FnvIndexMap<u8, u16, MAX_REPORTS>,
    pub has_report_id: bool,
}

impl ParsedDescriptor {
    #[must_use]
    pub fn new(has_report_id: bool) -> Self {
        Self {
            has_report_id,
            ..Self::default()
        }
    }

    pub fn set_report_size(&mut self, report_id: u8, size_bytes: u16) {
        if self.report_sizes.insert(report_id, size_bytes).is_err() {
            warn!("report table full, dropping report {}", report_id);
        }
    }

    /// Register `usage` under `def.report_id`
    pub fn add_usage(&mut self, usage: u32, def: UsageDef) {
        if let Some(map) = self.usages.get_mut(&def.report_id) {
            if map.insert(usage, def).is_err() {
                warn!("usage table full, dropping usage {:08x}", usage);
            }
        } else {
            let mut map = UsageMap::new();
            let _ = map.insert(usage, def);
            if self.usages.insert(def.report_id, map).is_err() {
                warn!("report table full, dropping usage {:08x}", usage);
            }
        }
    }
}

/// One outgoing report: its usages, masks, the working buffer the resolver
/// writes into and the image most recently queued for the host.
pub(crate) struct ReportSlot {
    size: u16,
    pub(crate) usages: UsageMap,
    working: [u8; MAX_REPORT_BYTES],
    previous: [u8; MAX_REPORT_BYTES],
    relative_mask: [u8; MAX_REPORT_BYTES],
    absolute_mask: [u8; MAX_REPORT_BYTES],
}

impl ReportSlot {
    fn new(size_bytes: u16) -> Self {
        let size = if usize::from(size_bytes) > MAX_REPORT_BYTES {
            warn!("report size {} exceeds buffer, truncating", size_bytes);
            MAX_REPORT_BYTES as u16
        } else {
            size_bytes
        };
        Self {
            size,
            usages: UsageMap::new(),
            working: [0; MAX_REPORT_BYTES],
            previous: [0; MAX_REPORT_BYTES],
            relative_mask: [0; MAX_REPORT_BYTES],
            absolute_mask: [0; MAX_REPORT_BYTES],
        }
    }

    fn len(&self) -> usize {
        usize::from(self.size)
    }

    pub(crate) fn working(&self) -> &[u8] {
        &self.working[..self.len()]
    }

    pub(crate) fn put_field(&mut self, bitpos: u16, size: u8, value: u32) {
        let len = self.len();
        put_bits(&mut self.working[..len], bitpos, size, value);
    }

    fn mask_field(&mut self, def: &UsageDef) {
        let len = self.len();
        let mask = if def.is_relative {
            &mut self.relative_mask
        } else {
            &mut self.absolute_mask
        };
        put_bits(&mut mask[..len], def.bitpos, def.size, u32::MAX);
    }

    /// Any pending relative movement, or any absolute state change since
    /// the image last queued for the host
    pub(crate) fn needs_send(&self) -> bool {
        (0..self.len()).any(|i| {
            self.working[i] & self.relative_mask[i] != 0
                || self.working[i] & self.absolute_mask[i]
                    != self.previous[i] & self.absolute_mask[i]
        })
    }

    /// Compare the working buffer against a queued payload on absolute bits
    pub(crate) fn differs_on_absolute(&self, other: &[u8]) -> bool {
        (0..self.len()).any(|i| {
            self.working[i] & self.absolute_mask[i]
                != other.get(i).copied().unwrap_or(0) & self.absolute_mask[i]
        })
    }

    /// Fold the working buffer's relative fields into `prev`, summing each
    /// signed field. Absolute bits in `prev` are left alone.
    pub(crate) fn aggregate_relative_into(&self, prev: &mut [u8]) {
        for (_, def) in self.usages.iter() {
            if !def.is_relative {
                continue;
            }
            let value = read_value(self.working(), def.bitpos, def.size, def.logical_minimum);
            if value != 0 {
                let existing = read_value(prev, def.bitpos, def.size, def.logical_minimum);
                put_bits(
                    prev,
                    def.bitpos,
                    def.size,
                    existing.wrapping_add(value) as u32,
                );
            }
        }
    }

    pub(crate) fn snapshot_previous(&mut self) {
        self.previous = self.working;
    }

    pub(crate) fn clear_working(&mut self) {
        self.working = [0; MAX_REPORT_BYTES];
    }

    #[cfg(test)]
    pub(crate) fn relative_mask(&self) -> &[u8] {
        &self.relative_mask[..self.len()]
    }

    #[cfg(test)]
    pub(crate) fn absolute_mask(&self) -> &[u8] {
        &self.absolute_mask[..self.len()]
    }
}

/// Outgoing-side tables, derived once from our report descriptor at boot
pub(crate) struct OurTables {
    pub(crate) reports: FnvIndexMap<u8, ReportSlot, MAX_REPORTS>,
    /// Flat projection over report ids; on collision the last writer wins
    pub(crate) flat: FnvIndexMap<u32, UsageDef, MAX_USAGES>,
    /// Stable enumeration order for the send path
    pub(crate) report_ids: Vec<u8, MAX_REPORTS>,
    pub(crate) rle: Vec<UsageRle, MAX_RLE_RUNS>,
}

impl OurTables {
    pub(crate) fn new(parsed: ParsedDescriptor) -> Self {
        let mut reports = FnvIndexMap::new();
        let mut report_ids = Vec::new();
        for (&report_id, &size) in parsed.report_sizes.iter() {
            if reports.insert(report_id, ReportSlot::new(size)).is_err() {
                warn!("report table full, dropping report {}", report_id);
            } else {
                let _ = report_ids.push(report_id);
            }
        }

        let mut flat = FnvIndexMap::new();
        for (&report_id, usage_map) in parsed.usages.iter() {
            let slot = match reports.get_mut(&report_id) {
                Some(slot) => slot,
                None => {
                    warn!("no size known for report {}, dropping its usages", report_id);
                    continue;
                }
            };
            for (&usage, def) in usage_map.iter() {
                let _ = slot.usages.insert(usage, *def);
                slot.mask_field(def);
                if flat.insert(usage, *def).is_err() {
                    warn!("flat usage table full, dropping usage {:08x}", usage);
                }
            }
        }

        let mut all: Vec<u32, MAX_USAGES> = Vec::new();
        for (&usage, _) in flat.iter() {
            let _ = all.push(usage);
        }
        sort_dedup(&mut all);
        let mut rle = Vec::new();
        rlencode(&all, &mut rle);

        Self {
            reports,
            flat,
            report_ids,
            rle,
        }
    }
}

pub(crate) struct TheirInterface {
    pub(crate) has_report_id: bool,
    pub(crate) reports: FnvIndexMap<u8, UsageMap, MAX_REPORTS>,
}

/// Attached-device tables, per interface, plus the products derived from
/// them: which incoming usages are relative (and must be zeroed after each
/// tick) and the published usage set.
#[derive(Default)]
pub(crate) struct TheirTables {
    pub(crate) interfaces: FnvIndexMap<u16, TheirInterface, MAX_INTERFACES>,
    pub(crate) relative_usages: Vec<u32, MAX_USAGES>,
    pub(crate) relative_set: FnvIndexSet<u32, MAX_USAGES>,
    pub(crate) rle: Vec<UsageRle, MAX_RLE_RUNS>,
}

impl TheirTables {
    /// Replace one interface's tables. The derived products are stale until
    /// [`Self::rebuild_derived`] runs; the engine flags that to the main
    /// loop rather than rebuilding inline.
    pub(crate) fn install(&mut self, interface: u16, parsed: ParsedDescriptor) {
        let entry = TheirInterface {
            has_report_id: parsed.has_report_id,
            reports: parsed.usages,
        };
        if self.interfaces.insert(interface, entry).is_err() {
            warn!("interface table full, dropping interface {}", interface);
        }
    }

    pub(crate) fn rebuild_derived(&mut self) {
        self.relative_usages.clear();
        self.relative_set.clear();

        let mut all: Vec<u32, MAX_USAGES> = Vec::new();
        for (_, iface) in self.interfaces.iter() {
            for (_, usage_map) in iface.reports.iter() {
                for (&usage, def) in usage_map.iter() {
                    let _ = all.push(usage);
                    if def.is_relative {
                        if self.relative_usages.push(usage).is_err() {
                            warn!("relative usage table full");
                        }
                        let _ = self.relative_set.insert(usage);
                    }
                }
            }
        }

        sort_dedup(&mut all);
        rlencode(&all, &mut self.rle);
    }
}

fn sort_dedup<const N: usize>(values: &mut Vec<u32, N>) {
    values.sort_unstable();
    let mut kept = 0;
    for i in 0..values.len() {
        if kept == 0 || values[kept - 1] != values[i] {
            values[kept] = values[i];
            kept += 1;
        }
    }
    values.truncate(kept);
}
