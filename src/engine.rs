//! The remapping engine
//!
//! [`Remapper`] owns every table and buffer of the data plane: the
//! descriptor-derived tables for both sides, the mapping configuration and
//! its reverse view, all per-usage runtime state, and the outgoing report
//! queue. The embedding firmware feeds it received reports, calls
//! [`Remapper::process_mapping`] on the millisecond tick, and drains the
//! queue into the HID endpoint whenever the stack is ready, usually via
//! [`crate::runner::Runner`], which wires those calls up in the right
//! order.

use delegate::delegate;
use fugit::MicrosDurationU64;
use heapless::FnvIndexMap;
use log::{trace, warn};

use crate::bits::read_value;
use crate::descriptor::{OurTables, ParsedDescriptor, TheirTables, MAX_USAGES};
use crate::mapping::{Config, ReverseMap};
use crate::queue::OutgoingQueue;
use crate::usage::{
    UsageDef, UsageRle, H_RESOLUTION_BITMASK, H_SCROLL_USAGE, LAYERS_USAGE_PAGE, NLAYERS,
    RESOLUTION_MULTIPLIER, V_RESOLUTION_BITMASK, V_SCROLL_USAGE,
};
use crate::RemapperError;

/// Timestamps handed to the engine, in microseconds
pub type Instant = fugit::TimerInstantU64<1_000_000>;

/// The submit side of the USB HID stack, called only when ready
pub trait HidEndpoint {
    fn ready(&self) -> bool;
    fn suspended(&self) -> bool;
    fn write_report(&mut self, report_id: u8, data: &[u8]) -> usb_device::Result<usize>;
}

/// Data-plane counters, reported once per second by the runner
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    pub reports_received: u32,
    pub reports_sent: u32,
    /// Cumulative outgoing-queue overflows; not reset by `take_stats`
    pub overflows: u32,
}

/// Sticky latches are keyed `(layer << 32) | usage`; layer-triggering
/// stickies use the bare usage (layer 0), matching how the resolver looks
/// them up from both paths.
#[derive(Clone, Copy, PartialEq, Eq)]
struct StickyKey(u64);

impl StickyKey {
    fn layered(layer: u8, usage: u32) -> Self {
        Self(u64::from(layer) << 32 | u64::from(usage))
    }

    fn trigger(usage: u32) -> Self {
        Self(u64::from(usage))
    }
}

impl hash32::Hash for StickyKey {
    fn hash<H: hash32::Hasher>(&self, state: &mut H) {
        state.write(&self.0.to_le_bytes());
    }
}

type UsageState = FnvIndexMap<u32, i32, MAX_USAGES>;

/// Lo-res wheel synthesis state, per source usage
#[derive(Default)]
struct ScrollState {
    accumulated: FnvIndexMap<u32, i32, 16>,
    last_timestamp: FnvIndexMap<u32, Instant, 16>,
}

impl ScrollState {
    /// Hi-res axes pass movement through untouched. Lo-res axes accumulate
    /// movement and emit whole detents; a partial detent left sitting for
    /// longer than `timeout` decays to nothing.
    fn handle(
        &mut self,
        hi_res: bool,
        source: u32,
        movement: i32,
        now: Instant,
        timeout: MicrosDurationU64,
    ) -> i32 {
        if hi_res {
            return movement;
        }
        if movement != 0 {
            if self.last_timestamp.insert(source, now).is_err() {
                warn!("scroll table full, dropping movement from {:08x}", source);
                return 0;
            }
            if !self.accumulated.contains_key(&source) && self.accumulated.insert(source, 0).is_err() {
                return 0;
            }
            let acc = match self.accumulated.get_mut(&source) {
                Some(acc) => acc,
                None => return 0,
            };
            *acc = acc.wrapping_add(movement);
            let ticks = *acc / (1000 * RESOLUTION_MULTIPLIER);
            *acc -= ticks * (1000 * RESOLUTION_MULTIPLIER);
            ticks * 1000
        } else {
            if let (Some(acc), Some(last)) = (
                self.accumulated.get_mut(&source),
                self.last_timestamp.get(&source),
            ) {
                let idle = now.checked_duration_since(*last);
                if *acc != 0 && idle.map_or(false, |d| d > timeout) {
                    *acc = 0;
                }
            }
            0
        }
    }
}

pub struct Remapper {
    ours: OurTables,
    theirs: TheirTables,
    config: Config,
    reverse: ReverseMap,
    input_state: UsageState,
    prev_input_state: UsageState,
    sticky_state: FnvIndexMap<StickyKey, i32, MAX_USAGES>,
    accumulated: UsageState,
    scroll: ScrollState,
    queue: OutgoingQueue,
    suspended: bool,
    their_descriptor_updated: bool,
    need_to_persist_config: bool,
    stats: Stats,
}

impl Remapper {
    /// Build the engine around our (outgoing) parsed report descriptor,
    /// with the default configuration: no mappings, passthrough on.
    #[must_use]
    pub fn new(our_descriptor: ParsedDescriptor) -> Self {
        let mut remapper = Self {
            ours: OurTables::new(our_descriptor),
            theirs: TheirTables::default(),
            config: Config::default(),
            reverse: ReverseMap::default(),
            input_state: UsageState::new(),
            prev_input_state: UsageState::new(),
            sticky_state: FnvIndexMap::new(),
            accumulated: UsageState::new(),
            scroll: ScrollState::default(),
            queue: OutgoingQueue::new(),
            suspended: false,
            their_descriptor_updated: false,
            need_to_persist_config: false,
            stats: Stats::default(),
        };
        remapper.rebuild_mapping();
        remapper
    }

    /// Install a new configuration and rebuild the reverse mapping
    pub fn apply_config(&mut self, config: Config) {
        self.config = config;
        self.rebuild_mapping();
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Host-set resolution multiplier feature report (V bit 0, H bit 2)
    pub fn set_resolution_multiplier(&mut self, multiplier: u8) {
        self.config.resolution_multiplier = multiplier;
    }

    /// Bus suspend gate: while set, mapping and sending are no-ops
    pub fn set_suspended(&mut self, suspended: bool) {
        self.suspended = suspended;
    }

    /// Replace one interface's incoming usage tables. Derived tables are
    /// rebuilt by the main loop when it observes the raised flag.
    pub fn set_their_descriptor(&mut self, interface: u16, parsed: ParsedDescriptor) {
        self.theirs.install(interface, parsed);
        self.their_descriptor_updated = true;
    }

    pub fn take_their_descriptor_updated(&mut self) -> bool {
        let raised = self.their_descriptor_updated;
        self.their_descriptor_updated = false;
        raised
    }

    pub fn rebuild_their_derived(&mut self) {
        self.theirs.rebuild_derived();
    }

    /// Ask the main loop to persist the current configuration
    pub fn request_persist(&mut self) {
        self.need_to_persist_config = true;
    }

    pub fn take_persist_request(&mut self) -> bool {
        let raised = self.need_to_persist_config;
        self.need_to_persist_config = false;
        raised
    }

    /// Published usage set of our report descriptor, run-length encoded
    #[must_use]
    pub fn our_usages_rle(&self) -> &[UsageRle] {
        &self.ours.rle
    }

    /// Published usage set across all attached interfaces
    #[must_use]
    pub fn their_usages_rle(&self) -> &[UsageRle] {
        &self.theirs.rle
    }

    #[must_use]
    pub fn stats(&self) -> Stats {
        self.stats
    }

    /// Read and reset the send/receive counters; overflows accumulate
    pub fn take_stats(&mut self) -> Stats {
        let stats = self.stats;
        self.stats.reports_received = 0;
        self.stats.reports_sent = 0;
        stats
    }

    delegate! {
        to self.queue {
            #[call(len)]
            pub fn pending_reports(&self) -> usize;
        }
    }

    fn rebuild_mapping(&mut self) {
        self.reverse.rebuild(&self.config, &self.ours.flat);
    }

    /// Decode one received input report into `input_state`, using the
    /// usage table registered for `interface`. Unknown interfaces and
    /// report ids are ignored.
    pub fn handle_received_report(&mut self, interface: u16, data: &[u8]) {
        self.stats.reports_received = self.stats.reports_received.wrapping_add(1);

        let iface = match self.theirs.interfaces.get(&interface) {
            Some(iface) => iface,
            None => {
                trace!("report from unknown interface {}", interface);
                return;
            }
        };

        let (report_id, payload) = if iface.has_report_id {
            match data.split_first() {
                Some((&id, rest)) => (id, rest),
                None => return,
            }
        } else {
            (0, data)
        };

        let usages = match iface.reports.get(&report_id) {
            Some(usages) => usages,
            None => {
                trace!("report id {} not in interface {} tables", report_id, interface);
                return;
            }
        };

        for (&usage, def) in usages.iter() {
            let value = read_input(payload, def);
            store(&mut self.input_state, usage, value);
        }
    }

    /// Run the mapping table over the current input state and queue any
    /// resulting reports.
    ///
    /// `auto_repeat` is true on the once-per-millisecond tick path and
    /// false when running early because a report just arrived; sources
    /// that are not freshly-arriving relative values are only evaluated
    /// with `auto_repeat` set, which is what makes an absolute source
    /// (a held button) feed a relative target once per tick.
    ///
    /// Targets are visited in reverse-map insertion order (configuration
    /// order, passthrough identities last). For absolute targets with
    /// several sources the last truthy source wins: a sticky source
    /// contributes its latch whenever the latch is non-zero, a non-sticky
    /// source contributes 1 while its layer is active and
    /// `input * scaling > 0`.
    pub fn process_mapping(&mut self, auto_repeat: bool, now: Instant) {
        if self.suspended {
            return;
        }

        // sticky layer triggers latch on any layer
        for &usage in self.reverse.layer_triggering_stickies.iter() {
            let current = load(&self.input_state, usage);
            if load(&self.prev_input_state, usage) == 0 && current != 0 {
                toggle(&mut self.sticky_state, StickyKey::trigger(usage));
            }
            store(&mut self.prev_input_state, usage, current);
        }

        let layer_state = self.evaluate_layers();

        // per-layer stickies latch only while their layer is active
        for &(layer, usage) in self.reverse.sticky_usages.iter() {
            let current = load(&self.input_state, usage);
            if layer_state[usize::from(layer)]
                && load(&self.prev_input_state, usage) == 0
                && current != 0
            {
                toggle(&mut self.sticky_state, StickyKey::layered(layer, usage));
            }
            store(&mut self.prev_input_state, usage, current);
        }

        for (&target, sources) in self.reverse.targets.iter() {
            let def = match self.ours.flat.get(&target) {
                Some(def) => *def,
                None => continue,
            };
            if def.is_relative {
                for source in sources.iter() {
                    if !(auto_repeat || self.theirs.relative_set.contains(&source.usage)) {
                        continue;
                    }
                    let value = if source.sticky {
                        load_sticky(
                            &self.sticky_state,
                            StickyKey::layered(source.layer, source.usage),
                        )
                        .wrapping_mul(source.scaling)
                    } else if layer_state[usize::from(source.layer)] {
                        load(&self.input_state, source.usage).wrapping_mul(source.scaling)
                    } else {
                        0
                    };
                    if target == V_SCROLL_USAGE || target == H_SCROLL_USAGE {
                        // called with zero movement too, so an abandoned
                        // partial detent can time out
                        let hi_res = self.config.resolution_multiplier
                            & resolution_bitmask(target)
                            != 0;
                        let emitted = self.scroll.handle(
                            hi_res,
                            source.usage,
                            value.wrapping_mul(RESOLUTION_MULTIPLIER),
                            now,
                            self.config.partial_scroll_timeout,
                        );
                        if emitted != 0 {
                            accumulate(&mut self.accumulated, target, emitted);
                        }
                    } else if value != 0 {
                        accumulate(&mut self.accumulated, target, value);
                    }
                }
            } else {
                let mut value = 0;
                for source in sources.iter() {
                    if source.sticky {
                        let latch = load_sticky(
                            &self.sticky_state,
                            StickyKey::layered(source.layer, source.usage),
                        );
                        if latch != 0 {
                            value = latch;
                        }
                    } else if layer_state[usize::from(source.layer)]
                        && load(&self.input_state, source.usage).wrapping_mul(source.scaling) > 0
                    {
                        value = 1;
                    }
                }
                if value != 0 {
                    if let Some(slot) = self.ours.reports.get_mut(&def.report_id) {
                        slot.put_field(def.bitpos, def.size, value as u32);
                    }
                }
            }
        }

        // relative inputs are deltas, not state: consume them
        for &usage in self.theirs.relative_usages.iter() {
            store(&mut self.input_state, usage, 0);
        }

        // flush whole units out of the milli-unit accumulators
        for (&usage, acc) in self.accumulated.iter_mut() {
            if *acc == 0 {
                continue;
            }
            let def = match self.ours.flat.get(&usage) {
                Some(def) => *def,
                None => {
                    *acc = 0;
                    continue;
                }
            };
            let truncated = *acc / 1000;
            *acc -= truncated * 1000;
            if truncated != 0 {
                if let Some(slot) = self.ours.reports.get_mut(&def.report_id) {
                    let existing =
                        read_value(slot.working(), def.bitpos, def.size, def.logical_minimum);
                    slot.put_field(
                        def.bitpos,
                        def.size,
                        existing.wrapping_add(truncated) as u32,
                    );
                }
            }
        }

        self.enqueue_reports();
    }

    fn evaluate_layers(&self) -> [bool; NLAYERS] {
        let mut layer_state = [false; NLAYERS];
        layer_state[0] = true;
        for layer in 1..NLAYERS {
            for source in self.reverse.sources(LAYERS_USAGE_PAGE | layer as u32) {
                let active = if source.sticky {
                    load_sticky(&self.sticky_state, StickyKey::trigger(source.usage))
                } else {
                    load(&self.input_state, source.usage)
                };
                if active != 0 {
                    layer_state[layer] = true;
                    layer_state[0] = false;
                    break;
                }
            }
        }
        layer_state
    }

    /// Queue every working report that needs the host's attention, then
    /// clear the working buffers for the next tick.
    ///
    /// A report whose absolute bits match the newest queued entry for the
    /// same id folds its relative fields into that entry instead of taking
    /// a new slot; `previous` is left alone because the absolute snapshot
    /// did not change.
    fn enqueue_reports(&mut self) {
        for i in 0..self.ours.report_ids.len() {
            let report_id = self.ours.report_ids[i];
            let slot = match self.ours.reports.get_mut(&report_id) {
                Some(slot) => slot,
                None => continue,
            };
            if slot.needs_send() {
                if self.queue.is_full() {
                    self.stats.overflows += 1;
                    warn!("outgoing queue overflow, dropping report {}", report_id);
                } else {
                    let coalesced = match self.queue.tail_mut() {
                        Some(prev)
                            if prev.report_id == report_id
                                && !slot.differs_on_absolute(prev.payload()) =>
                        {
                            slot.aggregate_relative_into(prev.payload_mut());
                            true
                        }
                        _ => false,
                    };
                    if !coalesced && self.queue.push(report_id, slot.working()).is_ok() {
                        slot.snapshot_previous();
                    }
                }
            }
            slot.clear_working();
        }
    }

    /// Submit the oldest queued report. A no-op while suspended or empty;
    /// call when the endpoint reports ready.
    pub fn send_report<E: HidEndpoint>(&mut self, endpoint: &mut E) -> Result<(), RemapperError> {
        if self.suspended {
            return Ok(());
        }
        let report = match self.queue.pop() {
            Some(report) => report,
            None => return Ok(()),
        };
        self.stats.reports_sent = self.stats.reports_sent.wrapping_add(1);
        endpoint
            .write_report(report.report_id, report.payload())
            .map(|_| ())
            .map_err(RemapperError::from)
    }
}

fn resolution_bitmask(target: u32) -> u8 {
    if target == V_SCROLL_USAGE {
        V_RESOLUTION_BITMASK
    } else {
        H_RESOLUTION_BITMASK
    }
}

/// Array items scan `count` fields for `index`; variable items read the
/// field, sign-extended when the logical minimum is negative.
fn read_input(data: &[u8], def: &UsageDef) -> i32 {
    if def.is_array {
        for i in 0..u16::from(def.count) {
            let bitpos = def.bitpos.wrapping_add(i.wrapping_mul(u16::from(def.size)));
            if crate::bits::get_bits(data, bitpos, def.size) == def.index {
                return 1;
            }
        }
        0
    } else {
        read_value(data, def.bitpos, def.size, def.logical_minimum)
    }
}

fn load<const N: usize>(map: &FnvIndexMap<u32, i32, N>, usage: u32) -> i32 {
    map.get(&usage).copied().unwrap_or(0)
}

fn store<const N: usize>(map: &mut FnvIndexMap<u32, i32, N>, usage: u32, value: i32) {
    if let Some(slot) = map.get_mut(&usage) {
        *slot = value;
    } else if map.insert(usage, value).is_err() {
        warn!("usage state table full, dropping usage {:08x}", usage);
    }
}

fn accumulate<const N: usize>(map: &mut FnvIndexMap<u32, i32, N>, usage: u32, delta: i32) {
    if let Some(slot) = map.get_mut(&usage) {
        *slot = slot.wrapping_add(delta);
    } else if map.insert(usage, delta).is_err() {
        warn!("accumulator table full, dropping usage {:08x}", usage);
    }
}

fn load_sticky(map: &FnvIndexMap<StickyKey, i32, MAX_USAGES>, key: StickyKey) -> i32 {
    map.get(&key).copied().unwrap_or(0)
}

fn toggle(map: &mut FnvIndexMap<StickyKey, i32, MAX_USAGES>, key: StickyKey) {
    let flipped = i32::from(load_sticky(map, key) == 0);
    if let Some(slot) = map.get_mut(&key) {
        *slot = flipped;
    } else if map.insert(key, flipped).is_err() {
        warn!("sticky state table full");
    }
}
