//! Cooperative main loop
//!
//! The remapper runs as a single-threaded loop with one interrupt
//! participant: the USB start-of-frame ISR, which raises [`SofFlag`] once
//! per millisecond. [`Runner::poll`] executes one loop iteration (ingest,
//! resolve, send, housekeeping) and is meant to be called from the
//! firmware's main loop alongside the USB stack's own poll, in the shape
//! of:
//!
//! ```ignore
//! loop {
//!     runner.poll();
//!     usb_dev.poll(&mut [&mut hid]);
//! }
//! ```
//!
//! All platform specifics come in through the seams below: where input
//! reports come from ([`InputSource`]), where output reports go
//! ([`HidEndpoint`]), what time it is ([`Clock`]) and where configuration
//! lives ([`ConfigStore`]).

use core::sync::atomic::{AtomicBool, Ordering};

use fugit::MicrosDurationU64;
use log::{error, info};

use crate::engine::{HidEndpoint, Instant, Remapper};
use crate::mapping::Config;
use crate::RemapperError;

const STATS_INTERVAL: MicrosDurationU64 = MicrosDurationU64::from_ticks(1_000_000);

/// Monotonic microsecond clock
pub trait Clock {
    fn now(&self) -> Instant;
}

/// One input report pulled off an attached device
pub struct ReceivedReport<'a> {
    pub interface: u16,
    pub data: &'a [u8],
}

/// Where incoming reports are pulled from; must never block
pub trait InputSource {
    fn try_read_report(&mut self) -> Option<ReceivedReport<'_>>;
}

/// Configuration persistence, consumed at boot and on request
pub trait ConfigStore {
    fn load(&mut self) -> Option<Config>;
    fn persist(&mut self, config: &Config) -> Result<(), RemapperError>;
}

/// The once-per-millisecond tick, shared with the USB SOF ISR.
///
/// [`SofFlag::take`] is a deliberate non-atomic read-then-clear: losing or
/// double-counting the odd tick is harmless, and nothing here can ever
/// block the ISR.
#[derive(Default)]
pub struct SofFlag(AtomicBool);

impl SofFlag {
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Call from the SOF interrupt handler
    pub fn set(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Read and clear the pending tick
    pub fn take(&self) -> bool {
        let pending = self.0.load(Ordering::Relaxed);
        self.0.store(false, Ordering::Relaxed);
        pending
    }
}

/// Drives a [`Remapper`] through one loop iteration per [`Runner::poll`]
pub struct Runner<'a, S, E, C, P> {
    engine: Remapper,
    source: S,
    endpoint: E,
    clock: C,
    store: P,
    tick: &'a SofFlag,
    next_stats: Instant,
}

impl<'a, S, E, C, P> Runner<'a, S, E, C, P>
where
    S: InputSource,
    E: HidEndpoint,
    C: Clock,
    P: ConfigStore,
{
    /// Wire the engine to its surroundings and load the stored
    /// configuration, if any.
    pub fn new(
        mut engine: Remapper,
        source: S,
        endpoint: E,
        clock: C,
        mut store: P,
        tick: &'a SofFlag,
    ) -> Self {
        if let Some(config) = store.load() {
            engine.apply_config(config);
        }
        let next_stats = clock.now() + STATS_INTERVAL;
        Self {
            engine,
            source,
            endpoint,
            clock,
            store,
            tick,
            next_stats,
        }
    }

    #[must_use]
    pub fn engine(&self) -> &Remapper {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut Remapper {
        &mut self.engine
    }

    /// One cooperative loop iteration: ingest at most one report, run the
    /// resolver on the tick, submit at most one queued report, and handle
    /// the rebuild/persist flags.
    pub fn poll(&mut self) {
        self.engine.set_suspended(self.endpoint.suspended());

        if let Some(report) = self.source.try_read_report() {
            self.engine.handle_received_report(report.interface, report.data);
            let auto_repeat = self.tick.take();
            self.engine.process_mapping(auto_repeat, self.clock.now());
        }

        if self.endpoint.ready() {
            if self.tick.take() {
                self.engine.process_mapping(true, self.clock.now());
            }
            if let Err(e) = self.engine.send_report(&mut self.endpoint) {
                error!("failed to submit report: {:?}", e);
            }
        }

        if self.engine.take_their_descriptor_updated() {
            self.engine.rebuild_their_derived();
        }

        if self.engine.take_persist_request() {
            if let Err(e) = self.store.persist(self.engine.config()) {
                error!("failed to persist config: {:?}", e);
            }
        }

        self.print_stats();
    }

    fn print_stats(&mut self) {
        let now = self.clock.now();
        if now >= self.next_stats {
            let stats = self.engine.take_stats();
            info!(
                "reports in {} out {}",
                stats.reports_received, stats.reports_sent
            );
            while self.next_stats <= now {
                self.next_stats += STATS_INTERVAL;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use core::cell::{Cell, RefCell};
    use std::collections::VecDeque;
    use std::vec::Vec as StdVec;

    use super::*;
    use crate::descriptor::ParsedDescriptor;
    use crate::usage::UsageDef;

    const USAGE_X: u32 = 0x0001_0030;

    fn init_logging() {
        let _ = env_logger::Builder::from_env(
            env_logger::Env::default().default_filter_or("trace"),
        )
        .is_test(true)
        .try_init();
    }

    fn x_only_descriptor() -> ParsedDescriptor {
        let mut parsed = ParsedDescriptor::new(false);
        parsed.set_report_size(0, 1);
        parsed.add_usage(
            USAGE_X,
            UsageDef {
                bitpos: 0,
                size: 8,
                logical_minimum: -127,
                is_relative: true,
                ..UsageDef::default()
            },
        );
        parsed
    }

    fn engine() -> Remapper {
        init_logging();
        let mut engine = Remapper::new(x_only_descriptor());
        engine.set_their_descriptor(0, x_only_descriptor());
        engine.rebuild_their_derived();
        engine
    }

    struct FakeSource {
        reports: VecDeque<StdVec<u8>>,
        current: Option<StdVec<u8>>,
    }

    impl FakeSource {
        fn new(reports: &[&[u8]]) -> Self {
            Self {
                reports: reports.iter().map(|r| r.to_vec()).collect(),
                current: None,
            }
        }
    }

    impl InputSource for FakeSource {
        fn try_read_report(&mut self) -> Option<ReceivedReport<'_>> {
            self.current = self.reports.pop_front();
            self.current.as_deref().map(|data| ReceivedReport {
                interface: 0,
                data,
            })
        }
    }

    struct FakeEndpoint {
        ready: Cell<bool>,
        sent: RefCell<StdVec<(u8, StdVec<u8>)>>,
    }

    impl FakeEndpoint {
        fn new() -> Self {
            Self {
                ready: Cell::new(true),
                sent: RefCell::new(StdVec::new()),
            }
        }
    }

    impl HidEndpoint for &FakeEndpoint {
        fn ready(&self) -> bool {
            self.ready.get()
        }

        fn suspended(&self) -> bool {
            false
        }

        fn write_report(&mut self, report_id: u8, data: &[u8]) -> usb_device::Result<usize> {
            self.sent.borrow_mut().push((report_id, data.to_vec()));
            Ok(data.len())
        }
    }

    struct FakeClock(Cell<u64>);

    impl Clock for &FakeClock {
        fn now(&self) -> Instant {
            Instant::from_ticks(self.0.get())
        }
    }

    struct FakeStore {
        config: Option<Config>,
        persisted: Cell<usize>,
    }

    impl ConfigStore for &FakeStore {
        fn load(&mut self) -> Option<Config> {
            self.config.clone()
        }

        fn persist(&mut self, _config: &Config) -> Result<(), RemapperError> {
            self.persisted.set(self.persisted.get() + 1);
            Ok(())
        }
    }

    #[test]
    fn sof_flag_take_clears() {
        let flag = SofFlag::new();
        assert!(!flag.take());
        flag.set();
        flag.set();
        assert!(flag.take());
        assert!(!flag.take());
    }

    #[test]
    fn poll_ingests_maps_and_sends() {
        let endpoint = FakeEndpoint::new();
        let clock = FakeClock(Cell::new(0));
        let store = FakeStore {
            config: Some(Config::default()),
            persisted: Cell::new(0),
        };
        let flag = SofFlag::new();
        let mut runner = Runner::new(
            engine(),
            FakeSource::new(&[&[5u8]]),
            &endpoint,
            &clock,
            &store,
            &flag,
        );

        flag.set();
        runner.poll();

        assert_eq!(endpoint.sent.borrow().as_slice(), &[(0u8, vec![5u8])]);
        assert_eq!(runner.engine().pending_reports(), 0);

        // nothing left to do on an idle iteration
        runner.poll();
        assert_eq!(endpoint.sent.borrow().len(), 1);
    }

    #[test]
    fn reports_queue_while_endpoint_is_busy() {
        let endpoint = FakeEndpoint::new();
        endpoint.ready.set(false);
        let clock = FakeClock(Cell::new(0));
        let store = FakeStore {
            config: None,
            persisted: Cell::new(0),
        };
        let flag = SofFlag::new();
        let mut runner = Runner::new(
            engine(),
            FakeSource::new(&[&[3u8], &[4u8]]),
            &endpoint,
            &clock,
            &store,
            &flag,
        );

        flag.set();
        runner.poll();
        flag.set();
        runner.poll();
        assert!(endpoint.sent.borrow().is_empty());
        // busy endpoint: the two deltas coalesced into one queued report
        assert_eq!(runner.engine().pending_reports(), 1);

        endpoint.ready.set(true);
        runner.poll();
        assert_eq!(endpoint.sent.borrow().as_slice(), &[(0u8, vec![7u8])]);
    }

    #[test]
    fn persist_flag_reaches_the_store() {
        let endpoint = FakeEndpoint::new();
        let clock = FakeClock(Cell::new(0));
        let store = FakeStore {
            config: None,
            persisted: Cell::new(0),
        };
        let flag = SofFlag::new();
        let mut runner = Runner::new(
            engine(),
            FakeSource::new(&[]),
            &endpoint,
            &clock,
            &store,
            &flag,
        );

        runner.poll();
        assert_eq!(store.persisted.get(), 0);

        runner.engine_mut().request_persist();
        runner.poll();
        assert_eq!(store.persisted.get(), 1);
        // the flag is consumed, not sticky
        runner.poll();
        assert_eq!(store.persisted.get(), 1);
    }

    #[test]
    fn stats_reset_once_per_second() {
        let endpoint = FakeEndpoint::new();
        let clock = FakeClock(Cell::new(0));
        let store = FakeStore {
            config: None,
            persisted: Cell::new(0),
        };
        let flag = SofFlag::new();
        let mut runner = Runner::new(
            engine(),
            FakeSource::new(&[&[1u8]]),
            &endpoint,
            &clock,
            &store,
            &flag,
        );

        flag.set();
        runner.poll();
        assert_eq!(runner.engine().stats().reports_received, 1);
        assert_eq!(runner.engine().stats().reports_sent, 1);

        clock.0.set(1_500_000);
        runner.poll();
        assert_eq!(runner.engine().stats().reports_received, 0);
        assert_eq!(runner.engine().stats().reports_sent, 0);
    }
}
