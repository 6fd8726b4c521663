//! Mapping configuration and the target-keyed reverse mapping table
//!
//! A mapping routes one source usage (something an attached device reports)
//! to one target usage (something our report descriptor exposes), with a
//! milli-unit scaling factor, an owning layer and optional sticky
//! behaviour. The data plane never walks the configured list directly; it
//! works from [`ReverseMap`], rebuilt on every configuration change, which
//! groups sources per target in configuration order.

use fugit::MicrosDurationU64;
use heapless::{FnvIndexMap, Vec};
use log::warn;
use packed_struct::prelude::*;

use crate::usage::{UsageDef, LAYERS_USAGE_PAGE, NLAYERS};

/// Mapping flag bit 0: toggle a latch on the source's rising edge instead
/// of following the source level
pub const MAPPING_FLAG_STICKY: u8 = 0x01;

/// Identity scaling: target moves one unit per source unit
pub const SCALING_UNIT: i32 = 1000;

pub const DEFAULT_PARTIAL_SCROLL_TIMEOUT: MicrosDurationU64 =
    MicrosDurationU64::from_ticks(1_000_000);

pub const MAX_MAPPINGS: usize = 64;
pub const MAX_TARGETS: usize = 64;
pub const MAX_SOURCES_PER_TARGET: usize = 8;
pub const MAX_STICKIES: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mapping {
    pub target_usage: u32,
    pub source_usage: u32,
    /// Milli-units: 1000 maps one source unit to one target unit
    pub scaling: i32,
    pub layer: u8,
    pub flags: u8,
}

impl Mapping {
    #[must_use]
    pub fn is_sticky(&self) -> bool {
        self.flags & MAPPING_FLAG_STICKY != 0
    }
}

/// Serialized form of one mapping, as stored and exchanged with host tooling
#[derive(Clone, Copy, Debug, PartialEq, Eq, PackedStruct)]
#[packed_struct(endian = "lsb", size_bytes = "14")]
pub struct MappingRecord {
    #[packed_field]
    pub target_usage: u32,
    #[packed_field]
    pub source_usage: u32,
    #[packed_field]
    pub scaling: i32,
    #[packed_field]
    pub layer: u8,
    #[packed_field]
    pub flags: u8,
}

impl From<&Mapping> for MappingRecord {
    fn from(m: &Mapping) -> Self {
        Self {
            target_usage: m.target_usage,
            source_usage: m.source_usage,
            scaling: m.scaling,
            layer: m.layer,
            flags: m.flags,
        }
    }
}

impl From<MappingRecord> for Mapping {
    fn from(r: MappingRecord) -> Self {
        Self {
            target_usage: r.target_usage,
            source_usage: r.source_usage,
            scaling: r.scaling,
            layer: r.layer,
            flags: r.flags,
        }
    }
}

/// Everything the persistence layer loads at boot and stores on request
#[derive(Clone, Debug)]
pub struct Config {
    pub mappings: Vec<Mapping, MAX_MAPPINGS>,
    /// Give every unmapped "our" usage an identity mapping on layer 0
    pub unmapped_passthrough: bool,
    /// Idle time after which a partial lo-res scroll accumulator decays
    pub partial_scroll_timeout: MicrosDurationU64,
    /// Host-set resolution multiplier feature bits (V bit 0, H bit 2)
    pub resolution_multiplier: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mappings: Vec::new(),
            unmapped_passthrough: true,
            partial_scroll_timeout: DEFAULT_PARTIAL_SCROLL_TIMEOUT,
            resolution_multiplier: 0,
        }
    }
}

/// One source feeding a target, in evaluation order
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct MapSource {
    pub usage: u32,
    pub scaling: i32,
    pub sticky: bool,
    pub layer: u8,
}

impl MapSource {
    fn identity(usage: u32) -> Self {
        Self {
            usage,
            scaling: SCALING_UNIT,
            sticky: false,
            layer: 0,
        }
    }
}

/// `target -> sources` view of the configuration, plus the sticky source
/// sets the resolver walks each tick
#[derive(Default)]
pub(crate) struct ReverseMap {
    pub(crate) targets: FnvIndexMap<u32, Vec<MapSource, MAX_SOURCES_PER_TARGET>, MAX_TARGETS>,
    /// Sticky sources mapped to a layer usage; they latch on all layers
    pub(crate) layer_triggering_stickies: Vec<u32, MAX_STICKIES>,
    /// Other sticky sources as `(layer, usage)`; they latch only while
    /// their layer is active
    pub(crate) sticky_usages: Vec<(u8, u32), MAX_STICKIES>,
}

impl ReverseMap {
    /// Recompute from the configured mappings. Layers out of range clamp to
    /// 0; when `unmapped_passthrough` is set, every "our" usage that no
    /// layer-0 mapping uses as a source gets an identity self-mapping
    /// appended after the configured entries.
    pub(crate) fn rebuild<const N: usize>(
        &mut self,
        config: &Config,
        our_flat: &FnvIndexMap<u32, UsageDef, N>,
    ) {
        self.targets.clear();
        self.layer_triggering_stickies.clear();
        self.sticky_usages.clear();

        let mut mapped: Vec<u32, MAX_MAPPINGS> = Vec::new();

        for mapping in &config.mappings {
            let layer = if usize::from(mapping.layer) < NLAYERS {
                mapping.layer
            } else {
                warn!(
                    "mapping {:08x} -> {:08x} has layer {} out of range, using 0",
                    mapping.source_usage, mapping.target_usage, mapping.layer
                );
                0
            };
            self.push_source(
                mapping.target_usage,
                MapSource {
                    usage: mapping.source_usage,
                    scaling: mapping.scaling,
                    sticky: mapping.is_sticky(),
                    layer,
                },
            );
            if layer == 0 && !mapped.contains(&mapping.source_usage) {
                let _ = mapped.push(mapping.source_usage);
            }
            if mapping.is_sticky() {
                if mapping.target_usage & 0xFFFF_0000 == LAYERS_USAGE_PAGE {
                    if !self.layer_triggering_stickies.contains(&mapping.source_usage)
                        && self
                            .layer_triggering_stickies
                            .push(mapping.source_usage)
                            .is_err()
                    {
                        warn!("sticky table full");
                    }
                } else if !self.sticky_usages.contains(&(layer, mapping.source_usage))
                    && self.sticky_usages.push((layer, mapping.source_usage)).is_err()
                {
                    warn!("sticky table full");
                }
            }
        }

        if config.unmapped_passthrough {
            for (&usage, _) in our_flat.iter() {
                if !mapped.contains(&usage) {
                    self.push_source(usage, MapSource::identity(usage));
                }
            }
        }
    }

    fn push_source(&mut self, target: u32, source: MapSource) {
        if let Some(sources) = self.targets.get_mut(&target) {
            if sources.push(source).is_err() {
                warn!("too many sources for target {:08x}", target);
            }
        } else {
            let mut sources = Vec::new();
            let _ = sources.push(source);
            if self.targets.insert(target, sources).is_err() {
                warn!("mapping target table full, dropping target {:08x}", target);
            }
        }
    }

    /// Sources feeding `target`, empty when none are configured
    pub(crate) fn sources(&self, target: u32) -> &[MapSource] {
        self.targets.get(&target).map_or(&[], Vec::as_slice)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn flat_with(usages: &[u32]) -> FnvIndexMap<u32, UsageDef, 64> {
        let mut flat = FnvIndexMap::new();
        for &usage in usages {
            flat.insert(usage, UsageDef::default()).unwrap();
        }
        flat
    }

    fn mapping(source: u32, target: u32, layer: u8, flags: u8) -> Mapping {
        Mapping {
            target_usage: target,
            source_usage: source,
            scaling: SCALING_UNIT,
            layer,
            flags,
        }
    }

    #[test]
    fn groups_sources_by_target_in_config_order() {
        let mut config = Config {
            unmapped_passthrough: false,
            ..Config::default()
        };
        config.mappings.push(mapping(0x10, 0x99, 0, 0)).unwrap();
        config.mappings.push(mapping(0x20, 0x99, 1, 0)).unwrap();

        let mut reverse = ReverseMap::default();
        reverse.rebuild(&config, &flat_with(&[0x99]));

        let sources = reverse.sources(0x99);
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].usage, 0x10);
        assert_eq!(sources[1].usage, 0x20);
        assert_eq!(sources[1].layer, 1);
    }

    #[test]
    fn out_of_range_layer_clamps_to_zero() {
        let mut config = Config {
            unmapped_passthrough: false,
            ..Config::default()
        };
        config.mappings.push(mapping(0x10, 0x99, 7, 0)).unwrap();

        let mut reverse = ReverseMap::default();
        reverse.rebuild(&config, &flat_with(&[0x99]));

        assert_eq!(reverse.sources(0x99)[0].layer, 0);
    }

    #[test]
    fn sticky_sources_are_classified() {
        let mut config = Config {
            unmapped_passthrough: false,
            ..Config::default()
        };
        // layer trigger: latches on every layer
        config
            .mappings
            .push(mapping(0x10, LAYERS_USAGE_PAGE | 1, 0, MAPPING_FLAG_STICKY))
            .unwrap();
        // plain sticky on layer 2
        config
            .mappings
            .push(mapping(0x20, 0x99, 2, MAPPING_FLAG_STICKY))
            .unwrap();

        let mut reverse = ReverseMap::default();
        reverse.rebuild(&config, &flat_with(&[0x99]));

        assert_eq!(reverse.layer_triggering_stickies.as_slice(), &[0x10]);
        assert_eq!(reverse.sticky_usages.as_slice(), &[(2, 0x20)]);
    }

    #[test]
    fn passthrough_appends_identity_for_unmapped_usages() {
        let mut config = Config::default();
        config.mappings.push(mapping(0x11, 0x99, 0, 0)).unwrap();

        let mut reverse = ReverseMap::default();
        reverse.rebuild(&config, &flat_with(&[0x11, 0x22]));

        // 0x11 is used as a layer-0 source, so only 0x22 passes through
        assert!(reverse.sources(0x11).is_empty());
        let passthrough = reverse.sources(0x22);
        assert_eq!(passthrough.len(), 1);
        assert_eq!(passthrough[0], MapSource::identity(0x22));
    }

    #[test]
    fn layer_one_mapping_does_not_block_passthrough() {
        let mut config = Config::default();
        config.mappings.push(mapping(0x11, 0x99, 1, 0)).unwrap();

        let mut reverse = ReverseMap::default();
        reverse.rebuild(&config, &flat_with(&[0x11]));

        // only layer-0 mappings mark a source as mapped
        assert_eq!(reverse.sources(0x11).len(), 1);
    }

    #[test]
    fn record_round_trip() {
        let m = Mapping {
            target_usage: 0x0001_0030,
            source_usage: 0x0009_0001,
            scaling: -2000,
            layer: 3,
            flags: MAPPING_FLAG_STICKY,
        };
        let packed = MappingRecord::from(&m).pack().unwrap();
        assert_eq!(
            packed,
            [
                0x30, 0x00, 0x01, 0x00, // target
                0x01, 0x00, 0x09, 0x00, // source
                0x30, 0xF8, 0xFF, 0xFF, // scaling -2000
                0x03, 0x01, // layer, flags
            ]
        );
        assert_eq!(Mapping::from(MappingRecord::unpack(&packed).unwrap()), m);
    }
}
