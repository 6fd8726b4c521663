//! Everything needed to embed the remapping engine

pub use crate::descriptor::ParsedDescriptor;
pub use crate::engine::{HidEndpoint, Instant, Remapper, Stats};
pub use crate::mapping::{Config, Mapping, MappingRecord, MAPPING_FLAG_STICKY};
pub use crate::runner::{Clock, ConfigStore, InputSource, ReceivedReport, Runner, SofFlag};
pub use crate::usage::{UsageDef, UsageRle};
pub use crate::RemapperError;
