//! Turns a raw kernel perf record stream into an address-resolved,
//! symbol-aggregated profile.
//!
//! [`Profile::load`] consumes a stream of perf records, registers loaded
//! memory objects from `MMAP` records and attributes `SAMPLE` records to
//! them, optionally walking each sample's call chain into caller-to-callee
//! edge counts. After the stream ends, [`Profile::resolve_symbols`] reads
//! each object's file through [`perfsieve_symbols::AddressResolver`] and
//! [`Profile::fixup_branches`] re-points every edge at the start of its
//! target function, so that edges into the same function aggregate.
//!
//! The decoder never aborts on malformed input: corrupt samples and unmapped
//! addresses are dropped and accounted for in
//! [`Profile::bad_samples_count`], and a failing stream simply yields the
//! partial profile aggregated so far.

pub mod perf_event;
mod profile;

pub use perfsieve_symbols::{AddressResolver, Error, Range, RangeMap, SymbolData};
pub use profile::{EntryData, MemoryObjectData, Mode, Profile};
