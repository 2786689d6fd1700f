use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

use log::debug;
use perfsieve_symbols::{AddressResolver, Range, RangeMap, SymbolData};

use crate::perf_event::{
    self, Event, MmapEvent, SampleEvent, PERF_CONTEXT_MAX, PERF_CONTEXT_USER, PERF_MAX_STACK_DEPTH,
};

/// What to aggregate from the sample stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Sample hits only.
    Flat,
    /// Sample hits plus caller-to-callee edges from the call chains.
    CallGraph,
}

/// A sampled instruction address within one memory object: how often it was
/// hit, and the outgoing call edges observed from it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryData {
    count: u64,
    branches: BTreeMap<u64, u64>,
}

impl EntryData {
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn branches(&self) -> &BTreeMap<u64, u64> {
        &self.branches
    }

    fn add_count(&mut self, count: u64) {
        self.count += count;
    }

    fn append_branch(&mut self, address: u64, count: u64) {
        *self.branches.entry(address).or_insert(0) += count;
    }
}

/// One loaded image, keyed in the profile by its runtime address range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryObjectData {
    file_name: String,
    page_offset: u64,
    entries: BTreeMap<u64, EntryData>,
}

impl MemoryObjectData {
    fn new(file_name: String, page_offset: u64) -> Self {
        MemoryObjectData {
            file_name,
            page_offset,
            entries: BTreeMap::new(),
        }
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// File offset reported by the MMAP record. Recorded for future use but
    /// never applied to address arithmetic.
    pub fn page_offset(&self) -> u64 {
        self.page_offset
    }

    pub fn entries(&self) -> &BTreeMap<u64, EntryData> {
        &self.entries
    }

    fn append_entry(&mut self, address: u64, count: u64) -> &mut EntryData {
        let entry = self.entries.entry(address).or_default();
        entry.add_count(count);
        entry
    }

    fn append_branch(&mut self, from: u64, to: u64, count: u64) {
        // Count 0: the address was seen as a caller frame, not as a hit.
        self.append_entry(from, 0).append_branch(to, count);
    }

    /// Rewrites every branch target to the start of its enclosing symbol, so
    /// that edges into the same function aggregate regardless of call site.
    /// Targets outside any symbol are kept as-is; weights to the same
    /// rewritten target sum.
    fn fixup_branches(&mut self, symbols: &RangeMap<SymbolData>) {
        for entry in self.entries.values_mut() {
            if entry.branches.is_empty() {
                continue;
            }

            let mut fixed = BTreeMap::new();
            for (&target, &count) in &entry.branches {
                let target = match symbols.get_entry(target) {
                    Some((range, _)) => range.start(),
                    None => target,
                };
                *fixed.entry(target).or_insert(0) += count;
            }
            entry.branches = fixed;
        }
    }
}

/// The aggregated result of one or more record streams.
///
/// Feed it a stream with [`Profile::load`], then call
/// [`Profile::resolve_symbols`] to symbolicate the collected addresses and
/// [`Profile::fixup_branches`] to normalize call edges. Calling
/// `fixup_branches` before the symbols are in place leaves the edges
/// un-normalized.
///
/// A `Profile` is single-threaded: one `load` at a time, no internal
/// locking. It exclusively owns all per-object data.
#[derive(Debug, Default)]
pub struct Profile {
    memory_objects: RangeMap<MemoryObjectData>,
    symbols: RangeMap<SymbolData>,
    mmap_event_count: usize,
    good_samples_count: usize,
    bad_samples_count: usize,
}

impl Profile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes events from `stream` until end-of-stream or a read failure.
    /// Either way the profile keeps everything aggregated so far; decode
    /// anomalies only show up in the counters.
    pub fn load<R: Read>(&mut self, mut stream: R, mode: Mode) {
        loop {
            let event = match perf_event::read_event(&mut stream) {
                Ok(Some(event)) => event,
                Ok(None) => break,
                Err(err) => {
                    debug!("record stream terminated: {err}");
                    break;
                }
            };
            match event {
                Event::Mmap(event) => self.process_mmap_event(event),
                Event::Sample(event) => self.process_sample_event(&event, mode),
                Event::Other(_) => {}
            }
        }

        // Objects that were mapped but never sampled don't survive.
        self.memory_objects.retain(|_, data| !data.entries.is_empty());
    }

    /// Resolves symbols for every loaded object by reading its object file,
    /// and merges them into the global symbol map. Objects whose files can't
    /// be read keep their entries unresolved.
    pub fn resolve_symbols(&mut self) {
        let Self {
            memory_objects,
            symbols,
            ..
        } = self;
        for (range, data) in memory_objects.iter() {
            let resolver = match AddressResolver::new(Path::new(data.file_name()), range.size()) {
                Ok(resolver) => resolver,
                Err(err) => {
                    debug!("no symbols for {}: {err}", data.file_name());
                    continue;
                }
            };
            resolver.resolve(data.entries.keys().copied(), range.start(), symbols);
        }
    }

    /// Re-points every branch edge at the start of the target's symbol.
    /// Requires the symbol map to be populated; idempotent.
    pub fn fixup_branches(&mut self) {
        let Self {
            memory_objects,
            symbols,
            ..
        } = self;
        for (_, data) in memory_objects.iter_mut() {
            data.fixup_branches(symbols);
        }
    }

    pub fn memory_objects(&self) -> &RangeMap<MemoryObjectData> {
        &self.memory_objects
    }

    pub fn symbols(&self) -> &RangeMap<SymbolData> {
        &self.symbols
    }

    pub fn symbols_mut(&mut self) -> &mut RangeMap<SymbolData> {
        &mut self.symbols
    }

    pub fn mmap_event_count(&self) -> usize {
        self.mmap_event_count
    }

    pub fn good_samples_count(&self) -> usize {
        self.good_samples_count
    }

    pub fn bad_samples_count(&self) -> usize {
        self.bad_samples_count
    }

    fn process_mmap_event(&mut self, event: MmapEvent) {
        self.mmap_event_count += 1;

        let range = Range::with_start_size(event.address, event.length);
        if let Some((existing_range, existing)) = self.memory_objects.overlap_of(range) {
            debug!(
                "memory object {:#x}..{:#x} {} was not inserted, overlaps {:#x}..{:#x} {}",
                range.start(),
                range.end(),
                event.file_name,
                existing_range.start(),
                existing_range.end(),
                existing.file_name(),
            );
            return;
        }
        self.memory_objects.insert(
            range,
            MemoryObjectData::new(event.file_name, event.page_offset),
        );
    }

    fn process_sample_event(&mut self, event: &SampleEvent, mode: Mode) {
        if event.callchain.first() != Some(&PERF_CONTEXT_USER)
            || event.callchain_size < 2
            || event.callchain_size > PERF_MAX_STACK_DEPTH
            || event.callchain.len() as u64 != event.callchain_size
        {
            self.bad_samples_count += 1;
            return;
        }

        let Some((_, object)) = self.memory_objects.get_entry_mut(event.ip) else {
            self.bad_samples_count += 1;
            return;
        };
        object.append_entry(event.ip, 1);
        self.good_samples_count += 1;

        if mode != Mode::CallGraph {
            return;
        }

        let mut skip_frame = false;
        let mut call_to = event.ip;
        for &call_from in &event.callchain[2..] {
            if call_from > PERF_CONTEXT_MAX {
                // Context switch; we only follow user-level frames.
                skip_frame = call_from != PERF_CONTEXT_USER;
                continue;
            }
            if skip_frame || call_from == call_to {
                continue;
            }

            let Some((_, object)) = self.memory_objects.get_entry_mut(call_from) else {
                continue;
            };
            object.append_branch(call_from, call_to, 1);

            call_to = call_from;
        }
    }
}
