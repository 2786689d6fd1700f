//! Address-to-symbol resolution for sampling profilers.
//!
//! This crate turns one ELF object file into a disjoint, address-ordered map
//! from virtual-address ranges to function symbols, and resolves collected
//! sample addresses against it. It reads the static symbol table when
//! present, falls back to the dynamic table and then to a debug companion
//! file under `/usr/lib/debug`, and undoes the base-address rewrite performed
//! by prelink when the object carries a `.gnu.prelink_undo` section. Address
//! ranges that no real symbol describes are covered by synthetic `func_<hex>`
//! placeholders, so that nearly every sampled address resolves to something.
//!
//! The entry point is [`AddressResolver`]: construct it per object file, call
//! [`AddressResolver::resolve`] with the sampled addresses and the runtime
//! load base, and discard it. The shared [`Range`]/[`RangeMap`] types
//! implement the range-keyed lookup that both this crate and the profile
//! aggregator build on.
//!
//! Source-line resolution is out of scope; only function-granularity symbol
//! names are produced.

mod demangle;
mod error;
mod range_map;
mod resolver;
mod shared;

pub use error::Error;
pub use range_map::{Range, RangeMap};
pub use resolver::AddressResolver;
pub use shared::SymbolData;
