use std::fs;
use std::mem;
use std::path::{Path, PathBuf};

use log::debug;
use memmap2::Mmap;
use object::elf;
use object::read::elf::{FileHeader, ProgramHeader};
use object::read::File;
use object::{pod, Endianness, Object, ObjectSection, ObjectSegment, ObjectSymbol, SymbolKind};

use crate::demangle::demangle_name;
use crate::error::Error;
use crate::range_map::{Range, RangeMap};
use crate::shared::SymbolData;

/// Prelink stores the object's pre-rewrite ELF and program headers here.
const PRELINK_UNDO_SECTION: &str = ".gnu.prelink_undo";

/// Fixed search root for debug companion files; the primary file's path is
/// appended to it, with [`DEBUG_FILE_SUFFIX`] at the end.
const DEBUG_FILE_ROOT: &str = "/usr/lib/debug";
const DEBUG_FILE_SUFFIX: &str = ".debug";

/// Gaps shorter than this between real symbols are left uncovered.
const MIN_GAP_SIZE: u64 = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
struct ResolverSymbolData {
    /// Size as encoded in the symbol table. Zero marks an asm label, which
    /// gets stretched to the next symbol during the fake-symbol pass.
    size: u64,
    /// Empty for synthetic gap symbols; those are named `func_<hex>` lazily
    /// at resolve time.
    name: String,
    binding: u8,
}

impl ResolverSymbolData {
    fn gap(size: u64) -> Self {
        ResolverSymbolData {
            size,
            name: String::new(),
            binding: 0,
        }
    }
}

/// Resolves sampled addresses within one object file to function symbols.
///
/// Construction reads the file's symbol metadata once and builds a disjoint
/// range-to-symbol index covering `[base_address, base_address + object_size)`
/// in the file's own load coordinates; [`AddressResolver::resolve`] then maps
/// runtime addresses through that index. A resolver holds no file handles
/// after construction and is intended to be built per object and discarded.
pub struct AddressResolver {
    /// Virtual address of the file's first loadable segment.
    base_address: u64,
    symbols: RangeMap<ResolverSymbolData>,
}

impl AddressResolver {
    pub fn new(file_name: &Path, object_size: u64) -> Result<Self, Error> {
        let mmap = map_file(file_name)?;
        let object_file = File::parse(&*mmap).map_err(Error::ObjectParse)?;

        let base_address = base_address_of(&object_file);
        let mut orig_base_address = base_address;

        // A prelinked object carries its original headers in a spare section.
        // Symbol values are rebased from the original load address to the
        // current one, so recover the original before ingesting any table.
        let has_debug_link = matches!(object_file.gnu_debuglink(), Ok(Some(_)));
        if has_debug_link {
            if let Some(section) = object_file.section_by_name(PRELINK_UNDO_SECTION) {
                if let Ok(data) = section.data() {
                    if let Some(address) = original_load_address(data) {
                        orig_base_address = address;
                    }
                }
            }
        }

        let mut symbols = RangeMap::new();
        let mut symtab_loaded = false;
        if object_file.symbol_table().is_some() {
            load_symbols(
                &mut symbols,
                object_file.symbols(),
                base_address,
                orig_base_address,
            );
            symtab_loaded = true;
        } else if object_file.dynamic_symbol_table().is_some() {
            load_symbols(
                &mut symbols,
                object_file.dynamic_symbols(),
                base_address,
                orig_base_address,
            );
        }

        // Without a static table in the main file, try the debug companion.
        if has_debug_link && !symtab_loaded {
            let debug_path = debug_companion_path(file_name);
            if let Ok(debug_mmap) = map_file(&debug_path) {
                if let Ok(debug_object) = File::parse(&*debug_mmap) {
                    if debug_object.symbol_table().is_some() {
                        load_symbols(
                            &mut symbols,
                            debug_object.symbols(),
                            base_address,
                            orig_base_address,
                        );
                    }
                }
            }
        }

        let base_name = file_name
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let symbols = construct_fake_symbols(symbols, base_address, object_size, &base_name);

        Ok(AddressResolver {
            base_address,
            symbols,
        })
    }

    /// Resolves an address-ordered sequence of sampled addresses, taken from
    /// an object loaded at `load_base`, and merges the matching symbols into
    /// `symbols` in runtime coordinates. Consecutive addresses inside one
    /// symbol produce a single output entry.
    pub fn resolve<I>(&self, addresses: I, load_base: u64, symbols: &mut RangeMap<SymbolData>)
    where
        I: IntoIterator<Item = u64>,
    {
        let adjust = load_base.wrapping_sub(self.base_address);
        let mut addresses = addresses.into_iter();
        let mut next = addresses.next();
        while let Some(address) = next {
            let file_address = address.wrapping_sub(adjust);
            let Some((range, data)) = self.symbols.get_entry(file_address) else {
                debug!(
                    "can't resolve symbol for address {file_address:#x}, load base: {load_base:#x}"
                );
                next = addresses.next();
                continue;
            };

            let name = if data.name.is_empty() {
                fake_symbol_name(range.start())
            } else {
                data.name.clone()
            };
            symbols.insert(
                Range::new(
                    range.start().wrapping_add(adjust),
                    range.end().wrapping_add(adjust),
                ),
                SymbolData::new(name),
            );

            // Skip the remaining addresses covered by the symbol we just
            // emitted.
            loop {
                next = addresses.next();
                match next {
                    Some(address) if address.wrapping_sub(adjust) < range.end() => continue,
                    _ => break,
                }
            }
        }
    }
}

fn fake_symbol_name(address: u64) -> String {
    format!("func_{address:x}")
}

fn map_file(path: &Path) -> Result<Mmap, Error> {
    let file = fs::File::open(path).map_err(|e| Error::OpenFile(path.to_path_buf(), e))?;
    let mmap = unsafe { Mmap::map(&file) }.map_err(|e| Error::OpenFile(path.to_path_buf(), e))?;
    Ok(mmap)
}

fn debug_companion_path(file_name: &Path) -> PathBuf {
    let mut path = String::from(DEBUG_FILE_ROOT);
    path.push_str(&file_name.to_string_lossy());
    path.push_str(DEBUG_FILE_SUFFIX);
    PathBuf::from(path)
}

/// Virtual address of the first `LOAD` program header, or zero if the file
/// has none.
fn base_address_of<'data, R: object::ReadRef<'data>>(object_file: &File<'data, R>) -> u64 {
    object_file
        .segments()
        .next()
        .map_or(0, |segment| segment.address())
}

/// Recovers the pre-prelink load address from a `.gnu.prelink_undo` payload:
/// a serialized copy of the original ELF header followed directly by its
/// program headers, in the class and endianness declared by the payload
/// itself. Returns the first `LOAD` entry's `p_vaddr`.
fn original_load_address(data: &[u8]) -> Option<u64> {
    let (ident, _) = pod::from_bytes::<elf::Ident>(data).ok()?;

    // The payload sits at an arbitrary offset in the file; copy it into
    // aligned storage before overlaying the raw header types.
    let mut aligned = vec![0u64; (data.len() + 7) / 8];
    pod::bytes_of_slice_mut(&mut aligned)[..data.len()].copy_from_slice(data);
    let data = &pod::bytes_of_slice(&aligned)[..data.len()];

    match ident.class {
        elf::ELFCLASS32 => first_load_vaddr::<elf::FileHeader32<Endianness>>(data),
        elf::ELFCLASS64 => first_load_vaddr::<elf::FileHeader64<Endianness>>(data),
        _ => None,
    }
}

/// The program headers follow the serialized file header directly; the
/// payload's `e_phoff` is not consulted.
fn first_load_vaddr<Elf: FileHeader>(data: &[u8]) -> Option<u64> {
    let header = Elf::parse(data).ok()?;
    let endian = header.endian().ok()?;
    let phnum = header.e_phnum(endian) as usize;
    let rest = data.get(mem::size_of::<Elf>()..)?;
    let (headers, _) = pod::slice_from_bytes::<Elf::ProgramHeader>(rest, phnum).ok()?;
    headers
        .iter()
        .find(|header| header.p_type(endian) == elf::PT_LOAD)
        .map(|header| header.p_vaddr(endian).into())
}

/// Replaces whatever `symbols` held with the function symbols of `iter`,
/// rebased from `orig_base_address` into `base_address` coordinates.
fn load_symbols<'data, S, I>(
    symbols: &mut RangeMap<ResolverSymbolData>,
    iter: I,
    base_address: u64,
    orig_base_address: u64,
) where
    S: ObjectSymbol<'data>,
    I: Iterator<Item = S>,
{
    *symbols = RangeMap::new();

    for symbol in iter {
        if symbol.kind() != SymbolKind::Text || symbol.is_undefined() {
            continue;
        }
        let name = match symbol.name_bytes() {
            Ok(bytes) => demangle_name(&String::from_utf8_lossy(bytes)),
            Err(_) => continue,
        };

        let start = symbol
            .address()
            .wrapping_sub(orig_base_address)
            .wrapping_add(base_address);
        let end = start.wrapping_add(symbol.size().max(1));
        let data = ResolverSymbolData {
            size: symbol.size(),
            name,
            binding: binding_rank(&symbol),
        };
        insert_symbol(symbols, Range::new(start, end), data);
    }
}

/// Numeric binding strength, matching the ELF binding values:
/// weak(2) > global(1) > local(0).
fn binding_rank<'data, S: ObjectSymbol<'data>>(symbol: &S) -> u8 {
    if symbol.is_weak() {
        2
    } else if symbol.is_global() {
        1
    } else {
        0
    }
}

/// Inserts one symbol, resolving collisions with whatever already covers the
/// range: sized symbols beat asm labels, and a higher binding beats a lower
/// one. A single keep-or-replace decision on the `(size > 0, binding)` order.
fn insert_symbol(symbols: &mut RangeMap<ResolverSymbolData>, range: Range, data: ResolverSymbolData) {
    match symbols.overlap_of(range) {
        None => {
            symbols.insert(range, data);
        }
        Some((existing_range, existing)) => {
            if (existing.size == 0 && data.size != 0) || existing.binding < data.binding {
                let start = existing_range.start();
                symbols.remove(start);
                symbols.insert(range, data);
            }
        }
    }
}

/// Walks the ingested symbols in address order, covering every gap of at
/// least [`MIN_GAP_SIZE`] bytes with an unnamed synthetic symbol and
/// stretching zero-sized asm labels up to the next symbol (or the object
/// end), renaming them to `<name>@<file basename>`.
fn construct_fake_symbols(
    symbols: RangeMap<ResolverSymbolData>,
    base_address: u64,
    object_size: u64,
    base_name: &str,
) -> RangeMap<ResolverSymbolData> {
    let object_end = base_address.wrapping_add(object_size);
    let mut new_symbols = RangeMap::new();
    let mut prev_end = base_address;

    let mut iter = symbols.iter().peekable();
    while let Some((range, data)) = iter.next() {
        let gap = range.start().saturating_sub(prev_end);
        if gap >= MIN_GAP_SIZE {
            new_symbols.insert(
                Range::new(prev_end, range.start()),
                ResolverSymbolData::gap(gap),
            );
        }

        if data.size == 0 {
            let new_end = match iter.peek() {
                Some((next_range, _)) => next_range.start(),
                None => object_end,
            };
            if new_end > range.start() {
                let stretched = ResolverSymbolData {
                    size: new_end - range.start(),
                    name: format!("{}@{}", data.name, base_name),
                    binding: data.binding,
                };
                new_symbols.insert(Range::new(range.start(), new_end), stretched);
                prev_end = new_end;
                continue;
            }
        }

        new_symbols.insert(range, data.clone());
        prev_end = range.end();
    }

    let trailing_gap = object_end.saturating_sub(prev_end);
    if trailing_gap >= MIN_GAP_SIZE {
        new_symbols.insert(
            Range::new(prev_end, object_end),
            ResolverSymbolData::gap(trailing_gap),
        );
    }

    new_symbols
}
