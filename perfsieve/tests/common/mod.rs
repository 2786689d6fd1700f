//! Test support: record-stream builders plus a minimal on-disk ELF fixture
//! (x86-64, little-endian, one LOAD segment and a `.symtab`) so the full
//! load → resolve → fixup pipeline can run against a real file.

#![allow(dead_code)]

use std::io::Write;

use byteorder::{LittleEndian, WriteBytesExt};
use perfsieve::perf_event::{PERF_EVENT_HEADER_SIZE, PERF_RECORD_MMAP, PERF_RECORD_SAMPLE};
use tempfile::NamedTempFile;

pub fn mmap_record(address: u64, length: u64, file_name: &str) -> Vec<u8> {
    let mut body = Vec::new();
    body.write_u32::<LittleEndian>(7).unwrap();
    body.write_u32::<LittleEndian>(7).unwrap();
    body.write_u64::<LittleEndian>(address).unwrap();
    body.write_u64::<LittleEndian>(length).unwrap();
    body.write_u64::<LittleEndian>(0).unwrap();
    body.extend_from_slice(file_name.as_bytes());
    body.push(0);
    with_header(PERF_RECORD_MMAP, &body)
}

pub fn sample_record(ip: u64, callchain: &[u64]) -> Vec<u8> {
    let mut body = Vec::new();
    body.write_u64::<LittleEndian>(ip).unwrap();
    body.write_u64::<LittleEndian>(callchain.len() as u64)
        .unwrap();
    for &frame in callchain {
        body.write_u64::<LittleEndian>(frame).unwrap();
    }
    with_header(PERF_RECORD_SAMPLE, &body)
}

pub fn with_header(kind: u32, body: &[u8]) -> Vec<u8> {
    let mut record = Vec::new();
    record.write_u32::<LittleEndian>(kind).unwrap();
    record.write_u16::<LittleEndian>(0).unwrap();
    record
        .write_u16::<LittleEndian>((PERF_EVENT_HEADER_SIZE + body.len()) as u16)
        .unwrap();
    record.extend_from_slice(body);
    record
}

pub fn stream(records: &[Vec<u8>]) -> Vec<u8> {
    records.concat()
}

const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;
const SYM_SIZE: usize = 24;
const SHDR_SIZE: usize = 64;

/// Writes an executable with the given base address and global `STT_FUNC`
/// symbols to a temp file.
pub fn write_elf(base_address: u64, symbols: &[(&str, u64, u64)]) -> NamedTempFile {
    let mut strtab = vec![0u8];
    let name_offsets: Vec<u32> = symbols
        .iter()
        .map(|&(name, _, _)| {
            let offset = strtab.len() as u32;
            strtab.extend_from_slice(name.as_bytes());
            strtab.push(0);
            offset
        })
        .collect();

    let mut symtab = vec![0u8; SYM_SIZE]; // index 0 is the null symbol
    for (&(_, value, size), &name_offset) in symbols.iter().zip(&name_offsets) {
        p32(&mut symtab, name_offset);
        symtab.push(0x12); // STB_GLOBAL, STT_FUNC
        symtab.push(0);
        p16(&mut symtab, 1); // defined in .text
        p64(&mut symtab, value);
        p64(&mut symtab, size);
    }

    let shstrtab = b"\0.text\0.symtab\0.strtab\0.shstrtab\0".to_vec();
    let (text_name, symtab_name, strtab_name, shstrtab_name) = (1u32, 7, 15, 23);

    let symtab_offset = EHDR_SIZE + PHDR_SIZE;
    let strtab_offset = symtab_offset + symtab.len();
    let shstrtab_offset = strtab_offset + strtab.len();
    let section_headers_offset = (shstrtab_offset + shstrtab.len() + 7) & !7;

    let mut out = Vec::new();
    out.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
    out.extend_from_slice(&[0u8; 8]);
    p16(&mut out, 2); // ET_EXEC
    p16(&mut out, 62); // EM_X86_64
    p32(&mut out, 1);
    p64(&mut out, 0); // entry point
    p64(&mut out, EHDR_SIZE as u64);
    p64(&mut out, section_headers_offset as u64);
    p32(&mut out, 0);
    p16(&mut out, EHDR_SIZE as u16);
    p16(&mut out, PHDR_SIZE as u16);
    p16(&mut out, 1);
    p16(&mut out, SHDR_SIZE as u16);
    p16(&mut out, 5);
    p16(&mut out, 4); // .shstrtab

    // The one LOAD segment.
    p32(&mut out, 1); // PT_LOAD
    p32(&mut out, 5); // R + X
    p64(&mut out, 0);
    p64(&mut out, base_address);
    p64(&mut out, base_address);
    p64(&mut out, 0x1000);
    p64(&mut out, 0x1000);
    p64(&mut out, 0x1000);

    out.extend_from_slice(&symtab);
    out.extend_from_slice(&strtab);
    out.extend_from_slice(&shstrtab);
    out.resize(section_headers_offset, 0);

    shdr(&mut out, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0);
    shdr(&mut out, text_name, 1, 6, base_address, 0, 0x1000, 0, 0, 16, 0);
    shdr(
        &mut out,
        symtab_name,
        2, // SHT_SYMTAB
        0,
        0,
        symtab_offset as u64,
        symtab.len() as u64,
        3,
        1,
        8,
        SYM_SIZE as u64,
    );
    shdr(
        &mut out,
        strtab_name,
        3, // SHT_STRTAB
        0,
        0,
        strtab_offset as u64,
        strtab.len() as u64,
        0,
        0,
        1,
        0,
    );
    shdr(
        &mut out,
        shstrtab_name,
        3,
        0,
        0,
        shstrtab_offset as u64,
        shstrtab.len() as u64,
        0,
        0,
        1,
        0,
    );

    let mut file = NamedTempFile::new().unwrap();
    file.write_all(&out).unwrap();
    file.flush().unwrap();
    file
}

fn p16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn p32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn p64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
}

#[allow(clippy::too_many_arguments)]
fn shdr(
    out: &mut Vec<u8>,
    name: u32,
    sh_type: u32,
    flags: u64,
    addr: u64,
    offset: u64,
    size: u64,
    link: u32,
    info: u32,
    align: u64,
    entsize: u64,
) {
    p32(out, name);
    p32(out, sh_type);
    p64(out, flags);
    p64(out, addr);
    p64(out, offset);
    p64(out, size);
    p32(out, link);
    p32(out, info);
    p64(out, align);
    p64(out, entsize);
}
