#![allow(dead_code)]

use std::{fs, path::PathBuf};

/// Guest physical address of the only loaded segment of the test kernels.
pub const KERNEL_PADDR: u64 = 0x40_0000;
/// Offset of the entry point inside the segment.
pub const ENTRY_OFFSET: u64 = 0x1000;
/// Offset of the scratch data area inside the segment.
pub const DATA_OFFSET: u64 = 0x2000;
/// File size of the segment.
pub const SEGMENT_SIZE: usize = 0x3000;
/// Memory size of the segment, which leaves room for the kernel log ring.
pub const SEGMENT_MEMSZ: u64 = 0x6000;

pub const ELFOSABI_HERMIT: u8 = 0x42;
pub const EM_X86_64: u16 = 62;
pub const EM_AARCH64: u16 = 183;

/// Builds a minimal ELF64 executable with a single `PT_LOAD` segment at
/// [`KERNEL_PADDR`] and the entry point at [`ENTRY_OFFSET`] into it.
pub fn build_elf(segment: &[u8], machine: u16, osabi: u8) -> Vec<u8> {
	const EHSIZE: u64 = 64;
	const PHSIZE: u64 = 56;
	const SEGMENT_FILE_OFFSET: u64 = 0x1000;

	let mut elf = Vec::new();

	// ELF header
	elf.extend_from_slice(&[0x7f, b'E', b'L', b'F']);
	elf.push(2); // ELFCLASS64
	elf.push(1); // little endian
	elf.push(1); // EV_CURRENT
	elf.push(osabi);
	elf.extend_from_slice(&[0u8; 8]); // ABI version + padding
	elf.extend_from_slice(&2u16.to_le_bytes()); // ET_EXEC
	elf.extend_from_slice(&machine.to_le_bytes());
	elf.extend_from_slice(&1u32.to_le_bytes()); // EV_CURRENT
	elf.extend_from_slice(&(KERNEL_PADDR + ENTRY_OFFSET).to_le_bytes()); // e_entry
	elf.extend_from_slice(&EHSIZE.to_le_bytes()); // e_phoff
	elf.extend_from_slice(&0u64.to_le_bytes()); // e_shoff
	elf.extend_from_slice(&0u32.to_le_bytes()); // e_flags
	elf.extend_from_slice(&(EHSIZE as u16).to_le_bytes()); // e_ehsize
	elf.extend_from_slice(&(PHSIZE as u16).to_le_bytes()); // e_phentsize
	elf.extend_from_slice(&1u16.to_le_bytes()); // e_phnum
	elf.extend_from_slice(&0u16.to_le_bytes()); // e_shentsize
	elf.extend_from_slice(&0u16.to_le_bytes()); // e_shnum
	elf.extend_from_slice(&0u16.to_le_bytes()); // e_shstrndx
	assert_eq!(elf.len() as u64, EHSIZE);

	// program header
	elf.extend_from_slice(&1u32.to_le_bytes()); // PT_LOAD
	elf.extend_from_slice(&7u32.to_le_bytes()); // rwx
	elf.extend_from_slice(&SEGMENT_FILE_OFFSET.to_le_bytes()); // p_offset
	elf.extend_from_slice(&KERNEL_PADDR.to_le_bytes()); // p_vaddr
	elf.extend_from_slice(&KERNEL_PADDR.to_le_bytes()); // p_paddr
	elf.extend_from_slice(&(segment.len() as u64).to_le_bytes()); // p_filesz
	elf.extend_from_slice(&SEGMENT_MEMSZ.to_le_bytes()); // p_memsz
	elf.extend_from_slice(&0x1000u64.to_le_bytes()); // p_align
	assert_eq!(elf.len() as u64, EHSIZE + PHSIZE);

	elf.resize(SEGMENT_FILE_OFFSET as usize, 0);
	elf.extend_from_slice(segment);

	elf
}

pub fn build_hermit_elf(segment: &[u8]) -> Vec<u8> {
	build_elf(segment, EM_X86_64, ELFOSABI_HERMIT)
}

/// Builds the segment of a test kernel: `code` at [`ENTRY_OFFSET`],
/// `data` at [`DATA_OFFSET`].
pub fn build_segment(code: &[u8], data: &[u8]) -> Vec<u8> {
	let mut segment = vec![0u8; SEGMENT_SIZE];
	segment[ENTRY_OFFSET as usize..][..code.len()].copy_from_slice(code);
	segment[DATA_OFFSET as usize..][..data.len()].copy_from_slice(data);
	segment
}

/// Writes a test kernel to a unique path below the temp directory.
pub fn write_kernel(name: &str, elf: &[u8]) -> PathBuf {
	let path = std::env::temp_dir().join(format!("mhyve-kernel-{name}-{}", std::process::id()));
	fs::write(&path, elf).unwrap();
	path
}

/// `out` instruction on `port` with the guest physical address `addr` as
/// payload.
pub fn asm_out(port: u16, addr: u32) -> Vec<u8> {
	let mut code = vec![0x66, 0xba]; // mov dx, port
	code.extend_from_slice(&port.to_le_bytes());
	code.push(0xb8); // mov eax, addr
	code.extend_from_slice(&addr.to_le_bytes());
	code.push(0xef); // out dx, eax
	code
}
