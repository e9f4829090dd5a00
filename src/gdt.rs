//! The boot GDT and its translation into KVM segment descriptors.

use kvm_bindings::{kvm_segment, kvm_sregs};

use crate::{
	consts::*,
	mem::{MemoryError, MmapMemory},
};

/// Constructor for a conventional segment GDT (or LDT) entry.
pub fn gdt_entry(flags: u64, base: u64, limit: u64) -> u64 {
	((base & 0xff00_0000u64) << (56 - 24))
		| ((flags & 0x0000_f0ffu64) << 40)
		| ((limit & 0x000f_0000u64) << (48 - 16))
		| ((base & 0x00ff_ffffu64) << 16)
		| (limit & 0x0000_ffffu64)
}

fn get_base(entry: u64) -> u64 {
	((entry & 0xff00_0000_0000_0000) >> 32)
		| ((entry & 0x0000_00ff_0000_0000) >> 16)
		| ((entry & 0x0000_0000_ffff_0000) >> 16)
}

fn get_limit(entry: u64) -> u32 {
	(((entry & 0x000f_0000_0000_0000) >> 32) | (entry & 0x0000_0000_0000_ffff)) as u32
}

fn get_g(entry: u64) -> u8 {
	((entry & 0x0080_0000_0000_0000) >> 55) as u8
}

fn get_db(entry: u64) -> u8 {
	((entry & 0x0040_0000_0000_0000) >> 54) as u8
}

fn get_l(entry: u64) -> u8 {
	((entry & 0x0020_0000_0000_0000) >> 53) as u8
}

fn get_avl(entry: u64) -> u8 {
	((entry & 0x0010_0000_0000_0000) >> 52) as u8
}

fn get_p(entry: u64) -> u8 {
	((entry & 0x0000_8000_0000_0000) >> 47) as u8
}

fn get_dpl(entry: u64) -> u8 {
	((entry & 0x0000_6000_0000_0000) >> 45) as u8
}

fn get_s(entry: u64) -> u8 {
	((entry & 0x0000_1000_0000_0000) >> 44) as u8
}

fn get_type(entry: u64) -> u8 {
	((entry & 0x0000_0f00_0000_0000) >> 40) as u8
}

/// Translates a GDT entry at `table_index` into the segment register
/// value KVM expects.
pub fn kvm_segment_from_gdt(entry: u64, table_index: u8) -> kvm_segment {
	kvm_segment {
		base: get_base(entry),
		limit: get_limit(entry),
		selector: table_index as u16 * 8,
		type_: get_type(entry),
		present: get_p(entry),
		dpl: get_dpl(entry),
		db: get_db(entry),
		s: get_s(entry),
		l: get_l(entry),
		g: get_g(entry),
		avl: get_avl(entry),
		unusable: u8::from(get_p(entry) == 0),
		padding: 0,
	}
}

/// Writes the boot GDT into the guest memory and derives the segment
/// registers in `sregs` from its entries.
pub fn write_boot_gdt(mem: &MmapMemory, sregs: &mut kvm_sregs) -> Result<(), MemoryError> {
	let gdt: [u64; BOOT_GDT_MAX] = [
		gdt_entry(0, 0, 0),
		gdt_entry(0xA09B, 0, 0xFFFFF), /* code */
		gdt_entry(0xC093, 0, 0xFFFFF), /* data */
	];

	for (i, entry) in gdt.iter().enumerate() {
		mem.write_u64(BOOT_GDT + (i * std::mem::size_of::<u64>()) as u64, *entry)?;
	}

	sregs.gdt.base = BOOT_GDT;
	sregs.gdt.limit = (std::mem::size_of::<u64>() * BOOT_GDT_MAX - 1) as u16;

	let code_seg = kvm_segment_from_gdt(gdt[BOOT_GDT_CODE], BOOT_GDT_CODE as u8);
	let data_seg = kvm_segment_from_gdt(gdt[BOOT_GDT_DATA], BOOT_GDT_DATA as u8);

	sregs.cs = code_seg;
	sregs.ds = data_seg;
	sregs.es = data_seg;
	sregs.fs = data_seg;
	sregs.gs = data_seg;
	sregs.ss = data_seg;

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_gdt_entry() {
		// the null descriptor stays empty
		assert_eq!(gdt_entry(0, 0, 0), 0);
		assert_eq!(gdt_entry(0xA09B, 0, 0xFFFFF), 0x00af_9b00_0000_ffff);
		assert_eq!(gdt_entry(0xC093, 0, 0xFFFFF), 0x00cf_9300_0000_ffff);
	}

	#[test]
	fn test_kvm_segment_from_gdt() {
		let code = kvm_segment_from_gdt(gdt_entry(0xA09B, 0, 0xFFFFF), 1);
		assert_eq!(code.selector, 1 << 3);
		assert_eq!(code.base, 0);
		assert_eq!(code.limit, 0xFFFFF);
		assert_eq!(code.type_, 0xB);
		assert_eq!(code.present, 1);
		assert_eq!(code.dpl, 0);
		assert_eq!(code.s, 1);
		assert_eq!(code.l, 1);
		assert_eq!(code.db, 0);
		assert_eq!(code.g, 1);
		assert_eq!(code.unusable, 0);

		let data = kvm_segment_from_gdt(gdt_entry(0xC093, 0, 0xFFFFF), 2);
		assert_eq!(data.selector, 2 << 3);
		assert_eq!(data.type_, 0x3);
		assert_eq!(data.l, 0);
		assert_eq!(data.db, 1);

		let null = kvm_segment_from_gdt(gdt_entry(0, 0, 0), 0);
		assert_eq!(null.present, 0);
		assert_eq!(null.unusable, 1);
	}

	#[test]
	fn test_write_boot_gdt() {
		let mem = MmapMemory::new(2 * 1024 * 1024, 0);
		let mut sregs = kvm_sregs::default();

		write_boot_gdt(&mem, &mut sregs).unwrap();

		assert_eq!(mem.read_u64(BOOT_GDT).unwrap(), 0);
		assert_eq!(mem.read_u64(BOOT_GDT + 8).unwrap(), gdt_entry(0xA09B, 0, 0xFFFFF));
		assert_eq!(
			mem.read_u64(BOOT_GDT + 16).unwrap(),
			gdt_entry(0xC093, 0, 0xFFFFF)
		);

		assert_eq!(sregs.gdt.base, BOOT_GDT);
		assert_eq!(sregs.gdt.limit, 23);
		assert_eq!(sregs.cs.selector, 1 << 3);
		assert_eq!(sregs.ss.selector, 2 << 3);
		assert_eq!(sregs.ds.selector, sregs.ss.selector);
	}
}
