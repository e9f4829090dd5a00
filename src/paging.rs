//! Construction of the boot page tables in the guest memory.

use kvm_bindings::kvm_sregs;
use x86_64::{
	registers::control::{Cr0Flags, Cr4Flags},
	structures::paging::PageTableFlags,
};

use crate::{
	consts::*,
	mem::{MemoryError, MmapMemory},
};

/// Identity-maps `[0, guest_size)` with 2 MiB pages and points the
/// control registers in `sregs` at the new tables.
///
/// For simplicity a single PML4/PDPTE/PDE chain is used, so the guest
/// memory has to be a multiple of the page size and has to fit into the
/// 512 entries of one PDE page. Both is verified by the VM builder.
pub fn initialize_pagetables(mem: &MmapMemory, sregs: &mut kvm_sregs) -> Result<(), MemoryError> {
	let guest_size = mem.memory_size() as u64;
	assert_eq!(guest_size & (GUEST_PAGE_SIZE - 1), 0);
	assert!(guest_size <= GUEST_PAGE_SIZE * 512);

	// The tables may overlap a reloaded kernel image, so clear them first.
	unsafe { mem.slice_at_mut(BOOT_PML4, 3 * PAGE_SIZE)? }.fill(0x00);

	let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
	mem.write_u64(BOOT_PML4, BOOT_PDPTE | flags.bits())?;
	mem.write_u64(BOOT_PDPTE, BOOT_PDE | flags.bits())?;

	let large = flags | PageTableFlags::HUGE_PAGE;
	let mut pde = BOOT_PDE;
	let mut paddr = 0;
	while paddr < guest_size {
		mem.write_u64(pde, paddr | large.bits())?;
		paddr += GUEST_PAGE_SIZE;
		pde += std::mem::size_of::<u64>() as u64;
	}

	sregs.cr3 = BOOT_PML4;
	sregs.cr4 |= Cr4Flags::PHYSICAL_ADDRESS_EXTENSION.bits();
	sregs.cr0 |= Cr0Flags::PAGING.bits();

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_initialize_pagetables() {
		let guest_size = 32 * 1024 * 1024;
		let mem = MmapMemory::new(guest_size, 0);
		let mut sregs = kvm_sregs::default();

		initialize_pagetables(&mem, &mut sregs).unwrap();

		assert_eq!(sregs.cr3, BOOT_PML4);
		assert_ne!(sregs.cr4 & Cr4Flags::PHYSICAL_ADDRESS_EXTENSION.bits(), 0);
		assert_ne!(sregs.cr0 & Cr0Flags::PAGING.bits(), 0);

		assert_eq!(mem.read_u64(BOOT_PML4).unwrap(), BOOT_PDPTE | 0x3);
		assert_eq!(mem.read_u64(BOOT_PDPTE).unwrap(), BOOT_PDE | 0x3);

		// one large page entry per 2 MiB of guest memory
		let entries = guest_size as u64 / GUEST_PAGE_SIZE;
		for i in 0..entries {
			assert_eq!(
				mem.read_u64(BOOT_PDE + i * 8).unwrap(),
				i * GUEST_PAGE_SIZE | 0x83
			);
		}
		assert_eq!(mem.read_u64(BOOT_PDE + entries * 8).unwrap(), 0);
	}

	#[test]
	fn test_pagetables_are_idempotent() {
		let mem = MmapMemory::new(8 * 1024 * 1024, 0);
		let mut first = kvm_sregs::default();
		let mut second = kvm_sregs::default();

		initialize_pagetables(&mem, &mut first).unwrap();
		let pml4 = mem.read_u64(BOOT_PML4).unwrap();

		initialize_pagetables(&mem, &mut second).unwrap();
		assert_eq!(mem.read_u64(BOOT_PML4).unwrap(), pml4);
		assert_eq!(first.cr3, second.cr3);
		assert_eq!(first.cr4, second.cr4);
	}
}
