pub const PAGE_SIZE: usize = 0x1000;
pub const GUEST_PAGE_SIZE: u64 = 0x200000; /* 2 MB pages in guest */
pub const GUEST_OFFSET: u64 = 0x0;
pub const DEFAULT_GUEST_SIZE: usize = 0x2000_0000;

pub const BOOT_GDT: u64 = 0x1000;
pub const BOOT_GDT_NULL: usize = 0;
pub const BOOT_GDT_CODE: usize = 1;
pub const BOOT_GDT_DATA: usize = 2;
pub const BOOT_GDT_MAX: usize = 3;
pub const BOOT_PML4: u64 = 0x10000;
pub const BOOT_PDPTE: u64 = 0x11000;
pub const BOOT_PDE: u64 = 0x12000;

pub const EFER_LME: u64 = 1 << 8; /* Long mode enable */

/// Base of the 32-bit PCI gap. The guest memory has to stay below it, as
/// mhyve only manages a single memory slot.
pub const KVM_32BIT_GAP_START: usize = 0xC000_0000;
const _: () = assert!(DEFAULT_GUEST_SIZE < KVM_32BIT_GAP_START);

/// OS ABI octet identifying a Hermit kernel image.
pub const HERMIT_ELFOSABI: u8 = 0x42;
pub const EI_OSABI: usize = 7;

/// Offset of the kernel log ring relative to the first loaded segment.
pub const KERNEL_LOG_OFFSET: u64 = 0x5000;

// Offsets of the boot information fields relative to the start of the
// first loaded segment. The layout is shared with the kernel.
pub const BOOT_INFO_BASE: u64 = 0x08;
pub const BOOT_INFO_LIMIT: u64 = 0x10;
pub const BOOT_INFO_CPU_FREQ: u64 = 0x18;
pub const BOOT_INFO_CPU_ONLINE: u64 = 0x20;
pub const BOOT_INFO_POSSIBLE_CPUS: u64 = 0x24;
pub const BOOT_INFO_CURRENT_BOOT_ID: u64 = 0x30;
pub const BOOT_INFO_IMAGE_SIZE: u64 = 0x38;
pub const BOOT_INFO_NUMA_NODES: u64 = 0x60;
pub const BOOT_INFO_MONITOR: u64 = 0x94;
