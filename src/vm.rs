//! This file contains the entry point to the hypervisor. mhyve utilizes
//! KVM to create a virtual machine, loads a Hermit kernel image into its
//! memory and runs one host thread per guest processor.

use std::{
	fs::File,
	os::unix::thread::JoinHandleExt,
	path::{Path, PathBuf},
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc, Mutex, OnceLock,
	},
	thread,
};

use goblin::elf64::{
	header::{Header, ELFCLASS64, ELFMAG, EI_CLASS, EM_X86_64, ET_EXEC, SELFMAG, SIZEOF_EHDR},
	program_header::{ProgramHeader, PT_LOAD, SIZEOF_PHDR},
};
use kvm_bindings::{kvm_sregs, KVM_API_VERSION};
use kvm_ioctls::{Kvm, VmFd};
use nix::sys::{
	pthread::{pthread_kill, pthread_self, Pthread},
	signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal},
};

use crate::{
	consts::*,
	error::*,
	mem::MmapMemory,
	net::Tap,
	params::Params,
	utils,
	vcpu::{MhyveCpu, VcpuStopReason},
};

/// Addresses of the loaded kernel image inside the guest memory.
#[derive(Debug, Clone, Copy)]
pub struct LoadedKernel {
	/// The ELF entry point.
	pub entry_point: u64,
	/// Start of the first loaded segment, which hosts the boot
	/// information fields.
	pub mboot: u64,
	/// Start of the kernel log ring.
	pub klog: u64,
}

/// The virtual machine and everything the vCPU threads share.
///
/// All fields are populated once during creation and are read-only
/// afterwards, except for the shutdown coordination state.
pub struct Mhyve {
	vm: VmFd,
	kvm: Kvm,
	mem: MmapMemory,
	kernel: LoadedKernel,
	num_cpus: u32,
	verbose: bool,
	netif: Option<String>,
	sregs: OnceLock<kvm_sregs>,
	tap: OnceLock<Tap>,
	shutdown: AtomicBool,
	exit_code: OnceLock<i32>,
	vcpu_threads: Mutex<Vec<Pthread>>,
}

impl Mhyve {
	pub fn new(kernel_path: PathBuf, params: &Params) -> HypervisorResult<Mhyve> {
		let guest_size = params.memory_size;
		if guest_size & (GUEST_PAGE_SIZE as usize - 1) != 0 {
			return Err(HypervisorError::UnalignedGuestMemory(guest_size));
		}
		if guest_size > GUEST_PAGE_SIZE as usize * 512 {
			return Err(HypervisorError::GuestMemoryTooLarge(guest_size));
		}
		if guest_size >= KVM_32BIT_GAP_START {
			return Err(HypervisorError::GuestMemoryOverlapsGap(guest_size));
		}

		let kvm = Kvm::new()?;

		// Make sure we have the stable version of the API
		let api_version = kvm.get_api_version();
		if api_version != KVM_API_VERSION as i32 {
			return Err(HypervisorError::InvalidKvmApiVersion(api_version));
		}

		let vm = kvm.create_vm()?;

		let mem = MmapMemory::new(guest_size, GUEST_OFFSET);
		unsafe { vm.set_user_memory_region(mem.as_kvm_region()) }?;

		debug!("Initialize interrupt controller");
		vm.create_irq_chip()?;

		let kernel = load_kernel(&mem, &kernel_path)?;

		Ok(Mhyve {
			vm,
			kvm,
			mem,
			kernel,
			num_cpus: params.num_cpus,
			verbose: params.verbose,
			netif: params.netif.clone(),
			sregs: OnceLock::new(),
			tap: OnceLock::new(),
			shutdown: AtomicBool::new(false),
			exit_code: OnceLock::new(),
			vcpu_threads: Mutex::new(Vec::new()),
		})
	}

	/// Boots the loaded kernel and runs it to completion. Returns the
	/// exit status of the guest.
	pub fn run(self: Arc<Self>) -> HypervisorResult<i32> {
		// register the signal handler before going multithreaded
		install_sigterm_handler()?;

		// The boot processor is created inline, so its register state is
		// published before any application processor looks at it.
		let mut boot_cpu = MhyveCpu::new(0, self.clone())?;
		boot_cpu.init(self.kernel.entry_point)?;

		// hand the configured core count to the guest
		self.mem
			.write_volatile_u32(self.kernel.mboot + BOOT_INFO_POSSIBLE_CPUS, self.num_cpus)?;
		self.mem
			.flush_cache_line(self.kernel.mboot + BOOT_INFO_POSSIBLE_CPUS)?;

		self.vcpu_threads.lock().unwrap().push(pthread_self());

		let mut threads = Vec::with_capacity(self.num_cpus.saturating_sub(1) as usize);
		for id in 1..self.num_cpus {
			let vm = self.clone();
			let handle = thread::spawn(move || -> HypervisorResult<()> {
				debug!("Create thread for CPU {}", id);

				// Only one core at a time is able to enter the startup
				// code, so wait until the guest has brought the
				// predecessor core online.
				while vm
					.mem
					.read_volatile_u32(vm.kernel.mboot + BOOT_INFO_CPU_ONLINE)?
					< id
				{
					if vm.is_shutting_down() {
						return Ok(());
					}
					thread::yield_now();
				}

				vm.mem
					.write_volatile_u32(vm.kernel.mboot + BOOT_INFO_CURRENT_BOOT_ID, id)?;
				vm.mem
					.flush_cache_line(vm.kernel.mboot + BOOT_INFO_CURRENT_BOOT_ID)?;

				let mut cpu = MhyveCpu::new(id, vm.clone())?;
				cpu.init(vm.kernel.entry_point)?;

				match cpu.run()? {
					VcpuStopReason::Exit(code) => vm.initiate_shutdown(code),
					// a halted or kicked application processor simply
					// ends its thread
					VcpuStopReason::Halt | VcpuStopReason::Kick => {}
				}

				Ok(())
			});

			self.vcpu_threads
				.lock()
				.unwrap()
				.push(handle.as_pthread_t());
			threads.push(handle);
		}

		if let Some(netif) = &self.netif {
			debug!("Open TAP device {}", netif);
			let tap = Tap::new(netif)?;
			self.tap.set(tap).ok();
		}

		// jump into the VM and execute the code of the guest
		match boot_cpu.run()? {
			VcpuStopReason::Halt => self.initiate_shutdown(0),
			VcpuStopReason::Exit(code) => self.initiate_shutdown(code),
			VcpuStopReason::Kick => {}
		}

		for thread in threads {
			thread.join().expect("vCPU thread panicked")?;
		}

		if self.verbose {
			self.dump_kernel_log();
		}

		Ok(*self.exit_code.get().unwrap_or(&0))
	}

	/// Publishes the exit status and kicks every peer vCPU thread out of
	/// `KVM_RUN`, so the monitor can wind down.
	pub(crate) fn initiate_shutdown(&self, code: i32) {
		let _ = self.exit_code.set(code);
		self.shutdown.store(true, Ordering::SeqCst);

		let threads = self.vcpu_threads.lock().unwrap();
		let current = pthread_self();
		for &thread in threads.iter() {
			if thread != current {
				let _ = pthread_kill(thread, Signal::SIGTERM);
			}
		}
	}

	pub(crate) fn is_shutting_down(&self) -> bool {
		self.shutdown.load(Ordering::SeqCst)
	}

	pub(crate) fn publish_sregs(&self, sregs: kvm_sregs) {
		self.sregs
			.set(sregs)
			.expect("system registers published twice");
	}

	pub(crate) fn cached_sregs(&self) -> &kvm_sregs {
		self.sregs
			.get()
			.expect("the boot processor has not published its system registers")
	}

	pub(crate) fn kvm(&self) -> &Kvm {
		&self.kvm
	}

	pub(crate) fn vm_fd(&self) -> &VmFd {
		&self.vm
	}

	pub fn mem(&self) -> &MmapMemory {
		&self.mem
	}

	pub fn kernel(&self) -> &LoadedKernel {
		&self.kernel
	}

	pub fn num_cpus(&self) -> u32 {
		self.num_cpus
	}

	pub(crate) fn net(&self) -> &Tap {
		self.tap
			.get()
			.expect("network hypercall without a network backend")
	}

	pub(crate) fn net_fd(&self) -> std::os::unix::io::RawFd {
		use std::os::unix::io::AsRawFd;
		self.net().as_raw_fd()
	}

	fn dump_kernel_log(&self) {
		println!("\nDump kernel log:");
		println!("================\n");
		match self.mem.read_cstr(self.kernel.klog) {
			Ok(log) => println!("{}", log.to_string_lossy()),
			Err(_) => warn!("The kernel log ring is not terminated"),
		}
	}
}

impl Drop for Mhyve {
	fn drop(&mut self) {
		debug!("Drop virtual machine");
	}
}

/// Loads a Hermit ELF image into the guest memory and initializes the
/// boot information fields on its first loaded segment.
pub fn load_kernel(mem: &MmapMemory, path: &Path) -> HypervisorResult<LoadedKernel> {
	debug!("Load kernel from {}", path.display());

	let invalid = || HypervisorError::InvalidFile(path.display().to_string());

	let file = File::open(path).map_err(|_| invalid())?;

	let mut ehdr_buf = [0u8; SIZEOF_EHDR];
	if utils::pread_in_full(&file, &mut ehdr_buf, 0)? != SIZEOF_EHDR {
		return Err(invalid());
	}
	let hdr = Header::from_bytes(&ehdr_buf);

	// check if the program is a Hermit file
	if hdr.e_ident[..SELFMAG] != ELFMAG[..]
		|| hdr.e_ident[EI_CLASS] != ELFCLASS64
		|| hdr.e_ident[EI_OSABI] != HERMIT_ELFOSABI
		|| hdr.e_type != ET_EXEC
		|| hdr.e_machine != EM_X86_64
	{
		return Err(invalid());
	}

	if hdr.e_phentsize as usize != SIZEOF_PHDR {
		return Err(invalid());
	}

	let phdrs_size = SIZEOF_PHDR * hdr.e_phnum as usize;
	let mut phdr_buf = vec![0u8; phdrs_size];
	if utils::pread_in_full(&file, &mut phdr_buf, hdr.e_phoff)? != phdrs_size {
		return Err(invalid());
	}
	let phdrs = ProgramHeader::from_bytes(&phdr_buf, hdr.e_phnum as usize);

	let mut kernel = None;

	// Load all segments with type "LOAD" from the file at offset
	// p_offset into the guest memory at p_paddr.
	for phdr in &phdrs {
		if phdr.p_type != PT_LOAD {
			continue;
		}

		let paddr = phdr.p_paddr - GUEST_OFFSET;
		let filesz = phdr.p_filesz as usize;
		let memsz = phdr.p_memsz as usize;

		debug!(
			"Load segment with start addr {:#x} and size {:#x}, offset {:#x}",
			phdr.p_paddr, filesz, phdr.p_offset
		);

		let segment = unsafe { mem.slice_at_mut(paddr, memsz)? };
		if utils::pread_in_full(&file, &mut segment[..filesz], phdr.p_offset)? != filesz {
			return Err(invalid());
		}
		segment[filesz..].fill(0x00);

		if kernel.is_none() {
			// initialize the boot information on the first loaded segment
			mem.write_u64(paddr + BOOT_INFO_BASE, phdr.p_paddr)?; // physical start address
			mem.write_u64(paddr + BOOT_INFO_LIMIT, mem.memory_size() as u64)?; // physical limit
			mem.write_u32(paddr + BOOT_INFO_CPU_FREQ, utils::get_cpu_frequency())?;
			mem.write_u32(paddr + BOOT_INFO_POSSIBLE_CPUS, 1)?; // number of used cpus
			mem.write_u32(paddr + BOOT_INFO_CURRENT_BOOT_ID, 0)?; // apic id
			mem.write_u64(paddr + BOOT_INFO_IMAGE_SIZE, filesz as u64)?;
			mem.write_u32(paddr + BOOT_INFO_NUMA_NODES, 1)?; // numa nodes
			mem.write_u32(paddr + BOOT_INFO_MONITOR, 1)?; // announce mhyve

			kernel = Some(LoadedKernel {
				entry_point: hdr.e_entry,
				mboot: paddr,
				klog: paddr + KERNEL_LOG_OFFSET,
			});
		}
	}

	let kernel = kernel.ok_or_else(invalid)?;
	debug!("ELF entry point at {:#x}", kernel.entry_point);

	Ok(kernel)
}

extern "C" fn sigterm_handler(_signum: libc::c_int) {
	// The handler itself does nothing. Its delivery interrupts KVM_RUN
	// with EINTR, which makes the vCPU loop observe the shutdown flag,
	// drop its vCPU descriptor and end the thread.
}

fn install_sigterm_handler() -> HypervisorResult<()> {
	let action = SigAction::new(
		SigHandler::Handler(sigterm_handler),
		SaFlags::empty(),
		SigSet::empty(),
	);
	unsafe { sigaction(Signal::SIGTERM, &action) }?;

	Ok(())
}
