use std::sync::Arc;

use kvm_bindings::{kvm_mp_state, kvm_regs, KVM_MAX_CPUID_ENTRIES, KVM_MP_STATE_RUNNABLE};
use kvm_ioctls::{VcpuExit, VcpuFd};
use x86_64::registers::control::Cr0Flags;

use crate::{
	consts::*,
	error::*,
	gdt,
	hypercall::{self, Hypercall},
	paging,
	vm::Mhyve,
};

const CPUID_EXT_HYPERVISOR: u32 = 1 << 31;
const CPUID_ENABLE_MSR: u32 = 1 << 5;
const CPUID_FUNC_PERFMON: u32 = 0x0A;

/// Why a vCPU left its dispatch loop.
#[derive(Debug, Clone, Copy)]
pub enum VcpuStopReason {
	/// The guest halted the processor.
	Halt,
	/// The guest requested to terminate the monitor with a status.
	Exit(i32),
	/// The vCPU was kicked by the shutdown signal.
	Kick,
}

/// A single guest processor, owned by the host thread that runs it.
pub struct MhyveCpu {
	id: u32,
	vcpu: VcpuFd,
	vm: Arc<Mhyve>,
}

impl MhyveCpu {
	pub fn new(id: u32, vm: Arc<Mhyve>) -> HypervisorResult<MhyveCpu> {
		let vcpu = vm.vm_fd().create_vcpu(id.into())?;
		Ok(MhyveCpu { id, vcpu, vm })
	}

	pub fn init(&mut self, entry_point: u64) -> HypervisorResult<()> {
		self.setup_system()?;

		// Initial register state as expected by the kernel's startup code.
		let regs = kvm_regs {
			rip: entry_point,
			rax: 2,
			rbx: 2,
			rdx: 0,
			rflags: 0x2,
			..Default::default()
		};
		self.vcpu.set_regs(&regs)?;

		self.setup_cpuid()?;

		// be sure that the multiprocessor is runnable
		let mp_state = self.vcpu.get_mp_state()?;
		if mp_state.mp_state != KVM_MP_STATE_RUNNABLE {
			self.vcpu.set_mp_state(kvm_mp_state {
				mp_state: KVM_MP_STATE_RUNNABLE,
			})?;
		}

		Ok(())
	}

	/// Initializes the segment and control registers.
	///
	/// All cores run the same startup code and share the GDT and page
	/// tables, so only the boot processor builds the register set. The
	/// application processors apply the published copy.
	fn setup_system(&self) -> HypervisorResult<()> {
		let sregs = if self.id == 0 {
			let mut sregs = self.vcpu.get_sregs()?;

			gdt::write_boot_gdt(self.vm.mem(), &mut sregs)?;
			paging::initialize_pagetables(self.vm.mem(), &mut sregs)?;
			sregs.cr0 |= Cr0Flags::PROTECTED_MODE_ENABLE.bits();
			sregs.efer |= EFER_LME;

			self.vm.publish_sregs(sregs);
			sregs
		} else {
			*self.vm.cached_sregs()
		};

		self.vcpu.set_sregs(&sregs)?;

		Ok(())
	}

	fn setup_cpuid(&self) -> Result<(), kvm_ioctls::Error> {
		let mut kvm_cpuid = self
			.vm
			.kvm()
			.get_supported_cpuid(KVM_MAX_CPUID_ENTRIES as usize)?;

		for entry in kvm_cpuid.as_mut_slice().iter_mut() {
			match entry.function {
				1 => {
					// CPUID to define basic cpu features
					entry.ecx |= CPUID_EXT_HYPERVISOR; // propagate that we are running on a hypervisor
					entry.edx |= CPUID_ENABLE_MSR; // enable msr support
				}
				CPUID_FUNC_PERFMON => {
					// disable performance monitor
					entry.eax = 0x00;
				}
				_ => {}
			}
		}

		self.vcpu.set_cpuid2(&kvm_cpuid)
	}

	/// Runs the vCPU until the guest halts, requests an exit or the
	/// monitor shuts down.
	pub fn run(&mut self) -> HypervisorResult<VcpuStopReason> {
		loop {
			// The exit reason borrows the run structure, so the ioctl
			// error is carried out of the match as a plain errno.
			let errno = match self.vcpu.run() {
				Ok(exit_reason) => {
					match exit_reason {
						VcpuExit::Hlt => {
							eprintln!(
								"Guest has halted the CPU, this is considered as a normal exit."
							);
							return Ok(VcpuStopReason::Halt);
						}
						VcpuExit::IoOut(port, data) => {
							let data_addr =
								u32::from_le_bytes(data[..4].try_into().unwrap()).into();
							match unsafe {
								hypercall::address_to_hypercall(self.vm.mem(), port, data_addr)
							} {
								Some(Hypercall::Exit(sysexit)) => {
									return Ok(VcpuStopReason::Exit(sysexit.arg));
								}
								Some(Hypercall::FileWrite(syswrite)) => {
									hypercall::write(self.vm.mem(), syswrite)
								}
								Some(Hypercall::FileOpen(sysopen)) => {
									hypercall::open(self.vm.mem(), sysopen)
								}
								Some(Hypercall::FileClose(sysclose)) => {
									hypercall::close(sysclose)
								}
								Some(Hypercall::FileRead(sysread)) => {
									hypercall::read(self.vm.mem(), sysread)
								}
								Some(Hypercall::FileLseek(syslseek)) => {
									hypercall::lseek(syslseek)
								}
								Some(Hypercall::Netinfo(sysnetinfo)) => {
									hypercall::netinfo(sysnetinfo, self.vm.net().mac_str())
								}
								Some(Hypercall::Netwrite(sysnetwrite)) => hypercall::netwrite(
									self.vm.mem(),
									self.vm.net_fd(),
									sysnetwrite,
								),
								Some(Hypercall::Netread(sysnetread)) => hypercall::netread(
									self.vm.mem(),
									self.vm.net_fd(),
									sysnetread,
								),
								None => {
									panic!("KVM: unhandled KVM_EXIT_IO at port {port:#x}")
								}
							}
						}
						VcpuExit::IoIn(port, _) => {
							panic!("KVM: unhandled KVM_EXIT_IO (in) at port {port:#x}")
						}
						VcpuExit::MmioRead(addr, _) | VcpuExit::MmioWrite(addr, _) => {
							panic!("KVM: unhandled KVM_EXIT_MMIO at {addr:#x}")
						}
						VcpuExit::FailEntry(reason, cpu) => {
							panic!(
								"KVM: entry failure on cpu {cpu}: hardware_entry_failure_reason={reason:#x}"
							)
						}
						VcpuExit::InternalError => {
							panic!("KVM: internal error exit")
						}
						VcpuExit::Shutdown => {
							panic!("KVM: received shutdown command")
						}
						vcpu_exit => {
							panic!("KVM: unhandled exit: {vcpu_exit:?}")
						}
					}
					continue;
				}
				Err(err) => err.errno(),
			};

			match errno {
				libc::EINTR => {
					if self.vm.is_shutting_down() {
						return Ok(VcpuStopReason::Kick);
					}
				}
				libc::EFAULT => {
					let regs = self.vcpu.get_regs()?;
					panic!("KVM: host/guest translation fault: rip={:#x}", regs.rip);
				}
				_ => panic!(
					"KVM: ioctl KVM_RUN in vcpu_loop failed: {}",
					kvm_ioctls::Error::new(errno)
				),
			}
		}
	}

	pub fn id(&self) -> u32 {
		self.id
	}
}
