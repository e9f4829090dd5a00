use thiserror::Error;

use crate::mem::MemoryError;

pub type HypervisorResult<T> = Result<T, HypervisorError>;

#[derive(Error, Debug)]
pub enum HypervisorError {
	#[error(transparent)]
	Kvm(#[from] kvm_ioctls::Error),
	#[error(transparent)]
	Io(#[from] std::io::Error),
	#[error(transparent)]
	Errno(#[from] nix::errno::Errno),
	#[error(transparent)]
	Memory(#[from] MemoryError),
	#[error("KVM: API version is {0}, mhyve requires version 12")]
	InvalidKvmApiVersion(i32),
	#[error("The file {0} was not found or is invalid")]
	InvalidFile(String),
	#[error("Guest memory size {0:#x} is not a multiple of 2 MiB")]
	UnalignedGuestMemory(usize),
	#[error("Guest memory size {0:#x} does not fit into a single PDE page")]
	GuestMemoryTooLarge(usize),
	#[error("Guest memory size {0:#x} overlaps the 32-bit PCI gap")]
	GuestMemoryOverlapsGap(usize),
	#[error("Couldn't parse the guest memory size from the environment")]
	ParseMemory,
	#[error("The network interface {0} has no MAC address")]
	InvalidMacAddress(String),
}
