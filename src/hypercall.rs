//! The guest communicates with the monitor through hypercalls: an `out`
//! instruction on one of the reserved ports, whose 32-bit payload is the
//! guest physical address of the request record for that port. The
//! record is mutated in place to return the result while the vCPU is
//! paused at the I/O exit.

use std::{io, os::unix::io::RawFd};

use nix::errno::Errno;
use num_enum::TryFromPrimitive;

use crate::mem::MmapMemory;

/// Enum containing all valid port mappings for hypercalls.
#[repr(u16)]
#[derive(Debug, Eq, PartialEq, TryFromPrimitive, Clone, Copy)]
pub enum HypercallAddress {
	FileWrite = 0x499,
	FileOpen = 0x500,
	FileClose = 0x501,
	FileRead = 0x502,
	Exit = 0x503,
	FileLseek = 0x504,
	Netinfo = 0x505,
	Netwrite = 0x506,
	Netread = 0x507,
}

/// Parameters for a [`FileWrite`](Hypercall::FileWrite) hypercall.
///
/// The number of bytes written is stored back into `len`; unlike
/// [`ReadParams`] there is no separate return field. The asymmetry is
/// part of the guest ABI.
#[repr(C, packed)]
#[derive(Debug, Copy, Clone)]
pub struct WriteParams {
	pub fd: i32,
	pub buf: u64,
	pub len: isize,
}

/// Parameters for a [`FileOpen`](Hypercall::FileOpen) hypercall.
#[repr(C, packed)]
#[derive(Debug, Copy, Clone)]
pub struct OpenParams {
	pub name: u64,
	pub flags: i32,
	pub mode: i32,
	pub ret: i32,
}

/// Parameters for a [`FileClose`](Hypercall::FileClose) hypercall.
///
/// `ret` doubles as the input gate: the descriptor is only closed if the
/// guest passed a value greater than 2, which keeps the standard streams
/// alive.
#[repr(C, packed)]
#[derive(Debug, Copy, Clone)]
pub struct CloseParams {
	pub fd: i32,
	pub ret: i32,
}

/// Parameters for a [`FileRead`](Hypercall::FileRead) hypercall.
#[repr(C, packed)]
#[derive(Debug, Copy, Clone)]
pub struct ReadParams {
	pub fd: i32,
	pub buf: u64,
	pub len: usize,
	pub ret: isize,
}

/// Parameters for an [`Exit`](Hypercall::Exit) hypercall.
#[repr(C, packed)]
#[derive(Debug, Copy, Clone)]
pub struct ExitParams {
	pub arg: i32,
}

/// Parameters for a [`FileLseek`](Hypercall::FileLseek) hypercall. The
/// resulting offset overwrites `offset` in place.
#[repr(C, packed)]
#[derive(Debug, Copy, Clone)]
pub struct LseekParams {
	pub fd: i32,
	pub offset: i64,
	pub whence: i32,
}

/// Parameters for a [`Netinfo`](Hypercall::Netinfo) hypercall.
#[repr(C, packed)]
#[derive(Debug, Copy, Clone)]
pub struct NetinfoParams {
	/// MAC address of the TAP device as a NUL-terminated ASCII string.
	pub mac_str: [u8; 18],
}

/// Parameters for a [`Netwrite`](Hypercall::Netwrite) hypercall.
#[repr(C, packed)]
#[derive(Debug, Copy, Clone)]
pub struct NetwriteParams {
	pub data: u64,
	pub len: usize,
	pub ret: i32,
}

/// Parameters for a [`Netread`](Hypercall::Netread) hypercall.
#[repr(C, packed)]
#[derive(Debug, Copy, Clone)]
pub struct NetreadParams {
	pub data: u64,
	pub len: usize,
	pub ret: i32,
}

/// Hypervisor calls available in mhyve with their respective parameters.
#[derive(Debug)]
pub enum Hypercall<'a> {
	Exit(&'a ExitParams),
	FileClose(&'a mut CloseParams),
	FileLseek(&'a mut LseekParams),
	FileOpen(&'a mut OpenParams),
	FileRead(&'a mut ReadParams),
	FileWrite(&'a mut WriteParams),
	Netinfo(&'a mut NetinfoParams),
	Netread(&'a mut NetreadParams),
	Netwrite(&'a mut NetwriteParams),
}

/// `port` is the address of the hypercall, `data` is the guest physical
/// address of the parameter record that was sent to that port.
///
/// # Safety
///
/// - The return value is only valid as long as the vCPU is paused at the
///   I/O exit.
/// - This fn must not be called multiple times on the same record, to
///   avoid creating mutable aliasing.
pub unsafe fn address_to_hypercall(
	mem: &MmapMemory,
	port: u16,
	data: u64,
) -> Option<Hypercall<'_>> {
	let hypercall_port = HypercallAddress::try_from(port).ok()?;
	Some(match hypercall_port {
		HypercallAddress::FileWrite => {
			let syswrite = mem.get_ref_mut::<WriteParams>(data).unwrap();
			Hypercall::FileWrite(syswrite)
		}
		HypercallAddress::FileOpen => {
			let sysopen = mem.get_ref_mut::<OpenParams>(data).unwrap();
			Hypercall::FileOpen(sysopen)
		}
		HypercallAddress::FileClose => {
			let sysclose = mem.get_ref_mut::<CloseParams>(data).unwrap();
			Hypercall::FileClose(sysclose)
		}
		HypercallAddress::FileRead => {
			let sysread = mem.get_ref_mut::<ReadParams>(data).unwrap();
			Hypercall::FileRead(sysread)
		}
		HypercallAddress::Exit => {
			let sysexit = mem.get_ref_mut::<ExitParams>(data).unwrap();
			Hypercall::Exit(sysexit)
		}
		HypercallAddress::FileLseek => {
			let syslseek = mem.get_ref_mut::<LseekParams>(data).unwrap();
			Hypercall::FileLseek(syslseek)
		}
		HypercallAddress::Netinfo => {
			let sysnetinfo = mem.get_ref_mut::<NetinfoParams>(data).unwrap();
			Hypercall::Netinfo(sysnetinfo)
		}
		HypercallAddress::Netwrite => {
			let sysnetwrite = mem.get_ref_mut::<NetwriteParams>(data).unwrap();
			Hypercall::Netwrite(sysnetwrite)
		}
		HypercallAddress::Netread => {
			let sysnetread = mem.get_ref_mut::<NetreadParams>(data).unwrap();
			Hypercall::Netread(sysnetread)
		}
	})
}

/// Handles a write syscall on the host. The result is stored back into
/// `len`, as the guest ABI demands.
pub fn write(mem: &MmapMemory, syswrite: &mut WriteParams) {
	let buf = unsafe { mem.slice_at(syswrite.buf, syswrite.len as usize) }
		.expect("WRITE hypercall with invalid buffer address");

	syswrite.len =
		unsafe { libc::write(syswrite.fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
}

/// Handles an open syscall by opening the host path at the guest address
/// `name`. Flags and mode are passed through unchanged.
pub fn open(mem: &MmapMemory, sysopen: &mut OpenParams) {
	let name = mem
		.read_cstr(sysopen.name)
		.expect("OPEN hypercall with invalid path address");

	sysopen.ret =
		unsafe { libc::open(name.as_ptr(), sysopen.flags, sysopen.mode as libc::c_uint) };
}

/// Handles a close syscall on the host. Descriptors of the standard
/// streams are never closed.
pub fn close(sysclose: &mut CloseParams) {
	if sysclose.ret > 2 {
		sysclose.ret = unsafe { libc::close(sysclose.fd) };
	}
}

/// Handles a read syscall on the host.
pub fn read(mem: &MmapMemory, sysread: &mut ReadParams) {
	let buf = unsafe { mem.slice_at_mut(sysread.buf, sysread.len) }
		.expect("READ hypercall with invalid buffer address");

	sysread.ret =
		unsafe { libc::read(sysread.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
}

/// Handles an lseek syscall on the host. The new offset replaces the
/// requested one in place.
pub fn lseek(syslseek: &mut LseekParams) {
	syslseek.offset = unsafe { libc::lseek(syslseek.fd, syslseek.offset, syslseek.whence) };
}

/// Copies the MAC address of the network back-end into the record.
pub fn netinfo(sysnetinfo: &mut NetinfoParams, mac_str: &[u8; 18]) {
	sysnetinfo.mac_str = *mac_str;
}

/// Writes a packet from the guest to the TAP device. Partial writes are
/// not tolerated, the packet has to leave in one piece.
pub fn netwrite(mem: &MmapMemory, netfd: RawFd, sysnetwrite: &mut NetwriteParams) {
	let buf = unsafe { mem.slice_at(sysnetwrite.data, sysnetwrite.len) }
		.expect("NETWRITE hypercall with invalid buffer address");

	let ret = unsafe { libc::write(netfd, buf.as_ptr() as *const libc::c_void, buf.len()) };
	let len = sysnetwrite.len;
	assert!(
		ret == len as isize,
		"NETWRITE transferred {ret} of {len} bytes"
	);
	sysnetwrite.ret = 0;
}

/// Reads a packet from the TAP device into the guest. Without a pending
/// packet `ret` becomes -1 and `len` keeps its value.
pub fn netread(mem: &MmapMemory, netfd: RawFd, sysnetread: &mut NetreadParams) {
	let buf = unsafe { mem.slice_at_mut(sysnetread.data, sysnetread.len) }
		.expect("NETREAD hypercall with invalid buffer address");

	let ret = unsafe { libc::read(netfd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
	if ret == 0 || (ret == -1 && Errno::last() == Errno::EAGAIN) {
		sysnetread.ret = -1;
		return;
	}
	assert!(ret > 0, "NETREAD failed: {}", io::Error::last_os_error());

	sysnetread.len = ret as usize;
	sysnetread.ret = 0;
}
