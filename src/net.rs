//! The TAP device backing the guest's network hypercalls.

use std::os::unix::io::{AsRawFd, RawFd};

use tun_tap::{Iface, Mode};

use crate::error::*;

/// Wrapper for a tap device, containing the descriptor and MAC address.
///
/// The device is created by the out-of-scope tun/tap machinery of the
/// host; the monitor only consumes its descriptor as a raw byte stream
/// and hands the MAC address to the guest via the NETINFO hypercall.
pub struct Tap {
	iface: Iface,
	mac_str: [u8; 18],
}

impl Tap {
	pub fn new(name: &str) -> HypervisorResult<Tap> {
		let iface = Iface::without_packet_info(name, Mode::Tap)?;

		// The guest polls the device, so reads must not block the vCPU
		// thread.
		let ret = unsafe { libc::fcntl(iface.as_raw_fd(), libc::F_SETFL, libc::O_NONBLOCK) };
		if ret < 0 {
			return Err(std::io::Error::last_os_error().into());
		}

		let mac = mac_address(name)?;
		let formatted = format!(
			"{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
			mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
		);
		let mut mac_str = [0u8; 18];
		mac_str[..17].copy_from_slice(formatted.as_bytes());

		Ok(Tap { iface, mac_str })
	}

	/// Return the tap device name.
	pub fn name(&self) -> &str {
		self.iface.name()
	}

	/// Return the MAC address as a NUL-terminated ASCII string.
	pub fn mac_str(&self) -> &[u8; 18] {
		&self.mac_str
	}
}

impl AsRawFd for Tap {
	fn as_raw_fd(&self) -> RawFd {
		self.iface.as_raw_fd()
	}
}

fn mac_address(name: &str) -> HypervisorResult<[u8; 6]> {
	nix::ifaddrs::getifaddrs()?
		.find(|dev| dev.interface_name == name)
		.and_then(|dev| dev.address)
		.and_then(|addr| addr.as_link_addr().and_then(|link| link.addr()))
		.ok_or_else(|| HypervisorError::InvalidMacAddress(name.to_owned()))
}
