use std::{env, fs::File};

use nix::{errno::Errno, sys::uio::pread};
use raw_cpuid::CpuId;

use crate::error::*;

/// Parses a memory size with an optional single-letter suffix
/// (`K`/`M`/`G`/`T`/`P`/`E`, case-insensitive). A bare integer is
/// returned unchanged; hexadecimal values are accepted with a `0x` prefix.
pub fn parse_mem(mem: &str) -> HypervisorResult<usize> {
	let mem = mem.trim();
	if mem.is_empty() {
		return Err(HypervisorError::ParseMemory);
	}

	if let Some(num) = parse_num(mem) {
		return Ok(num);
	}

	let suffix = mem.chars().last().unwrap();
	let num = &mem[..mem.len() - suffix.len_utf8()];
	let shift = match suffix {
		'E' | 'e' => 60,
		'P' | 'p' => 50,
		'T' | 't' => 40,
		'G' | 'g' => 30,
		'M' | 'm' => 20,
		'K' | 'k' => 10,
		_ => return Err(HypervisorError::ParseMemory),
	};

	parse_num(num)
		.map(|num| num << shift)
		.ok_or(HypervisorError::ParseMemory)
}

fn parse_num(s: &str) -> Option<usize> {
	if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
		usize::from_str_radix(hex, 16).ok()
	} else {
		s.parse().ok()
	}
}

/// Reads the environment variable `name` and interprets every value
/// except `"0"` as true.
pub fn parse_bool(name: &str, default: bool) -> bool {
	env::var(name).map(|x| x != "0").unwrap_or(default)
}

/// Reads `buf.len()` bytes at `offset`, retrying on `EINTR` and short
/// reads. Returns the number of bytes actually read, which is only
/// smaller than the buffer if the end of the file has been reached.
pub fn pread_in_full(file: &File, mut buf: &mut [u8], mut offset: u64) -> HypervisorResult<usize> {
	let mut total = 0;

	while !buf.is_empty() {
		match pread(file, buf, offset as libc::off_t) {
			Ok(0) => break,
			Ok(count) => {
				total += count;
				offset += count as u64;
				let tmp = buf;
				buf = &mut tmp[count..];
			}
			Err(Errno::EINTR) => continue,
			Err(err) => return Err(err.into()),
		}
	}

	Ok(total)
}

/// Determines the frequency of the boot processor in MHz.
///
/// Tries the cpufreq sysfs entry first, falls back to `/proc/cpuinfo`
/// and finally to the TSC info leaf. Returns 0 if the frequency cannot
/// be determined.
pub fn get_cpu_frequency() -> u32 {
	freq_from_sysfs()
		.or_else(freq_from_cpuinfo)
		.or_else(freq_from_cpuid)
		.unwrap_or(0)
}

fn freq_from_sysfs() -> Option<u32> {
	// cpufreq reports kHz
	std::fs::read_to_string("/sys/devices/system/cpu/cpu0/cpufreq/cpuinfo_max_freq")
		.ok()?
		.trim()
		.parse::<u32>()
		.ok()
		.map(|khz| khz / 1000)
}

fn freq_from_cpuinfo() -> Option<u32> {
	let cpuinfo = std::fs::read_to_string("/proc/cpuinfo").ok()?;

	for line in cpuinfo.lines() {
		if let Some(rest) = line.strip_prefix("cpu MHz") {
			let mhz = rest.split(':').nth(1)?.trim();
			return mhz.split('.').next()?.parse().ok();
		}
	}

	None
}

fn freq_from_cpuid() -> Option<u32> {
	let cpuid = CpuId::new();
	let hz = cpuid.get_tsc_info().and_then(|tinfo| tinfo.tsc_frequency())?;

	u32::try_from(hz / 1_000_000).ok().filter(|mhz| *mhz > 0)
}

#[cfg(test)]
mod tests {
	use std::io::Write;

	use super::*;

	#[test]
	fn test_parse_mem() {
		assert_eq!(parse_mem("2M").unwrap(), 2 * 1024 * 1024);
		assert_eq!(parse_mem("2m").unwrap(), 2 * 1024 * 1024);
		assert_eq!(parse_mem("1G").unwrap(), 1 << 30);
		assert_eq!(parse_mem("512K").unwrap(), 512 << 10);
		assert_eq!(parse_mem("1T").unwrap(), 1 << 40);
	}

	#[test]
	fn test_parse_mem_without_suffix() {
		assert_eq!(parse_mem("4711").unwrap(), 4711);
		assert_eq!(parse_mem("0x20000000").unwrap(), 0x2000_0000);
	}

	#[test]
	fn test_parse_mem_invalid() {
		assert!(parse_mem("").is_err());
		assert!(parse_mem("fourtytwo").is_err());
		assert!(parse_mem("2X").is_err());
		assert!(parse_mem("M").is_err());
	}

	#[test]
	fn test_parse_bool() {
		env::set_var("MHYVE_TEST_BOOL", "1");
		assert!(parse_bool("MHYVE_TEST_BOOL", false));
		env::set_var("MHYVE_TEST_BOOL", "0");
		assert!(!parse_bool("MHYVE_TEST_BOOL", true));
		env::remove_var("MHYVE_TEST_BOOL");
		assert!(parse_bool("MHYVE_TEST_BOOL", true));
		assert!(!parse_bool("MHYVE_TEST_BOOL", false));
	}

	#[test]
	fn test_pread_in_full() {
		let path = std::env::temp_dir().join(format!("mhyve-pread-{}", std::process::id()));
		let mut file = File::create(&path).unwrap();
		file.write_all(b"0123456789").unwrap();
		drop(file);

		let file = File::open(&path).unwrap();
		let mut buf = [0u8; 4];
		assert_eq!(pread_in_full(&file, &mut buf, 2).unwrap(), 4);
		assert_eq!(&buf, b"2345");

		// reading past the end is short, not an error
		let mut buf = [0u8; 8];
		assert_eq!(pread_in_full(&file, &mut buf, 6).unwrap(), 4);
		assert_eq!(&buf[..4], b"6789");

		std::fs::remove_file(&path).unwrap();
	}

	#[test]
	fn test_get_cpu_frequency() {
		let freq = get_cpu_frequency();
		// more than 10 GHz is probably wrong
		assert!(freq < 10000);
	}
}
