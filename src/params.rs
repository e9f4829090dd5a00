use crate::consts::DEFAULT_GUEST_SIZE;

/// Configuration of the virtual machine, assembled by the command-line
/// wrapper from its arguments and the `HERMIT_*` environment.
#[derive(Debug, Clone)]
pub struct Params {
	/// Guest RAM size in bytes.
	pub memory_size: usize,

	/// Number of guest processors.
	pub num_cpus: u32,

	/// Dump the kernel log ring on exit.
	pub verbose: bool,

	/// Name of the TAP interface backing the network hypercalls.
	pub netif: Option<String>,
}

impl Default for Params {
	fn default() -> Self {
		Params {
			memory_size: DEFAULT_GUEST_SIZE,
			num_cpus: 1,
			verbose: false,
			netif: None,
		}
	}
}
