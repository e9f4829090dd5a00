use std::{panic, process, sync::Arc};

use clap::{crate_version, App, Arg};
use mhyvelib::{consts::DEFAULT_GUEST_SIZE, params::Params, utils, Mhyve};

fn main() {
	env_logger::init();

	// A vCPU thread that panics must not leave the monitor running
	// headless, so turn every panic into a process exit.
	let default_hook = panic::take_hook();
	panic::set_hook(Box::new(move |info| {
		default_hook(info);
		process::exit(1);
	}));

	let matches = App::new("mhyve")
		.version(crate_version!())
		.about("A minimal hypervisor for Hermit unikernels")
		.arg(
			Arg::with_name("VERBOSE")
				.short("v")
				.long("verbose")
				.help("Print also kernel messages"),
		)
		.arg(
			Arg::with_name("MEM")
				.short("m")
				.long("memsize")
				.value_name("MEM")
				.help("Memory size of the guest")
				.takes_value(true)
				.env("HERMIT_MEM"),
		)
		.arg(
			Arg::with_name("CPUS")
				.short("c")
				.long("cpus")
				.value_name("CPUS")
				.help("Number of guest processors")
				.takes_value(true)
				.env("HERMIT_CPUS"),
		)
		.arg(
			Arg::with_name("NETIF")
				.long("nic")
				.value_name("NETIF")
				.help("Name of the network interface")
				.takes_value(true)
				.env("HERMIT_NETIF"),
		)
		.arg(
			Arg::with_name("KERNEL")
				.help("Sets path to the kernel")
				.required(true)
				.index(1),
		)
		.get_matches();

	let path = matches
		.value_of("KERNEL")
		.expect("Expect path to the kernel!");
	let memory_size = matches
		.value_of("MEM")
		.map(|x| {
			utils::parse_mem(x).unwrap_or_else(|err| {
				eprintln!("{err}");
				process::exit(1);
			})
		})
		.unwrap_or(DEFAULT_GUEST_SIZE);
	let num_cpus = matches
		.value_of("CPUS")
		.map(|x| {
			x.parse().unwrap_or_else(|_| {
				eprintln!("Couldn't parse the number of guest processors");
				process::exit(1);
			})
		})
		.unwrap_or(1);
	let netif = matches.value_of("NETIF").map(str::to_owned);
	let verbose = matches.is_present("VERBOSE") || utils::parse_bool("HERMIT_VERBOSE", false);

	let params = Params {
		memory_size,
		num_cpus,
		verbose,
		netif,
	};

	let vm = Mhyve::new(path.into(), &params).expect("Unable to create VM");
	let code = Arc::new(vm).run().expect("Unable to run the guest");

	process::exit(code);
}
