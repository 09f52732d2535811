//! `mkshallfs` writes the initial superblocks for a SHALLFS journal device
//! (spec §3 Lifecycle, "created").

use std::env;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::exit;

use shallfs_engine::device::FileDevice;
use shallfs_engine::format;
use shallfs_utils::util::ByteSize;
use shallfs_utils::{disk, error, init_logging};

/// Structure storing command line arguments.
#[derive(Default)]
struct Args {
	/// The name of the current program used in command line.
	prog: String,

	/// If true, print command line help.
	help: bool,

	/// Superblock alignment, in bytes (`MountOptions::alignment`'s on-disk twin).
	alignment: u32,
	/// Number of superblocks to lay out across the device.
	num_superblocks: u32,

	/// The path to the device file on which the journal will be created.
	device_path: Option<PathBuf>,
}

impl Default for Args {
	fn default() -> Self {
		Self { prog: String::new(), help: false, alignment: 8, num_superblocks: 16, device_path: None }
	}
}

fn parse_args() -> Args {
	let mut args = Args::default();
	let mut iter = env::args();

	args.prog = iter.next().unwrap_or("mkshallfs".to_owned());

	while let Some(arg) = iter.next() {
		match arg.as_str() {
			"-h" | "--help" => args.help = true,

			"-a" | "--alignment" => {
				args.alignment = iter
					.next()
					.and_then(|v| v.parse().ok())
					.unwrap_or_else(|| error(&args.prog, "--alignment requires a numeric argument"));
			}

			"-n" | "--superblocks" => {
				args.num_superblocks = iter
					.next()
					.and_then(|v| v.parse().ok())
					.unwrap_or_else(|| error(&args.prog, "--superblocks requires a numeric argument"));
			}

			_ => args.device_path = Some(arg.into()),
		}
	}

	args
}

fn print_help(prog: &str) {
	println!();
	println!("Usage:");
	println!(" {prog} [options] <device>");
	println!();
	println!("Writes the initial superblocks of a SHALLFS journal device.");
	println!();
	println!("Options:");
	println!(" -h, --help\t\tPrints help.");
	println!(" -a, --alignment\tRecord alignment in bytes (default 8).");
	println!(" -n, --superblocks\tNumber of superblocks (default 16).");
}

fn main() {
	init_logging();
	let args = parse_args();

	if args.help {
		print_help(&args.prog);
		exit(0);
	}

	let device_path = args.device_path.unwrap_or_else(|| {
		print_help(&args.prog);
		exit(1);
	});

	let size = disk::device_size(&device_path)
		.unwrap_or_else(|e| error(&args.prog, format!("{}: {e}", device_path.display())));

	let file = OpenOptions::new()
		.write(true)
		.open(&device_path)
		.unwrap_or_else(|e| error(&args.prog, format!("{}: {e}", device_path.display())));

	let mut device = FileDevice::open(file, size);

	format(&mut device, args.alignment, args.num_superblocks)
		.unwrap_or_else(|e| error(&args.prog, e));

	println!(
		"{}: formatted {} across {} superblocks",
		args.prog,
		ByteSize(size),
		args.num_superblocks
	);
}
