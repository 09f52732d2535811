//! `shallfsck` is the out-of-mount recovery/repair tool for a SHALLFS
//! journal device (spec §4.6 "Recovery / fsck"), implementing the §6
//! exit-code bitmask contract.

use std::env;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::exit;

use shallfs_engine::device::FileDevice;
use shallfs_engine::fsck::{self, FsckOptions};
use shallfs_utils::{disk, error, init_logging, prompt};

/// Structure storing command line arguments.
#[derive(Default)]
struct Args {
	/// The name of the current program used in command line.
	prog: String,

	/// If true, print command line help.
	help: bool,

	/// Skip the confirmation prompt for the record-stream repair pass.
	assume_yes: bool,
	/// Run the second, record-streaming repair pass.
	repair_records: bool,

	/// The device to check.
	device_path: Option<PathBuf>,
}

fn parse_args() -> Args {
	let mut args: Args = Default::default();
	let mut iter = env::args();

	args.prog = iter.next().unwrap_or("shallfsck".to_owned());

	while let Some(arg) = iter.next() {
		match arg.as_str() {
			"-h" | "--help" => args.help = true,
			"-y" | "--yes" => args.assume_yes = true,
			"-r" | "--records" => args.repair_records = true,

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
	println!("Checks and repairs a SHALLFS journal device's superblocks.");
	println!();
	println!("Options:");
	println!(" -h, --help\t\tPrints help.");
	println!(" -y, --yes\t\tAssume yes to every repair prompt.");
	println!(" -r, --records\t\tAlso stream and repair the record log.");
	println!();
	println!("Exit status is a bitmask: 1 corrected, 2 reboot needed,");
	println!("4 uncorrected errors remain, 8 operational error, 16 usage,");
	println!("32 cancelled by the user.");
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
		exit(fsck::EXIT_USAGE as i32);
	});

	let size = disk::device_size(&device_path)
		.unwrap_or_else(|e| error(&args.prog, format!("{}: {e}", device_path.display())));

	let file = OpenOptions::new()
		.read(true)
		.write(true)
		.open(&device_path)
		.unwrap_or_else(|e| error(&args.prog, format!("{}: {e}", device_path.display())));

	let mut device = FileDevice::open(file, size);

	// Spec §4.6: the record-streaming pass is policy-driven and defaults to
	// asking, since it overwrites corrupt records in place.
	let mut assume_yes = args.assume_yes;
	if args.repair_records && !assume_yes {
		let answer = prompt::prompt(Some("Repair corrupt records in the log? [y/N] "), false)
			.unwrap_or_default();
		assume_yes = matches!(answer.trim(), "y" | "Y" | "yes" | "Yes");
	}

	let options = FsckOptions { repair_records: args.repair_records, assume_yes };
	let code = fsck::fsck(&mut device, &options);

	if code == fsck::EXIT_OK {
		println!("{}: {} is clean", args.prog, device_path.display());
	} else {
		eprintln!("{}: {} needed attention (exit code {code})", args.prog, device_path.display());
	}

	exit(code as i32);
}
