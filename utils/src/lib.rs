//! Features common to the `mkshallfs` and `shallfsck` command-line front ends.

pub mod disk;
pub mod prompt;
pub mod util;

/// Installs the logger used by every SHALLFS binary.
///
/// Respects `RUST_LOG` (e.g. `RUST_LOG=shallfs_engine=debug`); defaults to
/// `info` so mount/fsck decisions are visible without extra flags.
pub fn init_logging() {
	let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
		.try_init();
}

/// Prints `{prog}: {msg}` to stderr and exits with status 1.
///
/// Mirrors the error-reporting convention used across every binary in this
/// workspace: program name and device name prefix the human-readable
/// message (spec's "User-visible failure" rule).
pub fn error(prog: &str, msg: impl std::fmt::Display) -> ! {
	eprintln!("{prog}: {msg}");
	std::process::exit(1);
}
