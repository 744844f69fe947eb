#![deny(
	// Enforce some additional strictness on unsafe code.
	unsafe_op_in_unsafe_fn,
	clippy::undocumented_unsafe_blocks,
	// Deny a number of `as` casts in favor of safer alternatives.
	clippy::as_underscore,
	clippy::ptr_as_ptr,
	clippy::cast_lossless,
	clippy::cast_possible_truncation,
	clippy::checked_conversions,
	clippy::unnecessary_cast,
	// More general style-type things.
	clippy::from_over_into,
	clippy::semicolon_if_nothing_returned,
)]

use std::borrow::Cow;
use std::env;
use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process;

use tracing_subscriber::{fmt as log_fmt, prelude::*, EnvFilter};

/// Reports an error to standard error in the JSON form that consumers of this
/// tool parse, then terminates the current process with exit code 1.
macro_rules! unpickle_bail {
	($category:expr, $fmt:literal $(, $($args:tt)* )?) => {{
		let _ = unpickle_json::write_error(
			::std::io::stderr().lock(),
			&format!($fmt $(, $($args)* )?),
			$category,
		);
		::std::process::exit(1);
	}};
}

fn main() {
	let args = match Cli::parse_args() {
		Ok(args) => args,
		Err(err) => unpickle_bail!("UsageError", "{err}"),
	};

	init_logging();

	let path = args.input_path.map_or(InputPath::Stdin, InputPath::from);
	let mut input = path
		.open()
		.unwrap_or_else(|err| unpickle_bail!("OSError", "{path}: {err}"));
	tracing::debug!(%path, "opened input");

	let handle = match &mut input {
		Input::Stdin => unpickle_json::Handle::from_reader(io::stdin().lock()),
		Input::File(file) => unpickle_json::Handle::from_reader(file),
		Input::Mmap(map) => unpickle_json::Handle::from_slice(map),
	};

	let output = BufWriter::new(io::stdout());
	if let Err(err) = unpickle_json::unpickle(handle, output) {
		tracing::debug!(error = %err, "failed to convert input");
		unpickle_bail!(unpickle_json::category(err.as_ref()), "{err}");
	}
}

/// Installs a `tracing` subscriber that logs to standard error, if the
/// `UNPICKLE_LOG` environment variable holds a filter.
///
/// Logging is off by default, as standard error carries the JSON error report.
fn init_logging() {
	let Ok(directives) = env::var("UNPICKLE_LOG") else {
		return;
	};
	let filter = EnvFilter::try_new(directives)
		.unwrap_or_else(|err| unpickle_bail!("UsageError", "invalid UNPICKLE_LOG: {err}"));
	let json = env::var("UNPICKLE_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

	let registry = tracing_subscriber::registry().with(filter);
	let result = if json {
		registry
			.with(log_fmt::layer().json().with_writer(io::stderr))
			.try_init()
	} else {
		registry
			.with(log_fmt::layer().compact().with_writer(io::stderr))
			.try_init()
	};
	if let Err(err) = result {
		unpickle_bail!("Error", "failed to initialize logging: {err}");
	}
}

struct Cli {
	input_path: Option<PathBuf>,
}

impl Cli {
	fn parse_args() -> Result<Self, lexopt::Error> {
		use lexopt::prelude::*;

		let mut input_path: Option<PathBuf> = None;

		let mut parser = lexopt::Parser::from_env();
		while let Some(arg) = parser.next()? {
			match arg {
				Value(val) => {
					if input_path.is_some() {
						return Err("cannot provide more than one input file".into());
					}
					input_path = Some(PathBuf::from(val));
				}
				Short('V') | Long("version") => {
					const VERSION: &str = version_string();
					let _ = writeln!(io::stdout().lock(), "{VERSION}");
					process::exit(0);
				}
				Short('h') => {
					write_short_help(io::stdout().lock());
					process::exit(0);
				}
				Long("help") => {
					print_long_help();
					process::exit(0);
				}
				_ => return Err(arg.unexpected()),
			}
		}

		Ok(Cli { input_path })
	}
}

/// A usage summary string shared across short and long help output.
static USAGE: &str = "[file]";

/// Writes short help output to the provided writer, ignoring errors.
fn write_short_help<W>(mut w: W)
where
	W: Write,
{
	let argv0 = usage_name();
	let _ = write!(
		w,
		r#"Usage: {argv0} {USAGE}
Try '{argv0} --help' for more information.
"#
	);
}

/// Writes long help output to standard output, ignoring errors.
fn print_long_help() {
	const VERSION: &str = version_string();
	let argv0 = usage_name();
	let _ = write!(
		io::stdout().lock(),
		r#"{VERSION} - Decode Python pickle data into JSON

Usage: {argv0} {USAGE}

Flags:
    -h, --help     Print help information
    -V, --version  Print version information

Reads a single pickle from the named file, or from standard input when no
file or the special file name '-' is given, and writes it to standard output
as one line of JSON.

Dicts become JSON objects and lists and tuples become arrays. Byte strings
become text when they are valid UTF-8, and {{"__bytes__": "<base64>"}}
otherwise. Any other value, such as a set or an instance of a class, becomes
the string that Python's str() would print for it. No Python code is run
while decoding.

On failure, {argv0} writes {{"error": <message>, "type": <category>}} to
standard error and exits with status 1.

Environment:
    UNPICKLE_LOG         Log filter for diagnostics on standard error
                         (for example 'debug')
    UNPICKLE_LOG_FORMAT  Set to 'json' for JSON log lines

The behavior of {argv0} is undefined if an input file is modified while
running.
"#
	);
}

/// Returns the name of this program as it was invoked, or a default.
fn usage_name() -> Cow<'static, str> {
	if let Some(Ok(name)) = env::args_os().next().map(|s| s.into_string()) {
		Cow::Owned(name)
	} else {
		Cow::Borrowed(match env!("CARGO_PKG_NAME") {
			"" => "unpickle-json",
			name => name,
		})
	}
}

/// Returns the full version string for the program (including the crate name)
/// based on Cargo metadata, or a default if Cargo metadata is unavailable.
const fn version_string() -> &'static str {
	let version = concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION"));
	if !version.is_empty() {
		version
	} else {
		"unpickle-json 0.0.0-unknown"
	}
}

#[derive(PartialEq, Eq)]
enum InputPath {
	Stdin,
	File(PathBuf),
}

enum Input {
	Stdin,
	File(File),
	Mmap(memmap2::Mmap),
}

impl From<PathBuf> for InputPath {
	fn from(path: PathBuf) -> Self {
		if path == Path::new("-") {
			Self::Stdin
		} else {
			Self::File(path)
		}
	}
}

impl InputPath {
	fn open(&self) -> io::Result<Input> {
		let path = match self {
			Self::Stdin => return Ok(Input::Stdin),
			Self::File(path) => path,
		};
		let file = File::open(path)?;
		// (UN)SAFETY: It is Undefined Behavior to modify a mapped file outside
		// of the process, which the help output tells users not to do. This is
		// not a real safety guarantee.
		match unsafe { memmap2::MmapOptions::new().populate().map(&file) } {
			// Per memmap2 docs, it's safe to drop the file once mmap succeeds.
			Ok(map) => Ok(Input::Mmap(map)),
			// Process substitutions, named pipes, and empty files can't be
			// mapped, but can still be read normally.
			Err(_) => Ok(Input::File(file)),
		}
	}
}

impl fmt::Display for InputPath {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Stdin => f.write_str("standard input"),
			Self::File(path) => write!(f, "{}", path.display()),
		}
	}
}
