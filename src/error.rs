use std::error;
use std::io;
use std::result;

use crate::pickle;

/// The result produced by decoding and conversion.
pub type Result<T> = result::Result<T, Error>;

/// An error produced during decoding or conversion.
pub type Error = Box<dyn error::Error>;

/// Returns a label for the kind of an error, named after the Python exception
/// class that would describe it.
///
/// The label comes from the first error in the source chain that has a known
/// kind: decoder errors carry their own category, I/O errors are `OSError`,
/// JSON output errors are `ValueError`, and command line errors are
/// `UsageError`. Errors of any other kind are labeled `Error`.
pub fn category(err: &(dyn error::Error + 'static)) -> &'static str {
	let mut next = Some(err);
	while let Some(err) = next {
		if let Some(err) = err.downcast_ref::<pickle::Error>() {
			return err.category();
		}
		if err.is::<io::Error>() {
			return "OSError";
		}
		if err.is::<serde_json::Error>() {
			return "ValueError";
		}
		if err.is::<lexopt::Error>() {
			return "UsageError";
		}
		next = err.source();
	}
	"Error"
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn categories_follow_the_source_chain() {
		let err: Error = Box::new(pickle::Error::Eof);
		assert_eq!(category(err.as_ref()), "EOFError");

		let err: Error = Box::new(io::Error::new(io::ErrorKind::Other, pickle::Error::Truncated));
		assert_eq!(category(err.as_ref()), "OSError");

		let err: Error = Box::new(lexopt::Error::from("bad flag"));
		assert_eq!(category(err.as_ref()), "UsageError");

		let err: Error = "something else".into();
		assert_eq!(category(err.as_ref()), "Error");
	}
}
