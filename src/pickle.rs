//! The Python pickle data format.
//!
//! This is a decoder only. It runs the unpickling machine for protocols 0
//! through 5 without importing or calling anything: references to classes and
//! functions become [`Global`]s, and the objects they would have created
//! become [`Object`]s that remember their constructor arguments and state.

use std::error;
use std::fmt;

mod machine;
pub(crate) mod opcode;
mod resolve;
mod value;

pub use value::{BigInt, Global, Object, Recursive, Value, MAX_STR_DIGITS};

/// The maximum allowed nesting depth of decoded values.
///
/// Python's unpickler is not recursive and accepts any depth, but every
/// consumer of a [`Value`] (including its `Drop` implementation) is. This
/// matches the default recursion limit of the Python interpreter that produced
/// the JSON for this tool's original consumers, so inputs that Python could
/// convert are still accepted.
pub(crate) const DEPTH_LIMIT: usize = 1024;

/// Decodes a single pickled value from the start of the input.
///
/// Any data after the pickle's STOP opcode is ignored, as in Python's
/// `pickle.loads`.
pub fn from_slice(input: &[u8]) -> Result<Value, Error> {
	let (root, memo) = machine::Machine::new(input).run()?;
	resolve::resolve(&root, &memo)
}

/// An error produced while decoding a pickle.
///
/// Messages match the wording of CPython's unpickler where one exists, and
/// [`Error::category`] names the Python exception class that CPython would
/// raise for the same input.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
	/// The input ended where an opcode was expected.
	Eof,
	/// The input ended in the middle of an opcode's argument.
	Truncated,
	/// The input contained an unknown opcode.
	InvalidOpcode(u8),
	/// The PROTO opcode named a protocol newer than the decoder supports.
	UnsupportedProtocol(u8),
	/// An opcode needed more values than were on the stack.
	StackUnderflow,
	/// An opcode reached past a MARK for one of its values.
	UnexpectedMark,
	/// An opcode that consumes a MARK found none.
	MarkNotFound,
	/// A memo lookup referred to an index that was never stored.
	MemoNotFound(u64),
	/// A text memo opcode named an index too large for Python's memo.
	MemoIndexOverflow,
	/// A text opcode held a number that could not be parsed.
	InvalidLiteral(&'static str),
	/// An integer had more decimal digits than Python will convert to or
	/// from text, with the digit count when Python reports it.
	IntTooLarge(Option<usize>),
	/// A STRING opcode argument was not enclosed in matching quotes.
	UnquotedString,
	/// Text data could not be decoded with the given codec.
	Decode {
		codec: &'static str,
		byte: u8,
		position: usize,
		reason: &'static str,
	},
	/// The input used a persistent ID, which requires a Python callback.
	PersistentId,
	/// The input used the extension registry, which this decoder lacks.
	Extension(u32),
	/// The input referred to an out-of-band buffer.
	OutOfBandBuffer,
	/// An opcode was applied to a value of the wrong kind.
	Malformed(&'static str),
	/// The maximum allowed nesting depth of values was exceeded.
	DepthLimitExceeded,
}

impl Error {
	/// Returns the name of the Python exception class CPython's unpickler
	/// raises for this error.
	pub fn category(&self) -> &'static str {
		match self {
			Error::Eof => "EOFError",
			Error::UnsupportedProtocol(_)
			| Error::InvalidLiteral(_)
			| Error::IntTooLarge(_)
			| Error::Extension(_) => "ValueError",
			Error::Decode { .. } => "UnicodeDecodeError",
			Error::DepthLimitExceeded => "RecursionError",
			Error::MemoIndexOverflow => "OverflowError",
			_ => "UnpicklingError",
		}
	}

	pub(crate) fn decode_utf8(input: &[u8], err: std::str::Utf8Error) -> Error {
		let position = err.valid_up_to();
		let byte = input.get(position).copied().unwrap_or(0);
		let reason = match err.error_len() {
			None => "unexpected end of data",
			Some(_) if (0x80..0xc2).contains(&byte) || byte >= 0xf5 => "invalid start byte",
			Some(_) => "invalid continuation byte",
		};
		Error::Decode {
			codec: "utf-8",
			byte,
			position,
			reason,
		}
	}
}

impl error::Error for Error {}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Error::Eof => f.write_str("Ran out of input"),
			Error::Truncated => f.write_str("pickle data was truncated"),
			Error::InvalidOpcode(op) => match char::from(*op) {
				c if c.is_ascii_graphic() || c == ' ' => write!(f, "invalid load key, '{c}'."),
				_ => write!(f, "invalid load key, '\\x{op:02x}'."),
			},
			Error::UnsupportedProtocol(proto) => write!(f, "unsupported pickle protocol: {proto}"),
			Error::StackUnderflow => f.write_str("unpickling stack underflow"),
			Error::UnexpectedMark => f.write_str("unexpected MARK found"),
			Error::MarkNotFound => f.write_str("could not find MARK"),
			Error::MemoNotFound(idx) => write!(f, "Memo value not found at index {idx}"),
			Error::MemoIndexOverflow => f.write_str("Python int too large to convert to C ssize_t"),
			Error::InvalidLiteral(msg) => f.write_str(msg),
			Error::IntTooLarge(digits) => {
				write!(f, "Exceeds the limit ({MAX_STR_DIGITS} digits) for integer string conversion")?;
				if let Some(digits) = digits {
					write!(f, ": value has {digits} digits")?;
				}
				f.write_str("; use sys.set_int_max_str_digits() to increase the limit")
			}
			Error::UnquotedString => f.write_str("the STRING opcode argument must be quoted"),
			Error::Decode {
				codec,
				byte,
				position,
				reason,
			} => write!(
				f,
				"'{codec}' codec can't decode byte 0x{byte:02x} in position {position}: {reason}"
			),
			Error::PersistentId => f.write_str(
				"A load persistent id instruction was encountered, \
				but no persistent_load function was specified.",
			),
			Error::Extension(code) => write!(f, "unregistered extension code {code}"),
			Error::OutOfBandBuffer => f.write_str(
				"pickle stream refers to out-of-band data but no *buffers* argument was given",
			),
			Error::Malformed(msg) => f.write_str(msg),
			Error::DepthLimitExceeded => f.write_str("maximum recursion depth exceeded"),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use hex_literal::hex;

	#[test]
	fn error_messages_match_python() {
		assert_eq!(from_slice(b"").unwrap_err().to_string(), "Ran out of input");
		assert_eq!(
			from_slice(&hex!("80 06 4e 2e")).unwrap_err().to_string(),
			"unsupported pickle protocol: 6"
		);
		assert_eq!(
			from_slice(&hex!("ff")).unwrap_err().to_string(),
			"invalid load key, '\\xff'."
		);
		assert_eq!(
			from_slice(b"(K\x01a.").unwrap_err().to_string(),
			"unexpected MARK found"
		);
		assert_eq!(
			from_slice(b"h\x05.").unwrap_err().to_string(),
			"Memo value not found at index 5"
		);
		assert_eq!(
			from_slice(&hex!("80 03 58 02 00 00 00 ff fe 2e"))
				.unwrap_err()
				.to_string(),
			"'utf-8' codec can't decode byte 0xff in position 0: invalid start byte"
		);
	}

	#[test]
	fn error_categories() {
		assert_eq!(from_slice(b"").unwrap_err().category(), "EOFError");
		assert_eq!(from_slice(b"\x80").unwrap_err().category(), "UnpicklingError");
		assert_eq!(from_slice(b"I12x\n.").unwrap_err().category(), "ValueError");
		assert_eq!(from_slice(b"\x82\x05.").unwrap_err().category(), "ValueError");
		assert_eq!(Error::DepthLimitExceeded.category(), "RecursionError");
		assert_eq!(Error::IntTooLarge(None).category(), "ValueError");
	}

	#[test]
	fn dup_refers_to_the_same_list() {
		let value = from_slice(b"\x80\x04]2a.").unwrap();
		assert_eq!(value, Value::List(vec![Value::Recursive(Recursive::List)]));
		assert_eq!(crate::pyrepr::Repr(&value).to_string(), "[[...]]");

		// Repeated DUPs still build a single list.
		let mut input = b"\x80\x04]".to_vec();
		input.extend([b'2'; 40]);
		input.extend([b'a'; 40]);
		input.push(b'.');
		let Value::List(items) = from_slice(&input).unwrap() else {
			panic!("expected a list");
		};
		assert_eq!(items, vec![Value::Recursive(Recursive::List); 40]);
	}

	#[test]
	fn long_text_digits_are_limited() {
		let input = format!("L{}L\n.", "1".repeat(MAX_STR_DIGITS + 700));
		assert_eq!(
			from_slice(input.as_bytes()).unwrap_err().to_string(),
			"Exceeds the limit (4300 digits) for integer string conversion: \
			value has 5000 digits; use sys.set_int_max_str_digits() to increase the limit"
		);

		let input = format!("I{}\n.", "1".repeat(MAX_STR_DIGITS + 1));
		assert_eq!(
			from_slice(input.as_bytes()).unwrap_err(),
			Error::InvalidLiteral("could not convert string to int")
		);

		let input = format!("L-{}L\n.", "1".repeat(MAX_STR_DIGITS));
		assert!(matches!(from_slice(input.as_bytes()), Ok(Value::BigInt(_))));
	}
}
