//! Decode Python pickle data into JSON.
//!
//! The decoder in [`pickle`] reads a pickle without running any Python code,
//! [`convert`] turns the decoded value into JSON, and [`pyrepr`] supplies the
//! printed forms of values that JSON has no equivalent for. The functions at
//! the top level of the crate chain these steps together and write JSON text
//! in the same format as Python's `json.dumps`.

use std::borrow::Cow;
use std::io::{Read, Write};

pub mod convert;
mod error;
mod input;
mod json;
pub mod pickle;
pub mod pyrepr;

pub use error::{category, Error, Result};
pub use input::Handle;

/// Decodes a pickle from a slice and writes its JSON form to the output.
pub fn unpickle_slice<W>(input: &[u8], output: W) -> Result<()>
where
	W: Write,
{
	unpickle(Handle::from_slice(input), output)
}

/// Decodes a pickle from a reader and writes its JSON form to the output.
///
/// The reader is read to its end before decoding begins.
pub fn unpickle_reader<R, W>(input: R, output: W) -> Result<()>
where
	R: Read,
	W: Write,
{
	unpickle(Handle::from_reader(input), output)
}

/// Decodes a pickle from the provided input and writes its JSON form to the
/// output, followed by a newline.
///
/// Nothing is written to the output unless decoding succeeds. Data after the
/// end of the pickle is ignored.
pub fn unpickle<W>(input: Handle, output: W) -> Result<()>
where
	W: Write,
{
	let input: Cow<[u8]> = input.try_into()?;
	tracing::debug!(len = input.len(), "read input");

	let value = pickle::from_slice(&input)?;
	let json = convert::to_json(&value);

	let mut output = json::Output::new(output);
	output.write_value(&json)?;
	output.flush()?;
	tracing::debug!("wrote JSON output");
	Ok(())
}

/// Writes the one-line JSON object that reports a failure, in the form
/// `{"error": <message>, "type": <category>}`.
///
/// See [`category`] for the labels used to describe errors.
pub fn write_error<W>(output: W, message: &str, category: &str) -> Result<()>
where
	W: Write,
{
	let mut output = json::Output::new(output);
	output.write_value(serde_json::json!({"error": message, "type": category}))?;
	output.flush()?;
	Ok(())
}
