//! JSON output in the style of Python's `json.dumps`.

use std::io::{self, Write};

use serde::Serialize;
use serde_json::ser::Formatter;

pub(crate) struct Output<W: Write>(W);

impl<W: Write> Output<W> {
	pub fn new(w: W) -> Output<W> {
		Output(w)
	}

	/// Writes a single value followed by a newline.
	pub fn write_value<S>(&mut self, value: S) -> crate::Result<()>
	where
		S: Serialize,
	{
		let mut ser = serde_json::Serializer::with_formatter(&mut self.0, PythonFormatter);
		value.serialize(&mut ser)?;
		writeln!(&mut self.0)?;
		Ok(())
	}

	pub fn flush(&mut self) -> io::Result<()> {
		self.0.flush()
	}
}

/// Formats JSON like `json.dumps` with its default arguments: `", "` and
/// `": "` as separators, and every character outside of printable ASCII
/// escaped as `\uXXXX`.
pub(crate) struct PythonFormatter;

impl Formatter for PythonFormatter {
	fn begin_array_value<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
	where
		W: ?Sized + Write,
	{
		if first {
			Ok(())
		} else {
			writer.write_all(b", ")
		}
	}

	fn begin_object_key<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
	where
		W: ?Sized + Write,
	{
		if first {
			Ok(())
		} else {
			writer.write_all(b", ")
		}
	}

	fn begin_object_value<W>(&mut self, writer: &mut W) -> io::Result<()>
	where
		W: ?Sized + Write,
	{
		writer.write_all(b": ")
	}

	fn write_string_fragment<W>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()>
	where
		W: ?Sized + Write,
	{
		let mut rest = fragment;
		while let Some(i) = rest.find(|c: char| !matches!(c, ' '..='~')) {
			writer.write_all(&rest.as_bytes()[..i])?;
			let mut chars = rest[i..].chars();
			if let Some(c) = chars.next() {
				let mut units = [0; 2];
				for unit in c.encode_utf16(&mut units) {
					write!(writer, "\\u{unit:04x}")?;
				}
			}
			rest = chars.as_str();
		}
		writer.write_all(rest.as_bytes())
	}
}
