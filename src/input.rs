use std::borrow::Cow;
use std::io::{self, Read};

/// A container for input to [`unpickle`](crate::unpickle).
///
/// The pickle decoder works on a complete slice of input. Slice inputs are
/// decoded in place, while reader inputs are read to the end into a buffer
/// before decoding begins.
pub struct Handle<'i>(Source<'i>);

/// The private container for the original input a [`Handle`] was created from.
enum Source<'i> {
	Slice(&'i [u8]),
	Reader(Box<dyn Read + 'i>),
}

impl<'i> Handle<'i> {
	/// Creates a handle for an input slice, such as a memory-mapped file.
	pub fn from_slice(source: &'i [u8]) -> Handle<'i> {
		Handle(Source::Slice(source))
	}

	/// Creates a handle for an input reader, such as standard input.
	pub fn from_reader<R>(source: R) -> Handle<'i>
	where
		R: Read + 'i,
	{
		Handle(Source::Reader(Box::new(source)))
	}
}

/// Produces the original input as a slice, either by passing through the
/// original slice or fully reading the original reader into a buffer.
impl<'i> TryInto<Cow<'i, [u8]>> for Handle<'i> {
	type Error = io::Error;

	fn try_into(self) -> io::Result<Cow<'i, [u8]>> {
		match self.0 {
			Source::Slice(b) => Ok(Cow::Borrowed(b)),
			Source::Reader(mut r) => {
				let mut buf = Vec::new();
				r.read_to_end(&mut buf)?;
				Ok(Cow::Owned(buf))
			}
		}
	}
}
