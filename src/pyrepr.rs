//! Python's printed forms of decoded values.
//!
//! [`Str`] and [`Repr`] format a [`Value`] the way Python's `str()` and
//! `repr()` would format the object it was pickled from. Builtin types are
//! exact. Objects from a handful of standard library modules (`datetime`,
//! `decimal`, `uuid`, and exceptions) are rendered from their pickled state.
//! Any other object is shown as a call to its class with its constructor
//! arguments and attributes, since there is no way to run its `__str__`.

use std::fmt::{self, Display, Formatter, Write};

use crate::pickle::{Global, Object, Recursive, Value};

mod datetime;

/// Formats a value like Python's `str()`.
pub struct Str<'a>(pub &'a Value);

/// Formats a value like Python's `repr()`.
pub struct Repr<'a>(pub &'a Value);

impl Display for Str<'_> {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		match self.0 {
			Value::Str(s) => f.write_str(s),
			Value::Object(obj) => write_object(f, obj, Form::Str),
			value => Repr(value).fmt(f),
		}
	}
}

impl Display for Repr<'_> {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		match self.0 {
			Value::None => f.write_str("None"),
			Value::Bool(true) => f.write_str("True"),
			Value::Bool(false) => f.write_str("False"),
			Value::Int(n) => write!(f, "{n}"),
			Value::BigInt(n) => write!(f, "{n}"),
			Value::Float(x) => f.write_str(&float_repr(*x)),
			Value::Str(s) => write_str_literal(f, s),
			Value::Bytes(b) => write_bytes_literal(f, b),
			Value::ByteArray(b) => {
				f.write_str("bytearray(")?;
				write_bytes_literal(f, b)?;
				f.write_char(')')
			}
			Value::List(items) => write_seq(f, "[", items, "]"),
			Value::Tuple(items) => write_tuple(f, items),
			Value::Dict(pairs) => write_dict(f, pairs),
			Value::Set(items) if items.is_empty() => f.write_str("set()"),
			Value::Set(items) => write_seq(f, "{", items, "}"),
			Value::FrozenSet(items) if items.is_empty() => f.write_str("frozenset()"),
			Value::FrozenSet(items) => write_seq(f, "frozenset({", items, "})"),
			Value::Global(g) => write!(f, "<class '{g}'>"),
			Value::Object(obj) => write_object(f, obj, Form::Repr),
			Value::Recursive(Recursive::List) => f.write_str("[...]"),
			Value::Recursive(Recursive::Dict | Recursive::Set) => f.write_str("{...}"),
			Value::Recursive(Recursive::Other) => f.write_str("..."),
		}
	}
}

/// Returns Python's `repr()` of a float.
///
/// Python prints the shortest string that round-trips to the same float, using
/// scientific notation when the decimal exponent is below -4 or above 15, and
/// always including a decimal point or exponent.
pub fn float_repr(x: f64) -> String {
	float_text(x, true)
}

fn float_text(x: f64, add_dot_zero: bool) -> String {
	if x.is_nan() {
		return "nan".into();
	}
	if x.is_infinite() {
		return if x > 0.0 { "inf".into() } else { "-inf".into() };
	}

	let mut out = String::new();
	if x.is_sign_negative() {
		out.push('-');
	}
	if x == 0.0 {
		out.push_str(if add_dot_zero { "0.0" } else { "0" });
		return out;
	}

	// Rust's exponential form gives the same shortest round-trip digits as
	// Python's repr, e.g. "1.2345e3".
	let sci = format!("{:e}", x.abs());
	let (mantissa, exp) = sci.split_once('e').unwrap_or((sci.as_str(), "0"));
	let exp: i32 = exp.parse().unwrap_or(0);
	let digits: String = mantissa.chars().filter(|c| *c != '.').collect();
	let decpt = exp + 1;

	if -4 < decpt && decpt <= 16 {
		let ndigits = i32::try_from(digits.len()).unwrap_or(i32::MAX);
		if decpt <= 0 {
			out.push_str("0.");
			out.extend(std::iter::repeat('0').take(decpt.unsigned_abs() as usize));
			out.push_str(&digits);
		} else if decpt >= ndigits {
			out.push_str(&digits);
			out.extend(std::iter::repeat('0').take((decpt - ndigits).unsigned_abs() as usize));
			if add_dot_zero {
				out.push_str(".0");
			}
		} else {
			let (int, frac) = digits.split_at(decpt.unsigned_abs() as usize);
			out.push_str(int);
			out.push('.');
			out.push_str(frac);
		}
	} else {
		let (first, rest) = digits.split_at(1);
		out.push_str(first);
		if !rest.is_empty() {
			out.push('.');
			out.push_str(rest);
		}
		let sign = if exp < 0 { '-' } else { '+' };
		let _ = write!(out, "e{sign}{:02}", exp.unsigned_abs());
	}
	out
}

fn write_str_literal(f: &mut Formatter<'_>, s: &str) -> fmt::Result {
	let quote = if s.contains('\'') && !s.contains('"') {
		'"'
	} else {
		'\''
	};
	f.write_char(quote)?;
	for c in s.chars() {
		match c {
			'\\' => f.write_str("\\\\")?,
			'\t' => f.write_str("\\t")?,
			'\n' => f.write_str("\\n")?,
			'\r' => f.write_str("\\r")?,
			c if c == quote => write!(f, "\\{c}")?,
			' '..='~' => f.write_char(c)?,
			c if is_printable(c) => f.write_char(c)?,
			c => match u32::from(c) {
				n @ 0..=0xff => write!(f, "\\x{n:02x}")?,
				n @ 0x100..=0xffff => write!(f, "\\u{n:04x}")?,
				n => write!(f, "\\U{n:08x}")?,
			},
		}
	}
	f.write_char(quote)
}

/// Approximates Python's `str.isprintable()` for a single non-ASCII character.
fn is_printable(c: char) -> bool {
	!(c.is_control()
		|| (c.is_whitespace() && c != ' ')
		|| matches!(c,
			'\u{ad}'
			| '\u{200b}'..='\u{200f}'
			| '\u{2060}'..='\u{2064}'
			| '\u{feff}'
			| '\u{e000}'..='\u{f8ff}'))
}

pub(crate) fn write_bytes_literal<W: Write>(f: &mut W, b: &[u8]) -> fmt::Result {
	let quote = if b.contains(&b'\'') && !b.contains(&b'"') {
		b'"'
	} else {
		b'\''
	};
	f.write_char('b')?;
	f.write_char(char::from(quote))?;
	for &byte in b {
		match byte {
			b'\\' => f.write_str("\\\\")?,
			b'\t' => f.write_str("\\t")?,
			b'\n' => f.write_str("\\n")?,
			b'\r' => f.write_str("\\r")?,
			q if q == quote => write!(f, "\\{}", char::from(q))?,
			b' '..=b'~' => f.write_char(char::from(byte))?,
			_ => write!(f, "\\x{byte:02x}")?,
		}
	}
	f.write_char(char::from(quote))
}

fn write_seq(f: &mut Formatter<'_>, open: &str, items: &[Value], close: &str) -> fmt::Result {
	f.write_str(open)?;
	write_items(f, items)?;
	f.write_str(close)
}

fn write_items(f: &mut Formatter<'_>, items: &[Value]) -> fmt::Result {
	for (i, item) in items.iter().enumerate() {
		if i > 0 {
			f.write_str(", ")?;
		}
		Repr(item).fmt(f)?;
	}
	Ok(())
}

fn write_tuple(f: &mut Formatter<'_>, items: &[Value]) -> fmt::Result {
	match items {
		[item] => write!(f, "({},)", Repr(item)),
		items => write_seq(f, "(", items, ")"),
	}
}

fn write_dict(f: &mut Formatter<'_>, pairs: &[(Value, Value)]) -> fmt::Result {
	f.write_char('{')?;
	for (i, (k, v)) in pairs.iter().enumerate() {
		if i > 0 {
			f.write_str(", ")?;
		}
		write!(f, "{}: {}", Repr(k), Repr(v))?;
	}
	f.write_char('}')
}

#[derive(Copy, Clone, PartialEq, Eq)]
enum Form {
	Str,
	Repr,
}

fn write_object(f: &mut Formatter<'_>, obj: &Object, form: Form) -> fmt::Result {
	if let Some(global) = obj.global() {
		if datetime::write(f, global, obj, form)? {
			return Ok(());
		}
		if write_known(f, global, obj, form)? {
			return Ok(());
		}
	}

	// Instances of dict and list subclasses print as their contents.
	if !obj.dict_items.is_empty() && obj.list_items.is_empty() {
		return write_dict(f, &obj.dict_items);
	}
	if !obj.list_items.is_empty() && obj.dict_items.is_empty() {
		return write_seq(f, "[", &obj.list_items, "]");
	}

	write_call(f, obj)
}

/// Writes objects of recognized standard library classes, returning false if
/// the object is not one of them.
fn write_known(f: &mut Formatter<'_>, global: &Global, obj: &Object, form: Form) -> Result<bool, fmt::Error> {
	match (global.module.as_str(), global.name.as_str(), obj.args.as_slice()) {
		("decimal", "Decimal", [Value::Str(s)]) => {
			match form {
				Form::Str => f.write_str(s)?,
				Form::Repr => write!(f, "Decimal('{s}')")?,
			}
			Ok(true)
		}
		("uuid", "UUID", _) => {
			let int = match obj.field("int") {
				Some(Value::Int(n)) => u128::try_from(*n).ok(),
				Some(Value::BigInt(n)) => n.to_u128(),
				_ => None,
			};
			let Some(int) = int else {
				return Ok(false);
			};
			let hex = format!("{int:032x}");
			let text = format!(
				"{}-{}-{}-{}-{}",
				&hex[..8],
				&hex[8..12],
				&hex[12..16],
				&hex[16..20],
				&hex[20..]
			);
			match form {
				Form::Str => f.write_str(&text)?,
				Form::Repr => write!(f, "UUID('{text}')")?,
			}
			Ok(true)
		}
		("builtins", "complex", [re, im]) => {
			let (Some(re), Some(im)) = (as_float(re), as_float(im)) else {
				return Ok(false);
			};
			write_complex(f, re, im)?;
			Ok(true)
		}
		(_, name, args) if is_exception_name(name) => {
			match form {
				Form::Str => write_exception_str(f, global, args)?,
				Form::Repr => {
					write!(f, "{}(", global.name)?;
					write_items(f, args)?;
					f.write_char(')')?;
				}
			}
			Ok(true)
		}
		_ => Ok(false),
	}
}

fn as_float(value: &Value) -> Option<f64> {
	match value {
		Value::Float(x) => Some(*x),
		Value::Int(n) => i32::try_from(*n).ok().map(f64::from),
		_ => None,
	}
}

fn write_complex(f: &mut Formatter<'_>, re: f64, im: f64) -> fmt::Result {
	if re == 0.0 && re.is_sign_positive() {
		return write!(f, "{}j", float_text(im, false));
	}
	let im_text = float_text(im, false);
	let sign = if im_text.starts_with('-') { "" } else { "+" };
	write!(f, "({}{sign}{im_text}j)", float_text(re, false))
}

fn is_exception_name(name: &str) -> bool {
	name.ends_with("Error")
		|| name.ends_with("Exception")
		|| name.ends_with("Warning")
		|| matches!(
			name,
			"BaseException"
				| "KeyboardInterrupt"
				| "SystemExit"
				| "GeneratorExit"
				| "StopIteration"
				| "StopAsyncIteration"
		)
}

/// Writes an exception the way `BaseException.__str__` and its builtin
/// overrides do.
fn write_exception_str(f: &mut Formatter<'_>, global: &Global, args: &[Value]) -> fmt::Result {
	let builtin = global.module == "builtins";
	match args {
		[] => Ok(()),
		[arg] if builtin && global.name == "KeyError" => Repr(arg).fmt(f),
		[arg] => Str(arg).fmt(f),
		[Value::Int(errno), strerror, rest @ ..] if builtin && is_os_error(&global.name) => {
			write!(f, "[Errno {errno}] {}", Str(strerror))?;
			match rest {
				[filename, ..] => write!(f, ": {}", Repr(filename)),
				[] => Ok(()),
			}
		}
		args => write_tuple(f, args),
	}
}

fn is_os_error(name: &str) -> bool {
	matches!(
		name,
		"OSError"
			| "IOError"
			| "EnvironmentError"
			| "BlockingIOError"
			| "BrokenPipeError"
			| "ChildProcessError"
			| "ConnectionError"
			| "ConnectionAbortedError"
			| "ConnectionRefusedError"
			| "ConnectionResetError"
			| "FileExistsError"
			| "FileNotFoundError"
			| "InterruptedError"
			| "IsADirectoryError"
			| "NotADirectoryError"
			| "PermissionError"
			| "ProcessLookupError"
			| "TimeoutError"
	)
}

/// Writes an arbitrary object as a call to its class with its positional
/// arguments, keyword arguments, and attributes.
fn write_call(f: &mut Formatter<'_>, obj: &Object) -> fmt::Result {
	match &obj.class {
		Value::Global(g) => write!(f, "{g}(")?,
		class => write!(f, "{}(", Repr(class))?,
	}

	let mut first = true;
	let mut sep = |f: &mut Formatter<'_>| {
		if std::mem::take(&mut first) {
			Ok(())
		} else {
			f.write_str(", ")
		}
	};

	for arg in &obj.args {
		sep(f)?;
		Repr(arg).fmt(f)?;
	}
	for (k, v) in &obj.kwargs {
		sep(f)?;
		write!(f, "{}={}", Str(k), Repr(v))?;
	}

	let attrs: &[Value] = match &obj.state {
		None => &[][..],
		Some(state @ Value::Tuple(parts)) => match parts.as_slice() {
			[Value::Dict(_) | Value::None, Value::Dict(_) | Value::None] => parts.as_slice(),
			_ => std::slice::from_ref(state),
		},
		Some(state) => std::slice::from_ref(state),
	};
	for attr in attrs {
		match attr {
			Value::None => {}
			Value::Dict(pairs) => {
				for (k, v) in pairs {
					sep(f)?;
					write!(f, "{}={}", Str(k), Repr(v))?;
				}
			}
			other => {
				sep(f)?;
				Repr(other).fmt(f)?;
			}
		}
	}

	f.write_char(')')
}

#[cfg(test)]
mod tests {
	use super::*;

	fn object(module: &str, name: &str, args: Vec<Value>) -> Value {
		Value::Object(Box::new(Object::new(
			Value::Global(Global::new(module, name)),
			args,
		)))
	}

	#[test]
	fn float_repr_matches_python() {
		let cases: &[(f64, &str)] = &[
			(0.0, "0.0"),
			(-0.0, "-0.0"),
			(1.0, "1.0"),
			(0.1, "0.1"),
			(123.456, "123.456"),
			(1e15, "1000000000000000.0"),
			(1e16, "1e+16"),
			(1.5e300, "1.5e+300"),
			(0.0001, "0.0001"),
			(0.00001, "1e-05"),
			(-2.5e-7, "-2.5e-07"),
			(f64::INFINITY, "inf"),
			(f64::NEG_INFINITY, "-inf"),
			(f64::NAN, "nan"),
			(5e-324, "5e-324"),
		];
		for (x, want) in cases {
			assert_eq!(float_repr(*x), *want, "repr of {x:?}");
		}
	}

	#[test]
	fn str_literal_quoting() {
		let repr = |s: &str| Repr(&Value::Str(s.into())).to_string();
		assert_eq!(repr("abc"), "'abc'");
		assert_eq!(repr("it's"), "\"it's\"");
		assert_eq!(repr("'\""), "'\\'\"'");
		assert_eq!(repr("a\nb\\"), "'a\\nb\\\\'");
		assert_eq!(repr("café\u{7f}\u{200b}😀"), "'café\\x7f\\u200b😀'");
	}

	#[test]
	fn bytes_literal() {
		let repr = |b: &[u8]| Repr(&Value::Bytes(b.to_vec())).to_string();
		assert_eq!(repr(b"abc"), "b'abc'");
		assert_eq!(repr(b"\xff\x00'"), "b\"\\xff\\x00'\"");
		assert_eq!(
			Repr(&Value::ByteArray(b"x".to_vec())).to_string(),
			"bytearray(b'x')"
		);
	}

	#[test]
	fn containers() {
		let value = Value::List(vec![
			Value::Tuple(vec![Value::Int(1)]),
			Value::Tuple(vec![]),
			Value::Set(vec![]),
			Value::FrozenSet(vec![Value::Int(2), Value::Int(3)]),
			Value::Dict(vec![(Value::Str("k".into()), Value::None)]),
			Value::Bool(true),
		]);
		assert_eq!(
			Str(&value).to_string(),
			"[(1,), (), set(), frozenset({2, 3}), {'k': None}, True]"
		);
		assert_eq!(Str(&Value::Str("plain".into())).to_string(), "plain");
	}

	#[test]
	fn exceptions() {
		let err = object("builtins", "ValueError", vec![Value::Str("bad value".into())]);
		assert_eq!(Str(&err).to_string(), "bad value");
		assert_eq!(Repr(&err).to_string(), "ValueError('bad value')");

		let err = object("builtins", "KeyError", vec![Value::Str("job".into())]);
		assert_eq!(Str(&err).to_string(), "'job'");

		let err = object("builtins", "TimeoutError", vec![]);
		assert_eq!(Str(&err).to_string(), "");

		let err = object(
			"builtins",
			"FileNotFoundError",
			vec![
				Value::Int(2),
				Value::Str("No such file or directory".into()),
				Value::Str("x.txt".into()),
			],
		);
		assert_eq!(
			Str(&err).to_string(),
			"[Errno 2] No such file or directory: 'x.txt'"
		);

		let err = object(
			"app.jobs",
			"RetryJobException",
			vec![Value::Str("a".into()), Value::Int(1)],
		);
		assert_eq!(Str(&err).to_string(), "('a', 1)");
	}

	#[test]
	fn known_objects() {
		let dec = object("decimal", "Decimal", vec![Value::Str("1.50".into())]);
		assert_eq!(Str(&dec).to_string(), "1.50");
		assert_eq!(Repr(&dec).to_string(), "Decimal('1.50')");

		let mut uuid = Object::new(Value::Global(Global::new("uuid", "UUID")), vec![]);
		uuid.state = Some(Value::Dict(vec![(
			Value::Str("int".into()),
			Value::Int(0x1234),
		)]));
		assert_eq!(
			Str(&Value::Object(Box::new(uuid))).to_string(),
			"00000000-0000-0000-0000-000000001234"
		);

		let c = object("builtins", "complex", vec![Value::Float(1.0), Value::Float(-2.0)]);
		assert_eq!(Str(&c).to_string(), "(1-2j)");
		let c = object("builtins", "complex", vec![Value::Float(0.0), Value::Float(2.5)]);
		assert_eq!(Str(&c).to_string(), "2.5j");
	}

	#[test]
	fn generic_objects() {
		let mut obj = Object::new(
			Value::Global(Global::new("app.models", "User")),
			vec![Value::Int(7)],
		);
		obj.state = Some(Value::Dict(vec![(
			Value::Str("name".into()),
			Value::Str("ada".into()),
		)]));
		assert_eq!(
			Str(&Value::Object(Box::new(obj))).to_string(),
			"app.models.User(7, name='ada')"
		);
		assert_eq!(
			Str(&Value::Global(Global::new("app.tasks", "Job"))).to_string(),
			"<class 'app.tasks.Job'>"
		);
	}
}
