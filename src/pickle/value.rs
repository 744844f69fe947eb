//! The decoded form of a pickle.

use std::fmt;

/// A value decoded from a pickle stream.
///
/// `Value` models the Python objects a pickle can describe without running any
/// Python code. Builtin types that the unpickler reconstructs on its own (sets,
/// byte strings, dict subclasses like `OrderedDict`, and so on) appear as their
/// natural variants. Instances of any other class appear as [`Object`]s that
/// record how the unpickler would have built them.
///
/// Dictionaries are represented as `Vec`s of key-value pairs, which preserves
/// the insertion order Python guarantees and permits keys of any type.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
	None,
	Bool(bool),
	Int(i64),
	BigInt(BigInt),
	Float(f64),
	Str(String),
	Bytes(Vec<u8>),
	ByteArray(Vec<u8>),
	List(Vec<Value>),
	Tuple(Vec<Value>),
	Dict(Vec<(Value, Value)>),
	Set(Vec<Value>),
	FrozenSet(Vec<Value>),
	Global(Global),
	Object(Box<Object>),
	Recursive(Recursive),
}

/// A reference to a module-level attribute, like a class or function.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Global {
	pub module: String,
	pub name: String,
}

impl Global {
	pub fn new(module: impl Into<String>, name: impl Into<String>) -> Global {
		Global {
			module: module.into(),
			name: name.into(),
		}
	}

	/// Returns true if this global refers to `module.name`.
	pub fn is(&self, module: &str, name: &str) -> bool {
		self.module == module && self.name == name
	}
}

impl fmt::Display for Global {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}.{}", self.module, self.name)
	}
}

/// An instance created by calling a class or other callable while unpickling.
///
/// An `Object` captures every input the unpickler would have used to build the
/// instance: the callable and its arguments, the state passed to
/// `__setstate__`, and any list or dict items appended to it afterward. The
/// latter only appear for subclasses of `list` and `dict`.
#[derive(Clone, Debug, PartialEq)]
pub struct Object {
	pub class: Value,
	pub args: Vec<Value>,
	pub kwargs: Vec<(Value, Value)>,
	pub state: Option<Value>,
	pub list_items: Vec<Value>,
	pub dict_items: Vec<(Value, Value)>,
}

impl Object {
	pub fn new(class: Value, args: Vec<Value>) -> Object {
		Object {
			class,
			args,
			kwargs: Vec::new(),
			state: None,
			list_items: Vec::new(),
			dict_items: Vec::new(),
		}
	}

	/// Returns the class of the object when it is a plain global reference.
	pub fn global(&self) -> Option<&Global> {
		match &self.class {
			Value::Global(g) => Some(g),
			_ => None,
		}
	}

	/// Returns the value of a field in the object's state, if the state is a
	/// dict (or a `(dict, slots)` pair) containing the field.
	pub fn field(&self, name: &str) -> Option<&Value> {
		let dict = match &self.state {
			Some(Value::Dict(d)) => d,
			Some(Value::Tuple(t)) => match t.first() {
				Some(Value::Dict(d)) => d,
				_ => return None,
			},
			_ => return None,
		};
		dict.iter().find_map(|(k, v)| match k {
			Value::Str(k) if k == name => Some(v),
			_ => None,
		})
	}
}

/// The kind of container referenced by a [`Value::Recursive`] back-reference.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Recursive {
	List,
	Dict,
	Set,
	Other,
}

/// The most decimal digits that Python converts an `int` to or from text, the
/// default of `sys.get_int_max_str_digits()`.
pub const MAX_STR_DIGITS: usize = 4300;

/// A Python `int` too large to fit in an `i64`.
///
/// The value is stored as its canonical decimal representation: an optional
/// minus sign followed by digits with no leading zeros.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BigInt(String);

impl BigInt {
	/// Creates a `BigInt` from a little-endian two's complement byte string,
	/// as used by the LONG1 and LONG4 opcodes.
	pub fn from_le_bytes(bytes: &[u8]) -> BigInt {
		let negative = bytes.last().is_some_and(|b| b & 0x80 != 0);

		let mut limbs = limbs_from_le_chunks(bytes, negative);
		if negative {
			negate(&mut limbs);
		}

		let mut digits = Vec::new();
		while limbs.iter().any(|&l| l != 0) {
			let mut rem: u64 = 0;
			for limb in limbs.iter_mut() {
				let cur = (rem << 32) | u64::from(*limb);
				*limb = u32::try_from(cur / 1_000_000_000).unwrap_or(u32::MAX);
				rem = cur % 1_000_000_000;
			}
			digits.push(rem);
		}

		let mut text = String::new();
		if negative {
			text.push('-');
		}
		match digits.split_last() {
			None => text.push('0'),
			Some((most, rest)) => {
				text.push_str(&most.to_string());
				for chunk in rest.iter().rev() {
					text.push_str(&format!("{chunk:09}"));
				}
			}
		}
		BigInt(text)
	}

	/// Creates a `BigInt` from decimal text, like the argument of the LONG
	/// opcode. Returns `None` if the text is not a valid decimal integer.
	pub fn parse(text: &str) -> Option<BigInt> {
		let (negative, digits) = match text.strip_prefix('-') {
			Some(rest) => (true, rest),
			None => (false, text.strip_prefix('+').unwrap_or(text)),
		};
		if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
			return None;
		}
		let digits = digits.trim_start_matches('0');
		if digits.is_empty() {
			return Some(BigInt("0".into()));
		}
		Some(BigInt(if negative {
			format!("-{digits}")
		} else {
			digits.to_owned()
		}))
	}

	/// Returns the value as a `u128`, if it is non-negative and fits.
	pub fn to_u128(&self) -> Option<u128> {
		self.0.parse().ok()
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	/// Returns the number of decimal digits in the value, not counting its
	/// sign.
	pub fn digits(&self) -> usize {
		self.0.trim_start_matches('-').len()
	}
}

/// Splits a little-endian byte string into base 2^32 limbs, most significant
/// first, sign-extending the final partial limb.
fn limbs_from_le_chunks(bytes: &[u8], negative: bool) -> Vec<u32> {
	let fill = if negative { 0xff } else { 0 };
	let mut limbs: Vec<u32> = bytes
		.chunks(4)
		.map(|chunk| {
			let mut word = [fill; 4];
			word[..chunk.len()].copy_from_slice(chunk);
			u32::from_le_bytes(word)
		})
		.collect();
	limbs.reverse();
	limbs
}

/// Negates a two's complement number stored in big-endian limbs.
fn negate(limbs: &mut [u32]) {
	let mut carry = true;
	for limb in limbs.iter_mut().rev() {
		let (sum, overflow) = (!*limb).overflowing_add(u32::from(carry));
		*limb = sum;
		carry = overflow;
	}
}

impl fmt::Display for BigInt {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}
