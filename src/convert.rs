//! Conversion of decoded pickle values into JSON.

use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{Map, Number, Value as Json};

use crate::pickle::Value;
use crate::pyrepr::{self, Str};

/// The key of the object that stands in for a byte string that is not valid
/// UTF-8. Its value is the standard Base64 encoding of the bytes.
pub const BYTES_KEY: &str = "__bytes__";

/// Converts a decoded value into JSON.
///
/// Mappings become objects and sequences become arrays, with their contents
/// converted in turn. Strings, numbers, booleans, and `None` are kept as they
/// are. Byte strings become text when they hold valid UTF-8, and a
/// [`BYTES_KEY`] object otherwise. Every other value becomes the string that
/// Python's `str()` would have printed for it.
///
/// Conversion never fails. Floats that JSON can't express (infinities and NaN)
/// become `null`.
pub fn to_json(value: &Value) -> Json {
	match value {
		Value::Dict(pairs) => object(pairs),
		Value::Object(obj) if !obj.dict_items.is_empty() => object(&obj.dict_items),
		Value::List(items) | Value::Tuple(items) => array(items),
		Value::Object(obj) if !obj.list_items.is_empty() => array(&obj.list_items),
		Value::Bytes(b) => match std::str::from_utf8(b) {
			Ok(s) => Json::String(s.to_owned()),
			Err(_) => {
				let mut map = Map::with_capacity(1);
				map.insert(BYTES_KEY.to_owned(), Json::String(BASE64.encode(b)));
				Json::Object(map)
			}
		},
		Value::None => Json::Null,
		Value::Bool(b) => Json::Bool(*b),
		Value::Int(n) => Json::Number((*n).into()),
		Value::BigInt(n) => number(n.as_str()),
		Value::Float(x) if x.is_finite() => number(&pyrepr::float_repr(*x)),
		Value::Float(_) => Json::Null,
		Value::Str(s) => Json::String(s.clone()),
		other => Json::String(Str(other).to_string()),
	}
}

fn object(pairs: &[(Value, Value)]) -> Json {
	let mut map = Map::with_capacity(pairs.len());
	for (k, v) in pairs {
		// Inserting an existing key replaces its value in its original
		// position, like assignment to a Python dict.
		map.insert(key(k), to_json(v));
	}
	Json::Object(map)
}

fn array(items: &[Value]) -> Json {
	Json::Array(items.iter().map(to_json).collect())
}

/// Returns the JSON text of a number that is already formatted as a valid
/// JSON number literal.
fn number(text: &str) -> Json {
	match Number::from_str(text) {
		Ok(n) => Json::Number(n),
		Err(_) => Json::String(text.to_owned()),
	}
}

/// Coerces a mapping key to a string.
///
/// Strings, numbers, booleans, and `None` follow Python's `json.dumps`. Byte
/// strings follow the same text rule as byte string values, falling back to
/// their `repr()`, and any other key becomes its `str()`.
fn key(k: &Value) -> String {
	match k {
		Value::Str(s) => s.clone(),
		Value::Bool(true) => "true".to_owned(),
		Value::Bool(false) => "false".to_owned(),
		Value::None => "null".to_owned(),
		Value::Int(n) => n.to_string(),
		Value::BigInt(n) => n.to_string(),
		Value::Float(x) if x.is_nan() => "NaN".to_owned(),
		Value::Float(x) if x.is_infinite() && *x > 0.0 => "Infinity".to_owned(),
		Value::Float(x) if x.is_infinite() => "-Infinity".to_owned(),
		Value::Float(x) => pyrepr::float_repr(*x),
		Value::Bytes(b) => match std::str::from_utf8(b) {
			Ok(s) => s.to_owned(),
			Err(_) => pyrepr::Repr(k).to_string(),
		},
		other => Str(other).to_string(),
	}
}
