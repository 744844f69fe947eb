//! Printed forms of the `datetime` module's types.
//!
//! `date`, `time`, and `datetime` pickle their fields as a packed byte string;
//! `timedelta` and `timezone` pickle their constructor arguments.

use std::fmt::{self, Formatter, Write};

use super::{Form, Repr};
use crate::pickle::{Global, Object, Value};

const MICROS_PER_SECOND: i64 = 1_000_000;
const SECONDS_PER_DAY: i64 = 86_400;
const MAX_DAYS: u64 = 999_999_999;

/// Writes an object from the `datetime` module, returning false if the object
/// is not one or its state has an unexpected shape.
pub(super) fn write(f: &mut Formatter<'_>, global: &Global, obj: &Object, form: Form) -> Result<bool, fmt::Error> {
	if global.module != "datetime" {
		return Ok(false);
	}
	let args = obj.args.as_slice();
	match global.name.as_str() {
		"datetime" => {
			let (Some(state), tz) = (args.first().and_then(packed), args.get(1)) else {
				return Ok(false);
			};
			let [y1, y2, month, day, hour, minute, second, u1, u2, u3] = state[..] else {
				return Ok(false);
			};
			let date = Date {
				year: u16::from_be_bytes([y1, y2]),
				month: month & 0x7f,
				day,
			};
			let time = Time {
				hour: hour & 0x7f,
				minute,
				second,
				micros: u32::from_be_bytes([0, u1, u2, u3]),
			};
			match form {
				Form::Str => {
					write!(f, "{} ", date.iso())?;
					write_time_str(f, &time, tz)?;
				}
				Form::Repr => {
					write!(f, "datetime.datetime({}, {}, {}, ", date.year, date.month, date.day)?;
					write_time_args(f, &time, tz)?;
				}
			}
			Ok(true)
		}
		"date" => {
			let Some(state) = args.first().and_then(packed) else {
				return Ok(false);
			};
			let [y1, y2, month, day] = state[..] else {
				return Ok(false);
			};
			let date = Date {
				year: u16::from_be_bytes([y1, y2]),
				month,
				day,
			};
			match form {
				Form::Str => f.write_str(&date.iso())?,
				Form::Repr => write!(f, "datetime.date({}, {}, {})", date.year, date.month, date.day)?,
			}
			Ok(true)
		}
		"time" => {
			let (Some(state), tz) = (args.first().and_then(packed), args.get(1)) else {
				return Ok(false);
			};
			let [hour, minute, second, u1, u2, u3] = state[..] else {
				return Ok(false);
			};
			let time = Time {
				hour: hour & 0x7f,
				minute,
				second,
				micros: u32::from_be_bytes([0, u1, u2, u3]),
			};
			match form {
				Form::Str => write_time_str(f, &time, tz)?,
				Form::Repr => {
					f.write_str("datetime.time(")?;
					write_time_args(f, &time, tz)?;
				}
			}
			Ok(true)
		}
		"timedelta" => {
			let Some(delta) = Delta::from_args(args) else {
				return Ok(false);
			};
			match form {
				Form::Str => delta.write_str(f)?,
				Form::Repr => delta.write_repr(f)?,
			}
			Ok(true)
		}
		"timezone" => {
			let Some(zone) = Zone::from_args(args) else {
				return Ok(false);
			};
			match form {
				Form::Str => zone.write_str(f)?,
				Form::Repr => zone.write_repr(f)?,
			}
			Ok(true)
		}
		_ => Ok(false),
	}
}

/// Returns the packed state of a date or time, which older protocols encode as
/// a Latin-1 string.
fn packed(value: &Value) -> Option<Vec<u8>> {
	match value {
		Value::Bytes(b) => Some(b.clone()),
		Value::Str(s) => s.chars().map(|c| u8::try_from(c).ok()).collect(),
		_ => None,
	}
}

struct Date {
	year: u16,
	month: u8,
	day: u8,
}

impl Date {
	fn iso(&self) -> String {
		format!("{:04}-{:02}-{:02}", self.year, self.month, self.day)
	}
}

struct Time {
	hour: u8,
	minute: u8,
	second: u8,
	micros: u32,
}

fn write_time_str(f: &mut Formatter<'_>, time: &Time, tz: Option<&Value>) -> fmt::Result {
	write!(f, "{:02}:{:02}:{:02}", time.hour, time.minute, time.second)?;
	if time.micros != 0 {
		write!(f, ".{:06}", time.micros)?;
	}
	if let Some(zone) = tz.and_then(Zone::from_value) {
		write_offset(f, zone.offset, "")?;
	}
	Ok(())
}

/// Writes the time fields of a `datetime` or `time` constructor call, omitting
/// trailing zero fields, followed by the closing parenthesis.
fn write_time_args(f: &mut Formatter<'_>, time: &Time, tz: Option<&Value>) -> fmt::Result {
	write!(f, "{}, {}", time.hour, time.minute)?;
	if time.micros != 0 {
		write!(f, ", {}, {}", time.second, time.micros)?;
	} else if time.second != 0 {
		write!(f, ", {}", time.second)?;
	}
	if let Some(tz) = tz {
		write!(f, ", tzinfo={}", Repr(tz))?;
	}
	f.write_char(')')
}

/// Writes a UTC offset in microseconds as `±HH:MM[:SS[.ffffff]]`.
fn write_offset(f: &mut Formatter<'_>, offset: i64, prefix: &str) -> fmt::Result {
	let sign = if offset < 0 { '-' } else { '+' };
	let offset = offset.unsigned_abs();
	let micros = offset % MICROS_PER_SECOND.unsigned_abs();
	let seconds = offset / MICROS_PER_SECOND.unsigned_abs();
	write!(f, "{prefix}{sign}{:02}:{:02}", seconds / 3600, seconds / 60 % 60)?;
	if seconds % 60 != 0 || micros != 0 {
		write!(f, ":{:02}", seconds % 60)?;
	}
	if micros != 0 {
		write!(f, ".{micros:06}")?;
	}
	Ok(())
}

/// A normalized `timedelta`.
struct Delta {
	days: i64,
	seconds: i64,
	micros: i64,
}

impl Delta {
	/// Normalizes constructor arguments the way `timedelta` does, returning
	/// `None` for values outside of its range.
	fn from_args(args: &[Value]) -> Option<Delta> {
		let [Value::Int(days), Value::Int(seconds), Value::Int(micros)] = args else {
			return None;
		};
		let total = (i128::from(*days) * i128::from(SECONDS_PER_DAY) + i128::from(*seconds))
			* i128::from(MICROS_PER_SECOND)
			+ i128::from(*micros);
		let micros_per_day = i128::from(SECONDS_PER_DAY) * i128::from(MICROS_PER_SECOND);
		let days = i64::try_from(total.div_euclid(micros_per_day)).ok()?;
		if days.unsigned_abs() > MAX_DAYS {
			return None;
		}
		let rest = i64::try_from(total.rem_euclid(micros_per_day)).ok()?;
		Some(Delta {
			days,
			seconds: rest / MICROS_PER_SECOND,
			micros: rest % MICROS_PER_SECOND,
		})
	}

	fn from_value(value: &Value) -> Option<Delta> {
		match value {
			Value::Object(obj) if obj.global().is_some_and(|g| g.is("datetime", "timedelta")) => {
				Delta::from_args(&obj.args)
			}
			_ => None,
		}
	}

	fn total_micros(&self) -> Option<i64> {
		self.days
			.checked_mul(SECONDS_PER_DAY)?
			.checked_add(self.seconds)?
			.checked_mul(MICROS_PER_SECOND)?
			.checked_add(self.micros)
	}

	fn write_str(&self, f: &mut Formatter<'_>) -> fmt::Result {
		if self.days != 0 {
			let plural = if self.days.unsigned_abs() == 1 { "" } else { "s" };
			write!(f, "{} day{plural}, ", self.days)?;
		}
		write!(
			f,
			"{}:{:02}:{:02}",
			self.seconds / 3600,
			self.seconds / 60 % 60,
			self.seconds % 60
		)?;
		if self.micros != 0 {
			write!(f, ".{:06}", self.micros)?;
		}
		Ok(())
	}

	fn write_repr(&self, f: &mut Formatter<'_>) -> fmt::Result {
		f.write_str("datetime.timedelta(")?;
		let fields = [
			("days", self.days),
			("seconds", self.seconds),
			("microseconds", self.micros),
		];
		let mut fields = fields.iter().filter(|(_, n)| *n != 0).peekable();
		if fields.peek().is_none() {
			f.write_char('0')?;
		}
		for (i, (name, n)) in fields.enumerate() {
			if i > 0 {
				f.write_str(", ")?;
			}
			write!(f, "{name}={n}")?;
		}
		f.write_char(')')
	}
}

/// A fixed-offset `timezone`.
struct Zone<'a> {
	delta: Delta,
	offset: i64,
	name: Option<&'a Value>,
}

impl<'a> Zone<'a> {
	fn from_args(args: &'a [Value]) -> Option<Zone<'a>> {
		let (delta, name) = match args {
			[delta] => (delta, None),
			[delta, name] => (delta, Some(name)),
			_ => return None,
		};
		let delta = Delta::from_value(delta)?;
		// Offsets must be strictly within one day.
		let offset = delta.total_micros()?;
		if offset.unsigned_abs() >= (SECONDS_PER_DAY * MICROS_PER_SECOND).unsigned_abs() {
			return None;
		}
		Some(Zone {
			offset,
			delta,
			name,
		})
	}

	fn from_value(value: &'a Value) -> Option<Zone<'a>> {
		match value {
			Value::Object(obj) if obj.global().is_some_and(|g| g.is("datetime", "timezone")) => {
				Zone::from_args(&obj.args)
			}
			_ => None,
		}
	}

	fn write_str(&self, f: &mut Formatter<'_>) -> fmt::Result {
		match self.name {
			Some(Value::Str(name)) => f.write_str(name),
			_ if self.offset == 0 => f.write_str("UTC"),
			_ => write_offset(f, self.offset, "UTC"),
		}
	}

	fn write_repr(&self, f: &mut Formatter<'_>) -> fmt::Result {
		if self.offset == 0 && self.name.is_none() {
			return f.write_str("datetime.timezone.utc");
		}
		f.write_str("datetime.timezone(")?;
		self.delta.write_repr(f)?;
		if let Some(name) = self.name {
			write!(f, ", {}", Repr(name))?;
		}
		f.write_char(')')
	}
}

#[cfg(test)]
mod tests {
	use crate::pickle::{Global, Object, Value};
	use crate::pyrepr::{Repr, Str};

	fn call(name: &str, args: Vec<Value>) -> Value {
		Value::Object(Box::new(Object::new(
			Value::Global(Global::new("datetime", name)),
			args,
		)))
	}

	fn delta(days: i64, seconds: i64, micros: i64) -> Value {
		call(
			"timedelta",
			vec![Value::Int(days), Value::Int(seconds), Value::Int(micros)],
		)
	}

	#[test]
	fn datetime_with_offset() {
		let tz = call("timezone", vec![delta(-1, 66600, 0)]);
		let dt = call(
			"datetime",
			vec![Value::Bytes(b"\x07\xe8\x01\x02\x03\x04\x05\x00\x00\x06".to_vec()), tz],
		);
		assert_eq!(Str(&dt).to_string(), "2024-01-02 03:04:05.000006-05:30");
		assert_eq!(
			Repr(&dt).to_string(),
			"datetime.datetime(2024, 1, 2, 3, 4, 5, 6, \
			tzinfo=datetime.timezone(datetime.timedelta(days=-1, seconds=66600)))"
		);
	}

	#[test]
	fn naive_datetime_drops_zero_fields() {
		let dt = call(
			"datetime",
			vec![Value::Bytes(b"\x07\xe8\x01\x02\x00\x00\x00\x00\x00\x00".to_vec())],
		);
		assert_eq!(Str(&dt).to_string(), "2024-01-02 00:00:00");
		assert_eq!(Repr(&dt).to_string(), "datetime.datetime(2024, 1, 2, 0, 0)");
	}

	#[test]
	fn date_and_time() {
		let date = call("date", vec![Value::Bytes(b"\x07\xe8\x0c\x1f".to_vec())]);
		assert_eq!(Str(&date).to_string(), "2024-12-31");
		assert_eq!(Repr(&date).to_string(), "datetime.date(2024, 12, 31)");

		let utc = call("timezone", vec![delta(0, 0, 0)]);
		let time = call(
			"time",
			vec![Value::Bytes(b"\x03\x04\x00\x00\x00\x00".to_vec()), utc],
		);
		assert_eq!(Str(&time).to_string(), "03:04:00+00:00");
		assert_eq!(
			Repr(&time).to_string(),
			"datetime.time(3, 4, tzinfo=datetime.timezone.utc)"
		);
	}

	#[test]
	fn timedelta_forms() {
		assert_eq!(Str(&delta(-2, 5, 3)).to_string(), "-2 days, 0:00:05.000003");
		assert_eq!(Str(&delta(1, 3723, 0)).to_string(), "1 day, 1:02:03");
		assert_eq!(Repr(&delta(0, 0, 0)).to_string(), "datetime.timedelta(0)");
		assert_eq!(
			Repr(&delta(-1, 5, 0)).to_string(),
			"datetime.timedelta(days=-1, seconds=5)"
		);
	}

	#[test]
	fn timezone_names() {
		let cet = call(
			"timezone",
			vec![delta(0, 3600, 0), Value::Str("CET".into())],
		);
		assert_eq!(Str(&cet).to_string(), "CET");
		assert_eq!(
			Repr(&cet).to_string(),
			"datetime.timezone(datetime.timedelta(seconds=3600), 'CET')"
		);
		assert_eq!(
			Str(&call("timezone", vec![delta(-1, 86339, 0)])).to_string(),
			"UTC-00:01:01"
		);
		assert_eq!(Str(&call("timezone", vec![delta(0, 0, 0)])).to_string(), "UTC");
	}

	#[test]
	fn out_of_range_offsets_are_not_applied() {
		let huge = call("timezone", vec![delta(200_000_000, 0, 0)]);
		let dt = call(
			"datetime",
			vec![Value::Bytes(b"\x07\xe8\x01\x02\x03\x04\x05\x00\x00\x06".to_vec()), huge],
		);
		assert_eq!(Str(&dt).to_string(), "2024-01-02 03:04:05.000006");

		let day = call("timezone", vec![delta(1, 0, 0)]);
		assert_eq!(
			Str(&day).to_string(),
			"datetime.timezone(datetime.timedelta(days=1))"
		);
		let extreme = call("timezone", vec![delta(i64::MAX, i64::MAX, i64::MIN)]);
		assert_eq!(
			Str(&extreme).to_string(),
			format!(
				"datetime.timezone(datetime.timedelta({}, {}, {}))",
				i64::MAX,
				i64::MAX,
				i64::MIN
			)
		);
	}

	#[test]
	fn timedelta_arguments_are_normalized() {
		assert_eq!(Str(&delta(0, -30, 0)).to_string(), "-1 day, 23:59:30");
		assert_eq!(Str(&delta(0, 86_400, 1_500_000)).to_string(), "1 day, 0:00:01.500000");
	}
}
