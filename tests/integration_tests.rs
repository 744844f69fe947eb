//! unpickle-json's integration test suite.
//!
//! Most tests decode documents that CPython pickled at every protocol from 0
//! through 5, and check that each protocol produces the same JSON. For the
//! documents in `pickles/*.json`, that JSON is byte-for-byte what Python
//! itself prints after loading the pickle and passing it through the same
//! conversion rules with `json.dumps`. Documents that involve classes Python
//! would print with a memory address have their expected output written out
//! in the tests below instead.

use rstest::rstest;
use similar_asserts::assert_eq;

use unpickle_json::pickle::{self, Value};

macro_rules! pickle_fixture {
	($name:literal, $protocol:expr) => {
		match $protocol {
			0 => include_bytes!(concat!("pickles/", $name, ".p0.pickle")).as_slice(),
			1 => include_bytes!(concat!("pickles/", $name, ".p1.pickle")).as_slice(),
			2 => include_bytes!(concat!("pickles/", $name, ".p2.pickle")).as_slice(),
			3 => include_bytes!(concat!("pickles/", $name, ".p3.pickle")).as_slice(),
			4 => include_bytes!(concat!("pickles/", $name, ".p4.pickle")).as_slice(),
			5 => include_bytes!(concat!("pickles/", $name, ".p5.pickle")).as_slice(),
			protocol => panic!("no fixture for protocol {protocol}"),
		}
	};
}

macro_rules! assert_unpickle {
	(
		input = $input:expr;
		unpickler = $unpickler:path;
		expected = $expected:expr;
	) => {
		let expected: &[u8] = $expected;
		let mut output = Vec::with_capacity(expected.len());
		$unpickler($input, &mut output).unwrap();

		// Compare as text first so that differences are readable.
		assert_eq!(std::str::from_utf8(&output), std::str::from_utf8(expected));
		assert_eq!(output, expected);
	};
}

fn get_pickle(name: &str, protocol: u8) -> &'static [u8] {
	match name {
		"basic" => pickle_fixture!("basic", protocol),
		"types" => pickle_fixture!("types", protocol),
		"job" => pickle_fixture!("job", protocol),
		"result" => pickle_fixture!("result", protocol),
		"object" => pickle_fixture!("object", protocol),
		"recursive" => pickle_fixture!("recursive", protocol),
		name => panic!("{name} is not a known pickle fixture"),
	}
}

fn get_expected_json(name: &str) -> &'static [u8] {
	match name {
		"basic" => include_bytes!("pickles/basic.json"),
		"types" => include_bytes!("pickles/types.json"),
		"job" => include_bytes!("pickles/job.json"),
		"result" => include_bytes!("pickles/result.json"),
		name => panic!("{name} does not have expected JSON output"),
	}
}

#[rstest]
fn unpickle_slice_matches_python(
	#[values("basic", "types", "job", "result")] name: &str,
	#[values(0, 1, 2, 3, 4, 5)] protocol: u8,
) {
	assert_unpickle! {
		input = get_pickle(name, protocol);
		unpickler = unpickle_json::unpickle_slice;
		expected = get_expected_json(name);
	}
}

#[rstest]
fn unpickle_reader_matches_python(
	#[values("basic", "types", "job", "result")] name: &str,
	#[values(0, 1, 2, 3, 4, 5)] protocol: u8,
) {
	assert_unpickle! {
		input = get_pickle(name, protocol);
		unpickler = unpickle_json::unpickle_reader;
		expected = get_expected_json(name);
	}
}

/// Tests the printed forms of instances of classes that the decoder knows
/// nothing about.
///
/// Python would print a plain instance with its memory address, which isn't
/// useful outside of the process that created it. The decoder shows the
/// instance's attributes instead. A subclass of dict is still a mapping, and
/// a bare class prints the way Python prints classes.
#[rstest]
fn unknown_classes(#[values(0, 1, 2, 3, 4, 5)] protocol: u8) {
	assert_unpickle! {
		input = get_pickle("object", protocol);
		unpickler = unpickle_json::unpickle_slice;
		expected = concat!(
			r#"{"point": "geometry.Point(x=1, y=2.5)", "tags": {"color": "red"}, "#,
			r#""cls": "<class 'geometry.Point'>"}"#,
			"\n",
		).as_bytes();
	}
}

/// Tests that a list containing itself is converted once, with the inner
/// reference printed the way Python prints a recursive list.
#[rstest]
fn recursive_list(#[values(0, 1, 2, 3, 4, 5)] protocol: u8) {
	assert_unpickle! {
		input = get_pickle("recursive", protocol);
		unpickler = unpickle_json::unpickle_slice;
		expected = b"[1, \"[...]\"]\n";
	}
}

/// Tests pickles written by Python 2, which uses byte strings for text and
/// different names for builtin modules.
#[test]
fn python2_pickles() {
	use hex_literal::hex;

	assert_unpickle! {
		input = &hex!("
			80 02 7d 71 00 28 55 03 6b 65 79 71 01 55 05 76 61 6c 75 65
			71 02 55 01 6e 71 03 8a 01 01 75 2e
		");
		unpickler = unpickle_json::unpickle_slice;
		expected = b"{\"key\": \"value\", \"n\": 1}\n";
	}

	assert_unpickle! {
		input = &hex!("
			80 02 63 5f 5f 62 75 69 6c 74 69 6e 5f 5f 0a 73 65 74 0a 71
			00 5d 71 01 4b 01 61 85 71 02 52 71 03 2e
		");
		unpickler = unpickle_json::unpickle_slice;
		expected = b"\"{1}\"\n";
	}
}

/// Tests that data after the end of a pickle is ignored, as in Python's
/// `pickle.loads`.
#[test]
fn trailing_data_is_ignored() {
	let mut input = get_pickle("basic", 4).to_vec();
	input.extend_from_slice(b"garbage");
	assert_unpickle! {
		input = &input;
		unpickler = unpickle_json::unpickle_slice;
		expected = get_expected_json("basic");
	}
}

/// Tests that every truncation of a valid pickle fails with the same kind of
/// error Python raises, without writing any output.
#[rstest]
fn truncated_input(#[values(0, 1, 2, 3, 4, 5)] protocol: u8) {
	let input = get_pickle("types", protocol);
	for len in 0..input.len() {
		let mut output = Vec::new();
		let err = unpickle_json::unpickle_slice(&input[..len], &mut output).unwrap_err();
		let category = unpickle_json::category(err.as_ref());
		assert!(
			matches!(category, "EOFError" | "UnpicklingError"),
			"unexpected {category} for {len} bytes of protocol {protocol}: {err}"
		);
		assert!(output.is_empty());
	}
}

/// Tests that deeply nested input is rejected instead of overflowing the
/// stack during decoding, conversion, or drop.
#[test]
fn nesting_depth_is_limited() {
	const PROTO_4: [u8; 2] = [0x80, 0x04];
	const EMPTY_LIST: u8 = b']';
	const APPEND: u8 = b'a';

	let build = |depth: usize| {
		let mut input = PROTO_4.to_vec();
		input.extend(std::iter::repeat(EMPTY_LIST).take(depth + 1));
		input.extend(std::iter::repeat(APPEND).take(depth));
		input.push(b'.');
		input
	};

	let value = pickle::from_slice(&build(1000)).unwrap();
	assert!(matches!(value, Value::List(_)));

	let err = pickle::from_slice(&build(100_000)).unwrap_err();
	assert_eq!(err.category(), "RecursionError");
}
