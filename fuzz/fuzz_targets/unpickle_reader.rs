#![no_main]

use std::io;

use libfuzzer_sys::fuzz_target;

// Decoded values are also printed in full, which walks every variant of the
// printed forms even where conversion would not.
fuzz_target!(|data: &[u8]| {
	let _ = unpickle_json::unpickle_reader(data, io::sink());
	if let Ok(value) = unpickle_json::pickle::from_slice(data) {
		let _ = unpickle_json::pyrepr::Repr(&value).to_string();
	}
});
