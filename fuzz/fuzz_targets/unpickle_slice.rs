#![no_main]

use std::io;

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
	let _ = unpickle_json::unpickle_slice(data, io::sink());
});
