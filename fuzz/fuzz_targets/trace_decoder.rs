#![no_main]

use libfuzzer_sys::fuzz_target;
use std::io::Write;
use tracerelay::trace_file::{TRACE_MAGIC, TRACE_VERSION};
use tracerelay::{CallSource, TraceFile};

fuzz_target!(|data: &[u8]| {
    let mut file = match tempfile::NamedTempFile::new() {
        Ok(file) => file,
        Err(_) => return,
    };
    let mut bytes = TRACE_MAGIC.to_vec();
    bytes.extend_from_slice(&TRACE_VERSION.to_le_bytes());
    bytes.extend_from_slice(data);
    if file.write_all(&bytes).is_err() {
        return;
    }

    // Decoding arbitrary bodies must fail cleanly, never panic.
    if let Ok(mut trace) = TraceFile::open_path(file.path()) {
        while let Ok(Some(_)) = trace.parse_call() {}
        let _ = trace.percent_read();
    }
});
