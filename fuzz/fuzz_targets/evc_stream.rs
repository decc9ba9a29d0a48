#![no_main]

use evc_parser::codec::evc::stream::EvcStreamParser;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut parser = EvcStreamParser::default();

    // The first byte picks the chunk size, so that splits land everywhere.
    let Some((&chunk_size, data)) = data.split_first() else {
        return;
    };

    for chunk in data.chunks(usize::from(chunk_size).max(1)) {
        let mut status = parser.feed(chunk);
        while status.is_err() {
            status = parser.feed(&[]);
        }
    }

    let _ = parser.flush();
});
