#![no_main]

use evc_parser::codec::evc::evcc::EvcDecoderConfigurationRecord;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(record) = EvcDecoderConfigurationRecord::parse(data) {
        let mut out = Vec::new();
        let _ = record.write(&mut out);
        let _ = record.write_nal_units(&mut out);
    }

    let _ = EvcDecoderConfigurationRecord::from_stream(data, true);
});
