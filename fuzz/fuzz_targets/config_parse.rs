//! Fuzz target for TOML config parsing and validation.
//!
//! Malformed input must produce an error, never a panic.

#![no_main]

use deskctl::Config;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(config) = Config::parse(s) {
            // Anything that validates must survive a save/load cycle
            let text = toml::to_string_pretty(&config).expect("serialize valid config");
            let reparsed = Config::parse(&text).expect("reparse saved config");
            assert_eq!(config, reparsed);
        }
    }
});
