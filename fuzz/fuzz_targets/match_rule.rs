//! Fuzz target for client-side match rule filtering.
//!
//! Arbitrary object paths and namespaces must never panic, and a match
//! always lies inside the namespace.

#![no_main]

use arbitrary::Arbitrary;
use deskctl::bus::{MatchRule, Signal};
use libfuzzer_sys::fuzz_target;
use std::collections::HashMap;

#[derive(Arbitrary, Debug)]
struct Input {
    namespace: String,
    path: String,
    interface: String,
}

fuzz_target!(|input: Input| {
    let rule = MatchRule::properties_changed("org.bluez", &input.namespace, "org.bluez.Device1");
    let signal = Signal {
        path: input.path,
        interface: input.interface,
        changed: HashMap::new(),
    };

    if rule.matches(&signal) {
        assert!(signal.path.starts_with(&input.namespace));
        assert_eq!(signal.interface, "org.bluez.Device1");
    }
    let _ = rule.to_string();
});
