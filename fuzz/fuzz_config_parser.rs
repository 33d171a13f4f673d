//! Fuzz target for the TOML configuration parser.
//!
//! Run with: cargo +nightly fuzz run fuzz_config_parser
//!
//! Feeds arbitrary text through `AppConfig::parse()`, including group id and
//! counter kind validation, looking for panics or hangs.

#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data)
        && let Ok(config) = ipacct_config::AppConfig::parse(s)
    {
        // A config that parsed has already had its groups validated.
        assert!(config.groups().is_ok());
    }
});
