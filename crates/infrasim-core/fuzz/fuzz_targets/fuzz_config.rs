#![no_main]
use infrasim_core::config::SimConfig;
use libfuzzer_sys::fuzz_target;

// Parsing arbitrary text must never panic, and anything that parses and
// validates must build an engine.
fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(config) = SimConfig::from_toml_str(text) else {
        return;
    };
    if config.validate().is_ok() {
        let (builder, _) = infrasim_core::test_utils::single_node_scenario();
        let engine = infrasim_core::engine::Engine::new(builder.build(), config);
        assert!(engine.is_ok());
    }
});
