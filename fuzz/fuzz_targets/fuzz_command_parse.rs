#![no_main]

use libfuzzer_sys::fuzz_target;

use termgate::commands::parse;

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };
    let parsed = parse(input);

    assert_eq!(parsed.raw, input);
    // Tokens never contain unquoted whitespace, so a blank input has no command.
    if input.trim().is_empty() {
        assert!(parsed.command.is_empty());
    }
});
