//! Fuzz target for STUN message decoding
//!
//! Datagrams come straight off the network, so the decoder must return
//! Ok or Err for any input and never panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use netscout_discovery::StunMessage;

fuzz_target!(|data: &[u8]| {
    if let Ok(message) = StunMessage::decode(data) {
        // Attribute lookups walk every attribute
        let _ = message.mapped_address();
        let _ = message.changed_address();
        let _ = message.error_code();

        // Whatever decoded must survive a re-encode
        let reencoded = message.encode();
        assert!(StunMessage::decode(&reencoded).is_ok());
    }
});
