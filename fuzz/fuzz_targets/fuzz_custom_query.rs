//! Fuzz testing for custom query validation.
//!
//! Feeds arbitrary bytes through the same path an HTTP body takes: JSON
//! parsing, request validation and translation into a store operation. None
//! of these steps may panic, and any request that validates must not name a
//! mutating verb.
//!
//! # Running the Fuzz Tests
//!
//! ```bash
//! # Install cargo-fuzz (requires nightly)
//! cargo +nightly install cargo-fuzz
//!
//! # Run the custom query fuzz target
//! cargo +nightly fuzz run fuzz_custom_query
//!
//! # Run with a time limit (e.g., 60 seconds)
//! cargo +nightly fuzz run fuzz_custom_query -- -max_total_time=60
//! ```

#![no_main]

use libfuzzer_sys::fuzz_target;
use query_gateway::query::custom::{CustomQueryLimits, find_forbidden, validate_request};
use query_gateway::query::{Collection, CustomQueryRequest};

fuzz_target!(|data: &[u8]| {
    // The first byte picks a collection; some inputs use an unknown name.
    let Some((&selector, body)) = data.split_first() else {
        return;
    };
    let collection = Collection::ALL
        .get(usize::from(selector) % (Collection::ALL.len() + 1))
        .map_or("not_a_collection", Collection::as_str);

    let Ok(request) = serde_json::from_slice::<CustomQueryRequest>(body) else {
        return;
    };

    if let Ok(validated) = validate_request(collection, &request, &CustomQueryLimits::default()) {
        let serialized = serde_json::to_string(&request.query).unwrap_or_default();
        assert!(find_forbidden(&serialized).is_none());
        assert!(validated.options.limit >= 1 && validated.options.limit <= 100);
        let _ = validated.to_store_operation();
    }
});
