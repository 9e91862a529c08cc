//! AMQP topic pattern matching.
//!
//! Binding patterns are dot-separated words where `*` matches exactly one
//! word and `#` matches zero or more. The backbone binds on exact keys,
//! but wildcard bindings are permitted and the in-memory broker honours
//! them with the same semantics as a topic exchange.

/// Returns true when `routing_key` matches the binding `pattern`.
pub fn matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => {
            // `#` absorbs zero words, or one word and stays greedy.
            match_words(rest, key) || (!key.is_empty() && match_words(pattern, &key[1..]))
        },
        Some((&"*", rest)) => match key.split_first() {
            Some((_, key_rest)) => match_words(rest, key_rest),
            None => false,
        },
        Some((word, rest)) => match key.split_first() {
            Some((key_word, key_rest)) if word == key_word => match_words(rest, key_rest),
            _ => false,
        },
    }
}
