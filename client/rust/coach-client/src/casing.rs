//! Key-case conversion between the wire convention (snake_case) and the
//! in-memory convention (camelCase).
//!
//! Conversions are deep: keys of nested maps, including maps inside arrays,
//! are rewritten. Values are never touched. The two directions are not exact
//! inverses for every key (`sampleURL` becomes `sample_url`, then `sampleUrl`),
//! so each boundary crossing applies exactly one of them.

use serde_json::{Map, Value};

pub fn snake_to_camel(key: &str) -> String {
    let prefix_len = key.len() - key.trim_start_matches('_').len();
    let (prefix, rest) = key.split_at(prefix_len);
    let mut out = String::with_capacity(key.len());
    out.push_str(prefix);
    let mut upper_next = false;
    for c in rest.chars() {
        if c == '_' || c == '-' {
            upper_next = out.len() > prefix.len();
            continue;
        }
        if upper_next {
            out.extend(c.to_uppercase());
            upper_next = false;
        } else {
            out.push(c);
        }
    }
    out
}

pub fn camel_to_snake(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    let mut out = String::with_capacity(key.len() + 4);
    for (i, &c) in chars.iter().enumerate() {
        if c.is_uppercase() {
            let prev = i.checked_sub(1).map(|j| chars[j]);
            let next = chars.get(i + 1).copied();
            let boundary = match prev {
                None | Some('_') => false,
                Some(p) if p.is_lowercase() || p.is_ascii_digit() => true,
                // End of an acronym: `URLValue` -> `url_value`.
                Some(p) if p.is_uppercase() => next.is_some_and(|n| n.is_lowercase()),
                Some(_) => false,
            };
            if boundary {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else if c == '-' {
            out.push('_');
        } else {
            out.push(c);
        }
    }
    out
}

fn map_keys(value: Value, f: fn(&str) -> String) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(f(&k), map_keys(v, f));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(|v| map_keys(v, f)).collect()),
        other => other,
    }
}

/// Wire to memory: snake_case keys become camelCase.
pub fn to_client(value: Value) -> Value {
    map_keys(value, snake_to_camel)
}

/// Memory to wire: camelCase keys become snake_case.
pub fn to_server(value: Value) -> Value {
    map_keys(value, camel_to_snake)
}
