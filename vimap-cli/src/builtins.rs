//! Transforms shipped with the `vimap` binary
//!
//! The coordinator and its workers are the same executable, so both sides
//! resolve names against this registry.

use serde_json::Value as JsonValue;
use vimap_pool::{from_fn, try_from_fn, TransformError, TransformRegistry};

/// Name and one-line summary of every built-in transform
pub const BUILTINS: &[(&str, &str)] = &[
    ("add", "adds the sum of the numeric init args to each numeric input"),
    ("fail-after", "echoes inputs, then fails once kwarg `n` items have been seen"),
    ("identity", "returns each input unchanged"),
    ("length", "character count of each string input"),
    ("prefix", "prepends kwarg `prefix` to each string input"),
    ("upper", "uppercases each string input"),
];

pub fn registry() -> TransformRegistry {
    let mut registry = TransformRegistry::new();
    registry
        .register("identity", |_| Ok(from_fn(|x: JsonValue| x)))
        .register("upper", |_| Ok(from_fn(|s: String| s.to_uppercase())))
        .register("length", |_| Ok(from_fn(|s: String| s.chars().count())))
        .register("prefix", |args| {
            let prefix: String = args.require_kwarg("prefix")?;
            Ok(from_fn(move |s: String| format!("{}{}", prefix, s)))
        })
        .register("add", |args| {
            let offset: f64 = args.args_as::<f64>()?.iter().sum();
            Ok(from_fn(move |x: f64| x + offset))
        })
        .register("fail-after", |args| {
            let limit: u64 = args.require_kwarg("n")?;
            let mut seen = 0u64;
            Ok(try_from_fn(move |x: JsonValue| {
                seen += 1;
                if seen > limit {
                    Err(TransformError::new(format!("refusing item {} (limit {})", seen, limit)))
                } else {
                    Ok(x)
                }
            }))
        });
    registry
}
