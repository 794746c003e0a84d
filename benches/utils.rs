#![allow(dead_code, reason = "each benchmark uses a different subset of the helpers")]

use std::fmt::Write as _;

use rand::{Rng, SeedableRng, rngs::StdRng};
use serde_json::{Value, json};

/// The profile template both engines render.
pub const PROFILE_TEMPLATE: &str = include_str!("template_profile.html");

const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyz";

/// Contexts for [`PROFILE_TEMPLATE`], reproducible across runs.
pub fn generate_random_contexts(n: usize) -> Vec<Value> {
    let mut rng = StdRng::seed_from_u64(42);
    (0..n).map(|_| profile(&mut rng)).collect()
}

fn profile(rng: &mut StdRng) -> Value {
    let items: Vec<Value> = (0..rng.random_range(3..10))
        .map(|_| {
            json!({
                "name": word(rng, 3..=8),
                "value": rng.random_range(10..1000),
                "special": rng.random_bool(0.3),
            })
        })
        .collect();

    json!({
        "user": {
            "name": word(rng, 5..=10),
            "age": rng.random_range(18..80),
            "active": rng.random_bool(0.7),
        },
        "items": items,
        "show_details": rng.random_bool(0.8),
        "has_access": rng.random_bool(0.6),
    })
}

fn word(rng: &mut StdRng, len: std::ops::RangeInclusive<usize>) -> String {
    (0..rng.random_range(len))
        .filter_map(|_| LETTERS.get(rng.random_range(0..LETTERS.len())))
        .map(|&b| char::from(b))
        .collect()
}

/// A template with `sections` copies of the profile body, each in its own
/// block, for measuring how compilation scales with source size.
pub fn large_template(sections: usize) -> String {
    let mut code = String::with_capacity(PROFILE_TEMPLATE.len().saturating_mul(sections));
    for i in 0..sections {
        writeln!(code, "{{% block section_{i} %}}{PROFILE_TEMPLATE}{{% endblock %}}")
            .expect("writing to a String cannot fail");
    }
    code
}

pub fn print_binary_size() {
    let Ok(path) = std::env::current_exe() else {
        return;
    };
    let Ok(metadata) = std::fs::metadata(&path) else {
        return;
    };
    let bytes = metadata.len();
    println!(
        "Binary size: {:.2} KB ({bytes} bytes) at {}",
        bytes as f64 / 1024.0,
        path.display()
    );
}
