#![allow(dead_code, reason = "each test binary uses a different subset of the fixtures")]

use rand::Rng;
use twiglet::{ArrayLoader, Context, Environment, EnvironmentOptions, Error};

/// Routes engine logs to the test output. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub fn env_with(templates: &[(&str, &str)]) -> Environment {
    init_tracing();
    Environment::new(ArrayLoader::new(templates.iter().copied()))
}

pub fn env_with_options(templates: &[(&str, &str)], options: EnvironmentOptions) -> Environment {
    init_tracing();
    Environment::with_options(ArrayLoader::new(templates.iter().copied()), options)
}

/// Renders `code` as `test.html` on its own.
pub fn render(code: &str, context: Context) -> String {
    env_with(&[("test.html", code)])
        .render("test.html", context)
        .unwrap_or_else(|e| panic!("rendering {code:?} failed: {e}"))
}

/// Renders `code` as `test.txt`, which is not autoescaped.
pub fn render_text(code: &str, context: Context) -> String {
    env_with(&[("test.txt", code)])
        .render("test.txt", context)
        .unwrap_or_else(|e| panic!("rendering {code:?} failed: {e}"))
}

/// The error rendering `code` as `test.html` fails with.
pub fn render_error(code: &str, context: Context) -> Error {
    match env_with(&[("test.html", code)]).render("test.html", context) {
        Ok(output) => panic!("expected {code:?} to fail, it rendered {output:?}"),
        Err(e) => e,
    }
}

pub fn generate_random_whitespace() -> String {
    let mut rng = rand::rng();
    let length = rng.random_range(0..10);
    (0..length).map(|_| ' ').collect()
}

pub fn generate_random_whitespace_at_least_one() -> String {
    let mut rng = rand::rng();
    let length = rng.random_range(1..10);
    (0..length).map(|_| ' ').collect()
}
