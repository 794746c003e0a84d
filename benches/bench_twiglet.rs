#![allow(
    clippy::tests_outside_test_module,
    clippy::unwrap_used,
    reason = "benchmark"
)]

use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};
use twiglet::{ArrayLoader, Context, Environment, MemoryCache, Source};

mod utils;

fn twiglet_benchmark(c: &mut Criterion) {
    let mut env = Environment::new(ArrayLoader::new([("profile.html", utils::PROFILE_TEMPLATE)]));
    env.set_cache(MemoryCache::new());

    let json_contexts = utils::generate_random_contexts(100);
    let contexts: Vec<Context> = json_contexts.into_iter().map(Context::from).collect();

    utils::print_binary_size();

    let mut group = c.benchmark_group("Template Rendering");
    group.sample_size(50);

    group.bench_function("twiglet_render", |b| {
        b.iter(|| {
            for context in &contexts {
                black_box(env.render("profile.html", context.clone()).unwrap());
            }
        });
    });

    group.finish();

    // Lexing, parsing, the tree passes and code generation, without the cache.
    let mut group = c.benchmark_group("Template Compilation");
    let source = Source::new(utils::PROFILE_TEMPLATE, "profile.html");
    group.bench_function("twiglet_compile", |b| {
        b.iter(|| black_box(env.compile_source(&source).unwrap()));
    });
    let large = Source::new(utils::large_template(200), "large.html");
    group.bench_function("twiglet_compile_large", |b| {
        b.iter(|| black_box(env.compile_source(&large).unwrap()));
    });

    group.finish();
}

criterion_group!(benches, twiglet_benchmark);
criterion_main!(benches);
