mod fixtures;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fixtures::init_tracing;
use twiglet::{
    ArrayLoader, ChainLoader, Context, Environment, EnvironmentOptions, Error, FilesystemCache,
    FilesystemLoader, Loader, MemoryCache,
};

fn write(dir: &Path, name: &str, code: &str) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create template directory");
    }
    fs::write(&path, code).expect("write template");
    path
}

fn json_files(dir: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    for entry in fs::read_dir(dir).expect("read cache directory").flatten() {
        let path = entry.path();
        if path.is_dir() {
            found.extend(json_files(&path));
        } else if path.extension().is_some_and(|ext| ext == "json") {
            found.push(path);
        }
    }
    found
}

fn loader_message(error: &Error) -> &str {
    let Error::Loader(e) = error else {
        panic!("expected a loader error, got {error:?}");
    };
    e.message()
}

#[test]
#[ntest::timeout(1000)]
fn test_filesystem_loader() {
    init_tracing();
    let dir = tempfile::tempdir().expect("temp dir");
    write(dir.path(), "page.html", "{% include 'partials/item.html' %}!");
    write(dir.path(), "partials/item.html", "item");

    let env = Environment::new(FilesystemLoader::new([dir.path()]));
    assert_eq!(env.render("page.html", Context::new()).expect("renders"), "item!");
    assert_eq!(
        env.render("./partials//item.html", Context::new()).expect("renders"),
        "item",
        "names are normalized"
    );

    let error = env.render("nope.html", Context::new()).expect_err("no such file");
    assert_eq!(
        loader_message(&error),
        format!(
            "Unable to find template \"nope.html\" (looked into: {}).",
            dir.path().display()
        )
    );
}

#[test]
#[ntest::timeout(1000)]
fn test_filesystem_loader_rejects_names_outside_its_paths() {
    let dir = tempfile::tempdir().expect("temp dir");
    write(dir.path(), "secret.html", "secret");
    let root = dir.path().join("templates");
    write(&root, "page.html", "page");

    let loader = FilesystemLoader::new([&root]);
    assert!(loader.exists("page.html"), "page.html is in the search path");
    assert!(!loader.exists("../secret.html"), "climbing out is refused");

    let error = loader.source("partials/../../secret.html").expect_err("outside");
    assert_eq!(
        loader_message(&error),
        "Looks like you try to load a template outside configured directories (partials/../../secret.html)."
    );
}

#[test]
#[ntest::timeout(1000)]
fn test_filesystem_loader_namespaces() {
    let dir = tempfile::tempdir().expect("temp dir");
    let main = dir.path().join("main");
    let admin = dir.path().join("admin");
    let theme = dir.path().join("theme");
    write(&main, "page.html", "{% extends '@admin/layout.html' %}{% block body %}page{% endblock %}");
    write(&admin, "layout.html", "admin[{% block body %}{% endblock %}]");
    write(&theme, "layout.html", "theme[{% block body %}{% endblock %}]");

    let mut loader = FilesystemLoader::new([&main]);
    loader.add_path(&admin, "admin");
    let env = Environment::new(loader);
    assert_eq!(env.render("page.html", Context::new()).expect("renders"), "admin[page]");

    let mut loader = FilesystemLoader::new([&main]);
    loader.add_path(&admin, "admin");
    loader.prepend_path(&theme, "admin");
    assert_eq!(loader.paths("admin"), [theme.clone(), admin.clone()]);
    let env = Environment::new(loader);
    assert_eq!(
        env.render("page.html", Context::new()).expect("renders"),
        "theme[page]",
        "prepended paths are searched first"
    );

    let loader = FilesystemLoader::new([&main]);
    let error = loader.source("@shop/cart.html").expect_err("no shop namespace");
    assert_eq!(
        loader_message(&error),
        "There are no registered paths for namespace \"shop\"."
    );
    let error = loader.source("@shop").expect_err("malformed");
    assert!(
        loader_message(&error).starts_with("Malformed namespaced template name \"@shop\""),
        "unexpected message: {error}"
    );
}

#[test]
#[ntest::timeout(1000)]
fn test_chain_loader() {
    init_tracing();
    let loader = ChainLoader::new()
        .with_loader(ArrayLoader::new([("a.html", "first"), ("shared.html", "first")]))
        .with_loader(ArrayLoader::new([("b.html", "second"), ("shared.html", "second")]));
    assert!(loader.exists("b.html"), "any loader may hold the template");

    let env = Environment::new(loader);
    assert_eq!(env.render("a.html", Context::new()).expect("renders"), "first");
    assert_eq!(env.render("b.html", Context::new()).expect("renders"), "second");
    assert_eq!(
        env.render("shared.html", Context::new()).expect("renders"),
        "first",
        "the first loader that has it wins"
    );

    let error = env.render("ghost.html", Context::new()).expect_err("nobody has it");
    assert!(
        loader_message(&error).starts_with("Template \"ghost.html\" is not defined (Template \"ghost.html\" is not defined"),
        "every loader's reason is listed: {error}"
    );
}

#[test]
#[ntest::timeout(1000)]
fn test_memory_cache_shares_programs() {
    init_tracing();
    let cache = Arc::new(MemoryCache::new());
    let templates = [("page.html", "{% include 'part.html' %}"), ("part.html", "part")];

    let mut env = Environment::new(ArrayLoader::new(templates));
    env.set_cache(Arc::clone(&cache));
    assert_eq!(env.render("page.html", Context::new()).expect("renders"), "part");
    assert_eq!(cache.len(), 2, "one entry per compiled template");

    let mut other = Environment::new(ArrayLoader::new(templates));
    other.set_cache(Arc::clone(&cache));
    assert_eq!(other.render("page.html", Context::new()).expect("renders"), "part");
    assert_eq!(cache.len(), 2, "the same sources reuse the cached programs");

    let mut changed = Environment::new(ArrayLoader::new([
        ("page.html", "{% include 'part.html' %}"),
        ("part.html", "changed"),
    ]));
    changed.set_cache(Arc::clone(&cache));
    assert_eq!(changed.render("page.html", Context::new()).expect("renders"), "changed");
    assert_eq!(cache.len(), 3, "a changed source gets a new key");
}

#[test]
#[ntest::timeout(1000)]
fn test_filesystem_cache() {
    init_tracing();
    let dir = tempfile::tempdir().expect("temp dir");
    let templates = [("page.html", "Hello {{ name }}")];
    let mut context = Context::new();
    context.insert("name", "cache");

    let mut env = Environment::new(ArrayLoader::new(templates));
    env.set_cache(FilesystemCache::new(dir.path()));
    assert_eq!(env.render("page.html", context.clone()).expect("renders"), "Hello cache");

    let files = json_files(dir.path());
    assert_eq!(files.len(), 1, "one program was written: {files:?}");
    let entry = files.first().expect("one program");
    let bucket = entry
        .parent()
        .and_then(Path::file_name)
        .and_then(|name| name.to_str())
        .expect("entry sits in a bucket directory");
    assert_eq!(bucket.len(), 2, "buckets are named after the first two hex digits");
    let program: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(entry).expect("read entry")).expect("entry is json");
    assert!(program.is_object(), "the program is stored as a json object");

    fs::write(entry, "not json").expect("corrupt the entry");
    let mut fresh = Environment::new(ArrayLoader::new(templates));
    fresh.set_cache(FilesystemCache::new(dir.path()));
    assert_eq!(
        fresh.render("page.html", context).expect("renders"),
        "Hello cache",
        "unreadable entries are recompiled"
    );
    let rewritten = fs::read_to_string(entry).expect("read entry");
    assert!(
        serde_json::from_str::<serde_json::Value>(&rewritten).is_ok(),
        "the entry was rewritten"
    );
}

fn touch_later(path: &Path) {
    let file = fs::OpenOptions::new()
        .write(true)
        .open(path)
        .expect("open template");
    file.set_modified(SystemTime::now().checked_add(Duration::from_secs(60)).expect("in range"))
        .expect("set modification time");
}

#[test]
#[ntest::timeout(1000)]
fn test_auto_reload() {
    init_tracing();
    let dir = tempfile::tempdir().expect("temp dir");
    let path = write(dir.path(), "page.html", "v1");

    let options = EnvironmentOptions {
        auto_reload: Some(true),
        ..EnvironmentOptions::default()
    };
    let reloading = Environment::with_options(FilesystemLoader::new([dir.path()]), options);
    let fixed = Environment::new(FilesystemLoader::new([dir.path()]));
    assert_eq!(reloading.render("page.html", Context::new()).expect("renders"), "v1");
    assert_eq!(fixed.render("page.html", Context::new()).expect("renders"), "v1");

    fs::write(&path, "v2").expect("rewrite template");
    touch_later(&path);

    assert_eq!(
        reloading.render("page.html", Context::new()).expect("renders"),
        "v2",
        "changed sources are recompiled"
    );
    assert_eq!(
        fixed.render("page.html", Context::new()).expect("renders"),
        "v1",
        "without auto-reload a loaded template is kept"
    );
}

#[test]
#[ntest::timeout(1000)]
fn test_debug_turns_on_auto_reload() {
    let options: EnvironmentOptions =
        serde_json::from_str(r#"{"debug": true}"#).expect("partial options parse");
    assert!(options.auto_reload(), "auto-reload follows debug");

    let options: EnvironmentOptions =
        serde_json::from_str(r#"{"debug": true, "auto_reload": false}"#).expect("options parse");
    assert!(!options.auto_reload(), "an explicit setting wins");
}
