mod fixtures;

use fixtures::{env_with, env_with_options};
use twiglet::error::SecurityErrorKind;
use twiglet::sandbox::{AllowListPolicy, SandboxExtension};
use twiglet::{Context, Environment, EnvironmentOptions, Error, Object, Result, Value};

#[derive(Debug)]
struct Article {
    title: String,
}

impl Object for Article {
    fn class_name(&self) -> &str {
        "Article"
    }

    fn get_property(&self, name: &str) -> Option<Value> {
        (name == "title").then(|| Value::from(self.title.as_str()))
    }

    fn has_method(&self, name: &str) -> bool {
        matches!(name, "getTitle" | "delete")
    }

    fn call_method(&self, name: &str, _args: &[Value]) -> Result<Value> {
        match name {
            "getTitle" => Ok(Value::from(self.title.as_str())),
            _ => Ok(Value::from("deleted")),
        }
    }

    fn to_display(&self) -> Option<String> {
        Some(format!("Article({})", self.title))
    }
}

fn policy() -> AllowListPolicy {
    AllowListPolicy::new()
        .allow_tags(["if", "for"])
        .allow_filters(["upper"])
        .allow_functions(["max"])
        .allow_methods("Article", ["gettitle"])
        .allow_properties("Article", ["title"])
}

fn sandboxed_env(templates: &[(&str, &str)]) -> Environment {
    let options = EnvironmentOptions {
        sandboxed: true,
        ..EnvironmentOptions::default()
    };
    let mut env = env_with_options(templates, options);
    env.add_extension(SandboxExtension::new(policy()))
        .expect("registry is open");
    env
}

fn with_article() -> Context {
    let mut context = Context::new();
    context.insert(
        "article",
        Value::from_object(Article {
            title: "Rust".to_owned(),
        }),
    );
    context
}

fn security_error(env: &Environment, name: &str) -> Error {
    match env.render(name, with_article()) {
        Ok(output) => panic!("expected {name} to be rejected, it rendered {output:?}"),
        Err(error) => error,
    }
}

#[test]
#[ntest::timeout(1000)]
fn test_allowed_template_renders() {
    let env = sandboxed_env(&[(
        "ok.txt",
        "{% if true %}{{ article.title|upper }} {{ article.getTitle() }} {{ max(1, 2) }}{% endif %}",
    )]);
    assert_eq!(env.render("ok.txt", with_article()).expect("renders"), "RUST Rust 2");
}

#[test]
#[ntest::timeout(1000)]
fn test_disallowed_names() {
    let env = sandboxed_env(&[
        ("tag.txt", "\n{% set x = 1 %}"),
        ("filter.txt", "{{ 'a'|lower }}"),
        ("function.txt", "{{ min(1, 2) }}"),
    ]);

    let error = security_error(&env, "tag.txt");
    assert!(
        matches!(&error, Error::Security(e) if *e.kind() == SecurityErrorKind::NotAllowedTag { tag: "set".to_owned() }),
        "unexpected error: {error:?}"
    );
    assert_eq!(error.to_string(), "Tag \"set\" is not allowed in \"tag.txt\" at line 2.");

    assert_eq!(
        security_error(&env, "filter.txt").to_string(),
        "Filter \"lower\" is not allowed in \"filter.txt\" at line 1."
    );
    assert_eq!(
        security_error(&env, "function.txt").to_string(),
        "Function \"min\" is not allowed in \"function.txt\" at line 1."
    );
}

#[test]
#[ntest::timeout(1000)]
fn test_nothing_renders_before_the_check() {
    let env = sandboxed_env(&[("late.txt", "visible{{ 'a'|lower }}")]);
    let mut out = String::new();
    let result = env.render_to("late.txt", Context::new(), &mut out);
    assert!(result.is_err(), "lower is not allowed");
    assert_eq!(out, "", "the manifest is checked before any output");
}

#[test]
#[ntest::timeout(1000)]
fn test_methods_and_properties() {
    let env = sandboxed_env(&[
        ("method.txt", "{{ article.delete() }}"),
        ("print.txt", "{{ article }}"),
    ]);
    assert_eq!(
        security_error(&env, "method.txt").to_string(),
        "Calling \"delete\" method on a \"Article\" object is not allowed in \"method.txt\" at line 1."
    );
    assert_eq!(
        security_error(&env, "print.txt").to_string(),
        "Calling \"__toString\" method on a \"Article\" object is not allowed in \"print.txt\" at line 1.",
        "printing an object calls its string conversion"
    );
}

#[test]
#[ntest::timeout(1000)]
fn test_properties_are_checked() {
    let options = EnvironmentOptions {
        sandboxed: true,
        ..EnvironmentOptions::default()
    };
    let mut env = env_with_options(&[("prop.txt", "{{ article.title }}")], options);
    env.add_extension(SandboxExtension::new(
        AllowListPolicy::new().allow_methods("Article", ["getTitle"]),
    ))
    .expect("registry is open");
    assert_eq!(
        security_error(&env, "prop.txt").to_string(),
        "Calling \"title\" property on a \"Article\" object is not allowed in \"prop.txt\" at line 1."
    );
}

#[test]
#[ntest::timeout(1000)]
fn test_sandbox_tag_only_applies_to_its_includes() {
    let mut env = env_with(&[
        ("page.txt", "{{ 'a'|lower }}{% sandbox %}{% include 'inner.txt' %}{% endsandbox %}"),
        ("inner.txt", "{{ 'b'|lower }}"),
        ("safe.txt", "{% sandbox %}{% include 'ok.txt' %}{% endsandbox %}{{ 'C'|lower }}"),
        ("ok.txt", "{{ 'b'|upper }}"),
    ]);
    env.add_extension(SandboxExtension::new(policy()))
        .expect("registry is open");

    assert_eq!(
        env.render("safe.txt", Context::new()).expect("renders"),
        "Bc",
        "the host template is not sandboxed"
    );
    let error = env.render("page.txt", Context::new()).expect_err("inner uses lower");
    assert_eq!(
        error.to_string(),
        "Filter \"lower\" is not allowed in \"inner.txt\" at line 1."
    );
}

#[test]
#[ntest::timeout(1000)]
fn test_sandbox_tag_only_holds_includes() {
    let mut env = env_with(&[("page.txt", "{% sandbox %}text{% endsandbox %}")]);
    env.add_extension(SandboxExtension::new(policy()))
        .expect("registry is open");
    let error = env.render("page.txt", Context::new()).expect_err("text is not an include");
    assert!(
        error
            .to_string()
            .starts_with("Only \"include\" tags are allowed within a \"sandbox\" section"),
        "unexpected message: {error}"
    );
}

#[test]
#[ntest::timeout(1000)]
fn test_sandboxed_include_function() {
    let mut env = env_with(&[
        ("page.txt", "{{ include('inner.txt', sandboxed=true) }}"),
        ("inner.txt", "{{ 'b'|lower }}"),
    ]);
    env.add_extension(SandboxExtension::new(
        AllowListPolicy::new().allow_functions(["include"]),
    ))
    .expect("registry is open");
    let error = env.render("page.txt", Context::new()).expect_err("inner uses lower");
    assert!(matches!(error, Error::Security(_)), "unexpected error: {error:?}");
}
