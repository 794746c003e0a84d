mod fixtures;

use fixtures::{env_with, env_with_options, render, render_error, render_text};
use twiglet::{guess_strategy, Autoescape, Context, EnvironmentOptions, Value};

fn named(value: &str) -> Context {
    let mut context = Context::new();
    context.insert("name", value);
    context
}

#[test]
#[ntest::timeout(1000)]
fn test_strategy_follows_the_template_name() {
    let env = env_with(&[
        ("page.html", "{{ name }}"),
        ("page.html.twig", "{{ name }}"),
        ("app.js", "{{ name }}"),
        ("notes.txt", "{{ name }}"),
    ]);
    assert_eq!(env.render("page.html", named("<a&b>")).expect("renders"), "&lt;a&amp;b&gt;");
    assert_eq!(
        env.render("page.html.twig", named("<a>")).expect("renders"),
        "&lt;a&gt;",
        "a trailing .twig is ignored"
    );
    assert_eq!(
        env.render("app.js", named("a b")).expect("renders"),
        "a\\u0020b"
    );
    assert_eq!(env.render("notes.txt", named("<a>")).expect("renders"), "<a>", "txt is not escaped");

    assert_eq!(guess_strategy("style.css").as_deref(), Some("css"));
    assert_eq!(guess_strategy("dir/").as_deref(), Some("html"));
}

#[test]
#[ntest::timeout(1000)]
fn test_html_escapes_quotes() {
    assert_eq!(
        render("{{ name }}", named("\"it's\"")),
        "&quot;it&#039;s&quot;"
    );
}

#[test]
#[ntest::timeout(1000)]
fn test_autoescape_tag() {
    let code = "{% autoescape 'js' %}{{ name }}{% endautoescape %}|\
                {% autoescape false %}{{ name }}{% endautoescape %}|\
                {% autoescape %}{{ name }}{% endautoescape %}";
    assert_eq!(
        render_text(code, named("<x>")),
        "\\u003Cx\\u003E|<x>|&lt;x&gt;",
        "the innermost tag picks the strategy"
    );

    let error = render_error("{% autoescape 1 + 1 %}{% endautoescape %}", Context::new());
    assert!(
        error.to_string().starts_with("An escaping strategy must be a string or false"),
        "unexpected message: {error}"
    );
}

#[test]
#[ntest::timeout(1000)]
fn test_escape_filter_strategies() {
    assert_eq!(render_text("{{ 'a&b c'|e('url') }}", Context::new()), "a%26b%20c");
    assert_eq!(render_text("{{ 'a b'|e('css') }}", Context::new()), "a\\20 b");
    assert_eq!(
        render_text("{{ 'x=\"1\" y'|escape('html_attr') }}", Context::new()),
        "x&#x3D;&quot;1&quot;&#x20;y"
    );
    assert_eq!(render_text("{{ 'é/'|e('js') }}", Context::new()), "\\u00E9\\/");
    assert_eq!(render_text("{{ 42|e }}", Context::new()), "42", "numbers are left alone");
}

#[test]
#[ntest::timeout(1000)]
fn test_no_double_escaping() {
    assert_eq!(
        render("{{ name|e }}|{{ name|escape('html') }}", named("<b>")),
        "&lt;b&gt;|&lt;b&gt;",
        "an explicit html escape is not escaped again"
    );
    assert_eq!(render("{{ name|raw }}", named("<b>")), "<b>");
    assert_eq!(
        render("{{ '<br>' }}", Context::new()),
        "<br>",
        "constants are trusted"
    );
}

#[test]
#[ntest::timeout(1000)]
fn test_conditionals_escape_only_unsafe_branches() {
    let code = "{{ flag ? '<hr>' : name }}";

    let mut context = named("<i>");
    context.insert("flag", true);
    assert_eq!(render(code, context), "<hr>");

    let mut context = named("<i>");
    context.insert("flag", false);
    assert_eq!(render(code, context), "&lt;i&gt;");
}

#[test]
#[ntest::timeout(1000)]
fn test_markup_values() {
    let mut context = Context::new();
    context.insert("html", Value::markup("<em>hi</em>"));
    assert_eq!(
        render("{{ html }}|{{ html|e }}", context),
        "<em>hi</em>|&lt;em&gt;hi&lt;/em&gt;",
        "autoescaping trusts markup while an explicit escape does not"
    );
}

#[test]
#[ntest::timeout(1000)]
fn test_custom_escaper() {
    let mut env = env_with(&[("test.txt", "{{ name|e('shout') }}")]);
    env.set_escaper("shout", |text, _charset| Ok(text.to_uppercase()));
    assert_eq!(env.render("test.txt", named("hey")).expect("renders"), "HEY");
}

#[test]
#[ntest::timeout(1000)]
fn test_invalid_strategy() {
    let error = render_error("{{ 'x'|e('nope') }}", Context::new());
    assert!(
        error
            .to_string()
            .starts_with("Invalid escaping strategy \"nope\" (valid ones: html, js, url, css, html_attr"),
        "unexpected message: {error}"
    );
    assert_eq!(error.line(), Some(1));
}

#[test]
#[ntest::timeout(1000)]
fn test_unsupported_charset() {
    let error = render_error("{{ 'x'|e('html', 'ISO-8859-1') }}", Context::new());
    assert!(
        error.to_string().contains("Unsupported charset \"ISO-8859-1\""),
        "unexpected message: {error}"
    );
}

#[test]
#[ntest::timeout(1000)]
fn test_autoescape_options() {
    let options = EnvironmentOptions {
        autoescape: Autoescape::Disabled,
        ..EnvironmentOptions::default()
    };
    let env = env_with_options(&[("page.html", "{{ name }}")], options);
    assert_eq!(env.render("page.html", named("<a>")).expect("renders"), "<a>");

    let options = EnvironmentOptions {
        autoescape: Autoescape::Strategy("url".to_owned()),
        ..EnvironmentOptions::default()
    };
    let env = env_with_options(&[("notes.txt", "{{ name }}")], options);
    assert_eq!(
        env.render("notes.txt", named("a b")).expect("renders"),
        "a%20b",
        "one strategy for every template"
    );
}

#[test]
#[ntest::timeout(1000)]
fn test_autoescape_callback() {
    let mut env = env_with(&[("page.html", "{{ name }}"), ("raw.html", "{{ name }}")]);
    env.set_autoescape_callback(|name| (name != "raw.html").then(|| "css".to_owned()));
    assert_eq!(env.render("page.html", named("a b")).expect("renders"), "a\\20 b");
    assert_eq!(env.render("raw.html", named("a b")).expect("renders"), "a b");
    assert_eq!(env.default_escaping_strategy("x.txt").as_deref(), Some("css"));
}
