mod fixtures;

use fixtures::env_with;
use twiglet::{Context, Error};

const BASE: &str = "<title>{% block title %}Default{% endblock %}</title>\
<main>{% block content %}{% endblock %}</main>\
<footer>{% block footer %}(c) {{ year }}{% endblock %}</footer>";

fn year() -> Context {
    let mut context = Context::new();
    context.insert("year", 2024);
    context
}

#[test]
#[ntest::timeout(1000)]
fn test_child_overrides_blocks() {
    let env = env_with(&[
        ("base.html", BASE),
        (
            "page.html",
            "{% extends 'base.html' %}{% block title %}Page{% endblock %}{% block content %}Body{% endblock %}",
        ),
    ]);
    assert_eq!(
        env.render("page.html", year()).expect("renders"),
        "<title>Page</title><main>Body</main><footer>(c) 2024</footer>",
        "blocks not overridden keep the parent's content"
    );
}

#[test]
#[ntest::timeout(1000)]
fn test_parent_function() {
    let env = env_with(&[
        ("base.html", BASE),
        (
            "page.html",
            "{% extends 'base.html' %}{% block title %}Page - {{ parent() }}{% endblock %}",
        ),
    ]);
    assert_eq!(
        env.render("page.html", year()).expect("renders"),
        "<title>Page - Default</title><main></main><footer>(c) 2024</footer>"
    );
}

#[test]
#[ntest::timeout(1000)]
fn test_three_level_inheritance() {
    let env = env_with(&[
        ("base.html", BASE),
        (
            "layout.html",
            "{% extends 'base.html' %}{% block content %}<div>{% block inner %}layout{% endblock %}</div>{% endblock %}",
        ),
        (
            "page.html",
            "{% extends 'layout.html' %}{% block inner %}{{ parent() }}+page{% endblock %}{% block title %}T{% endblock %}",
        ),
    ]);
    assert_eq!(
        env.render("page.html", year()).expect("renders"),
        "<title>T</title><main><div>layout+page</div></main><footer>(c) 2024</footer>"
    );
}

#[test]
#[ntest::timeout(1000)]
fn test_dynamic_parent() {
    let env = env_with(&[
        ("a.html", "A[{% block body %}{% endblock %}]"),
        ("b.html", "B[{% block body %}{% endblock %}]"),
        (
            "page.html",
            "{% extends layout ? 'a.html' : 'b.html' %}{% block body %}x{% endblock %}",
        ),
        (
            "list.html",
            "{% extends ['missing.html', 'b.html'] %}{% block body %}y{% endblock %}",
        ),
    ]);

    let mut context = Context::new();
    context.insert("layout", true);
    assert_eq!(env.render("page.html", context).expect("renders"), "A[x]");
    assert_eq!(env.render("page.html", Context::new()).expect("renders"), "B[x]");
    assert_eq!(
        env.render("list.html", Context::new()).expect("renders"),
        "B[y]",
        "the first existing template of a list is the parent"
    );
}

#[test]
#[ntest::timeout(1000)]
fn test_block_function_and_defined_blocks() {
    let env = env_with(&[(
        "test.html",
        "{% block a %}A{% endblock %}|{{ block('a') }}|{{ block('nope') is defined ? 'y' : 'n' }}|{{ block('a') is defined ? 'y' : 'n' }}",
    )]);
    assert_eq!(env.render("test.html", Context::new()).expect("renders"), "A|A|n|y");
}

#[test]
#[ntest::timeout(1000)]
fn test_blocks_see_the_render_context() {
    let env = env_with(&[
        ("base.html", "{% for item in items %}{% block row %}{{ item }}{% endblock %}{% endfor %}"),
        ("page.html", "{% extends 'base.html' %}{% block row %}<{{ item }}>{% endblock %}"),
    ]);
    let mut context = Context::new();
    context.insert("items", vec!["a", "b"]);
    assert_eq!(
        env.render("page.html", context).expect("renders"),
        "<a><b>",
        "block bodies run with the loop variables in scope"
    );
}

#[test]
#[ntest::timeout(1000)]
fn test_inheritance_cycle_is_reported() {
    let env = env_with(&[
        ("a.html", "{% extends 'b.html' %}"),
        ("b.html", "{% extends 'a.html' %}"),
    ]);
    let error = env.render("a.html", Context::new()).expect_err("a and b extend each other");
    assert!(
        error
            .to_string()
            .contains("Circular template inheritance detected (\"a.html\" -> \"b.html\" -> \"a.html\")"),
        "unexpected message: {error}"
    );
}

#[test]
#[ntest::timeout(1000)]
fn test_missing_parent() {
    let env = env_with(&[("page.html", "{% extends 'ghost.html' %}")]);
    let error = env.render("page.html", Context::new()).expect_err("the parent is missing");
    assert!(matches!(error, Error::Loader(_)), "missing templates are loader errors");
    assert!(
        error.to_string().contains("Template \"ghost.html\" is not defined"),
        "unexpected message: {error}"
    );
}

#[test]
#[ntest::timeout(1000)]
fn test_render_block_and_introspection() {
    let env = env_with(&[
        ("base.html", BASE),
        (
            "page.html",
            "{% extends 'base.html' %}{% block title %}Page {{ name }}{% endblock %}",
        ),
    ]);
    let template = env.load_template("page.html").expect("loads");

    assert!(template.has_block("title"), "own block");
    assert!(template.has_block("footer"), "inherited block");
    assert!(!template.has_block("sidebar"), "unknown block");
    let mut names = template.block_names();
    names.sort_unstable();
    assert_eq!(names, ["title"], "only blocks declared by the template itself");

    let mut context = Context::new();
    context.insert("name", "<x>");
    assert_eq!(
        template.render_block(&env, "title", context).expect("renders"),
        "Page &lt;x&gt;",
        "a single block can be rendered"
    );
}

#[test]
#[ntest::timeout(1000)]
fn test_use_imports_trait_blocks() {
    let env = env_with(&[
        ("traits.html", "{% block greeting %}Hello{% endblock %}{% block farewell %}Bye{% endblock %}"),
        (
            "page.html",
            "{% use 'traits.html' %}{% use 'traits.html' with farewell as goodbye %}\
             {{ block('greeting') }} {{ block('goodbye') }}",
        ),
        (
            "override.html",
            "{% use 'traits.html' %}{% block greeting %}{{ parent() }} there{% endblock %}",
        ),
    ]);
    assert_eq!(env.render("page.html", Context::new()).expect("renders"), "Hello Bye");
    assert_eq!(
        env.render("override.html", Context::new()).expect("renders"),
        "Hello there",
        "parent() reaches the trait's block"
    );
}

#[test]
#[ntest::timeout(1000)]
fn test_use_rejects_templates_with_body() {
    let env = env_with(&[
        ("traits.html", "text outside blocks"),
        ("page.html", "{% use 'traits.html' %}"),
    ]);
    let error = env.render("page.html", Context::new()).expect_err("not a trait");
    assert!(
        error.to_string().contains("cannot be used as a trait"),
        "unexpected message: {error}"
    );
}

#[test]
#[ntest::timeout(1000)]
fn test_include() {
    let env = env_with(&[
        ("partial.html", "[{{ name }}{{ extra }}]"),
        (
            "page.html",
            "{% include 'partial.html' %}\
             {% include 'partial.html' with {'extra': '!'} %}\
             {% include 'partial.html' with {'extra': '?'} only %}\
             {% include 'missing.html' ignore missing %}\
             {% include ['missing.html', 'partial.html'] %}",
        ),
    ]);
    let mut context = Context::new();
    context.insert("name", "n");
    assert_eq!(
        env.render("page.html", context).expect("renders"),
        "[n][n!][?][n]",
        "include passes the context unless told otherwise"
    );
}

#[test]
#[ntest::timeout(1000)]
fn test_include_function() {
    let env = env_with(&[
        ("partial.html", "<b>{{ name }}</b>"),
        (
            "page.html",
            "{{ include('partial.html', {'name': '<i>'}) }}|{{ include('partial.html', with_context=false) }}|{{ include('nope.html', ignore_missing=true) }}",
        ),
    ]);
    let mut context = Context::new();
    context.insert("name", "ctx");
    assert_eq!(
        env.render("page.html", context).expect("renders"),
        "<b>&lt;i&gt;</b>|<b></b>|",
        "the include function returns safe markup"
    );
}

#[test]
#[ntest::timeout(1000)]
fn test_include_missing_template_fails() {
    let env = env_with(&[("page.html", "{% include 'ghost.html' %}")]);
    let error = env.render("page.html", Context::new()).expect_err("ghost is missing");
    assert!(matches!(error, Error::Loader(_)), "missing includes are loader errors");
}

#[test]
#[ntest::timeout(1000)]
fn test_embed() {
    let env = env_with(&[
        ("card.html", "<div class=\"card\">{% block header %}Header{% endblock %}|{% block body %}{% endblock %}</div>"),
        (
            "page.html",
            "{% embed 'card.html' %}{% block body %}Hi {{ name }}{% endblock %}{% endembed %}\
             {% embed 'card.html' with {'name': 'B'} only %}{% block header %}{{ parent() }}!{% endblock %}{% endembed %}",
        ),
    ]);
    let mut context = Context::new();
    context.insert("name", "A");
    assert_eq!(
        env.render("page.html", context).expect("renders"),
        "<div class=\"card\">Header|Hi A</div><div class=\"card\">Header!|</div>"
    );
}

#[test]
#[ntest::timeout(1000)]
fn test_resolve_template() {
    let env = env_with(&[("b.html", "B")]);
    let template = env
        .resolve_template(&["a.html", "b.html"])
        .expect("b.html exists");
    assert_eq!(template.name(), "b.html");

    let error = env
        .resolve_template(&["x.html", "y.html"])
        .expect_err("neither exists");
    assert_eq!(
        error.to_string(),
        "Unable to find one of the following templates: \"x.html\", \"y.html\"."
    );
}

#[test]
#[ntest::timeout(1000)]
fn test_use_renaming_a_missing_block() {
    let env = env_with(&[
        ("traits.html", "{% block greeting %}Hello{% endblock %}"),
        ("page.html", "{% use 'traits.html' with missing as x %}"),
    ]);
    let error = env.render("page.html", Context::new()).expect_err("no such block");
    assert!(matches!(error, Error::Runtime(_)), "unexpected error: {error:?}");
    assert!(
        error
            .to_string()
            .starts_with("Block \"missing\" is not defined in trait \"traits.html\""),
        "unexpected message: {error}"
    );
    assert_eq!(error.template_name(), Some("page.html"));
}
