mod fixtures;

use fixtures::{
    env_with, generate_random_whitespace, generate_random_whitespace_at_least_one, render,
    render_error, render_text,
};
use twiglet::{Context, Error, Source};

fn syntax_message(error: &Error) -> &str {
    let Error::Syntax(e) = error else {
        panic!("expected a syntax error, got {error:?}");
    };
    e.message()
}

#[test]
#[ntest::timeout(1000)]
fn test_basic_substitution() {
    let mut context = Context::new();
    context.insert("name", "Jessica");

    assert_eq!(
        render("Hello, {{ name }}!", context),
        "Hello, Jessica!",
        "Rendered string should match the template."
    );
}

#[test]
#[ntest::timeout(1000)]
fn test_random_whitespace_inside_delimiters() {
    let template = format!(
        "{{%{}for{}cat{}in{}cats{}%}}Greetings {{{{{}cat{}}}}}\n{{%{}endfor{}%}}",
        generate_random_whitespace(),
        generate_random_whitespace_at_least_one(),
        generate_random_whitespace_at_least_one(),
        generate_random_whitespace_at_least_one(),
        generate_random_whitespace(),
        generate_random_whitespace(),
        generate_random_whitespace(),
        generate_random_whitespace(),
        generate_random_whitespace(),
    );

    let mut context = Context::new();
    context.insert("cats", vec!["Fluffy", "Whiskers"]);

    assert_eq!(
        render(&template, context),
        "Greetings Fluffy\nGreetings Whiskers\n",
        "whitespace inside delimiters must not matter, template was {template:?}"
    );
}

#[test]
#[ntest::timeout(1000)]
fn test_newline_after_block_tag_is_removed() {
    let output = render_text("{% if true %}\nyes\n{% endif %}\ndone", Context::new());
    assert_eq!(output, "yes\ndone", "the first newline after a block tag belongs to the tag");
}

#[test]
#[ntest::timeout(1000)]
fn test_whitespace_trim_modifiers() {
    assert_eq!(
        render_text("a  \n {{- 'b' -}} \n  c", Context::new()),
        "abc",
        "'-' trims all whitespace on its side"
    );
    assert_eq!(
        render_text("x\n  {{~ 'y' }}", Context::new()),
        "x\ny",
        "'~' trims spaces but keeps the newline"
    );
    assert_eq!(
        render_text("<li>\n    {%- if true -%}\n  ok\n  {%- endif -%}\n</li>", Context::new()),
        "<li>ok</li>",
        "trim modifiers work on block tags too"
    );
}

#[test]
#[ntest::timeout(1000)]
fn test_comments_are_dropped() {
    assert_eq!(
        render_text("a{# hidden {{ x }} #}b", Context::new()),
        "ab",
        "comments produce no output"
    );
}

#[test]
#[ntest::timeout(1000)]
fn test_verbatim_keeps_template_syntax() {
    assert_eq!(
        render_text("{% verbatim %}{{ not_a_var }}{% if %}{% endverbatim %}", Context::new()),
        "{{ not_a_var }}{% if %}",
        "verbatim content is printed as is"
    );
}

#[test]
#[ntest::timeout(1000)]
fn test_string_interpolation() {
    let mut context = Context::new();
    context.insert("name", "world");

    assert_eq!(
        render_text(r#"{{ "hello #{name|upper}!" }}"#, context),
        "hello WORLD!",
        "double quoted strings interpolate expressions"
    );
    assert_eq!(
        render_text("{{ 'hello #{name}' }}", Context::new()),
        "hello #{name}",
        "single quoted strings do not interpolate"
    );
}

#[test]
#[ntest::timeout(1000)]
fn test_tokenize_reports_lines() {
    let env = env_with(&[]);
    let stream = env
        .tokenize(&Source::new("line one\n{{ a }}\n{% if b %}{% endif %}", "lines.html"))
        .expect("the source is valid");
    assert_eq!(stream.source().name(), "lines.html", "the stream keeps its source");
    let line_of = |value: &str| {
        stream
            .tokens()
            .iter()
            .find(|token| token.value() == value)
            .map(|token| token.line())
    };
    assert_eq!(line_of("a"), Some(2), "'a' is on the second line");
    assert_eq!(line_of("b"), Some(3), "'b' is on the third line");
}

#[test]
#[ntest::timeout(1000)]
fn test_unclosed_variable() {
    let error = render_error("Hello {{ name", Context::new());
    assert_eq!(syntax_message(&error), "Unclosed \"variable\".");
    assert_eq!(error.template_name(), Some("test.html"), "error is located in the template");
    assert_eq!(error.line(), Some(1), "error points at the opening line");
}

#[test]
#[ntest::timeout(1000)]
fn test_unclosed_comment() {
    let error = render_error("a\n{# never closed", Context::new());
    assert_eq!(syntax_message(&error), "Unclosed comment.");
}

#[test]
#[ntest::timeout(1000)]
fn test_unexpected_character() {
    let error = render_error("{{ a $ b }}", Context::new());
    assert_eq!(syntax_message(&error), "Unexpected character \"$\".");
}

#[test]
#[ntest::timeout(1000)]
fn test_unclosed_bracket() {
    let error = render_error("{{ (a + b }}", Context::new());
    assert_eq!(syntax_message(&error), "Unclosed \"(\".");
}

#[test]
#[ntest::timeout(1000)]
fn test_unknown_tag_suggests_alternatives() {
    let error = render_error("{% fi x %}", Context::new());
    assert_eq!(syntax_message(&error), "Unknown \"fi\" tag. Did you mean \"if\"?");
    assert_eq!(
        error.to_string(),
        "Unknown \"fi\" tag. Did you mean \"if\" in \"test.html\" at line 1?",
        "location goes before the final punctuation"
    );
}

#[test]
#[ntest::timeout(1000)]
fn test_unknown_filter_suggests_alternatives() {
    let error = render_error("{{ name|uper }}", Context::new());
    assert_eq!(syntax_message(&error), "Unknown \"uper\" filter. Did you mean \"upper\"?");
}

#[test]
#[ntest::timeout(1000)]
fn test_unknown_function() {
    let error = render_error("{{ nope() }}", Context::new());
    assert!(
        syntax_message(&error).starts_with("Unknown \"nope\" function."),
        "unexpected message: {error}"
    );
}

#[test]
#[ntest::timeout(1000)]
fn test_missing_end_tag() {
    let error = render_error("{% for x in items %}\n{{ x }}", Context::new());
    assert_eq!(
        syntax_message(&error),
        "Unexpected end of template (expecting closing tag for the \"for\" tag defined near line 1)."
    );
}

#[test]
#[ntest::timeout(1000)]
fn test_duplicate_block() {
    let error = render_error(
        "{% block a %}{% endblock %}\n{% block a %}{% endblock %}",
        Context::new(),
    );
    assert_eq!(
        syntax_message(&error),
        "The block 'a' has already been defined line 1."
    );
    assert_eq!(error.line(), Some(2), "the second definition is reported");
}

#[test]
#[ntest::timeout(1000)]
fn test_content_outside_blocks_in_child_template() {
    let env = env_with(&[
        ("base.html", "{% block body %}{% endblock %}"),
        ("child.html", "{% extends 'base.html' %}stray text"),
    ]);
    let error = env.render("child.html", Context::new()).expect_err("stray content is rejected");
    assert_eq!(
        syntax_message(&error),
        "A template that extends another one cannot include content outside Twig blocks. Did you forget to put the content inside a {% block %} tag?"
    );
}

#[test]
#[ntest::timeout(1000)]
fn test_whitespace_outside_blocks_in_child_template_is_fine() {
    let env = env_with(&[
        ("base.html", "[{% block body %}{% endblock %}]"),
        ("child.html", "{% extends 'base.html' %}\n\n{% block body %}ok{% endblock %}\n"),
    ]);
    assert_eq!(
        env.render("child.html", Context::new()).expect("whitespace is allowed"),
        "[ok]",
        "child blocks replace the parent's"
    );
}

#[test]
#[ntest::timeout(1000)]
fn test_multiple_extends_are_rejected() {
    let error = render_error("{% extends 'a.html' %}{% extends 'b.html' %}", Context::new());
    assert_eq!(syntax_message(&error), "Multiple extends tags are forbidden.");
}

#[test]
#[ntest::timeout(1000)]
fn test_parent_outside_block() {
    let error = render_error("{{ parent() }}", Context::new());
    assert_eq!(
        syntax_message(&error),
        "Calling the \"parent\" function outside of a block is forbidden."
    );
}

#[test]
#[ntest::timeout(1000)]
fn test_cannot_assign_to_reserved_names() {
    let error = render_error("{% set true = 1 %}", Context::new());
    assert_eq!(syntax_message(&error), "You cannot assign a value to \"true\".");
}

#[test]
#[ntest::timeout(1000)]
fn test_set_arity_must_match() {
    let error = render_error("{% set a, b = 1 %}", Context::new());
    assert_eq!(
        syntax_message(&error),
        "When using set, you must have the same number of variables and assignments."
    );
}

#[test]
#[ntest::timeout(1000)]
fn test_line_directive_moves_line_numbers() {
    let mut options = twiglet::EnvironmentOptions::default();
    options.strict_variables = true;
    let env = fixtures::env_with_options(&[("test.txt", "{% line 40 %}\n\n{{ missing }}")], options);
    let error = env.render("test.txt", Context::new()).expect_err("missing is undefined");
    assert_eq!(error.line(), Some(42), "line numbers continue from the directive");
}

#[test]
#[ntest::timeout(1000)]
fn test_unclosed_string() {
    let error = render_error("{{ 'foo }}", Context::new());
    assert_eq!(syntax_message(&error), "Unclosed \"'\".");
}

#[test]
#[ntest::timeout(1000)]
fn test_unclosed_verbatim() {
    let error = render_error("{% verbatim %}{{ kept }}", Context::new());
    assert_eq!(
        syntax_message(&error),
        "Unexpected end of file: Unclosed \"verbatim\" block."
    );
}

#[test]
#[ntest::timeout(1000)]
fn test_mapping_mixes_keys_and_values() {
    let error = render_error("{{ {a: 1, 2} }}", Context::new());
    assert_eq!(
        syntax_message(&error),
        "A mapping key must be followed by a colon (:). Unexpected token \"punctuation\" of value \"}\" (\"punctuation\" expected with value \":\")."
    );
}

#[test]
#[ntest::timeout(1000)]
fn test_deeply_nested_expression() {
    let depth = 1000;
    let code = format!("{{{{ {}1{} }}}}", "(".repeat(depth), ")".repeat(depth));
    let error = render_error(&code, Context::new());
    assert!(
        syntax_message(&error).starts_with("Expression is nested too deeply"),
        "unexpected message: {error}"
    );
    assert_eq!(error.line(), Some(1));

    let code = format!("{{{{ {}1{} }}}}", "(".repeat(20), ")".repeat(20));
    assert_eq!(render(&code, Context::new()), "1", "moderate nesting still parses");

    let code = format!("{{{{ {}1 }}}}", "- ".repeat(depth));
    let error = render_error(&code, Context::new());
    assert!(
        syntax_message(&error).starts_with("Expression is nested too deeply"),
        "unary chains are bounded too: {error}"
    );
}
