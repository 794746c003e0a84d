mod fixtures;

use fixtures::{env_with, render_error, render_text};
use twiglet::{Context, Error};

const FORMS: &str = "{% macro input(name, value = '', type = 'text') %}\
<input type=\"{{ type }}\" name=\"{{ name }}\" value=\"{{ value }}\">\
{% endmacro %}\
{% macro label(text) %}<label>{{ text }}</label>{% endmacro %}";

#[test]
#[ntest::timeout(1000)]
fn test_macro_defaults_and_named_arguments() {
    let env = env_with(&[
        ("forms.html", FORMS),
        (
            "page.html",
            "{% import 'forms.html' as forms %}{{ forms.input('q') }}|{{ forms.input('pw', type='password') }}",
        ),
    ]);
    assert_eq!(
        env.render("page.html", Context::new()).expect("renders"),
        "<input type=\"text\" name=\"q\" value=\"\">|<input type=\"password\" name=\"pw\" value=\"\">",
        "macro output is markup and is not escaped again"
    );
}

#[test]
#[ntest::timeout(1000)]
fn test_macro_arguments_are_escaped_inside_the_macro() {
    let env = env_with(&[
        ("forms.html", FORMS),
        ("page.html", "{% from 'forms.html' import label %}{{ label(text) }}"),
    ]);
    let mut context = Context::new();
    context.insert("text", "<Name>");
    assert_eq!(
        env.render("page.html", context).expect("renders"),
        "<label>&lt;Name&gt;</label>",
        "values are escaped once, inside the macro"
    );
}

#[test]
#[ntest::timeout(1000)]
fn test_from_import_with_alias() {
    let env = env_with(&[
        ("forms.html", FORMS),
        (
            "page.txt",
            "{% from 'forms.html' import input as field, label %}{{ field('a', 'b') }}{{ label('c') }}",
        ),
    ]);
    assert_eq!(
        env.render("page.txt", Context::new()).expect("renders"),
        "<input type=\"text\" name=\"a\" value=\"b\"><label>c</label>"
    );
}

#[test]
#[ntest::timeout(1000)]
fn test_macros_from_the_same_template() {
    let code = "{% macro hello(name) %}Hello {{ name }}{% endmacro %}\
                {{ hello('direct') }}|{% import _self as me %}{{ me.hello('imported') }}|{{ _self.hello('self') }}";
    assert_eq!(
        render_text(code, Context::new()),
        "Hello direct|Hello imported|Hello self"
    );
}

#[test]
#[ntest::timeout(1000)]
fn test_macro_scope_is_isolated() {
    let code = "{% macro show() %}[{{ outside }}][{{ site }}]{% endmacro %}{{ show() }}";
    let mut env = env_with(&[("test.txt", code)]);
    env.add_global("site", "global").expect("registry is open");

    let mut context = Context::new();
    context.insert("outside", "hidden");
    assert_eq!(
        env.render("test.txt", context).expect("renders"),
        "[][global]",
        "macros only see globals and their arguments"
    );
}

#[test]
#[ntest::timeout(1000)]
fn test_macro_varargs() {
    let code = "{% macro list() %}{{ varargs|join(',') }}{% endmacro %}{{ list(1, 2, 3) }}";
    assert_eq!(render_text(code, Context::new()), "1,2,3", "extra arguments land in varargs");
}

#[test]
#[ntest::timeout(1000)]
fn test_macro_recursion() {
    let code = "{% macro countdown(n) %}{{ n }}{% if n > 0 %} {{ _self.countdown(n - 1) }}{% endif %}{% endmacro %}{{ _self.countdown(3) }}";
    assert_eq!(render_text(code, Context::new()), "3 2 1 0");
}

#[test]
#[ntest::timeout(1000)]
fn test_empty_macro_output_is_empty_string() {
    let code = "{% macro nothing() %}{% endmacro %}{{ nothing() is same as('') ? 'empty' : 'other' }}";
    assert_eq!(render_text(code, Context::new()), "empty");
}

#[test]
#[ntest::timeout(1000)]
fn test_macro_argument_errors() {
    let error = render_error(
        "{% macro m(a) %}{{ a }}{% endmacro %}{{ m(1, a=2) }}",
        Context::new(),
    );
    assert!(matches!(error, Error::Runtime(_)), "bad calls fail while rendering");
    assert_eq!(
        error.to_string(),
        "Argument \"a\" is defined twice for macro \"m\" in \"test.html\" at line 1."
    );

    let error = render_error(
        "{% macro m(a) %}{{ a }}{% endmacro %}{{ m(b=2) }}",
        Context::new(),
    );
    assert!(
        error.to_string().starts_with("Unknown argument \"b\" for macro \"m\""),
        "unexpected message: {error}"
    );
}

#[test]
#[ntest::timeout(1000)]
fn test_missing_macro_in_imported_template() {
    let env = env_with(&[
        ("forms.html", FORMS),
        ("page.html", "{% import 'forms.html' as forms %}{{ forms.textarea() }}"),
    ]);
    let error = env.render("page.html", Context::new()).expect_err("textarea is not defined");
    assert!(
        error.to_string().contains("Macro \"textarea\" is not defined in template \"forms.html\""),
        "unexpected message: {error}"
    );
}

#[test]
#[ntest::timeout(1000)]
fn test_macro_has_macro_introspection() {
    let env = env_with(&[("forms.html", FORMS)]);
    let template = env.load_template("forms.html").expect("loads");
    assert!(template.has_macro("input"), "input is declared");
    assert!(!template.has_macro("textarea"), "textarea is not");
    let mut names = template.macro_names();
    names.sort_unstable();
    assert_eq!(names, ["input", "label"]);
}

#[test]
#[ntest::timeout(1000)]
fn test_imported_macro_defined_check() {
    let env = env_with(&[
        ("forms.html", FORMS),
        (
            "page.html",
            "{% import 'forms.html' as forms %}{{ forms.input is defined ? 'y' : 'n' }}{{ forms.nope is defined ? 'y' : 'n' }}",
        ),
    ]);
    assert_eq!(env.render("page.html", Context::new()).expect("renders"), "yn");
}

#[test]
#[ntest::timeout(1000)]
fn test_macro_definition_errors() {
    let error = render_error("{% macro m(varargs) %}{% endmacro %}", Context::new());
    let Error::Syntax(e) = &error else {
        panic!("expected a syntax error, got {error:?}");
    };
    assert_eq!(
        e.message(),
        "The argument \"varargs\" in macro \"m\" cannot be defined because the variable \"varargs\" is reserved for arbitrary arguments."
    );

    let error = render_error("{% macro m(a = x) %}{% endmacro %}", Context::new());
    let Error::Syntax(e) = &error else {
        panic!("expected a syntax error, got {error:?}");
    };
    assert_eq!(
        e.message(),
        "A default value for an argument must be a constant (a boolean, a string, a number, a sequence, or a mapping)."
    );
}
