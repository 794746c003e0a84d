mod fixtures;

use fixtures::{env_with, env_with_options, render_error, render_text};
use serde_json::json;
use twiglet::{Callable, Context, EnvironmentOptions, Error, Value};

fn user_context() -> Context {
    Context::from(json!({
        "user": { "name": "Ada", "age": 36, "tags": ["math", "engines"] },
        "items": [3, 1, 2],
        "empty": [],
        "nothing": null,
    }))
}

#[test]
#[ntest::timeout(1000)]
fn test_arithmetic_and_precedence() {
    let cases = [
        ("{{ 1 + 2 * 3 }}", "7"),
        ("{{ (1 + 2) * 3 }}", "9"),
        ("{{ 2 ** 3 ** 2 }}", "512"),
        ("{{ 7 / 2 }}", "3.5"),
        ("{{ 6 / 2 }}", "3"),
        ("{{ 7 // 2 }}", "3"),
        ("{{ -7 // 2 }}", "-4"),
        ("{{ 7 % 3 }}", "1"),
        ("{{ -3 + 5 }}", "2"),
        ("{{ '3' + 4 }}", "7"),
        ("{{ 5 b-and 3 }}{{ 5 b-or 3 }}{{ 5 b-xor 3 }}", "176"),
    ];
    for (code, expected) in cases {
        assert_eq!(render_text(code, Context::new()), expected, "evaluating {code}");
    }
}

#[test]
#[ntest::timeout(1000)]
fn test_logic_and_comparisons() {
    let cases = [
        ("{{ true and false ? 'y' : 'n' }}", "n"),
        ("{{ true or false ? 'y' : 'n' }}", "y"),
        ("{{ true xor true ? 'y' : 'n' }}", "n"),
        ("{{ not false ? 'y' : 'n' }}", "y"),
        ("{{ '10' == 10 ? 'y' : 'n' }}", "y"),
        ("{{ 'abc' != 'abd' ? 'y' : 'n' }}", "y"),
        ("{{ 2 < 10 ? 'y' : 'n' }}", "y"),
        ("{{ 'b' > 'a' ? 'y' : 'n' }}", "y"),
        ("{{ 1 <=> 2 }}", "-1"),
        ("{{ 2 in [1, 2] ? 'y' : 'n' }}", "y"),
        ("{{ 'ell' in 'hello' ? 'y' : 'n' }}", "y"),
        ("{{ 3 not in [1, 2] ? 'y' : 'n' }}", "y"),
        ("{{ 'abc123' matches '/^[a-z]+[0-9]+$/' ? 'y' : 'n' }}", "y"),
        ("{{ 'Twig' matches '/twig/i' ? 'y' : 'n' }}", "y"),
        ("{{ 'hello' starts with 'he' ? 'y' : 'n' }}", "y"),
        ("{{ 'hello' ends with 'lo' ? 'y' : 'n' }}", "y"),
        ("{{ false ? 'y' }}", ""),
        ("{{ 'set' ?: 'unset' }}", "set"),
    ];
    for (code, expected) in cases {
        assert_eq!(render_text(code, Context::new()), expected, "evaluating {code}");
    }
}

#[test]
#[ntest::timeout(1000)]
fn test_concatenation_and_ranges() {
    assert_eq!(render_text("{{ 'a' ~ 1 ~ true ~ null }}", Context::new()), "a11");
    assert_eq!(render_text("{{ (1..4)|join(',') }}", Context::new()), "1,2,3,4");
    assert_eq!(render_text("{{ (3..1)|join(',') }}", Context::new()), "3,2,1");
    assert_eq!(render_text("{{ range('a', 'e', 2)|join }}", Context::new()), "ace");
    assert_eq!(render_text("{{ range(0, 10, 5)|join(',') }}", Context::new()), "0,5,10");
}

#[test]
#[ntest::timeout(1000)]
fn test_null_coalescing() {
    let context = user_context();
    assert_eq!(
        render_text("{{ missing ?? nothing ?? user.name }}", context),
        "Ada",
        "?? skips undefined and null values"
    );

    let options = EnvironmentOptions {
        strict_variables: true,
        ..EnvironmentOptions::default()
    };
    let env = env_with_options(&[("test.txt", "{{ missing ?? 'fallback' }}")], options);
    assert_eq!(
        env.render("test.txt", Context::new()).expect("?? tolerates undefined variables"),
        "fallback",
        "strict mode still allows ?? on undefined variables"
    );
}

#[test]
#[ntest::timeout(1000)]
fn test_attribute_access() {
    let cases = [
        ("{{ user.name }}", "Ada"),
        ("{{ user['age'] }}", "36"),
        ("{{ user.tags.1 }}", "engines"),
        ("{{ user.tags[0] }}", "math"),
        ("{{ attribute(user, 'name') }}", "Ada"),
        ("{{ user.missing }}", ""),
        ("{{ [10, 20, 30][1:2]|join }}", "2030"),
        ("{{ 'abcdef'[2:] }}", "cdef"),
    ];
    for (code, expected) in cases {
        assert_eq!(render_text(code, user_context()), expected, "evaluating {code}");
    }
}

#[test]
#[ntest::timeout(1000)]
fn test_builtin_filters() {
    let cases = [
        ("{{ user.name|upper }}", "ADA"),
        ("{{ 'ADA'|lower }}", "ada"),
        ("{{ '  padded  '|trim }}", "padded"),
        ("{{ 'xxhixx'|trim('x', 'left') }}", "hixx"),
        ("{{ '  hi  '|trim(side='right') }}|", "  hi|"),
        ("{{ user.tags|length }}", "2"),
        ("{{ 'héllo'|length }}", "5"),
        ("{{ items|join(', ', ' and ') }}", "3, 1 and 2"),
        ("{{ items|join(and=' & ') }}", "31 & 2"),
        ("{{ user|keys|join(',') }}", "age,name,tags"),
        ("{{ items|first }}{{ items|last }}", "32"),
        ("{{ 'word'|first }}{{ 'word'|last }}", "wd"),
        ("{{ items|slice(1, 2)|join }}", "12"),
        ("{{ 'hello'|slice(-3) }}", "llo"),
        ("{{ items|merge([4, 5])|join }}", "31245"),
        ("{{ {'a': 1}|merge({'b': 2})|keys|join }}", "ab"),
        ("{{ missing|default('fallback') }}", "fallback"),
        ("{{ ''|default('fallback') }}", "fallback"),
        ("{{ user.name|default('fallback') }}", "Ada"),
        ("{{ user.nope.deeper|default('safe') }}", "safe"),
    ];
    for (code, expected) in cases {
        assert_eq!(render_text(code, user_context()), expected, "evaluating {code}");
    }
}

#[test]
#[ntest::timeout(1000)]
fn test_builtin_functions() {
    let cases = [
        ("{{ max(1, 5, 3) }}", "5"),
        ("{{ min([4, 2, 8]) }}", "2"),
        ("{{ cycle(['odd', 'even'], 3) }}", "even"),
        ("{{ source('other.txt') }}", "{{ raw source }}"),
        ("{{ source('nope.txt', ignore_missing=true) }}|", "|"),
    ];
    for (code, expected) in cases {
        let env = env_with(&[("test.txt", code), ("other.txt", "{{ raw source }}")]);
        assert_eq!(
            env.render("test.txt", Context::new())
                .unwrap_or_else(|e| panic!("{code} failed: {e}")),
            expected,
            "evaluating {code}"
        );
    }
}

#[test]
#[ntest::timeout(1000)]
fn test_builtin_tests() {
    let cases = [
        ("{{ user is defined ? 'y' : 'n' }}", "y"),
        ("{{ ghost is defined ? 'y' : 'n' }}", "n"),
        ("{{ user.name is defined ? 'y' : 'n' }}", "y"),
        ("{{ user.ghost is defined ? 'y' : 'n' }}", "n"),
        ("{{ nothing is null ? 'y' : 'n' }}", "y"),
        ("{{ nothing is none ? 'y' : 'n' }}", "y"),
        ("{{ empty is empty ? 'y' : 'n' }}", "y"),
        ("{{ items is not empty ? 'y' : 'n' }}", "y"),
        ("{{ 4 is even ? 'y' : 'n' }}", "y"),
        ("{{ 3 is odd ? 'y' : 'n' }}", "y"),
        ("{{ items is iterable ? 'y' : 'n' }}", "y"),
        ("{{ 'abc' is iterable ? 'y' : 'n' }}", "n"),
        ("{{ 1 is same as(1) ? 'y' : 'n' }}", "y"),
        ("{{ '1' is same as(1) ? 'y' : 'n' }}", "n"),
        ("{{ 9 is divisible by(3) ? 'y' : 'n' }}", "y"),
        ("{{ items is sequence ? 'y' : 'n' }}", "y"),
        ("{{ user is mapping ? 'y' : 'n' }}", "y"),
    ];
    for (code, expected) in cases {
        assert_eq!(render_text(code, user_context()), expected, "evaluating {code}");
    }
}

#[test]
#[ntest::timeout(1000)]
fn test_control_structures() {
    let code = "{% if user.age > 40 %}old{% elseif user.age > 30 %}mid{% else %}young{% endif %}";
    assert_eq!(render_text(code, user_context()), "mid", "elseif branch is taken");

    let code = "{% set a, b = 1, 2 %}{{ a + b }}";
    assert_eq!(render_text(code, Context::new()), "3", "multi-target set");

    let code = "{% set greeting %}Hi {{ user.name }}{% endset %}[{{ greeting }}]";
    assert_eq!(render_text(code, user_context()), "[Hi Ada]", "capturing set");

    let code = "{% apply upper %}shout {{ user.name }}{% endapply %}";
    assert_eq!(render_text(code, user_context()), "SHOUT ADA", "apply filters the body");

    let code = "{% with {'name': 'Bob'} %}{{ name }}{% endwith %}{{ name }}";
    assert_eq!(render_text(code, Context::new()), "Bob", "with scopes its variables");

    let code = "{% set outer = 'o' %}{% with {'inner': 'i'} only %}{{ outer }}{{ inner }}{% endwith %}";
    assert_eq!(render_text(code, Context::new()), "i", "with only hides the outer context");

    let code = "{% do 1 + 1 %}done";
    assert_eq!(render_text(code, Context::new()), "done", "do discards its value");
}

#[test]
#[ntest::timeout(1000)]
fn test_guard_picks_a_branch_at_compile_time() {
    let code = "{% guard filter upper %}{{ 'a'|upper }}{% else %}no{% endguard %}\
                {% guard function shiny %}{{ shiny() }}{% else %}fallback{% endguard %}";
    assert_eq!(render_text(code, Context::new()), "Afallback", "unknown callables take the else branch");
}

#[test]
#[ntest::timeout(1000)]
fn test_strict_variables() {
    let options = EnvironmentOptions {
        strict_variables: true,
        ..EnvironmentOptions::default()
    };
    let env = env_with_options(
        &[
            ("var.txt", "{{ ghost }}"),
            ("attr.txt", "{{ user.ghost }}"),
            ("ok.txt", "{{ ghost is defined ? 'y' : 'n' }}"),
        ],
        options,
    );

    let error = env.render("var.txt", Context::new()).expect_err("ghost is undefined");
    assert_eq!(
        error.to_string(),
        "Variable \"ghost\" does not exist in \"var.txt\" at line 1."
    );

    let error = env.render("attr.txt", user_context()).expect_err("ghost is not a key");
    assert!(
        error.to_string().contains("\"ghost\""),
        "attribute error names the key: {error}"
    );

    assert_eq!(
        env.render("ok.txt", Context::new()).expect("defined tests are lenient"),
        "n",
        "the defined test never raises"
    );
}

#[test]
#[ntest::timeout(1000)]
fn test_runtime_errors_carry_location() {
    let error = render_error("line one\n{{ 1 // 0 }}", Context::new());
    assert!(matches!(error, Error::Runtime(_)), "division by zero is a runtime error");
    assert_eq!(error.line(), Some(2), "the failing line is reported");
    assert_eq!(error.template_name(), Some("test.html"), "the template is reported");
}

#[test]
#[ntest::timeout(1000)]
fn test_custom_callables() {
    let mut env = env_with(&[(
        "test.txt",
        "{{ name|shout }} {{ greet(name, punctuation='?') }} {{ 7 is lucky ? 'lucky' : 'not' }}",
    )]);
    env.add_filter(Callable::filter("shout", |_, args| {
        Ok(Value::from(format!("{}!", args.first().cloned().unwrap_or_default()).to_uppercase()))
    }))
    .expect("registry is open");
    env.add_function(
        Callable::function("greet", |_, args| {
            let name = args.first().cloned().unwrap_or_default();
            let punctuation = args.get(1).filter(|v| !v.is_null()).cloned().unwrap_or_else(|| Value::from("."));
            Ok(Value::from(format!("Hello {name}{punctuation}")))
        })
        .arguments(&["name", "punctuation"]),
    )
    .expect("registry is open");
    env.add_test(Callable::test("lucky", |_, args| {
        Ok(Value::Bool(args.first().and_then(Value::as_int) == Some(7)))
    }))
    .expect("registry is open");
    env.add_global("site", "twiglet").expect("registry is open");

    let mut context = Context::new();
    context.insert("name", "ada");
    assert_eq!(
        env.render("test.txt", context).expect("custom callables resolve"),
        "ADA! Hello ada? lucky"
    );

    let error = env
        .add_filter(Callable::filter("late", |_, args| Ok(args.first().cloned().unwrap_or_default())))
        .expect_err("the registry froze on first use");
    assert!(matches!(error, Error::Logic { .. }), "late registration is a logic error");
}

#[test]
#[ntest::timeout(1000)]
fn test_globals_are_visible_and_overridable() {
    let mut env = env_with(&[("test.txt", "{{ site }}")]);
    env.add_global("site", "twiglet").expect("registry is open");

    assert_eq!(env.render("test.txt", Context::new()).expect("renders"), "twiglet");

    let mut context = Context::new();
    context.insert("site", "override");
    assert_eq!(
        env.render("test.txt", context).expect("renders"),
        "override",
        "context variables win over globals"
    );
}

#[test]
#[ntest::timeout(1000)]
fn test_template_from_string() {
    let env = env_with(&[("partial.html", "<b>{{ name }}</b>")]);
    let template = env
        .template_from_string("{{ include('partial.html') }}|{{ name }}", None)
        .expect("compiles");
    assert!(
        template.name().starts_with("__string_template__"),
        "string templates get a generated name"
    );

    let mut context = Context::new();
    context.insert("name", "<i>");
    assert_eq!(
        template.render(&env, context).expect("renders"),
        "<b>&lt;i&gt;</b>|&lt;i&gt;",
        "string templates are autoescaped as html"
    );
}

#[test]
#[ntest::timeout(1000)]
fn test_render_to_writer() {
    let env = env_with(&[("test.txt", "{% for i in 1..3 %}{{ i }}{% endfor %}")]);
    let mut out = String::from("> ");
    env.render_to("test.txt", Context::new(), &mut out).expect("renders");
    assert_eq!(out, "> 123", "output is appended to the writer");
}

#[test]
#[ntest::timeout(1000)]
fn test_values_from_rust_types() {
    let mut context = Context::new();
    context
        .insert("count", 3_i64)
        .insert("ratio", 0.25)
        .insert("flag", true)
        .insert("maybe", Option::<&str>::None)
        .insert("list", vec![1, 2, 3])
        .insert(
            "lazy",
            Value::from_iter_uncounted((1_i64..=3).map(Value::from)),
        );
    let code = "{{ count }}|{{ ratio }}|{{ flag }}|{{ maybe is null ? 'null' }}|{{ list|join }}|{{ lazy|join(',') }}";
    assert_eq!(render_text(code, context), "3|0.25|1|null|123|1,2,3");
}

#[test]
#[ntest::timeout(1000)]
fn test_collection_literals() {
    let mut context = Context::new();
    context.insert("name", "Ada").insert("key", "k");
    let code = "{% set base = {a: 1, 'b': 2} %}\
                {% set full = {...base, name, (key ~ 2): 3, 4: 'four'} %}\
                {{ full|keys|join(',') }}|{{ full.name }}|{{ full.k2 }}|\
                {{ [0, ...[1, 2], 3]|join }}";
    assert_eq!(render_text(code, context), "a,b,name,k2,4|Ada|3|0123");
}

#[test]
#[ntest::timeout(1000)]
fn test_rewritten_error_locations() {
    let templates = [("page.txt", "\n{% include 'inner.txt' %}"), ("inner.txt", "{{ 'x'|e('nope') }}")];

    let error = env_with(&templates)
        .render("page.txt", Context::new())
        .expect_err("nope is not a strategy");
    assert_eq!(error.template_name(), Some("inner.txt"), "errors point at their own template");
    assert_eq!(error.line(), Some(1));

    let options = EnvironmentOptions {
        rewrite_errors: true,
        ..EnvironmentOptions::default()
    };
    let error = env_with_options(&templates, options)
        .render("page.txt", Context::new())
        .expect_err("nope is not a strategy");
    assert_eq!(error.template_name(), Some("page.txt"), "rewritten to the outermost caller");
    assert_eq!(error.line(), Some(2));
}

#[test]
#[ntest::timeout(1000)]
fn test_arrow_functions() {
    let cases = [
        ("{{ [1, 2, 3]|map(x => x * 2)|join(',') }}", "2,4,6"),
        ("{{ {a: 1, b: 2, c: 3}|filter((v, k) => v > 1 and k != 'c')|keys|join(',') }}", "b"),
        ("{{ {a: 1, b: 2}|map((v, k) => k ~ v)|join(' ') }}", "a1 b2"),
        ("{{ [1, 2, 3]|reduce((carry, v) => carry + v, 0) }}", "6"),
        ("{% set factor = 3 %}{{ [1, 2]|map(x => x * factor)|join(',') }}", "3,6"),
        ("{% for i in [1, 2] %}{{ [10]|map(x => x + i)|first }} {% endfor %}", "11 12 "),
        ("{{ null|map(x => x)|length }}", "0"),
    ];
    for (code, expected) in cases {
        assert_eq!(render_text(code, Context::new()), expected, "evaluating {code}");
    }
}

#[test]
#[ntest::timeout(1000)]
fn test_host_filters_call_arrow_functions() {
    let mut env = env_with(&[("test.txt", "{{ 5|apply(n => n * n) }} {{ 'a'|apply((s, t) => s ~ t) }}")]);
    env.add_filter(Callable::filter("apply", |state, args| {
        let value = args.first().cloned().unwrap_or_default();
        let arrow = args.get(1).cloned().unwrap_or_default();
        assert!(arrow.is_callable(), "arrow arguments arrive as callable values");
        arrow.call(state, &[value.clone(), value])
    }))
    .expect("registry is open");
    assert_eq!(env.render("test.txt", Context::new()).expect("renders"), "25 aa");
}

#[test]
#[ntest::timeout(1000)]
fn test_arrow_argument_errors() {
    let error = render_error("{{ [1]|map('upper') }}", Context::new());
    assert!(matches!(error, Error::Runtime(_)), "unexpected error: {error:?}");
    assert!(
        error
            .to_string()
            .starts_with("The \"map\" filter expects an arrow function, got \"string\"."),
        "unexpected message: {error}"
    );

    let error = render_error("{{ 3|filter(x => x) }}", Context::new());
    assert!(
        error.to_string().contains("expects a sequence or a mapping"),
        "unexpected message: {error}"
    );
}

#[test]
#[ntest::timeout(1000)]
fn test_range_with_zero_step() {
    let error = render_error("{{ range(1, 5, 0) }}", Context::new());
    assert!(matches!(error, Error::Runtime(_)), "unexpected error: {error:?}");
    assert!(
        error.to_string().contains("The step of a range cannot be zero."),
        "unexpected message: {error}"
    );
    assert_eq!(render_text("{{ range(1, 7, 3)|join(',') }}", Context::new()), "1,4,7");
    assert_eq!(render_text("{{ range(5, 1, -2)|join(',') }}", Context::new()), "5,3,1");
}
