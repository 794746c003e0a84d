mod fixtures;

use fixtures::{env_with, env_with_options};
use twiglet::compiler::program::{CompiledTemplate, Instr, ParentRef};
use twiglet::value::ConstValue;
use twiglet::{Autoescape, Context, EnvironmentOptions, Source};

fn compile(code: &str) -> CompiledTemplate {
    env_with(&[])
        .compile_source(&Source::new(code, "test.txt"))
        .unwrap_or_else(|e| panic!("compiling {code:?} failed: {e}"))
}

fn position(program: &CompiledTemplate, found: impl Fn(&Instr) -> bool) -> usize {
    program
        .display
        .code
        .iter()
        .position(found)
        .expect("instruction is in the display routine")
}

#[test]
#[ntest::timeout(1000)]
fn test_compilation_is_deterministic() {
    let code = "{% extends 'base.html' %}{% block a %}{{ x|upper }}{% endblock %}\
                {% block b %}{% for i in items %}{{ loop.index }}{% endfor %}{% endblock %}\
                {% macro m(p, q = 2) %}{{ p ~ q }}{% endmacro %}";
    let first = compile(code);
    let second = compile(code);
    assert_eq!(first, second, "the same source compiles to the same program");
    assert_eq!(
        serde_json::to_string(&first).expect("serializes"),
        serde_json::to_string(&second).expect("serializes"),
        "and to the same bytes"
    );
}

#[test]
#[ntest::timeout(1000)]
fn test_program_survives_json() {
    let program = compile(
        "{% use 'traits.html' with a as b %}{% block c %}{{ 'x' ~ y }}{{ [1, {'k': true}]|length }}{% endblock %}",
    );
    let json = serde_json::to_string(&program).expect("serializes");
    let restored: CompiledTemplate = serde_json::from_str(&json).expect("deserializes");
    assert_eq!(restored, program);
    assert_eq!(restored.traits.len(), 1);
    assert_eq!(
        restored.traits[0].renames.get("a").map(String::as_str),
        Some("b"),
        "renamed trait blocks are recorded"
    );
}

#[test]
#[ntest::timeout(1000)]
fn test_program_metadata() {
    let program = compile(
        "{% extends 'base.html' %}{% block title %}T{% endblock %}{% macro field(name, size = 20) %}{% endmacro %}",
    );
    assert_eq!(
        program.parent,
        Some(ParentRef::Static {
            name: "base.html".to_owned(),
            line: 1
        })
    );
    assert!(program.blocks.contains_key("title"), "blocks get their own routine");
    let field = program.macros.get("field").expect("macro is compiled");
    assert_eq!(
        field.params,
        [
            ("name".to_owned(), ConstValue::Null),
            ("size".to_owned(), ConstValue::Int(20)),
        ]
    );
    assert!(program.manifest.is_none(), "no sandbox pass without the sandbox extension");
    assert!(!program.is_traitable, "templates that extend cannot be traits");

    let program = compile("{% extends layout %}");
    assert!(
        matches!(program.parent, Some(ParentRef::Dynamic { line: 1, .. })),
        "expressions are evaluated at render time"
    );

    assert!(compile("{% block a %}{% endblock %}").is_traitable);
}

#[test]
#[ntest::timeout(1000)]
fn test_line_table() {
    let program = compile("a\n{{ x }}\n\n{{ y }}");
    let pc = position(&program, |instr| matches!(instr, Instr::Lookup { name, .. } if name == "y"));
    assert_eq!(program.display.line_at(pc), Some(4));
    let pc = position(&program, |instr| matches!(instr, Instr::Lookup { name, .. } if name == "x"));
    assert_eq!(program.display.line_at(pc), Some(2));
}

#[test]
#[ntest::timeout(1000)]
fn test_optimizer_effects() {
    let program = compile("{{ 'a' }}{{ 1 }}");
    assert!(
        !program.display.code.contains(&Instr::Emit),
        "literal prints become text: {:?}",
        program.display.code
    );

    let program = compile("{% for i in items %}{{ i }}{% endfor %}");
    assert!(program.display.code.contains(&Instr::PushLoop { with_loop: false }));
    let program = compile("{% for i in items %}{{ loop.index }}{% endfor %}");
    assert!(program.display.code.contains(&Instr::PushLoop { with_loop: true }));

    let options = EnvironmentOptions {
        optimizations: false,
        ..EnvironmentOptions::default()
    };
    let program = env_with_options(&[], options)
        .compile_source(&Source::new("{{ 'a' }}{% for i in items %}{% endfor %}", "test.txt"))
        .expect("compiles");
    assert!(program.display.code.contains(&Instr::Emit), "prints are kept");
    assert!(
        program.display.code.contains(&Instr::PushLoop { with_loop: true }),
        "loops always build their variable"
    );
}

#[test]
#[ntest::timeout(1000)]
fn test_escaping_is_compiled_in() {
    let env = env_with(&[]);
    let html = env
        .compile_source(&Source::new("{{ x }}", "test.html"))
        .expect("compiles");
    assert!(
        html.display
            .code
            .iter()
            .any(|instr| matches!(instr, Instr::CallFilter { name, .. } if name == "escape")),
        "html templates escape prints"
    );
    assert!(
        !compile("{{ x }}")
            .display
            .code
            .iter()
            .any(|instr| matches!(instr, Instr::CallFilter { .. })),
        "txt templates do not"
    );
}

#[test]
#[ntest::timeout(1000)]
fn test_options_from_json() {
    let options: EnvironmentOptions = serde_json::from_str(
        r#"{"autoescape": {"strategy": "js"}, "lexer": {"tag_variable": ["${", "}"]}}"#,
    )
    .expect("partial options parse");
    assert_eq!(options.autoescape, Autoescape::Strategy("js".to_owned()));
    assert_eq!(options.lexer.tag_block, ("{%".to_owned(), "%}".to_owned()));

    let env = env_with_options(&[("test.txt", "${ name }|{{ name }}")], options);
    let mut context = Context::new();
    context.insert("name", "a b");
    assert_eq!(
        env.render("test.txt", context).expect("renders"),
        "a\\u0020b|{{ name }}",
        "custom delimiters replace the default ones"
    );

    let options: EnvironmentOptions =
        serde_json::from_str(r#"{"autoescape": "disabled"}"#).expect("unit variants are strings");
    assert_eq!(options.autoescape, Autoescape::Disabled);
}

#[test]
#[ntest::timeout(1000)]
fn test_only_block_templates_are_traits() {
    let cases = [
        ("{% block a %}A{% endblock %}\n  {% block b %}{% endblock %}\n", true),
        ("text {% block a %}{% endblock %}", false),
        ("{{ x }}", false),
        ("{% block a %}{% endblock %}{% if x %}{% endif %}", false),
        ("{% extends 'base.html' %}{% block a %}{% endblock %}", false),
    ];
    for (code, expected) in cases {
        assert_eq!(compile(code).is_traitable, expected, "compiling {code:?}");
    }
}
