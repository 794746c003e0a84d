mod fixtures;

use fixtures::render_text;
use twiglet::{Context, Value};

#[test]
#[ntest::timeout(1000)]
fn test_loop_variable() {
    let code = "{% for x in ['a', 'b', 'c'] %}{{ loop.index }}{{ x }}{% if not loop.last %},{% endif %}{% endfor %}";
    assert_eq!(render_text(code, Context::new()), "1a,2b,3c", "loop.index and loop.last");

    let code = "{% for x in ['a', 'b', 'c'] %}{{ loop.index0 }}{{ loop.revindex0 }}{{ loop.revindex }}{{ loop.length }} {% endfor %}";
    assert_eq!(
        render_text(code, Context::new()),
        "0233 1123 2013 ",
        "counters of a countable sequence"
    );

    let code = "{% for x in [1, 2] %}{{ loop.first ? 'first' : 'next' }} {% endfor %}";
    assert_eq!(render_text(code, Context::new()), "first next ", "loop.first");
}

#[test]
#[ntest::timeout(1000)]
fn test_keys_and_values() {
    let code = "{% for k, v in {'a': 1, 'b': 2} %}{{ k }}={{ v }};{% endfor %}";
    assert_eq!(render_text(code, Context::new()), "a=1;b=2;", "mapping keys are bound");

    let code = "{% for i, v in ['x', 'y'] %}{{ i }}{{ v }}{% endfor %}";
    assert_eq!(render_text(code, Context::new()), "0x1y", "sequence keys are positions");
}

#[test]
#[ntest::timeout(1000)]
fn test_else_branch() {
    let code = "{% for x in items %}{{ x }}{% else %}nothing{% endfor %}";

    let mut context = Context::new();
    context.insert("items", Vec::<Value>::new());
    assert_eq!(render_text(code, context), "nothing", "empty sequences run the else branch");

    assert_eq!(
        render_text(code, Context::new()),
        "nothing",
        "undefined sequences run the else branch"
    );

    let mut context = Context::new();
    context.insert("items", "not iterable");
    assert_eq!(render_text(code, context), "nothing", "scalars are not iterated");

    let mut context = Context::new();
    context.insert("items", vec![1]);
    assert_eq!(render_text(code, context), "1", "else is skipped once an item was seen");
}

#[test]
#[ntest::timeout(1000)]
fn test_nested_loops_reach_the_parent_loop() {
    let code = "{% for a in [1, 2] %}{% for b in [1, 2] %}{{ loop.parent.loop.index }}{{ loop.index }} {% endfor %}{% endfor %}";
    assert_eq!(render_text(code, Context::new()), "11 12 21 22 ");
}

#[test]
#[ntest::timeout(1000)]
fn test_loop_scoping() {
    let code = "{% set x = 'outer' %}{% for x in [1, 2] %}{% set y = x %}{% endfor %}{{ x }}|{{ y }}";
    assert_eq!(
        render_text(code, Context::new()),
        "outer|",
        "the target is restored and loop-local variables vanish"
    );

    let code = "{% set total = 0 %}{% for i in [1, 2, 3] %}{% set total = total + i %}{% endfor %}{{ total }}";
    assert_eq!(
        render_text(code, Context::new()),
        "6",
        "variables that existed before the loop keep their changes"
    );

    let code = "{% for x in [1] %}{% endfor %}{{ loop is defined ? 'leaked' : 'clean' }}";
    assert_eq!(render_text(code, Context::new()), "clean", "loop does not leak");
}

#[test]
#[ntest::timeout(1000)]
fn test_uncounted_iterators() {
    let mut context = Context::new();
    context.insert(
        "numbers",
        Value::from_iter_uncounted((1_i64..=3).map(Value::from)),
    );
    let code = "{% for n in numbers %}{{ loop.index }}:{{ n }}{{ loop.last is defined ? '!' : '' }} {% endfor %}";
    assert_eq!(
        render_text(code, context),
        "1:1 2:2 3:3 ",
        "length-dependent loop fields are absent for iterators"
    );
}

#[test]
#[ntest::timeout(1000)]
fn test_loop_over_ranges_and_filters() {
    let code = "{% for i in 1..5 %}{{ i }}{% endfor %}";
    assert_eq!(render_text(code, Context::new()), "12345");

    let code = "{% for w in ['b', 'a']|merge(['c']) %}{{ w|upper }}{% endfor %}";
    assert_eq!(render_text(code, Context::new()), "BAC");

    let code = "{% for c in range('a', 'c') %}{{ cycle(['-', '+'], loop.index0) }}{{ c }}{% endfor %}";
    assert_eq!(render_text(code, Context::new()), "-a+b-c");
}
