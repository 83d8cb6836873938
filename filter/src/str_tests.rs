use super::*;
use gantry_model::Properties;

fn parsed(input: &str) -> Filter {
    Filter::parse(input)
        .expect("Failed to parse filter")
        .expect("Filter was empty")
}

fn round_trip(input: &str) {
    let filter = parsed(input);
    let reparsed = parsed(&filter.to_string());
    assert_eq!(filter, reparsed, "Round-trip failed for {input}");
}

fn matches(filter: &str, props: &Properties) -> bool {
    parsed(filter).matches(props)
}

#[test]
fn blank_input() {
    assert!(Filter::parse("").expect("Failed to parse").is_none());
    assert!(Filter::parse("   ").expect("Failed to parse").is_none());
}

#[test]
fn invalid_input() {
    for input in [
        "(",
        ")",
        "(a=1",
        "a=1)",
        "(=1)",
        "( =1)",
        "(a)",
        "(a=)",
        "((a=1)",
        "(&(a=1)",
        "(!(a=1)(b=2))",
        "(!)",
    ] {
        assert!(Filter::parse(input).is_err(), "Accepted: {input}");
    }
}

#[test]
fn parse_shapes() {
    // A lone criterion
    let f = parsed("(a=1)");
    assert!(matches!(f, Filter::Criterion(_)));

    // Wrapping a single criterion collapses
    assert_eq!(parsed("(&(a=1))"), parsed("(a=1)"));
    assert_eq!(parsed("(|(a=1))"), parsed("(a=1)"));

    // Duplicate children are removed
    assert_eq!(parsed("(&(a=1)(a=1)(b=2))"), parsed("(&(a=1)(b=2))"));

    // NOT keeps its single child
    let f = parsed("(!(a=1))");
    let Filter::Group { operator, children } = &f else {
        panic!("Expected a group");
    };
    assert_eq!(*operator, Operator::Not);
    assert_eq!(children.len(), 1);

    // Spaces around the operator and criteria are tolerated
    assert_eq!(parsed("( & (a=1) (b=2) )"), parsed("(&(a=1)(b=2))"));
    assert_eq!(parsed("( a = 1 )"), parsed("(a=1)"));
}

#[test]
fn comparator_selection() {
    for (input, comparator) in [
        ("(a=1)", Comparator::Eq),
        ("(a~=1)", Comparator::Approx),
        ("(a<1)", Comparator::Lt),
        ("(a<=1)", Comparator::Le),
        ("(a>1)", Comparator::Gt),
        ("(a>=1)", Comparator::Ge),
        ("(a=*)", Comparator::Present),
        ("(a=b*c)", Comparator::Substring),
        ("(a~=b*c)", Comparator::ApproxSubstring),
    ] {
        let Filter::Criterion(criterion) = parsed(input) else {
            panic!("Expected a criterion for {input}");
        };
        assert_eq!(criterion.comparator(), comparator, "for {input}");
    }
}

#[test]
fn round_trips() {
    for input in [
        "(a=1)",
        "(a=hello world)",
        "(a~=Hello)",
        "(a<=42)",
        "(a>=42)",
        "(a<4.5)",
        "(a>4.5)",
        "(a=*)",
        "(a=b*)",
        "(a=*b)",
        "(a=b*c*d)",
        "(a~=b*c)",
        "(a=with\\*star)",
        "(name=with\\(parens\\))",
        "(&(a=1)(b=2))",
        "(|(a=1)(b=2)(c=3))",
        "(!(a=1))",
        "(&(objectClass=spec.a)(|(rank>=2)(!(mode=off))))",
    ] {
        round_trip(input);
    }
}

#[test]
fn equality_matching() {
    let props = Properties::from([
        ("name", Value::from("test")),
        ("count", Value::from(42)),
        ("ratio", Value::from(4.5)),
        ("active", Value::from(true)),
        ("tags", Value::from(vec!["red", "green"])),
    ]);

    assert!(matches("(name=test)", &props));
    assert!(!matches("(name=Test)", &props));
    assert!(!matches("(name=other)", &props));
    assert!(matches("(count=42)", &props));
    assert!(!matches("(count=43)", &props));
    assert!(matches("(ratio=4.5)", &props));
    assert!(matches("(active=true)", &props));
    assert!(matches("(active=True)", &props));

    // Sequence membership
    assert!(matches("(tags=red)", &props));
    assert!(matches("(tags=green)", &props));
    assert!(!matches("(tags=blue)", &props));

    // Missing key never matches
    assert!(!matches("(missing=1)", &props));
}

#[test]
fn presence_matching() {
    let props = Properties::from([
        ("present", Value::from(1)),
        ("empty_str", Value::from("")),
        ("empty_list", Value::List(vec![])),
        ("zero", Value::from(0)),
    ]);

    assert!(matches("(present=*)", &props));
    assert!(matches("(zero=*)", &props));
    assert!(!matches("(empty_str=*)", &props));
    assert!(!matches("(empty_list=*)", &props));
    assert!(!matches("(missing=*)", &props));
}

#[test]
fn substring_matching() {
    let props = Properties::from([
        ("name", Value::from("gantry-framework")),
        ("tags", Value::from(vec!["alpha", "beta"])),
        ("count", Value::from(42)),
    ]);

    assert!(matches("(name=gantry*)", &props));
    assert!(matches("(name=*framework)", &props));
    assert!(matches("(name=gantry*work)", &props));
    assert!(matches("(name=*try*frame*)", &props));
    assert!(!matches("(name=framework*)", &props));
    assert!(!matches("(name=*gantry)", &props));
    assert!(!matches("(name=*missing*)", &props));

    // Element-wise over sequences
    assert!(matches("(tags=al*)", &props));
    assert!(matches("(tags=*eta)", &props));
    assert!(!matches("(tags=*gamma*)", &props));

    // Substring only applies to strings
    assert!(!matches("(count=4*)", &props));

    // Escaping a star does not defuse it: the comparator is chosen on
    // the raw value, so `\*` still opens a substring hole
    assert!(matches(
        "(s=a\\*b)",
        &Properties::from([("s", Value::from("a*b"))])
    ));
    assert!(matches(
        "(s=a\\*b)",
        &Properties::from([("s", Value::from("a-middle-b"))])
    ));
    assert!(!matches(
        "(s=a\\*b)",
        &Properties::from([("s", Value::from("b*a"))])
    ));

    // A lone escaped star degenerates to a match-anything substring
    // (while a bare unescaped star would be a presence test)
    let Filter::Criterion(criterion) = parsed("(s=\\*)") else {
        panic!("Expected a criterion");
    };
    assert_eq!(criterion.comparator(), Comparator::Substring);
    assert!(matches("(s=\\*)", &Properties::from([("s", Value::from("x"))])));
    assert!(matches("(s=\\*)", &Properties::from([("s", Value::from(""))])));
}

#[test]
fn approximate_matching() {
    let props = Properties::from([
        ("name", Value::from("Gantry")),
        ("tags", Value::from(vec!["Alpha", "Beta"])),
    ]);

    assert!(matches("(name~=gantry)", &props));
    assert!(matches("(name~=GANTRY)", &props));
    assert!(matches("(name~=gan*)", &props));
    assert!(!matches("(name~=other)", &props));
    assert!(matches("(tags~=alpha)", &props));
    assert!(matches("(tags~=BE*)", &props));
}

#[test]
fn ordering_matching() {
    let props = Properties::from([
        ("count", Value::from(10)),
        ("ratio", Value::from(2.5)),
        ("name", Value::from("bbb")),
    ]);

    assert!(matches("(count<20)", &props));
    assert!(!matches("(count<10)", &props));
    assert!(matches("(count<=10)", &props));
    assert!(matches("(count>5)", &props));
    assert!(!matches("(count>10)", &props));
    assert!(matches("(count>=10)", &props));

    // Integer tested against a float filter value
    assert!(matches("(count<10.5)", &props));
    assert!(matches("(count>9.5)", &props));

    assert!(matches("(ratio<3)", &props));
    assert!(matches("(ratio>2)", &props));

    // Strings compare lexicographically
    assert!(matches("(name<ccc)", &props));
    assert!(matches("(name>aaa)", &props));
    assert!(!matches("(name<aaa)", &props));

    // Failed coercion compares false rather than raising
    assert!(!matches("(count<abc)", &props));
    assert!(!matches("(count>abc)", &props));
}

#[test]
fn boolean_trees() {
    let props = Properties::from([("a", Value::from(1)), ("b", Value::from(2))]);

    assert!(matches("(&(a=1)(b=2))", &props));
    assert!(!matches("(&(a=1)(b=3))", &props));
    assert!(matches("(|(a=9)(b=2))", &props));
    assert!(!matches("(|(a=9)(b=9))", &props));
    assert!(matches("(!(a=9))", &props));
    assert!(!matches("(!(a=1))", &props));
    assert!(matches("(&(a=1)(!(b=3)))", &props));
}

#[test]
fn escaping() {
    assert_eq!(escape("plain"), "plain");
    assert_eq!(escape("a=b"), "a\\=b");
    assert_eq!(escape("(x)"), "\\(x\\)");
    assert_eq!(escape("back\\slash"), "back\\\\slash");
    assert_eq!(escape(" lead"), "\\ lead");
    assert_eq!(escape("trail "), "trail\\ ");

    for raw in ["plain", "a=b", "(x)", "back\\slash", " lead", "trail ", "a*b"] {
        assert_eq!(unescape(&escape(raw)), raw);
    }

    // Matching against a property whose value needs escaping
    let props = Properties::from([("key", Value::from("va(lu)e"))]);
    assert!(matches("(key=va\\(lu\\)e)", &props));
}

#[test]
fn combine_filters() {
    let a = parsed("(a=1)");
    let b = parsed("(b=2)");

    assert!(Filter::combine([], Operator::And).is_none());
    assert!(Filter::combine([None, None], Operator::And).is_none());

    // A single survivor is returned unchanged
    assert_eq!(
        Filter::combine([None, Some(a.clone())], Operator::And),
        Some(a.clone())
    );

    let combined =
        Filter::combine([Some(a), None, Some(b)], Operator::And).expect("Combined filter");
    assert_eq!(combined, parsed("(&(a=1)(b=2))"));
}

#[test]
fn normalize_is_idempotent() {
    for input in ["(a=1)", "(&(a=1)(b=2))", "(!(a=1))", "(|(a=1)(a=1))"] {
        let once = parsed(input);
        let twice = once.clone().normalize().expect("Normalized to nothing");
        assert_eq!(once, twice);
    }
}
