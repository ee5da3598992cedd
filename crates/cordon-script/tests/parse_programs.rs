use cordon_script::ast::{ExprKind, StmtKind, Visitor};
use cordon_script::{parse, Span};

struct NameCollector(Vec<String>);

impl Visitor for NameCollector {
    fn visit_expr(&mut self, expr: &cordon_script::ast::Expr) {
        if let ExprKind::Name(n) = &expr.kind {
            self.0.push(n.clone());
        }
        cordon_script::ast::walk_expr(self, expr);
    }
}

#[test]
fn test_realistic_program_parses() {
    let src = r#"
# Aggregate order totals by customer.
totals = {}
for order in orders:
    cust = order["customer"]
    if cust in totals:
        totals[cust] = totals[cust] + order["amount"]
    else:
        totals[cust] = order["amount"]

def top(items, n=3):
    ranked = sorted(items, key=lambda kv: kv[1], reverse=True)
    return ranked[:n]

best = top(list(totals.items()) if False else [(k, totals[k]) for k in totals])
__result__ = {"best": best, "count": len(totals)}
"#;
    let module = parse(src).unwrap();
    assert_eq!(module.body.len(), 5);
    assert!(matches!(module.body[2].kind, StmtKind::FunctionDef(_)));

    let mut names = NameCollector(Vec::new());
    cordon_script::ast::walk_body(&mut names, &module.body);
    assert!(names.0.iter().any(|n| n == "orders"));
    assert!(names.0.iter().any(|n| n == "__result__"));
}

#[test]
fn test_class_and_with_blocks_parse() {
    let src = "\
class Counter:
    def __init__(self, start):
        self.value = start

with ctx as c:
    n = c
";
    let module = parse(src).unwrap();
    let StmtKind::ClassDef { name, body } = &module.body[0].kind else {
        panic!("expected class");
    };
    assert_eq!(name, "Counter");
    assert_eq!(body.len(), 1);
    assert!(matches!(module.body[1].kind, StmtKind::With { .. }));
}

#[test]
fn test_error_positions_are_reported() {
    let err = parse("x = 1\ny = = 2\n").unwrap_err();
    assert_eq!(err.span, Span::new(2, 5));
    assert!(err.to_string().contains("line 2"));
}

#[test]
fn test_semicolon_separated_statements() {
    let module = parse("a = 1; b = 2; c = a + b\n").unwrap();
    assert_eq!(module.body.len(), 3);
}
