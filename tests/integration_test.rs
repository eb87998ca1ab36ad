// Integration tests: full pipeline from source text to evaluated result.
//
// Each test compiles an expression and evaluates it against a JSON
// document, checking JSONata's sequence semantics, path operators, and
// error codes end to end.

use jsonata_core::{compile, compile_with_recovery, new_frame, RuntimeBounds, Value};
use serde_json::json;

fn eval(expr: &str, input: serde_json::Value) -> Value {
    compile(expr)
        .unwrap()
        .evaluate(&Value::from(input))
        .unwrap()
}

fn eval_err(expr: &str, input: serde_json::Value) -> jsonata_core::Error {
    compile(expr)
        .unwrap()
        .evaluate(&Value::from(input))
        .unwrap_err()
}

fn account_data() -> serde_json::Value {
    json!({
        "Account": {
            "Name": "Firefly",
            "Order": [
                {
                    "OrderID": "order103",
                    "Product": [
                        { "SKU": "0406654608", "Name": "Bowler Hat", "Price": 34.45, "Quantity": 2 },
                        { "SKU": "0406634348", "Name": "Trilby hat", "Price": 21.67, "Quantity": 1 }
                    ]
                },
                {
                    "OrderID": "order104",
                    "Product": [
                        { "SKU": "040657863", "Name": "Cloak", "Price": 107.99, "Quantity": 1 }
                    ]
                }
            ]
        }
    })
}

// ── paths and sequences ──────────────────────────────────────────────────────

#[test]
fn test_identity_and_field_access() {
    assert_eq!(eval("$", json!(42)), Value::from(42.0));
    assert_eq!(eval("name", json!({"name": "Alice"})), Value::from("Alice"));
    assert_eq!(
        eval("user.profile.name", json!({"user": {"profile": {"name": "Bob"}}})),
        Value::from("Bob")
    );
}

#[test]
fn test_missing_field_is_undefined() {
    let result = eval("nothing.here", json!({"name": "Alice"}));
    assert!(result.is_undefined());
}

#[test]
fn test_sequence_flattening_over_arrays() {
    let result = eval("Account.Order.Product.Price", account_data());
    let prices: Vec<f64> = result.items().unwrap().iter().filter_map(Value::as_f64).collect();
    assert_eq!(prices, vec![34.45, 21.67, 107.99]);
}

#[test]
fn test_singleton_collapses_unless_kept() {
    // one match collapses to the element itself
    assert_eq!(
        eval("Account.Order[0].OrderID", account_data()),
        Value::from("order103")
    );
    // the [] marker keeps it an array
    let kept = eval("Account.Order[0].OrderID[]", account_data());
    assert_eq!(kept.items().map(Vec::len), Some(1));
}

#[test]
fn test_keep_array_on_root_predicate() {
    let kept = eval("$[0][]", json!([1, 2, 3]));
    assert_eq!(kept.items().map(Vec::len), Some(1));
    assert_eq!(kept.items().unwrap()[0], Value::from(1.0));
}

#[test]
fn test_negative_index_and_filter() {
    assert_eq!(eval("$[-1]", json!([1, 2, 3])), Value::from(3.0));
    let result = eval("Account.Order.Product[Price > 30].Name", account_data());
    let names: Vec<&str> = result.items().unwrap().iter().filter_map(Value::as_str).collect();
    assert_eq!(names, vec!["Bowler Hat", "Cloak"]);
}

#[test]
fn test_wildcard_and_descendant() {
    let result = eval("*.Name", json!({"a": {"Name": "x"}, "b": {"Name": "y"}}));
    let names: Vec<&str> = result.items().unwrap().iter().filter_map(Value::as_str).collect();
    assert_eq!(names, vec!["x", "y"]);

    let result = eval("**.Price", account_data());
    assert_eq!(result.items().map(Vec::len), Some(3));
}

// ── operators ────────────────────────────────────────────────────────────────

#[test]
fn test_arithmetic_and_concat() {
    assert_eq!(eval("price * quantity", json!({"price": 100, "quantity": 5})), Value::from(500.0));
    assert_eq!(eval(r#""answer: " & 42"#, json!(null)), Value::from("answer: 42"));
    assert_eq!(eval("5 % 3 + 2", json!(null)), Value::from(4.0));
}

#[test]
fn test_comparison_requires_matching_types() {
    assert_eq!(eval("2 < 10", json!(null)), Value::Bool(true));
    let err = eval_err(r#"2 < "10""#, json!(null));
    assert_eq!(err.code(), "T2009");
}

#[test]
fn test_range_operator() {
    let result = eval("[1..4]", json!(null));
    let nums: Vec<f64> = result.items().unwrap().iter().filter_map(Value::as_f64).collect();
    assert_eq!(nums, vec![1.0, 2.0, 3.0, 4.0]);

    // descending ranges produce nothing
    assert!(eval("[4..1]", json!(null)).is_undefined() || eval("[4..1]", json!(null)).items().map(Vec::len) == Some(0));
}

#[test]
fn test_range_outside_array_constructor() {
    let result = eval("(0..3)", json!(null));
    let nums: Vec<f64> = result.items().unwrap().iter().filter_map(Value::as_f64).collect();
    assert_eq!(nums, vec![0.0, 1.0, 2.0, 3.0]);

    assert!(eval("5..1", json!(null)).is_undefined());
}

#[test]
fn test_range_size_cap() {
    let err = eval_err("1..100000000", json!(null));
    assert_eq!(err.code(), "D2014");
}

#[test]
fn test_conditional_and_boolean_ops() {
    assert_eq!(eval(r#"x > 3 ? "big" : "small""#, json!({"x": 5})), Value::from("big"));
    assert_eq!(eval("x and y", json!({"x": true, "y": false})), Value::Bool(false));
    // undefined coerces to false in boolean contexts
    assert_eq!(eval("missing or true", json!({})), Value::Bool(true));
}

#[test]
fn test_in_operator() {
    assert_eq!(eval(r#""b" in ["a", "b"]"#, json!(null)), Value::Bool(true));
    assert_eq!(eval("5 in 5", json!(null)), Value::Bool(true));
    assert_eq!(eval("missing in [1]", json!({})), Value::Bool(false));
}

// ── constructors and grouping ────────────────────────────────────────────────

#[test]
fn test_object_and_array_constructors() {
    let result = eval(r#"{"double": x * 2, "list": [x, x]}"#, json!({"x": 3}));
    assert_eq!(result.get("double"), Some(&Value::from(6.0)));
    assert_eq!(result.get("list").and_then(|v| v.items().map(Vec::len)), Some(2));
}

#[test]
fn test_group_by_collects_items() {
    let result = eval(
        "Account.Order.Product{Name: Price}",
        account_data(),
    );
    assert_eq!(result.get("Bowler Hat"), Some(&Value::from(34.45)));
    assert_eq!(result.get("Cloak"), Some(&Value::from(107.99)));
}

#[test]
fn test_duplicate_keys_across_pair_expressions() {
    let err = eval_err(r#"$.{"k": 1, "k": 2}"#, json!(null));
    assert_eq!(err.code(), "D1009");
}

#[test]
fn test_non_string_key_is_error() {
    let err = eval_err("Account.Order.Product{Price: Name}", account_data());
    assert_eq!(err.code(), "T1003");
}

// ── sorting ──────────────────────────────────────────────────────────────────

#[test]
fn test_order_by_ascending_and_descending() {
    let result = eval("Account.Order.Product^(Price).Name", account_data());
    let names: Vec<&str> = result.items().unwrap().iter().filter_map(Value::as_str).collect();
    assert_eq!(names, vec!["Trilby hat", "Bowler Hat", "Cloak"]);

    let result = eval("Account.Order.Product^(>Price).SKU", account_data());
    let skus: Vec<&str> = result.items().unwrap().iter().filter_map(Value::as_str).collect();
    assert_eq!(skus, vec!["040657863", "0406654608", "0406634348"]);
}

#[test]
fn test_order_by_mixed_types_is_error() {
    let err = eval_err("items^(v)", json!({"items": [{"v": 1}, {"v": "a"}]}));
    assert_eq!(err.code(), "T2007");
}

// ── variables, lambdas, higher-order functions ───────────────────────────────

#[test]
fn test_variable_binding_in_block() {
    assert_eq!(eval("($x := 4; $x * $x)", json!(null)), Value::from(16.0));
}

#[test]
fn test_lambda_definition_and_call() {
    assert_eq!(
        eval("($square := function($n) { $n * $n }; $square(7))", json!(null)),
        Value::from(49.0)
    );
}

#[test]
fn test_signature_validation() {
    let err = eval_err(
        r#"($f := function($n)<n:n> { $n + 1 }; $f("two"))"#,
        json!(null),
    );
    assert_eq!(err.code(), "T0410");
}

#[test]
fn test_map_filter_reduce() {
    assert_eq!(
        eval("$map([1, 2, 3], function($v) { $v * 10 })", json!(null)).items().map(Vec::len),
        Some(3)
    );
    let result = eval("$filter([1, 2, 3, 4], function($v) { $v > 2 })", json!(null));
    let nums: Vec<f64> = result.items().unwrap().iter().filter_map(Value::as_f64).collect();
    assert_eq!(nums, vec![3.0, 4.0]);
    assert_eq!(
        eval("$reduce([1, 2, 3, 4], function($a, $b) { $a + $b })", json!(null)),
        Value::from(10.0)
    );
}

#[test]
fn test_sort_function_with_comparator() {
    let result = eval(
        "$sort([3, 1, 2], function($a, $b) { $a > $b })",
        json!(null),
    );
    let nums: Vec<f64> = result.items().unwrap().iter().filter_map(Value::as_f64).collect();
    assert_eq!(nums, vec![1.0, 2.0, 3.0]);
}

#[test]
fn test_partial_application_and_chaining() {
    assert_eq!(
        eval(
            "($add := function($a, $b) { $a + $b }; $inc := $add(?, 1); $inc(41))",
            json!(null)
        ),
        Value::from(42.0)
    );
    assert_eq!(
        eval(
            "($double := function($n) { $n * 2 }; 5 ~> $double ~> $double)",
            json!(null)
        ),
        Value::from(20.0)
    );
}

#[test]
fn test_apply_with_call_prepends_context() {
    assert_eq!(eval("[1, 2, 3] ~> $count()", json!(null)), Value::from(3.0));
}

// ── tail calls and resource bounds ───────────────────────────────────────────

#[test]
fn test_tail_recursion_runs_in_constant_depth() {
    let frame = new_frame();
    frame.set_runtime_bounds(RuntimeBounds {
        timeout_ms: None,
        max_depth: Some(64),
    });
    let expr = compile(
        "($sum := function($n, $acc) { $n = 0 ? $acc : $sum($n - 1, $acc + $n) }; $sum(1000, 0))",
    )
    .unwrap();
    let result = expr
        .evaluate_with_frame(&Value::Null, &frame)
        .unwrap();
    assert_eq!(result, Value::from(500500.0));
}

#[test]
fn test_non_tail_recursion_hits_depth_limit() {
    let frame = new_frame();
    frame.set_runtime_bounds(RuntimeBounds {
        timeout_ms: None,
        max_depth: Some(64),
    });
    // the addition happens after the recursive call, so every frame stays
    // on the stack
    let expr = compile("($sum := function($n) { $n = 0 ? 0 : $n + $sum($n - 1) }; $sum(1000))")
        .unwrap();
    let err = expr.evaluate_with_frame(&Value::Null, &frame).unwrap_err();
    assert_eq!(err.code(), "U1001");
}

#[test]
fn test_timeout_stops_runaway_evaluation() {
    let frame = new_frame();
    frame.set_runtime_bounds(RuntimeBounds {
        timeout_ms: Some(100),
        max_depth: None,
    });
    let expr = compile("($loop := function($n) { $loop($n + 1) }; $loop(0))").unwrap();
    let err = expr.evaluate_with_frame(&Value::Null, &frame).unwrap_err();
    assert_eq!(err.code(), "U1002");
}

// ── ancestor references ──────────────────────────────────────────────────────

#[test]
fn test_parent_operator_recovers_ancestor() {
    let result = eval(
        "Account.Order.Product.{ \"product\": Name, \"order\": %.OrderID }",
        account_data(),
    );
    // one object per product; the mapping runs per product so the result
    // is a sequence of objects
    let objects = result.items().cloned().unwrap_or_else(|| vec![result.clone()]);
    assert_eq!(objects.len(), 3);
    assert_eq!(objects[0].get("order"), Some(&Value::from("order103")));
    assert_eq!(objects[2].get("order"), Some(&Value::from("order104")));
}

#[test]
fn test_unresolvable_parent_is_compile_error() {
    let err = compile("%.foo").unwrap_err();
    assert_eq!(err.code(), "S0217");
}

// ── context and index bindings ───────────────────────────────────────────────

#[test]
fn test_index_binding() {
    let result = eval("library.books#$i.{ \"title\": title, \"index\": $i }", json!({
        "library": {
            "books": [ {"title": "a"}, {"title": "b"} ]
        }
    }));
    let objects = result.items().cloned().unwrap();
    assert_eq!(objects[0].get("index"), Some(&Value::from(0.0)));
    assert_eq!(objects[1].get("index"), Some(&Value::from(1.0)));
}

#[test]
fn test_focus_bindings_join_sibling_collections() {
    // the focus binding keeps the context at the parent, so the second
    // step scans a sibling collection and the predicate joins the two
    let data = json!({
        "library": {
            "loans": [
                { "isbn": "111", "customer": "joe" },
                { "isbn": "222", "customer": "ann" }
            ],
            "books": [
                { "isbn": "111", "title": "Structure and Interpretation" },
                { "isbn": "222", "title": "The Art of Computer Programming" },
                { "isbn": "333", "title": "Compilers" }
            ]
        }
    });
    let result = eval(
        "library.loans@$l.books@$b[$l.isbn = $b.isbn].{ \"title\": $b.title, \"customer\": $l.customer }",
        data,
    );
    let objects = result.items().cloned().unwrap();
    assert_eq!(objects.len(), 2);
    assert_eq!(objects[0].get("customer"), Some(&Value::from("joe")));
    assert_eq!(
        objects[1].get("title"),
        Some(&Value::from("The Art of Computer Programming"))
    );
}

// ── transforms ───────────────────────────────────────────────────────────────

#[test]
fn test_transform_updates_matched_objects() {
    let expr = "| Account.Order.Product | { \"Price\": Price * 2 } |";
    let result = eval(expr, json!(null));
    // a transform evaluates to a function; apply it to the document
    assert!(result.is_function());

    let applied = eval(
        "$ ~> | Account.Order.Product | { \"Price\": Price * 2 } |",
        account_data(),
    );
    let prices = eval_on_value("Account.Order.Product.Price", &applied);
    let nums: Vec<f64> = prices.items().unwrap().iter().filter_map(Value::as_f64).collect();
    assert_eq!(nums, vec![68.9, 43.34, 215.98]);
}

#[test]
fn test_transform_delete_clause() {
    let applied = eval(
        "$ ~> | Account.Order.Product | {}, [\"Price\", \"Quantity\"] |",
        account_data(),
    );
    let prices = eval_on_value("Account.Order.Product.Price", &applied);
    assert!(prices.is_undefined());
    let names = eval_on_value("Account.Order.Product.Name", &applied);
    assert_eq!(names.items().map(Vec::len), Some(3));
}

fn eval_on_value(expr: &str, input: &Value) -> Value {
    compile(expr).unwrap().evaluate(input).unwrap()
}

// ── builtins ─────────────────────────────────────────────────────────────────

#[test]
fn test_string_number_boolean_casts() {
    assert_eq!(eval("$string(5)", json!(null)), Value::from("5"));
    assert_eq!(eval("$string([1, 2])", json!(null)), Value::from("[1,2]"));
    assert_eq!(eval(r#"$number("3.5")"#, json!(null)), Value::from(3.5));
    assert_eq!(eval("$boolean([])", json!(null)), Value::Bool(false));
    assert_eq!(eval("$not(0)", json!(null)), Value::Bool(true));
    let err = eval_err(r#"$number("nope")"#, json!(null));
    assert_eq!(err.code(), "D3030");
}

#[test]
fn test_keys_lookup_append_count() {
    let result = eval("$keys($)", json!({"a": 1, "b": 2}));
    assert_eq!(result.items().map(Vec::len), Some(2));
    assert_eq!(eval(r#"$lookup($, "a")"#, json!({"a": 7})), Value::from(7.0));
    assert_eq!(eval("$count($append([1, 2], 3))", json!(null)), Value::from(3.0));
    assert_eq!(eval("$count(missing)", json!({})), Value::from(0.0));
}

#[test]
fn test_exists_and_type() {
    assert_eq!(eval("$exists(a)", json!({"a": null})), Value::Bool(true));
    assert_eq!(eval("$exists(b)", json!({"a": 1})), Value::Bool(false));
    assert_eq!(eval("$type(a)", json!({"a": null})), Value::from("null"));
    assert_eq!(eval("$type([1])", json!(null)), Value::from("array"));
}

#[test]
fn test_error_and_assert() {
    let err = eval_err(r#"$error("boom")"#, json!(null));
    assert_eq!(err.code(), "D3137");
    assert_eq!(err.to_string(), "D3137: boom");
    let err = eval_err(r#"$assert(1 = 2, "off by one")"#, json!(null));
    assert_eq!(err.code(), "D3141");
}

#[test]
fn test_sift_each_single() {
    let result = eval("$sift($, function($v) { $v > 1 })", json!({"a": 1, "b": 2}));
    assert_eq!(result.get("b"), Some(&Value::from(2.0)));
    assert_eq!(result.get("a"), None);

    let result = eval("$each($, function($v, $k) { $k & \"=\" & $v })", json!({"x": 1}));
    assert_eq!(result, Value::from("x=1"));

    let err = eval_err("$single([1, 2], function($v) { $v > 0 })", json!(null));
    assert_eq!(err.code(), "D3138");
}

// ── compile-time errors and recovery ─────────────────────────────────────────

#[test]
fn test_syntax_error_codes() {
    assert_eq!(compile("(a").unwrap_err().code(), "S0203");
    assert_eq!(compile("1 := 2").unwrap_err().code(), "S0212");
    assert_eq!(compile("a.null").unwrap_err().code(), "S0213");
}

#[test]
fn test_recovery_collects_multiple_errors() {
    let (expr, errors) = compile_with_recovery("a.;b.;c");
    // each broken step reports separately
    assert!(errors.len() >= 2);
    let expr = expr.unwrap();
    // an expression holding errors refuses to evaluate
    let err = expr.evaluate(&Value::Null).unwrap_err();
    assert_eq!(err.code(), "S0500");
}

#[test]
fn test_error_determinism() {
    let a = eval_err("Account.Order.Product{Price: 1}", account_data());
    let b = eval_err("Account.Order.Product{Price: 1}", account_data());
    assert_eq!(a, b);
}

// ── concurrency ──────────────────────────────────────────────────────────────

#[test]
fn test_compiled_expression_shared_across_threads() {
    let expr = std::sync::Arc::new(compile("Account.Order.Product.Price").unwrap());
    let mut handles = Vec::new();
    for _ in 0..4 {
        let expr = std::sync::Arc::clone(&expr);
        handles.push(std::thread::spawn(move || {
            let input = Value::from(account_data());
            let result = expr.evaluate(&input).unwrap();
            result.items().map(Vec::len)
        }));
    }
    for handle in handles {
        assert_eq!(handle.join().unwrap(), Some(3));
    }
}

#[test]
fn test_tracing_hooks_observe_every_node() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    let entries = Arc::new(AtomicUsize::new(0));
    let exits = Arc::new(AtomicUsize::new(0));
    let (e, x) = (Arc::clone(&entries), Arc::clone(&exits));
    let expr = compile("a + b").unwrap().with_tracing(
        Arc::new(move |_node, _input, frame| {
            // the root input is always reachable from the hook's frame
            assert!(!frame.lookup("$").is_undefined());
            e.fetch_add(1, Ordering::Relaxed);
        }),
        Arc::new(move |_node, _input, _frame| {
            x.fetch_add(1, Ordering::Relaxed);
        }),
    );
    let result = expr.evaluate(&Value::from(json!({"a": 1, "b": 2}))).unwrap();
    assert_eq!(result, Value::from(3.0));
    let entered = entries.load(Ordering::Relaxed);
    assert_eq!(entered, exits.load(Ordering::Relaxed));
    // binary node plus its two name operands, at minimum
    assert!(entered >= 3);
}

// ── host extension ───────────────────────────────────────────────────────────

#[test]
fn test_registered_native_function() {
    let frame = new_frame();
    frame
        .register_native("twice", Some("<n:n>"), |_ev, _ctx, args| {
            Ok(Value::from(args[0].as_f64().unwrap_or(0.0) * 2.0))
        })
        .unwrap();
    let expr = compile("$twice(21)").unwrap();
    assert_eq!(
        expr.evaluate_with_frame(&Value::Null, &frame).unwrap(),
        Value::from(42.0)
    );
}
