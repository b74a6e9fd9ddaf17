//! Decoding server plans from JSON

use shardql_plan::{
    DistinctStrategy, Expr, OperatorKind, PlanError, PlanStep, QueryPlan, SortMode, Value, VarRef,
};

const ORDERED_PLAN: &str = r#"{
    "version": 1,
    "root": {
        "kind": "project",
        "fields": [
            {"name": "id", "expr": {"kind": "field", "name": "id"}},
            {"name": "scaled", "expr": {
                "kind": "arith", "op": "mul",
                "left": {"kind": "field", "name": "price"},
                "right": {"kind": "bind_var", "var": 1}
            }},
            {"name": "label", "expr": {"kind": "function", "name": "upper", "args": [
                {"kind": "field", "name": "name", "input": {"kind": "field", "name": "info"}}
            ]}}
        ],
        "input": {
            "kind": "distinct",
            "keys": ["id"],
            "strategy": "adjacent",
            "input": {
                "kind": "sort",
                "mode": "merge",
                "keys": [{"field": "id"}, {"field": "ts", "desc": true, "nulls_first": true}],
                "input": {"kind": "receive", "table": "items", "shards": [0, 1, 2], "ordered": true}
            }
        }
    }
}"#;

#[test]
fn test_decode_full_plan() {
    let plan = QueryPlan::from_json(ORDERED_PLAN).expect("plan should decode");

    assert_eq!(
        plan.shape(),
        vec![
            OperatorKind::Project,
            OperatorKind::Distinct,
            OperatorKind::Sort,
            OperatorKind::Receive,
        ]
    );
    assert_eq!(plan.bind_references(), vec![&VarRef::Position(1)]);

    match &plan.root {
        PlanStep::Project { input, fields } => {
            assert_eq!(fields.len(), 3);
            match input.as_ref() {
                PlanStep::Distinct { strategy, keys, input } => {
                    assert_eq!(*strategy, DistinctStrategy::Adjacent);
                    assert_eq!(keys, &vec!["id".to_string()]);
                    assert!(matches!(
                        input.as_ref(),
                        PlanStep::Sort { mode: SortMode::Merge, .. }
                    ));
                }
                other => panic!("expected distinct, got {:?}", other),
            }
        }
        other => panic!("expected project, got {:?}", other),
    }
}

#[test]
fn test_unknown_step_kind_is_rejected() {
    let json = r#"{
        "version": 1,
        "root": {"kind": "window", "input": {"kind": "receive", "table": "t", "shards": [1]}}
    }"#;
    let err = QueryPlan::from_json(json).unwrap_err();
    assert!(matches!(err, PlanError::Decode(_)));
    assert!(err.to_string().contains("window"));
}

#[test]
fn test_unknown_expression_kind_is_rejected() {
    let json = r#"{"version": 1, "root": {
        "kind": "project",
        "fields": [{"name": "x", "expr": {"kind": "subquery"}}],
        "input": {"kind": "receive", "table": "t", "shards": [1]}
    }}"#;
    assert!(matches!(QueryPlan::from_json(json), Err(PlanError::Decode(_))));
}

#[test]
fn test_defaults_for_optional_fields() {
    let json = r#"{"version": 1, "root": {
        "kind": "sort",
        "keys": [{"field": "k"}],
        "input": {"kind": "receive", "table": "t", "shards": [4]}
    }}"#;
    let plan = QueryPlan::from_json(json).unwrap();
    match plan.root {
        PlanStep::Sort { mode, keys, input } => {
            assert_eq!(mode, SortMode::Materialize);
            assert!(!keys[0].desc);
            assert!(!keys[0].nulls_first);
            assert!(matches!(*input, PlanStep::Receive { ordered: false, .. }));
        }
        other => panic!("expected sort, got {:?}", other),
    }
}

#[test]
fn test_empty_shard_list_is_invalid() {
    let json = r#"{"version": 1, "root": {"kind": "receive", "table": "t", "shards": []}}"#;
    assert!(matches!(QueryPlan::from_json(json), Err(PlanError::Invalid(_))));
}

#[test]
fn test_constants_keep_their_types() {
    let json = r#"{"version": 1, "root": {
        "kind": "slice",
        "offset": {"kind": "const", "value": 2},
        "limit": {"kind": "const", "value": 10},
        "input": {"kind": "receive", "table": "t", "shards": [1]}
    }}"#;
    let plan = QueryPlan::from_json(json).unwrap();
    match plan.root {
        PlanStep::Slice {
            offset: Some(Expr::Const { value }),
            ..
        } => assert!(matches!(value, Value::Int(2))),
        other => panic!("expected slice, got {:?}", other),
    }
}
