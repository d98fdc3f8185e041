//! End-to-end plan generation scenarios: bind a statement, hand the
//! generator a candidate onion set, and check the shape of the plan tree
//! and the rewritten server SQL.

use onionql_ast::{
    AggOp, BinOp, Binder, BoundStmt, CmpOp, Expr, GroupBy, Literal, OrderDirection, OrderKey,
    Projection, RelationDecl, RelationSource, SelectStmt,
};
use onionql_error::PlanError;
use onionql_planner::{
    EncContext, OnionSet, PlanGenerator, PlanNode, TransformOutput,
};
use onionql_types::{ColumnDef, DataType, Onion, OnionType, Schema, Statistics, TableDef};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn schema() -> Schema {
    let mut s = Schema::new();
    s.add_table(TableDef {
        name: "lineitem".to_owned(),
        columns: vec![
            ColumnDef {
                name: "l_extendedprice".to_owned(),
                ty: DataType::Decimal,
            },
            ColumnDef {
                name: "l_discount".to_owned(),
                ty: DataType::Decimal,
            },
            ColumnDef {
                name: "l_quantity".to_owned(),
                ty: DataType::Decimal,
            },
            ColumnDef {
                name: "l_shipdate".to_owned(),
                ty: DataType::Date,
            },
        ],
    });
    s.add_table(TableDef {
        name: "t".to_owned(),
        columns: vec![
            ColumnDef {
                name: "a".to_owned(),
                ty: DataType::Int,
            },
            ColumnDef {
                name: "b".to_owned(),
                ty: DataType::Str,
            },
            ColumnDef {
                name: "k".to_owned(),
                ty: DataType::Int,
            },
            ColumnDef {
                name: "x".to_owned(),
                ty: DataType::Decimal,
            },
        ],
    });
    s.add_table(TableDef {
        name: "u".to_owned(),
        columns: vec![
            ColumnDef {
                name: "a".to_owned(),
                ty: DataType::Int,
            },
            ColumnDef {
                name: "b".to_owned(),
                ty: DataType::Int,
            },
        ],
    });
    s
}

fn table(name: &str) -> RelationDecl {
    RelationDecl {
        alias: name.to_owned(),
        source: RelationSource::Table {
            name: name.to_owned(),
        },
    }
}

fn proj(expr: Expr) -> Projection {
    Projection::Expr { expr, alias: None }
}

fn bind(stmt: SelectStmt) -> BoundStmt {
    Binder::new(&schema()).bind(stmt).expect("statement binds")
}

fn plan_with(onions: &OnionSet, bound: &BoundStmt, enc: &EncContext) -> PlanNode {
    let schema = schema();
    let stats = Statistics::new();
    let gen = PlanGenerator::new(&schema, &stats, onions);
    match gen.generate_plan(bound, enc) {
        Ok(p) => p,
        Err(e) => panic!("plan generation failed: {e}"),
    }
}

fn leaf_sql(plan: &PlanNode) -> String {
    let mut cur = plan;
    loop {
        match cur {
            PlanNode::RemoteSql { stmt, .. } => return stmt.to_string(),
            other => cur = other.child().expect("leaf reached without RemoteSql"),
        }
    }
}

fn price_product() -> Expr {
    Expr::binop(
        BinOp::Mult,
        Expr::field("l_extendedprice"),
        Expr::binop(BinOp::Minus, Expr::int(1), Expr::field("l_discount")),
    )
}

// ---------------------------------------------------------------------------
// Packed-HOM sums
// ---------------------------------------------------------------------------

#[test]
fn test_sum_over_packed_hom_group_with_ope_filter() {
    // SELECT SUM(l_extendedprice * (1 - l_discount)) FROM lineitem
    // WHERE l_shipdate < date '1998-09-01'
    let mut stmt = SelectStmt::simple(
        vec![proj(Expr::Agg {
            op: AggOp::Sum,
            arg: Box::new(price_product()),
        })],
        vec![table("lineitem")],
    );
    stmt.filter = Some(Expr::cmp(
        CmpOp::Lt,
        Expr::field("l_shipdate"),
        Expr::Lit(Literal::Date("1998-09-01".to_owned())),
    ));
    let bound = bind(stmt);

    let mut onions = OnionSet::new();
    onions.add_packed_hom("lineitem", &Expr::field("l_quantity"));
    onions.add_packed_hom_to_last_group("lineitem", &price_product());
    onions.add("lineitem", &Expr::field("l_shipdate"), Onion::OPE);
    onions.complete(&schema());

    let plan = plan_with(&onions, &bound, &EncContext::PreserveOriginal);

    let PlanNode::LocalTransform { outputs, child } = &plan else {
        panic!("expected LocalTransform on top, got:\n{plan}");
    };
    assert_eq!(outputs.len(), 1);
    let TransformOutput::Expr { expr, .. } = &outputs[0] else {
        panic!("expected computed output");
    };
    assert_eq!(
        expr.to_string(),
        "hom_get_pos($0, 1)",
        "client extracts the product's slot within the packed group"
    );
    let PlanNode::LocalDecrypt { positions, .. } = child.as_ref() else {
        panic!("expected LocalDecrypt under the transform, got:\n{child}");
    };
    assert_eq!(positions, &[0]);

    let sql = leaf_sql(&plan);
    assert!(
        sql.contains("hom_agg(lineitem$enc.rowid, 'lineitem', 0)"),
        "sql: {sql}"
    );
    assert!(
        sql.contains("l_shipdate$OPE < encrypt(date '1998-09-01', 'OPE')"),
        "sql: {sql}"
    );
    assert!(sql.contains("FROM lineitem$enc"), "sql: {sql}");
}

#[test]
fn test_grouped_avg_divides_hom_sum_by_count() {
    // SELECT AVG(x) FROM t GROUP BY k
    let mut stmt = SelectStmt::simple(
        vec![proj(Expr::Agg {
            op: AggOp::Avg,
            arg: Box::new(Expr::field("x")),
        })],
        vec![table("t")],
    );
    stmt.group_by = Some(GroupBy {
        keys: vec![Expr::field("k")],
        having: None,
    });
    let bound = bind(stmt);

    let mut onions = OnionSet::new();
    onions.add_packed_hom("t", &Expr::field("x"));
    onions.complete(&schema());

    let plan = plan_with(&onions, &bound, &EncContext::PreserveOriginal);
    let sql = leaf_sql(&plan);
    assert!(sql.contains("hom_agg(t$enc.rowid, 't', 0)"), "sql: {sql}");
    assert!(sql.contains("COUNT(*)"), "sql: {sql}");
    assert!(sql.contains("GROUP BY t$enc.k$DET"), "sql: {sql}");

    let PlanNode::LocalTransform { outputs, child } = &plan else {
        panic!("expected LocalTransform on top, got:\n{plan}");
    };
    let TransformOutput::Expr { expr, .. } = &outputs[0] else {
        panic!("expected computed output");
    };
    assert_eq!(expr.to_string(), "hom_get_pos($0, 0) / $1");
    let PlanNode::LocalDecrypt { positions, .. } = child.as_ref() else {
        panic!("expected LocalDecrypt, got:\n{child}");
    };
    // Only the packed aggregate needs decryption; COUNT(*) is plaintext.
    assert_eq!(positions, &[0]);
}

#[test]
fn test_sum_prefers_least_used_hom_group() {
    // x lives in two groups; x+k only in the second. The shared group is
    // the more-used one, so SUM(x) should take the other.
    let stmt = SelectStmt::simple(
        vec![
            proj(Expr::Agg {
                op: AggOp::Sum,
                arg: Box::new(Expr::field("x")),
            }),
            proj(Expr::Agg {
                op: AggOp::Sum,
                arg: Box::new(Expr::binop(BinOp::Plus, Expr::field("x"), Expr::field("k"))),
            }),
        ],
        vec![table("t")],
    );
    let bound = bind(stmt);

    let mut onions = OnionSet::new();
    // group 0: [x]            candidate only for SUM(x), usage 1
    // group 1: [x, x + k]     candidate for both sums, usage 2
    onions.add_packed_hom("t", &Expr::field("x"));
    onions.add_packed_hom("t", &Expr::field("x"));
    onions.add_packed_hom_to_last_group(
        "t",
        &Expr::binop(BinOp::Plus, Expr::field("x"), Expr::field("k")),
    );
    onions.complete(&schema());

    let plan = plan_with(&onions, &bound, &EncContext::PreserveOriginal);
    let sql = leaf_sql(&plan);
    assert!(
        sql.contains("hom_agg(t$enc.rowid, 't', 0)"),
        "SUM(x) should use the less-used group 0; sql: {sql}"
    );
    assert!(
        sql.contains("hom_agg(t$enc.rowid, 't', 1)"),
        "SUM(x + k) can only use group 1; sql: {sql}"
    );
}

// ---------------------------------------------------------------------------
// Order-by and decrypt boundaries
// ---------------------------------------------------------------------------

#[test]
fn test_ope_order_by_projects_key_and_decrypts_output() {
    // SELECT a FROM t ORDER BY a, with a under OPE (plus completed DET).
    let mut stmt = SelectStmt::simple(vec![proj(Expr::field("a"))], vec![table("t")]);
    stmt.order_by = vec![OrderKey {
        expr: Expr::field("a"),
        dir: OrderDirection::Asc,
    }];
    let bound = bind(stmt);

    let mut onions = OnionSet::new();
    onions.add("t", &Expr::field("a"), Onion::OPE);
    onions.complete(&schema());

    let plan = plan_with(&onions, &bound, &EncContext::PreserveOriginal);

    let PlanNode::LocalTransform { outputs, child } = &plan else {
        panic!("expected LocalTransform on top, got:\n{plan}");
    };
    assert_eq!(outputs, &[TransformOutput::Position(0)]);
    let PlanNode::LocalDecrypt { positions, child } = child.as_ref() else {
        panic!("expected LocalDecrypt, got:\n{child}");
    };
    assert_eq!(positions, &[0]);
    assert!(child.is_remote_sql());

    let sql = leaf_sql(&plan);
    assert!(sql.contains("a$DET"), "sql: {sql}");
    assert!(sql.contains("ORDER BY t$enc.a$OPE"), "sql: {sql}");
}

#[test]
fn test_order_by_without_ope_sorts_locally_after_decrypt() {
    // SELECT a, b FROM t ORDER BY b DESC with no OPE anywhere.
    let mut stmt = SelectStmt::simple(
        vec![proj(Expr::field("a")), proj(Expr::field("b"))],
        vec![table("t")],
    );
    stmt.order_by = vec![OrderKey {
        expr: Expr::field("b"),
        dir: OrderDirection::Desc,
    }];
    let bound = bind(stmt);

    let mut onions = OnionSet::new();
    onions.complete(&schema());

    let plan = plan_with(&onions, &bound, &EncContext::PreserveOriginal);
    let PlanNode::LocalOrderBy { keys, child } = &plan else {
        panic!("expected LocalOrderBy on top, got:\n{plan}");
    };
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].pos, 1);
    assert_eq!(keys[0].dir, OrderDirection::Desc);
    assert!(!keys[0].ope_compare);
    let PlanNode::LocalDecrypt { positions, .. } = child.as_ref() else {
        panic!("expected LocalDecrypt, got:\n{child}");
    };
    assert_eq!(positions, &[0, 1]);

    let sql = leaf_sql(&plan);
    assert!(!sql.contains("ORDER BY"), "sort must not stay server-side: {sql}");
}

#[test]
fn test_residual_limit_applies_after_local_filter() {
    let mut stmt = SelectStmt::simple(vec![proj(Expr::field("a"))], vec![table("t")]);
    stmt.filter = Some(Expr::cmp(
        CmpOp::Gt,
        Expr::Call {
            name: "f".to_owned(),
            args: vec![Expr::field("a")],
        },
        Expr::int(3),
    ));
    stmt.limit = Some(10);
    let bound = bind(stmt);

    let mut onions = OnionSet::new();
    onions.complete(&schema());

    let plan = plan_with(&onions, &bound, &EncContext::PreserveOriginal);
    let PlanNode::LocalLimit { n, child } = &plan else {
        panic!("expected LocalLimit on top, got:\n{plan}");
    };
    assert_eq!(*n, 10);
    assert!(matches!(child.as_ref(), PlanNode::LocalFilter { .. }));
    let sql = leaf_sql(&plan);
    assert!(!sql.contains("LIMIT"), "limit must not stay server-side: {sql}");
}

// ---------------------------------------------------------------------------
// Pure-server rewrites
// ---------------------------------------------------------------------------

#[test]
fn test_count_with_det_and_precomputed_filter_is_pure_server() {
    // SELECT COUNT(*) FROM t WHERE a = 5 AND substr(b, 1, 2) = 'AB'
    let substr = Expr::Call {
        name: "substr".to_owned(),
        args: vec![Expr::field("b"), Expr::int(1), Expr::int(2)],
    };
    let mut stmt = SelectStmt::simple(vec![proj(Expr::CountStar)], vec![table("t")]);
    stmt.filter = Some(Expr::and(
        Expr::cmp(CmpOp::Eq, Expr::field("a"), Expr::int(5)),
        Expr::cmp(CmpOp::Eq, substr.clone(), Expr::str("AB")),
    ));
    let bound = bind(stmt);

    let mut onions = OnionSet::new();
    onions.add("t", &substr, Onion::DET);
    onions.complete(&schema());

    let plan = plan_with(&onions, &bound, &EncContext::PreserveOriginal);
    assert!(
        plan.is_remote_sql(),
        "no client wrappers expected, got:\n{plan}"
    );
    let sql = leaf_sql(&plan);
    assert!(sql.contains("COUNT(*)"), "sql: {sql}");
    assert!(sql.contains("a$DET = encrypt(5, 'DET')"), "sql: {sql}");
    assert!(
        sql.contains("precomp$0$DET = encrypt('AB', 'DET')"),
        "precomputed substr column expected; sql: {sql}"
    );
}

#[test]
fn test_in_subselect_inlines_pure_remote_sql() {
    // SELECT a FROM t WHERE a IN (SELECT MIN(b) FROM u)
    let inner = SelectStmt::simple(
        vec![proj(Expr::Agg {
            op: AggOp::Min,
            arg: Box::new(Expr::field("b")),
        })],
        vec![table("u")],
    );
    let mut stmt = SelectStmt::simple(vec![proj(Expr::field("a"))], vec![table("t")]);
    stmt.filter = Some(Expr::In {
        needle: Box::new(Expr::field("a")),
        set: vec![Expr::Subselect(Box::new(inner))],
        negated: false,
    });
    let bound = bind(stmt);

    let mut onions = OnionSet::new();
    onions.add("t", &Expr::field("a"), Onion::OPE);
    onions.add("u", &Expr::field("b"), Onion::OPE);
    onions.complete(&schema());

    let plan = plan_with(&onions, &bound, &EncContext::PreserveOriginal);
    // The only client work is decrypting the projected column.
    let PlanNode::LocalDecrypt { child, .. } = &plan else {
        panic!("expected LocalDecrypt on top, got:\n{plan}");
    };
    let PlanNode::RemoteSql { subplans, .. } = child.as_ref() else {
        panic!("expected inlined RemoteSql, got:\n{child}");
    };
    assert!(subplans.is_empty());

    let sql = leaf_sql(&plan);
    assert!(
        sql.contains("a$OPE IN (SELECT MIN(u$enc.b$OPE)"),
        "sql: {sql}"
    );
    assert!(sql.contains("FROM u$enc"), "sql: {sql}");
}

// ---------------------------------------------------------------------------
// Residual filters
// ---------------------------------------------------------------------------

#[test]
fn test_unsupported_function_filter_goes_residual() {
    // SELECT a FROM t WHERE f(a) > 3, no onion for f(a).
    let mut stmt = SelectStmt::simple(vec![proj(Expr::field("a"))], vec![table("t")]);
    stmt.filter = Some(Expr::cmp(
        CmpOp::Gt,
        Expr::Call {
            name: "f".to_owned(),
            args: vec![Expr::field("a")],
        },
        Expr::int(3),
    ));
    let bound = bind(stmt);

    let mut onions = OnionSet::new();
    onions.complete(&schema());

    let plan = plan_with(&onions, &bound, &EncContext::PreserveOriginal);
    let PlanNode::LocalFilter { expr, child, .. } = &plan else {
        panic!("expected LocalFilter on top, got:\n{plan}");
    };
    assert_eq!(expr.to_string(), "f($0) > 3");
    let PlanNode::LocalDecrypt { positions, child } = child.as_ref() else {
        panic!("expected LocalDecrypt, got:\n{child}");
    };
    assert_eq!(positions, &[0]);
    assert!(child.is_remote_sql());

    let sql = leaf_sql(&plan);
    assert!(sql.contains("a$DET"), "sql: {sql}");
    assert!(sql.get(..6) == Some("SELECT"), "sql: {sql}");
    assert!(!sql.contains("WHERE"), "filter must move client-side: {sql}");
}

#[test]
fn test_mixed_conjunction_splits_between_server_and_client() {
    // WHERE a = 5 AND f(b) = 'x': the equality stays server-side, the
    // function call becomes a local filter.
    let mut stmt = SelectStmt::simple(vec![proj(Expr::field("a"))], vec![table("t")]);
    stmt.filter = Some(Expr::and(
        Expr::cmp(CmpOp::Eq, Expr::field("a"), Expr::int(5)),
        Expr::cmp(
            CmpOp::Eq,
            Expr::Call {
                name: "f".to_owned(),
                args: vec![Expr::field("b")],
            },
            Expr::str("x"),
        ),
    ));
    let bound = bind(stmt);

    let mut onions = OnionSet::new();
    onions.complete(&schema());

    let plan = plan_with(&onions, &bound, &EncContext::PreserveOriginal);
    let PlanNode::LocalFilter { expr, .. } = &plan else {
        panic!("expected LocalFilter on top, got:\n{plan}");
    };
    assert!(expr.to_string().contains("f($"), "client expr: {expr}");

    let sql = leaf_sql(&plan);
    assert!(
        sql.contains("WHERE t$enc.a$DET = encrypt(5, 'DET')"),
        "server keeps the answerable conjunct; sql: {sql}"
    );
}

#[test]
fn test_correlated_exists_becomes_residual_subplan() {
    // SELECT a FROM t WHERE EXISTS (SELECT b FROM u WHERE u.b = t.a)
    let inner = {
        let mut s = SelectStmt::simple(
            vec![proj(Expr::qualified_field("u", "b"))],
            vec![table("u")],
        );
        s.filter = Some(Expr::cmp(
            CmpOp::Eq,
            Expr::qualified_field("u", "b"),
            Expr::qualified_field("t", "a"),
        ));
        s
    };
    let mut stmt = SelectStmt::simple(vec![proj(Expr::field("a"))], vec![table("t")]);
    stmt.filter = Some(Expr::Exists(Box::new(inner)));
    let bound = bind(stmt);

    let mut onions = OnionSet::new();
    onions.complete(&schema());

    let plan = plan_with(&onions, &bound, &EncContext::PreserveOriginal);
    let PlanNode::LocalFilter {
        expr,
        child,
        subplans,
        ..
    } = &plan
    else {
        panic!("expected LocalFilter on top, got:\n{plan}");
    };
    assert_eq!(expr.to_string(), "exists$0");
    assert_eq!(subplans.len(), 1);
    let PlanNode::RemoteSql { stmt: sub_sql, .. } = &subplans[0] else {
        panic!("expected RemoteSql subplan, got:\n{}", subplans[0]);
    };
    let sub = sub_sql.to_string();
    // The outer reference is a placeholder bound from outer tuple
    // position 0, which the outer plan projects and decrypts.
    assert!(sub.contains("u$enc.b$DET = :p0"), "subquery sql: {sub}");
    let PlanNode::LocalDecrypt { positions, .. } = child.as_ref() else {
        panic!("expected LocalDecrypt, got:\n{child}");
    };
    assert_eq!(positions, &[0]);
}

#[test]
fn test_residual_having_becomes_group_filter() {
    // SELECT COUNT(*) FROM t GROUP BY k HAVING f(k) > 2
    let mut stmt = SelectStmt::simple(vec![proj(Expr::CountStar)], vec![table("t")]);
    stmt.group_by = Some(GroupBy {
        keys: vec![Expr::field("k")],
        having: Some(Expr::cmp(
            CmpOp::Gt,
            Expr::Call {
                name: "f".to_owned(),
                args: vec![Expr::field("k")],
            },
            Expr::int(2),
        )),
    });
    let bound = bind(stmt);

    let mut onions = OnionSet::new();
    onions.complete(&schema());

    let plan = plan_with(&onions, &bound, &EncContext::PreserveOriginal);
    let mut cur = &plan;
    let mut saw_group_filter = false;
    while let Some(child) = cur.child() {
        if let PlanNode::LocalGroupFilter { expr, .. } = cur {
            saw_group_filter = true;
            assert!(expr.to_string().contains("f($"), "client expr: {expr}");
        }
        cur = child;
    }
    assert!(saw_group_filter, "expected a LocalGroupFilter, got:\n{plan}");

    let sql = leaf_sql(&plan);
    // The group key is projected for the client under its grouping onion.
    assert!(sql.contains("GROUP BY t$enc.k$DET"), "sql: {sql}");
    assert!(!sql.contains("HAVING"), "sql: {sql}");
}

#[test]
fn test_residual_sum_uses_group_concat_vector() {
    // SELECT SUM(x) FROM t GROUP BY k with x only under DET.
    let mut stmt = SelectStmt::simple(
        vec![proj(Expr::Agg {
            op: AggOp::Sum,
            arg: Box::new(Expr::field("x")),
        })],
        vec![table("t")],
    );
    stmt.group_by = Some(GroupBy {
        keys: vec![Expr::field("k")],
        having: None,
    });
    let bound = bind(stmt);

    let mut onions = OnionSet::new();
    onions.complete(&schema());

    let plan = plan_with(&onions, &bound, &EncContext::PreserveOriginal);
    let sql = leaf_sql(&plan);
    assert!(
        sql.contains("GROUP_CONCAT(t$enc.x$DET, ',')"),
        "sql: {sql}"
    );

    // Find the RemoteSql descriptor: the vector column is flagged.
    let mut cur = &plan;
    loop {
        if let PlanNode::RemoteSql { desc, .. } = cur {
            assert!(desc[0].vector_ctx);
            assert_eq!(desc[0].onion, OnionType::Bit(Onion::DET));
            break;
        }
        cur = cur.child().expect("RemoteSql leaf");
    }

    let PlanNode::LocalTransform { outputs, .. } = &plan else {
        panic!("expected LocalTransform on top, got:\n{plan}");
    };
    let TransformOutput::Expr { expr, .. } = &outputs[0] else {
        panic!("expected computed output");
    };
    assert_eq!(expr.to_string(), "SUM($0)");
}

// ---------------------------------------------------------------------------
// Derived tables
// ---------------------------------------------------------------------------

#[test]
fn test_pure_remote_subquery_relation_is_inlined() {
    // SELECT s.a FROM (SELECT a FROM u) s WHERE s.a = 1
    let inner = SelectStmt::simple(
        vec![proj(Expr::field("a"))],
        vec![table("u")],
    );
    let mut stmt = SelectStmt::simple(
        vec![proj(Expr::qualified_field("s", "a"))],
        vec![RelationDecl {
            alias: "s".to_owned(),
            source: RelationSource::Subquery(Box::new(inner)),
        }],
    );
    stmt.filter = Some(Expr::cmp(
        CmpOp::Eq,
        Expr::qualified_field("s", "a"),
        Expr::int(1),
    ));
    let bound = bind(stmt);

    let mut onions = OnionSet::new();
    onions.complete(&schema());

    let plan = plan_with(&onions, &bound, &EncContext::PreserveOriginal);
    let sql = leaf_sql(&plan);
    assert!(sql.contains("(SELECT u$enc.a$DET AS a FROM u$enc) AS s"), "sql: {sql}");
    assert!(sql.contains("s.a = "), "outer references the inlined alias; sql: {sql}");
}

#[test]
fn test_non_pure_subquery_relation_is_materialized() {
    // The inner ORDER BY has no OPE onion, so the child plan sorts
    // locally and cannot be inlined.
    let inner = {
        let mut s = SelectStmt::simple(vec![proj(Expr::field("a"))], vec![table("u")]);
        s.order_by = vec![OrderKey {
            expr: Expr::field("a"),
            dir: OrderDirection::Asc,
        }];
        s.limit = Some(5);
        s
    };
    let stmt = SelectStmt::simple(
        vec![proj(Expr::qualified_field("s", "a"))],
        vec![RelationDecl {
            alias: "s".to_owned(),
            source: RelationSource::Subquery(Box::new(inner)),
        }],
    );
    let bound = bind(stmt);

    let mut onions = OnionSet::new();
    onions.complete(&schema());

    let plan = plan_with(&onions, &bound, &EncContext::PreserveOriginal);
    let PlanNode::RemoteSql { stmt: outer, subplans, .. } = &plan else {
        panic!("expected RemoteSql on top, got:\n{plan}");
    };
    assert!(outer.to_string().contains("s$mat AS s"), "sql: {outer}");
    assert_eq!(subplans.len(), 1);
    assert!(
        matches!(&subplans[0], PlanNode::RemoteMaterialize { name, .. } if name == "s$mat"),
        "expected RemoteMaterialize, got:\n{}",
        subplans[0]
    );
}

// ---------------------------------------------------------------------------
// Encryption contexts
// ---------------------------------------------------------------------------

#[test]
fn test_encproj_require_re_encrypts_client_output() {
    // `a` only has DET; requiring OPE output forces decrypt + re-encrypt.
    let stmt = SelectStmt::simple(vec![proj(Expr::field("a"))], vec![table("t")]);
    let bound = bind(stmt);

    let mut onions = OnionSet::new();
    onions.complete(&schema());

    let enc = EncContext::EncProj {
        onions: vec![Onion::OPE],
        require: true,
    };
    let plan = plan_with(&onions, &bound, &enc);
    let desc = plan.tuple_desc();
    assert_eq!(desc.len(), 1);
    assert_eq!(desc[0].onion, OnionType::Bit(Onion::OPE));
    let PlanNode::LocalEncrypt { positions, .. } = &plan else {
        panic!("expected LocalEncrypt on top, got:\n{plan}");
    };
    assert_eq!(positions, &[(0, Onion::OPE)]);
}

#[test]
fn test_encproj_require_contract_holds_for_satisfiable_request() {
    let stmt = SelectStmt::simple(
        vec![proj(Expr::field("a")), proj(Expr::field("b"))],
        vec![table("t")],
    );
    let bound = bind(stmt);

    let mut onions = OnionSet::new();
    onions.add("t", &Expr::field("a"), Onion::OPE);
    onions.complete(&schema());

    let enc = EncContext::EncProj {
        onions: vec![Onion::DET | Onion::OPE, Onion::DET],
        require: true,
    };
    let plan = plan_with(&onions, &bound, &enc);
    let desc = plan.tuple_desc();
    assert_eq!(desc.len(), 2);
    for (pd, mask) in desc.iter().zip([Onion::DET | Onion::OPE, Onion::DET]) {
        let bit = pd.onion.bit().expect("single-bit onion");
        assert!(mask.contains(bit));
    }
    assert!(plan.is_remote_sql(), "no client work needed:\n{plan}");
}

#[test]
fn test_preserve_cardinality_keeps_encrypted_outputs() {
    let stmt = SelectStmt::simple(vec![proj(Expr::field("a"))], vec![table("t")]);
    let bound = bind(stmt);

    let mut onions = OnionSet::new();
    onions.complete(&schema());

    let plan = plan_with(&onions, &bound, &EncContext::PreserveCardinality);
    assert!(plan.is_remote_sql(), "got:\n{plan}");
    assert_eq!(plan.tuple_desc()[0].onion, OnionType::Bit(Onion::DET));
}

#[test]
fn test_preserve_original_output_is_all_plain() {
    let mut stmt = SelectStmt::simple(
        vec![proj(Expr::field("a")), proj(Expr::field("b"))],
        vec![table("t")],
    );
    stmt.filter = Some(Expr::cmp(CmpOp::Eq, Expr::field("a"), Expr::int(7)));
    let bound = bind(stmt);

    let mut onions = OnionSet::new();
    onions.add("t", &Expr::field("a"), Onion::OPE);
    onions.complete(&schema());

    let plan = plan_with(&onions, &bound, &EncContext::PreserveOriginal);
    for pd in plan.tuple_desc() {
        assert!(pd.onion.is_plain(), "plan:\n{plan}");
    }
    plan.check_tuple_desc().expect("well-formed");
}

#[test]
fn test_projection_wildcard_is_rejected() {
    let stmt = SelectStmt::simple(vec![Projection::Star], vec![table("t")]);
    let bound = bind(stmt);
    let schema = schema();
    let stats = Statistics::new();
    let mut onions = OnionSet::new();
    onions.complete(&schema);
    let gen = PlanGenerator::new(&schema, &stats, &onions);
    assert_eq!(
        gen.generate_plan(&bound, &EncContext::PreserveOriginal),
        Err(PlanError::WildcardProjection)
    );
}
