//! SELECT planner behavior: compounds, aggregates, subqueries, joins,
//! and the min/max fast path.

use dbsql::{Connection, StepResult, Value};

fn exec(conn: &mut Connection, sql: &str) {
    conn.exec(sql, |_, _| true).unwrap_or_else(|e| panic!("{}: {}", sql, e));
}

fn rows(conn: &mut Connection, sql: &str) -> Vec<Vec<Value>> {
    conn.exec_table(sql)
        .unwrap_or_else(|e| panic!("{}: {}", sql, e))
        .1
}

fn ints(conn: &mut Connection, sql: &str) -> Vec<i64> {
    rows(conn, sql).iter().map(|r| r[0].to_int()).collect()
}

#[test]
fn union_all_with_limit_across_branches() {
    let mut conn = Connection::open(":memory:").unwrap();
    exec(&mut conn, "CREATE TABLE u(x);");
    exec(&mut conn, "INSERT INTO u VALUES(1); INSERT INTO u VALUES(2);");
    let got = ints(
        &mut conn,
        "SELECT x FROM u UNION ALL SELECT x+10 FROM u LIMIT 3;",
    );
    assert_eq!(got, vec![1, 2, 11]);
}

#[test]
fn union_removes_duplicates_and_orders() {
    let mut conn = Connection::open(":memory:").unwrap();
    exec(&mut conn, "CREATE TABLE a(x); CREATE TABLE b(x);");
    exec(&mut conn, "INSERT INTO a VALUES(3); INSERT INTO a VALUES(1);");
    exec(&mut conn, "INSERT INTO b VALUES(1); INSERT INTO b VALUES(2);");
    let got = ints(&mut conn, "SELECT x FROM a UNION SELECT x FROM b ORDER BY 1;");
    assert_eq!(got, vec![1, 2, 3]);
}

#[test]
fn intersect_and_except() {
    let mut conn = Connection::open(":memory:").unwrap();
    exec(&mut conn, "CREATE TABLE a(x); CREATE TABLE b(x);");
    for v in [1, 2, 3] {
        exec(&mut conn, &format!("INSERT INTO a VALUES({});", v));
    }
    for v in [2, 3, 4] {
        exec(&mut conn, &format!("INSERT INTO b VALUES({});", v));
    }
    let mut got = ints(&mut conn, "SELECT x FROM a INTERSECT SELECT x FROM b;");
    got.sort_unstable();
    assert_eq!(got, vec![2, 3]);
    let got = ints(&mut conn, "SELECT x FROM a EXCEPT SELECT x FROM b;");
    assert_eq!(got, vec![1]);
}

#[test]
fn group_by_with_having() {
    let mut conn = Connection::open(":memory:").unwrap();
    exec(&mut conn, "CREATE TABLE g(k,v);");
    exec(&mut conn, "INSERT INTO g VALUES('a',1);");
    exec(&mut conn, "INSERT INTO g VALUES('a',2);");
    exec(&mut conn, "INSERT INTO g VALUES('b',5);");
    let got = rows(
        &mut conn,
        "SELECT k, sum(v) FROM g GROUP BY k HAVING sum(v) > 2 ORDER BY k;",
    );
    assert_eq!(got.len(), 2);
    assert_eq!(got[0][0].to_text(), "a");
    assert_eq!(got[0][1].to_int(), 3);
    assert_eq!(got[1][0].to_text(), "b");
    assert_eq!(got[1][1].to_int(), 5);
}

#[test]
fn aggregates_over_empty_table_produce_one_row() {
    let mut conn = Connection::open(":memory:").unwrap();
    exec(&mut conn, "CREATE TABLE e(v);");
    let got = rows(&mut conn, "SELECT count(*), sum(v) FROM e;");
    assert_eq!(got.len(), 1);
    assert_eq!(got[0][0].to_int(), 0);
    assert!(got[0][1].is_null());
}

#[test]
fn count_and_avg() {
    let mut conn = Connection::open(":memory:").unwrap();
    exec(&mut conn, "CREATE TABLE t(v);");
    for v in [2, 4, 6] {
        exec(&mut conn, &format!("INSERT INTO t VALUES({});", v));
    }
    exec(&mut conn, "INSERT INTO t VALUES(NULL);");
    let got = rows(&mut conn, "SELECT count(*), count(v), avg(v) FROM t;");
    assert_eq!(got[0][0].to_int(), 4);
    assert_eq!(got[0][1].to_int(), 3);
    assert_eq!(got[0][2].to_real(), 4.0);
}

#[test]
fn in_with_subquery_uses_temp_set() {
    let mut conn = Connection::open(":memory:").unwrap();
    exec(&mut conn, "CREATE TABLE a(x); CREATE TABLE b(y);");
    for v in [1, 2, 3] {
        exec(&mut conn, &format!("INSERT INTO a VALUES({});", v));
    }
    for v in [2, 3] {
        exec(&mut conn, &format!("INSERT INTO b VALUES({});", v));
    }
    let mut got = ints(&mut conn, "SELECT x FROM a WHERE x IN (SELECT y FROM b);");
    got.sort_unstable();
    assert_eq!(got, vec![2, 3]);
}

#[test]
fn in_with_constant_list() {
    let mut conn = Connection::open(":memory:").unwrap();
    exec(&mut conn, "CREATE TABLE a(x);");
    for v in [1, 2, 3, 4] {
        exec(&mut conn, &format!("INSERT INTO a VALUES({});", v));
    }
    let mut got = ints(&mut conn, "SELECT x FROM a WHERE x IN (2, 4);");
    got.sort_unstable();
    assert_eq!(got, vec![2, 4]);
    let got = ints(&mut conn, "SELECT x FROM a WHERE x NOT IN (2, 3, 4);");
    assert_eq!(got, vec![1]);
    // A non-constant member is a compile error.
    assert!(conn.exec_table("SELECT x FROM a WHERE x IN (x)").is_err());
}

#[test]
fn min_via_index_fast_path() {
    let mut conn = Connection::open(":memory:").unwrap();
    exec(&mut conn, "CREATE TABLE m(c); CREATE INDEX mi ON m(c);");
    for v in [5, 2, 9] {
        exec(&mut conn, &format!("INSERT INTO m VALUES({});", v));
    }
    let got = rows(&mut conn, "SELECT min(c) FROM m;");
    assert_eq!(got[0][0].to_int(), 2);
    let got = rows(&mut conn, "SELECT max(c) FROM m;");
    assert_eq!(got[0][0].to_int(), 9);

    // The fast path positions a cursor once instead of aggregating.
    let (stmt, _) = conn.prepare("EXPLAIN SELECT min(c) FROM m").unwrap();
    let mut stmt = stmt.unwrap();
    let mut opcodes = Vec::new();
    while conn.step(&mut stmt).unwrap() == StepResult::Row {
        opcodes.push(stmt.column_text(1));
    }
    assert!(opcodes.iter().any(|o| o == "Rewind"));
    assert!(!opcodes.iter().any(|o| o == "AggReset"));
}

#[test]
fn order_by_desc_and_alias() {
    let mut conn = Connection::open(":memory:").unwrap();
    exec(&mut conn, "CREATE TABLE t(a, b);");
    exec(&mut conn, "INSERT INTO t VALUES(1, 30);");
    exec(&mut conn, "INSERT INTO t VALUES(2, 10);");
    exec(&mut conn, "INSERT INTO t VALUES(3, 20);");
    let got = ints(&mut conn, "SELECT a FROM t ORDER BY b DESC;");
    assert_eq!(got, vec![1, 3, 2]);
    let got = ints(&mut conn, "SELECT b AS total FROM t ORDER BY total;");
    assert_eq!(got, vec![10, 20, 30]);
}

#[test]
fn order_by_is_numeric_for_numbers() {
    let mut conn = Connection::open(":memory:").unwrap();
    exec(&mut conn, "CREATE TABLE t(v);");
    for v in [10, 2, 1] {
        exec(&mut conn, &format!("INSERT INTO t VALUES({});", v));
    }
    assert_eq!(ints(&mut conn, "SELECT v FROM t ORDER BY v;"), vec![1, 2, 10]);
}

#[test]
fn limit_and_offset() {
    let mut conn = Connection::open(":memory:").unwrap();
    exec(&mut conn, "CREATE TABLE t(v);");
    for v in 1..=10 {
        exec(&mut conn, &format!("INSERT INTO t VALUES({});", v));
    }
    assert_eq!(
        ints(&mut conn, "SELECT v FROM t ORDER BY v LIMIT 3;"),
        vec![1, 2, 3]
    );
    assert_eq!(
        ints(&mut conn, "SELECT v FROM t ORDER BY v LIMIT 3 OFFSET 4;"),
        vec![5, 6, 7]
    );
    assert_eq!(ints(&mut conn, "SELECT v FROM t LIMIT 0;"), Vec::<i64>::new());
}

#[test]
fn distinct_filters_duplicates() {
    let mut conn = Connection::open(":memory:").unwrap();
    exec(&mut conn, "CREATE TABLE t(v);");
    for v in [1, 1, 2, 2, 2, 3] {
        exec(&mut conn, &format!("INSERT INTO t VALUES({});", v));
    }
    let got = ints(&mut conn, "SELECT DISTINCT v FROM t ORDER BY v;");
    assert_eq!(got, vec![1, 2, 3]);
}

#[test]
fn two_table_join_with_where() {
    let mut conn = Connection::open(":memory:").unwrap();
    exec(&mut conn, "CREATE TABLE emp(name, dept); CREATE TABLE dept(id, label);");
    exec(&mut conn, "INSERT INTO dept VALUES(1, 'eng');");
    exec(&mut conn, "INSERT INTO dept VALUES(2, 'ops');");
    exec(&mut conn, "INSERT INTO emp VALUES('ada', 1);");
    exec(&mut conn, "INSERT INTO emp VALUES('bob', 2);");
    exec(&mut conn, "INSERT INTO emp VALUES('cyd', 1);");
    let got = rows(
        &mut conn,
        "SELECT name, label FROM emp, dept WHERE emp.dept = dept.id ORDER BY name;",
    );
    assert_eq!(got.len(), 3);
    assert_eq!(got[0][0].to_text(), "ada");
    assert_eq!(got[0][1].to_text(), "eng");
    assert_eq!(got[1][1].to_text(), "ops");
}

#[test]
fn left_outer_join_emits_null_rows() {
    let mut conn = Connection::open(":memory:").unwrap();
    exec(&mut conn, "CREATE TABLE a(x); CREATE TABLE b(y);");
    exec(&mut conn, "INSERT INTO a VALUES(1); INSERT INTO a VALUES(2);");
    exec(&mut conn, "INSERT INTO b VALUES(2);");
    let got = rows(
        &mut conn,
        "SELECT x, y FROM a LEFT OUTER JOIN b ON a.x = b.y ORDER BY x;",
    );
    assert_eq!(got.len(), 2);
    assert_eq!(got[0][0].to_int(), 1);
    assert!(got[0][1].is_null());
    assert_eq!(got[1][0].to_int(), 2);
    assert_eq!(got[1][1].to_int(), 2);
}

#[test]
fn subquery_in_from_is_flattened_or_materialized() {
    let mut conn = Connection::open(":memory:").unwrap();
    exec(&mut conn, "CREATE TABLE t(a, b);");
    exec(&mut conn, "INSERT INTO t VALUES(1, 10);");
    exec(&mut conn, "INSERT INTO t VALUES(2, 20);");
    // Flattenable.
    let got = ints(
        &mut conn,
        "SELECT big FROM (SELECT b AS big FROM t) WHERE big > 15;",
    );
    assert_eq!(got, vec![20]);
    // Not flattenable: aggregate subquery under an aggregate outer.
    let got = rows(
        &mut conn,
        "SELECT count(*) FROM (SELECT sum(b) AS s FROM t);",
    );
    assert_eq!(got[0][0].to_int(), 1);
}

#[test]
fn scalar_subquery_and_exists() {
    let mut conn = Connection::open(":memory:").unwrap();
    exec(&mut conn, "CREATE TABLE t(v);");
    exec(&mut conn, "INSERT INTO t VALUES(5); INSERT INTO t VALUES(7);");
    let got = rows(&mut conn, "SELECT (SELECT max(v) FROM t) + 1;");
    assert_eq!(got[0][0].to_int(), 8);

    exec(&mut conn, "CREATE TABLE empty(v);");
    let got = rows(
        &mut conn,
        "SELECT EXISTS (SELECT v FROM t), EXISTS (SELECT v FROM empty);",
    );
    assert_eq!(got[0][0].to_int(), 1);
    assert_eq!(got[0][1].to_int(), 0);
}

#[test]
fn index_equality_lookup_returns_matches() {
    let mut conn = Connection::open(":memory:").unwrap();
    exec(&mut conn, "CREATE TABLE t(k, v); CREATE INDEX tk ON t(k);");
    for i in 0..20 {
        exec(
            &mut conn,
            &format!("INSERT INTO t VALUES({}, {});", i % 5, i),
        );
    }
    let got = ints(&mut conn, "SELECT v FROM t WHERE k = 3 ORDER BY v;");
    assert_eq!(got, vec![3, 8, 13, 18]);
}

#[test]
fn rowid_lookup_fast_path() {
    let mut conn = Connection::open(":memory:").unwrap();
    exec(&mut conn, "CREATE TABLE t(a INTEGER PRIMARY KEY, b);");
    for i in 1..=5 {
        exec(&mut conn, &format!("INSERT INTO t VALUES({}, {});", i, i * 10));
    }
    let got = rows(&mut conn, "SELECT b FROM t WHERE a = 4;");
    assert_eq!(got.len(), 1);
    assert_eq!(got[0][0].to_int(), 40);
    let got = rows(&mut conn, "SELECT b FROM t WHERE a = 99;");
    assert!(got.is_empty());
}

#[test]
fn select_idempotent_on_immutable_data() {
    let mut conn = Connection::open(":memory:").unwrap();
    exec(&mut conn, "CREATE TABLE t(v);");
    for v in [3, 1, 2] {
        exec(&mut conn, &format!("INSERT INTO t VALUES({});", v));
    }
    let first = rows(&mut conn, "SELECT v FROM t ORDER BY v;");
    let second = rows(&mut conn, "SELECT v FROM t ORDER BY v;");
    assert_eq!(
        first.iter().map(|r| r[0].to_int()).collect::<Vec<_>>(),
        second.iter().map(|r| r[0].to_int()).collect::<Vec<_>>()
    );
}

#[test]
fn error_messages_for_bad_names() {
    let mut conn = Connection::open(":memory:").unwrap();
    exec(&mut conn, "CREATE TABLE t(a);");
    let e = conn.exec_table("SELECT nope FROM t").unwrap_err();
    assert!(e.message().contains("no such column"));
    let e = conn.exec_table("SELECT * FROM missing").unwrap_err();
    assert!(e.message().contains("no such table"));
    let e = conn.exec_table("SELECT nope(1)").unwrap_err();
    assert!(e.message().contains("no such function"));
    let e = conn
        .exec_table("SELECT sum(a) FROM t WHERE sum(a) > 1")
        .unwrap_err();
    assert!(e.message().contains("misuse of aggregate"));
}

#[test]
fn ambiguous_column_is_detected() {
    let mut conn = Connection::open(":memory:").unwrap();
    exec(&mut conn, "CREATE TABLE a(v); CREATE TABLE b(v);");
    let e = conn.exec_table("SELECT v FROM a, b").unwrap_err();
    assert!(e.message().contains("ambiguous"));
}
