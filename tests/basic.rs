//! Basic create / insert / select round trips.

use dbsql::{Connection, StepResult, Value};

fn exec(conn: &mut Connection, sql: &str) {
    conn.exec(sql, |_, _| true).unwrap_or_else(|e| panic!("{}: {}", sql, e));
}

fn rows(conn: &mut Connection, sql: &str) -> Vec<Vec<Value>> {
    conn.exec_table(sql)
        .unwrap_or_else(|e| panic!("{}: {}", sql, e))
        .1
}

#[test]
fn create_insert_select_integers() {
    let mut conn = Connection::open(":memory:").unwrap();
    exec(&mut conn, "CREATE TABLE t(a INTEGER PRIMARY KEY, b);");
    exec(&mut conn, "INSERT INTO t VALUES(1,'x');");
    exec(&mut conn, "INSERT INTO t VALUES(2,'y');");
    assert_eq!(conn.last_inserted_rowid(), 2);

    let got = rows(&mut conn, "SELECT a, b FROM t ORDER BY a;");
    assert_eq!(got.len(), 2);
    assert_eq!(got[0][0].to_int(), 1);
    assert_eq!(got[0][1].to_text(), "x");
    assert_eq!(got[1][0].to_int(), 2);
    assert_eq!(got[1][1].to_text(), "y");
}

#[test]
fn rowid_allocation_is_dense_and_nonzero() {
    let mut conn = Connection::open(":memory:").unwrap();
    exec(&mut conn, "CREATE TABLE t(v);");
    for i in 0..5 {
        exec(&mut conn, &format!("INSERT INTO t VALUES({});", i));
        assert_eq!(conn.last_inserted_rowid(), i + 1);
    }
    let got = rows(&mut conn, "SELECT rowid, v FROM t;");
    assert_eq!(got.len(), 5);
    for (i, row) in got.iter().enumerate() {
        assert_eq!(row[0].to_int(), i as i64 + 1);
    }
}

#[test]
fn step_interface_surfaces_rows_one_at_a_time() {
    let mut conn = Connection::open(":memory:").unwrap();
    exec(&mut conn, "CREATE TABLE t(v); INSERT INTO t VALUES(7); INSERT INTO t VALUES(8);");

    let (stmt, _) = conn.prepare("SELECT v FROM t").unwrap();
    let mut stmt = stmt.unwrap();
    assert_eq!(stmt.column_count(), 1);
    assert_eq!(stmt.column_name(0), "v");

    let mut seen = Vec::new();
    loop {
        match conn.step(&mut stmt).unwrap() {
            StepResult::Row => seen.push(stmt.column_int(0)),
            StepResult::Done => break,
            StepResult::Busy => panic!("unexpected busy"),
        }
    }
    seen.sort_unstable();
    assert_eq!(seen, vec![7, 8]);
    stmt.finalize().unwrap();
}

#[test]
fn reset_reruns_with_kept_bindings() {
    let mut conn = Connection::open(":memory:").unwrap();
    exec(&mut conn, "CREATE TABLE t(a, b);");
    let (stmt, _) = conn.prepare("INSERT INTO t VALUES(?, ?)").unwrap();
    let mut stmt = stmt.unwrap();
    assert_eq!(stmt.bind_parameter_count(), 2);
    stmt.bind(1, Value::Int(1)).unwrap();
    stmt.bind(2, Value::Text("one".into())).unwrap();
    assert_eq!(conn.step(&mut stmt).unwrap(), StepResult::Done);

    stmt.reset();
    stmt.bind(1, Value::Int(2)).unwrap();
    assert_eq!(conn.step(&mut stmt).unwrap(), StepResult::Done);

    let got = rows(&mut conn, "SELECT a, b FROM t ORDER BY a;");
    assert_eq!(got.len(), 2);
    assert_eq!(got[0][1].to_text(), "one");
    // The second run kept the binding for ?2.
    assert_eq!(got[1][1].to_text(), "one");
}

#[test]
fn expression_evaluation() {
    let mut conn = Connection::open(":memory:").unwrap();
    let got = rows(&mut conn, "SELECT 1 + 2 * 3, 7 % 3, -4, 'a' || 'b';");
    assert_eq!(got[0][0].to_int(), 7);
    assert_eq!(got[0][1].to_int(), 1);
    assert_eq!(got[0][2].to_int(), -4);
    assert_eq!(got[0][3].to_text(), "ab");
}

#[test]
fn typeof_reports_static_type_class() {
    let mut conn = Connection::open(":memory:").unwrap();
    exec(&mut conn, "CREATE TABLE t(a VARCHAR(4), b INTEGER);");
    exec(&mut conn, "INSERT INTO t VALUES('x', 1);");
    let got = rows(&mut conn, "SELECT typeof(a), typeof(b), typeof('lit'), typeof(3) FROM t;");
    assert_eq!(got[0][0].to_text(), "text");
    assert_eq!(got[0][1].to_text(), "numeric");
    assert_eq!(got[0][2].to_text(), "text");
    assert_eq!(got[0][3].to_text(), "numeric");
}

#[test]
fn null_propagation_in_arithmetic() {
    let mut conn = Connection::open(":memory:").unwrap();
    let got = rows(&mut conn, "SELECT NULL + 1, 1 / 0, NULL || 'x';");
    assert!(got[0][0].is_null());
    assert!(got[0][1].is_null());
    assert!(got[0][2].is_null());
}

#[test]
fn case_and_between() {
    let mut conn = Connection::open(":memory:").unwrap();
    exec(&mut conn, "CREATE TABLE t(v);");
    for v in [1, 5, 9] {
        exec(&mut conn, &format!("INSERT INTO t VALUES({});", v));
    }
    let got = rows(
        &mut conn,
        "SELECT v, CASE WHEN v BETWEEN 2 AND 8 THEN 'mid' ELSE 'edge' END FROM t ORDER BY v;",
    );
    assert_eq!(got[0][1].to_text(), "edge");
    assert_eq!(got[1][1].to_text(), "mid");
    assert_eq!(got[2][1].to_text(), "edge");
}

#[test]
fn like_and_glob() {
    let mut conn = Connection::open(":memory:").unwrap();
    exec(&mut conn, "CREATE TABLE t(s);");
    for s in ["apple", "apricot", "banana"] {
        exec(&mut conn, &format!("INSERT INTO t VALUES('{}');", s));
    }
    let got = rows(&mut conn, "SELECT s FROM t WHERE s LIKE 'ap%' ORDER BY s;");
    assert_eq!(got.len(), 2);
    let got = rows(&mut conn, "SELECT s FROM t WHERE s GLOB 'ban*';");
    assert_eq!(got.len(), 1);
    assert_eq!(got[0][0].to_text(), "banana");
}

#[test]
fn empty_input_prepares_to_nothing() {
    let mut conn = Connection::open(":memory:").unwrap();
    let (stmt, _) = conn.prepare("   -- just a comment\n").unwrap();
    assert!(stmt.is_none());
}

#[test]
fn changes_are_counted() {
    let mut conn = Connection::open(":memory:").unwrap();
    exec(&mut conn, "CREATE TABLE t(v);");
    exec(&mut conn, "INSERT INTO t VALUES(1); INSERT INTO t VALUES(2);");
    assert_eq!(conn.last_change_count(), 1);
    assert!(conn.total_change_count() >= 2);
    exec(&mut conn, "UPDATE t SET v = v + 1;");
    assert_eq!(conn.last_change_count(), 2);
}
