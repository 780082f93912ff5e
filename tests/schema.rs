//! Schema lifecycle: DDL, views, recovery from the master table, and
//! cross-connection signature invalidation.

use dbsql::{Connection, ErrorCode, StepResult, Value};

fn exec(conn: &mut Connection, sql: &str) {
    conn.exec(sql, |_, _| true).unwrap_or_else(|e| panic!("{}: {}", sql, e));
}

fn rows(conn: &mut Connection, sql: &str) -> Vec<Vec<Value>> {
    conn.exec_table(sql)
        .unwrap_or_else(|e| panic!("{}: {}", sql, e))
        .1
}

fn unique_path(tag: &str) -> String {
    format!("test-{}-{}", tag, std::process::id())
}

#[test]
fn schema_change_invalidates_prepared_statements() {
    let path = unique_path("invalidate");
    let mut conn1 = Connection::open(&path).unwrap();
    let mut conn2 = Connection::open(&path).unwrap();

    exec(&mut conn1, "CREATE TABLE t(a); INSERT INTO t VALUES(1);");

    let (stmt, _) = conn1.prepare("SELECT a FROM t").unwrap();
    let mut stmt = stmt.unwrap();

    // A committed DDL elsewhere bumps the schema signature.
    exec(&mut conn2, "CREATE TABLE other(z);");

    let err = conn1.step(&mut stmt).unwrap_err();
    assert_eq!(err.code, ErrorCode::Schema);
    drop(stmt);

    // Re-preparing against the fresh schema succeeds.
    let got = rows(&mut conn1, "SELECT a FROM t");
    assert_eq!(got.len(), 1);
    assert_eq!(got[0][0].to_int(), 1);
}

#[test]
fn second_connection_recovers_schema_from_master() {
    let path = unique_path("recover");
    let mut conn1 = Connection::open(&path).unwrap();
    exec(
        &mut conn1,
        "CREATE TABLE r(a INTEGER PRIMARY KEY, b); CREATE INDEX rb ON r(b);",
    );
    exec(&mut conn1, "INSERT INTO r VALUES(1, 'one');");

    // A brand new connection reads the catalog and sees everything.
    let mut conn2 = Connection::open(&path).unwrap();
    let got = rows(&mut conn2, "SELECT b FROM r WHERE b = 'one'");
    assert_eq!(got.len(), 1);
    let got = rows(&mut conn2, "SELECT a FROM r");
    assert_eq!(got[0][0].to_int(), 1);
}

#[test]
fn master_table_is_queryable() {
    let mut conn = Connection::open(":memory:").unwrap();
    exec(&mut conn, "CREATE TABLE t(a); CREATE INDEX ti ON t(a);");
    let got = rows(
        &mut conn,
        "SELECT type, name FROM DBSQL_MASTER ORDER BY type;",
    );
    assert_eq!(got.len(), 2);
    assert_eq!(got[0][0].to_text(), "index");
    assert_eq!(got[0][1].to_text(), "ti");
    assert_eq!(got[1][0].to_text(), "table");
    assert_eq!(got[1][1].to_text(), "t");
}

#[test]
fn drop_table_removes_data_and_catalog_rows() {
    let mut conn = Connection::open(":memory:").unwrap();
    exec(&mut conn, "CREATE TABLE t(a); INSERT INTO t VALUES(1);");
    exec(&mut conn, "DROP TABLE t;");
    assert!(conn.exec_table("SELECT * FROM t").is_err());
    let got = rows(&mut conn, "SELECT count(*) FROM DBSQL_MASTER;");
    assert_eq!(got[0][0].to_int(), 0);
    // The name is reusable.
    exec(&mut conn, "CREATE TABLE t(x); INSERT INTO t VALUES(9);");
    assert_eq!(rows(&mut conn, "SELECT x FROM t")[0][0].to_int(), 9);
}

#[test]
fn duplicate_names_are_rejected() {
    let mut conn = Connection::open(":memory:").unwrap();
    exec(&mut conn, "CREATE TABLE t(a); CREATE INDEX i1 ON t(a);");
    let e = conn.exec_table("CREATE TABLE t(b)").unwrap_err();
    assert!(e.message().contains("already exists"));
    let e = conn.exec_table("CREATE TABLE i1(b)").unwrap_err();
    assert!(e.message().contains("already an index"));
    let e = conn.exec_table("CREATE INDEX i1 ON t(a)").unwrap_err();
    assert!(e.message().contains("already exists"));
}

#[test]
fn views_read_through_their_select() {
    let mut conn = Connection::open(":memory:").unwrap();
    exec(&mut conn, "CREATE TABLE t(a, b);");
    exec(&mut conn, "INSERT INTO t VALUES(1, 10); INSERT INTO t VALUES(2, 20);");
    exec(&mut conn, "CREATE VIEW v AS SELECT a, b FROM t WHERE b > 15;");
    let got = rows(&mut conn, "SELECT a FROM v;");
    assert_eq!(got.len(), 1);
    assert_eq!(got[0][0].to_int(), 2);
    // Views reject writes and DROP TABLE.
    assert!(conn.exec_table("INSERT INTO v VALUES(3, 30)").is_err());
    assert!(conn.exec_table("DROP TABLE v").is_err());
    exec(&mut conn, "DROP VIEW v;");
    assert!(conn.exec_table("SELECT * FROM v").is_err());
}

#[test]
fn unique_constraint_creates_auto_index() {
    let mut conn = Connection::open(":memory:").unwrap();
    exec(&mut conn, "CREATE TABLE u(a UNIQUE, b);");
    exec(&mut conn, "INSERT INTO u VALUES(1, 'x');");
    let e = conn
        .exec_table("INSERT INTO u VALUES(1, 'y')")
        .unwrap_err();
    assert_eq!(e.code, ErrorCode::Constraint);
    // The auto index cannot be dropped by hand.
    let got = rows(&mut conn, "SELECT name FROM DBSQL_MASTER WHERE type = 'index';");
    assert_eq!(got.len(), 1);
    let idx_name = got[0][0].to_text();
    let e = conn
        .exec_table(&format!("DROP INDEX {}", idx_name))
        .unwrap_err();
    assert!(e.message().contains("cannot be dropped"));
}

#[test]
fn temp_tables_live_in_the_temp_db() {
    let path = unique_path("tempdb");
    let mut conn1 = Connection::open(&path).unwrap();
    exec(&mut conn1, "CREATE TEMP TABLE scratch(v);");
    exec(&mut conn1, "INSERT INTO scratch VALUES(42);");
    assert_eq!(
        rows(&mut conn1, "SELECT v FROM scratch")[0][0].to_int(),
        42
    );
    // Another connection on the same path cannot see it.
    let mut conn2 = Connection::open(&path).unwrap();
    assert!(conn2.exec_table("SELECT v FROM scratch").is_err());
}

#[test]
fn transactions_commit_and_rollback() {
    let mut conn = Connection::open(":memory:").unwrap();
    exec(&mut conn, "CREATE TABLE t(v);");
    exec(&mut conn, "BEGIN; INSERT INTO t VALUES(1); COMMIT;");
    assert_eq!(rows(&mut conn, "SELECT count(*) FROM t")[0][0].to_int(), 1);

    exec(&mut conn, "BEGIN; INSERT INTO t VALUES(2);");
    exec(&mut conn, "ROLLBACK;");
    assert_eq!(rows(&mut conn, "SELECT count(*) FROM t")[0][0].to_int(), 1);

    let e = conn.exec_table("COMMIT").unwrap_err();
    assert!(e.message().contains("no transaction is active"));
    exec(&mut conn, "BEGIN;");
    let e = conn.exec_table("BEGIN").unwrap_err();
    assert!(e.message().contains("within a transaction"));
    exec(&mut conn, "ROLLBACK;");
}

#[test]
fn explain_lists_the_program() {
    let mut conn = Connection::open(":memory:").unwrap();
    exec(&mut conn, "CREATE TABLE t(v);");
    let (stmt, _) = conn.prepare("EXPLAIN SELECT v FROM t").unwrap();
    let mut stmt = stmt.unwrap();
    assert_eq!(stmt.column_count(), 5);
    assert_eq!(stmt.column_name(1), "opcode");
    let mut opcodes = Vec::new();
    while conn.step(&mut stmt).unwrap() == StepResult::Row {
        opcodes.push(stmt.column_text(1));
    }
    assert!(opcodes.iter().any(|o| o == "OpenRead"));
    assert!(opcodes.iter().any(|o| o == "Callback"));
    assert!(opcodes.iter().any(|o| o == "Next"));
}

#[test]
fn create_table_as_select_copies_rows() {
    let mut conn = Connection::open(":memory:").unwrap();
    exec(&mut conn, "CREATE TABLE src(a, b);");
    exec(&mut conn, "INSERT INTO src VALUES(1, 'x'); INSERT INTO src VALUES(2, 'y');");
    exec(&mut conn, "CREATE TABLE dst AS SELECT a, b FROM src;");
    let got = rows(&mut conn, "SELECT a, b FROM dst ORDER BY a;");
    assert_eq!(got.len(), 2);
    assert_eq!(got[1][1].to_text(), "y");
}

#[test]
fn triggers_are_stored_in_the_schema() {
    let mut conn = Connection::open(":memory:").unwrap();
    exec(&mut conn, "CREATE TABLE t(v);");
    exec(
        &mut conn,
        "CREATE TRIGGER tr AFTER INSERT ON t BEGIN SELECT 1; END;",
    );
    let got = rows(
        &mut conn,
        "SELECT name, type FROM DBSQL_MASTER WHERE type = 'trigger';",
    );
    assert_eq!(got.len(), 1);
    assert_eq!(got[0][0].to_text(), "tr");
    exec(&mut conn, "DROP TRIGGER tr;");
    let got = rows(
        &mut conn,
        "SELECT count(*) FROM DBSQL_MASTER WHERE type = 'trigger';",
    );
    assert_eq!(got[0][0].to_int(), 0);
}

#[test]
fn attach_and_detach_databases() {
    let main_path = unique_path("attach-main");
    let aux_path = unique_path("attach-aux");
    {
        let mut aux = Connection::open(&aux_path).unwrap();
        exec(&mut aux, "CREATE TABLE remote(v); INSERT INTO remote VALUES(7);");
    }
    let mut conn = Connection::open(&main_path).unwrap();
    exec(&mut conn, &format!("ATTACH DATABASE '{}' AS aux;", aux_path));
    let got = rows(&mut conn, "SELECT v FROM remote;");
    assert_eq!(got[0][0].to_int(), 7);
    exec(&mut conn, "DETACH DATABASE aux;");
    assert!(conn.exec_table("SELECT v FROM remote").is_err());
}

#[test]
fn pragma_table_info() {
    let mut conn = Connection::open(":memory:").unwrap();
    exec(
        &mut conn,
        "CREATE TABLE p(a INTEGER PRIMARY KEY, b TEXT NOT NULL, c DEFAULT 5);",
    );
    let got = rows(&mut conn, "PRAGMA table_info(p);");
    assert_eq!(got.len(), 3);
    assert_eq!(got[0][1].to_text(), "a");
    assert_eq!(got[1][2].to_text(), "TEXT");
    assert_eq!(got[1][3].to_int(), 1);
    assert_eq!(got[2][4].to_text(), "5");
}
