//! INSERT, UPDATE, DELETE, COPY, and constraint behavior.

use dbsql::{Connection, ErrorCode, Value};

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
fn insert_with_column_list_and_defaults() {
    let mut conn = Connection::open(":memory:").unwrap();
    exec(&mut conn, "CREATE TABLE t(a, b DEFAULT 'dflt', c);");
    exec(&mut conn, "INSERT INTO t(a) VALUES(1);");
    let got = rows(&mut conn, "SELECT a, b, c FROM t;");
    assert_eq!(got[0][0].to_int(), 1);
    assert_eq!(got[0][1].to_text(), "dflt");
    assert!(got[0][2].is_null());

    let e = conn
        .exec_table("INSERT INTO t(a, nosuch) VALUES(1, 2)")
        .unwrap_err();
    assert!(e.message().contains("has no column"));
    let e = conn.exec_table("INSERT INTO t VALUES(1)").unwrap_err();
    assert!(e.message().contains("values were supplied"));
}

#[test]
fn insert_select_copies_between_tables() {
    let mut conn = Connection::open(":memory:").unwrap();
    exec(&mut conn, "CREATE TABLE src(v); CREATE TABLE dst(v);");
    for v in [1, 2, 3] {
        exec(&mut conn, &format!("INSERT INTO src VALUES({});", v));
    }
    exec(&mut conn, "INSERT INTO dst SELECT v + 100 FROM src;");
    let mut got = ints(&mut conn, "SELECT v FROM dst;");
    got.sort_unstable();
    assert_eq!(got, vec![101, 102, 103]);
}

#[test]
fn explicit_integer_primary_key_values() {
    let mut conn = Connection::open(":memory:").unwrap();
    exec(&mut conn, "CREATE TABLE t(id INTEGER PRIMARY KEY, v);");
    exec(&mut conn, "INSERT INTO t VALUES(10, 'ten');");
    exec(&mut conn, "INSERT INTO t(v) VALUES('next');");
    // The generated row id continues past the explicit one.
    let got = rows(&mut conn, "SELECT id, v FROM t ORDER BY id;");
    assert_eq!(got[0][0].to_int(), 10);
    assert_eq!(got[1][0].to_int(), 11);

    let e = conn
        .exec_table("INSERT INTO t VALUES(10, 'again')")
        .unwrap_err();
    assert_eq!(e.code, ErrorCode::Constraint);
    assert!(e.message().contains("PRIMARY KEY must be unique"));
}

#[test]
fn insert_or_replace_swaps_the_row() {
    let mut conn = Connection::open(":memory:").unwrap();
    exec(&mut conn, "CREATE TABLE t(id INTEGER PRIMARY KEY, v);");
    exec(&mut conn, "INSERT INTO t VALUES(1, 'old');");
    exec(&mut conn, "INSERT OR REPLACE INTO t VALUES(1, 'new');");
    let got = rows(&mut conn, "SELECT id, v FROM t;");
    assert_eq!(got.len(), 1);
    assert_eq!(got[0][1].to_text(), "new");
}

#[test]
fn insert_or_ignore_skips_conflicts() {
    let mut conn = Connection::open(":memory:").unwrap();
    exec(&mut conn, "CREATE TABLE t(id INTEGER PRIMARY KEY, v);");
    exec(&mut conn, "INSERT INTO t VALUES(1, 'keep');");
    exec(&mut conn, "INSERT OR IGNORE INTO t VALUES(1, 'skip');");
    let got = rows(&mut conn, "SELECT v FROM t;");
    assert_eq!(got.len(), 1);
    assert_eq!(got[0][0].to_text(), "keep");
}

#[test]
fn not_null_constraint() {
    let mut conn = Connection::open(":memory:").unwrap();
    exec(&mut conn, "CREATE TABLE t(a NOT NULL, b);");
    exec(&mut conn, "INSERT INTO t VALUES(1, NULL);");
    let e = conn
        .exec_table("INSERT INTO t VALUES(NULL, 2)")
        .unwrap_err();
    assert_eq!(e.code, ErrorCode::Constraint);
    assert!(e.message().contains("may not be NULL"));
}

#[test]
fn update_rewrites_rows_and_indices() {
    let mut conn = Connection::open(":memory:").unwrap();
    exec(&mut conn, "CREATE TABLE t(k, v); CREATE INDEX tk ON t(k);");
    for (k, v) in [(1, 10), (2, 20), (3, 30)] {
        exec(&mut conn, &format!("INSERT INTO t VALUES({}, {});", k, v));
    }
    exec(&mut conn, "UPDATE t SET v = v + 1 WHERE k > 1;");
    let got = ints(&mut conn, "SELECT v FROM t ORDER BY v;");
    assert_eq!(got, vec![10, 21, 31]);

    // Index lookups still find rows after the key column changes.
    exec(&mut conn, "UPDATE t SET k = 9 WHERE v = 10;");
    let got = ints(&mut conn, "SELECT v FROM t WHERE k = 9;");
    assert_eq!(got, vec![10]);
    let got = ints(&mut conn, "SELECT v FROM t WHERE k = 1;");
    assert!(got.is_empty());
}

#[test]
fn update_integer_primary_key_moves_the_row() {
    let mut conn = Connection::open(":memory:").unwrap();
    exec(&mut conn, "CREATE TABLE t(id INTEGER PRIMARY KEY, v);");
    exec(&mut conn, "INSERT INTO t VALUES(1, 'a');");
    exec(&mut conn, "UPDATE t SET id = 5 WHERE id = 1;");
    let got = rows(&mut conn, "SELECT id, v FROM t;");
    assert_eq!(got[0][0].to_int(), 5);
    assert_eq!(got[0][1].to_text(), "a");
}

#[test]
fn delete_with_where_and_without() {
    let mut conn = Connection::open(":memory:").unwrap();
    exec(&mut conn, "CREATE TABLE t(v); CREATE INDEX tv ON t(v);");
    for v in 1..=6 {
        exec(&mut conn, &format!("INSERT INTO t VALUES({});", v));
    }
    exec(&mut conn, "DELETE FROM t WHERE v % 2 = 0;");
    let got = ints(&mut conn, "SELECT v FROM t ORDER BY v;");
    assert_eq!(got, vec![1, 3, 5]);
    // Index entries for the deleted rows are gone too.
    let got = ints(&mut conn, "SELECT v FROM t WHERE v = 2;");
    assert!(got.is_empty());

    exec(&mut conn, "DELETE FROM t;");
    assert_eq!(rows(&mut conn, "SELECT count(*) FROM t")[0][0].to_int(), 0);
}

#[test]
fn delete_then_reinsert_reuses_table() {
    let mut conn = Connection::open(":memory:").unwrap();
    exec(&mut conn, "CREATE TABLE t(v);");
    exec(&mut conn, "INSERT INTO t VALUES(1);");
    exec(&mut conn, "DELETE FROM t WHERE v = 1;");
    exec(&mut conn, "INSERT INTO t VALUES(2);");
    let got = ints(&mut conn, "SELECT v FROM t;");
    assert_eq!(got, vec![2]);
}

#[test]
fn copy_bulk_loads_delimited_lines() {
    let path = std::env::temp_dir().join(format!("dbsql-copy-{}.txt", std::process::id()));
    std::fs::write(&path, "1\talpha\n2\tbeta\n3\t\\N\n").unwrap();

    let mut conn = Connection::open(":memory:").unwrap();
    exec(&mut conn, "CREATE TABLE c(n, s);");
    exec(
        &mut conn,
        &format!("COPY c FROM '{}';", path.display()),
    );
    let got = rows(&mut conn, "SELECT n, s FROM c ORDER BY n;");
    assert_eq!(got.len(), 3);
    assert_eq!(got[0][1].to_text(), "alpha");
    assert_eq!(got[1][1].to_text(), "beta");
    assert!(got[2][1].is_null());

    std::fs::remove_file(&path).ok();
}

#[test]
fn rollback_undoes_dml_and_ddl() {
    let mut conn = Connection::open(":memory:").unwrap();
    exec(&mut conn, "CREATE TABLE t(v); INSERT INTO t VALUES(1);");
    exec(&mut conn, "BEGIN;");
    exec(&mut conn, "INSERT INTO t VALUES(2);");
    exec(&mut conn, "CREATE TABLE t2(x);");
    exec(&mut conn, "ROLLBACK;");
    assert_eq!(rows(&mut conn, "SELECT count(*) FROM t")[0][0].to_int(), 1);
    assert!(conn.exec_table("SELECT * FROM t2").is_err());
}
