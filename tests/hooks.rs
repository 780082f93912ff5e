//! Caller hooks: authorizer, busy, progress, trace, commit, interrupt.

use std::cell::RefCell;
use std::rc::Rc;

use dbsql::{AuthAction, AuthResult, Connection, ErrorCode, StepResult, Value};

fn exec(conn: &mut Connection, sql: &str) {
    conn.exec(sql, |_, _| true).unwrap_or_else(|e| panic!("{}: {}", sql, e));
}

fn rows(conn: &mut Connection, sql: &str) -> Vec<Vec<Value>> {
    conn.exec_table(sql)
        .unwrap_or_else(|e| panic!("{}: {}", sql, e))
        .1
}

fn unique_path(tag: &str) -> String {
    format!("hooks-{}-{}", tag, std::process::id())
}

#[test]
fn authorizer_deny_fails_the_prepare() {
    let mut conn = Connection::open(":memory:").unwrap();
    exec(&mut conn, "CREATE TABLE secret(v); INSERT INTO secret VALUES(42);");
    conn.set_authorizer(Some(Box::new(|action, arg1, _, _, _| {
        if action == AuthAction::Read && arg1 == "secret" {
            AuthResult::Deny
        } else {
            AuthResult::Ok
        }
    })));
    let e = conn.exec_table("SELECT v FROM secret").unwrap_err();
    assert_eq!(e.code, ErrorCode::Perm);
    conn.set_authorizer(None);
    assert_eq!(rows(&mut conn, "SELECT v FROM secret")[0][0].to_int(), 42);
}

#[test]
fn authorizer_ignore_elides_the_column() {
    let mut conn = Connection::open(":memory:").unwrap();
    exec(&mut conn, "CREATE TABLE t(a, b); INSERT INTO t VALUES(1, 2);");
    conn.set_authorizer(Some(Box::new(|action, _, arg2, _, _| {
        if action == AuthAction::Read && arg2 == "b" {
            AuthResult::Ignore
        } else {
            AuthResult::Ok
        }
    })));
    let got = rows(&mut conn, "SELECT a, b FROM t");
    assert_eq!(got[0][0].to_int(), 1);
    assert!(got[0][1].is_null());
}

#[test]
fn authorizer_gates_ddl() {
    let mut conn = Connection::open(":memory:").unwrap();
    conn.set_authorizer(Some(Box::new(|action, _, _, _, _| {
        if action == AuthAction::CreateTable {
            AuthResult::Deny
        } else {
            AuthResult::Ok
        }
    })));
    let e = conn.exec_table("CREATE TABLE t(v)").unwrap_err();
    assert_eq!(e.code, ErrorCode::Perm);
}

#[test]
fn busy_surfaces_when_another_connection_writes() {
    let path = unique_path("busy");
    let mut writer = Connection::open(&path).unwrap();
    exec(&mut writer, "CREATE TABLE t(v); INSERT INTO t VALUES(1);");

    let mut reader = Connection::open(&path).unwrap();
    // Warm the reader's schema cache before the lock appears.
    assert_eq!(rows(&mut reader, "SELECT count(*) FROM t")[0][0].to_int(), 1);

    exec(&mut writer, "BEGIN; INSERT INTO t VALUES(2);");

    let (stmt, _) = reader.prepare("SELECT count(*) FROM t").unwrap();
    let mut stmt = stmt.unwrap();
    assert_eq!(reader.step(&mut stmt).unwrap(), StepResult::Busy);

    // Retrying after the writer commits succeeds with state intact.
    exec(&mut writer, "COMMIT;");
    assert_eq!(reader.step(&mut stmt).unwrap(), StepResult::Row);
    assert_eq!(stmt.column_int(0), 2);
    assert_eq!(reader.step(&mut stmt).unwrap(), StepResult::Done);
}

#[test]
fn busy_timeout_handler_retries() {
    let path = unique_path("timeout");
    let mut writer = Connection::open(&path).unwrap();
    exec(&mut writer, "CREATE TABLE t(v);");
    exec(&mut writer, "BEGIN; INSERT INTO t VALUES(1);");

    let mut reader = Connection::open(&path).unwrap();
    reader.set_timeout(30);
    let (stmt, _) = reader.prepare("SELECT count(*) FROM t").unwrap();
    let mut stmt = stmt.unwrap();
    // The lock never releases, so the handler gives up after its
    // budget and the caller sees Busy.
    assert_eq!(reader.step(&mut stmt).unwrap(), StepResult::Busy);
    exec(&mut writer, "ROLLBACK;");
}

#[test]
fn interrupt_stops_a_scan() {
    let mut conn = Connection::open(":memory:").unwrap();
    exec(&mut conn, "CREATE TABLE t(v);");
    for i in 0..50 {
        exec(&mut conn, &format!("INSERT INTO t VALUES({});", i));
    }
    conn.interrupt();
    let e = conn.exec_table("SELECT count(*) FROM t").unwrap_err();
    assert_eq!(e.code, ErrorCode::Interrupted);
    // The flag clears once consumed.
    assert_eq!(rows(&mut conn, "SELECT count(*) FROM t")[0][0].to_int(), 50);
}

#[test]
fn progress_callback_can_abort() {
    let mut conn = Connection::open(":memory:").unwrap();
    exec(&mut conn, "CREATE TABLE t(v); INSERT INTO t VALUES(1);");
    conn.set_progresscall(1, Some(Box::new(|| false)));
    let e = conn.exec_table("SELECT v FROM t").unwrap_err();
    assert_eq!(e.code, ErrorCode::Abort);
    conn.set_progresscall(0, None);
    assert_eq!(rows(&mut conn, "SELECT v FROM t").len(), 1);
}

#[test]
fn trace_sees_statement_text() {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let seen2 = seen.clone();
    let mut conn = Connection::open(":memory:").unwrap();
    conn.set_tracecall(Some(Box::new(move |sql: &str| {
        seen2.borrow_mut().push(sql.to_string());
    })));
    exec(&mut conn, "CREATE TABLE t(v); INSERT INTO t VALUES(1);");
    let traced = seen.borrow();
    assert!(traced.iter().any(|s| s.contains("CREATE TABLE")));
    assert!(traced.iter().any(|s| s.contains("INSERT")));
}

#[test]
fn commit_hook_can_veto() {
    let mut conn = Connection::open(":memory:").unwrap();
    exec(&mut conn, "CREATE TABLE t(v);");
    conn.set_commitcall(Some(Box::new(|| true)));
    let e = conn.exec_table("INSERT INTO t VALUES(1)").unwrap_err();
    assert_eq!(e.code, ErrorCode::Constraint);
    conn.set_commitcall(None);
    exec(&mut conn, "INSERT INTO t VALUES(2);");
    assert_eq!(rows(&mut conn, "SELECT count(*) FROM t")[0][0].to_int(), 1);
}

#[test]
fn exec_callback_abort_propagates() {
    let mut conn = Connection::open(":memory:").unwrap();
    exec(&mut conn, "CREATE TABLE t(v); INSERT INTO t VALUES(1); INSERT INTO t VALUES(2);");
    let e = conn.exec("SELECT v FROM t", |_, _| false).unwrap_err();
    assert_eq!(e.code, ErrorCode::Abort);
}

#[test]
fn user_defined_scalar_function() {
    let mut conn = Connection::open(":memory:").unwrap();
    conn.create_function("double_it", 1, dbsql::FuncReturn::Numeric, |ctx, args| {
        let v = args.first().map(|v| v.to_int()).unwrap_or(0);
        ctx.set_result(Value::Int(v * 2));
    });
    let got = rows(&mut conn, "SELECT double_it(21)");
    assert_eq!(got[0][0].to_int(), 42);
}

#[test]
fn user_defined_aggregate_function() {
    let mut conn = Connection::open(":memory:").unwrap();
    exec(&mut conn, "CREATE TABLE t(v);");
    for v in [2, 3, 4] {
        exec(&mut conn, &format!("INSERT INTO t VALUES({});", v));
    }
    conn.create_aggregate(
        "product",
        1,
        dbsql::FuncReturn::Numeric,
        |ctx, args| {
            let state = ctx.aggregate_context::<Option<i64>>();
            let v = args.first().map(|v| v.to_int()).unwrap_or(1);
            *state = Some(state.unwrap_or(1) * v);
        },
        |ctx| {
            let v = ctx.aggregate_context::<Option<i64>>().unwrap_or(0);
            ctx.set_result(Value::Int(v));
        },
    );
    let got = rows(&mut conn, "SELECT product(v) FROM t");
    assert_eq!(got[0][0].to_int(), 24);
}
