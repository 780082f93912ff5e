//! Direct bytecode programs: opcodes the SQL surface reaches rarely.

use dbsql::vdbe::{vdbe_exec, Exec, Opcode, Vdbe, P3};
use dbsql::{Connection, Value};

fn run_rows(conn: &mut Connection, v: &mut Vdbe) -> Vec<Vec<Value>> {
    v.ready();
    let mut rows = Vec::new();
    loop {
        match vdbe_exec(conn, v).expect("exec") {
            Exec::Row => rows.push(v.result_row.clone()),
            Exec::Done => return rows,
            Exec::Busy => panic!("unexpected busy"),
        }
    }
}

#[test]
fn gosub_and_return() {
    let mut conn = Connection::open(":memory:").unwrap();
    let mut v = Vdbe::new();
    // Call a subroutine twice; it doubles the top of stack.
    let sub = v.make_label();
    v.add_op(Opcode::Integer, 5, 0);
    v.add_op(Opcode::Gosub, 0, sub);
    v.add_op(Opcode::Gosub, 0, sub);
    v.add_op(Opcode::Callback, 1, 0);
    v.add_op(Opcode::Halt, 0, 0);
    v.resolve_label(sub);
    v.add_op(Opcode::Dup, 0, 0);
    v.add_op(Opcode::Add, 0, 0);
    v.add_op(Opcode::Return, 0, 0);

    let rows = run_rows(&mut conn, &mut v);
    assert_eq!(rows[0][0].to_int(), 20);
}

#[test]
fn stack_shuffling_ops() {
    let mut conn = Connection::open(":memory:").unwrap();
    let mut v = Vdbe::new();
    v.add_op(Opcode::Integer, 1, 0);
    v.add_op(Opcode::Integer, 2, 0);
    v.add_op(Opcode::Integer, 3, 0);
    // Pull the bottom to the top: 2 3 1.
    v.add_op(Opcode::Pull, 2, 0);
    // Overwrite two-deep with the top and pop: 1 3.
    v.add_op(Opcode::Push, 2, 0);
    v.add_op(Opcode::Callback, 2, 0);
    v.add_op(Opcode::Halt, 0, 0);
    let rows = run_rows(&mut conn, &mut v);
    assert_eq!(rows[0][0].to_int(), 1);
    assert_eq!(rows[0][1].to_int(), 3);
}

#[test]
fn concat_addimm_forceint() {
    let mut conn = Connection::open(":memory:").unwrap();
    let mut v = Vdbe::new();
    v.add_op_p3(Opcode::String, 0, 0, P3::Static("a"));
    v.add_op_p3(Opcode::String, 0, 0, P3::Static("b"));
    v.add_op_p3(Opcode::Concat, 2, 0, P3::Static("-"));
    v.add_op_p3(Opcode::String, 0, 0, P3::Static("2.7"));
    v.add_op(Opcode::ForceInt, 1, 0);
    v.add_op(Opcode::AddImm, 10, 0);
    v.add_op(Opcode::Callback, 2, 0);
    v.add_op(Opcode::Halt, 0, 0);
    let rows = run_rows(&mut conn, &mut v);
    assert_eq!(rows[0][0].to_text(), "a-b");
    // 2.7 rounds up under ForceInt's ceiling flag, then +10.
    assert_eq!(rows[0][1].to_int(), 13);
}

#[test]
fn keylist_push_pop_preserves_outer_list() {
    let mut conn = Connection::open(":memory:").unwrap();
    let mut v = Vdbe::new();
    // Outer list gets 1; a pushed scope gets 2 and drains it; after
    // the pop the outer 1 is still there.
    v.add_op(Opcode::Integer, 1, 0);
    v.add_op(Opcode::ListWrite, 0, 0);
    v.add_op(Opcode::ListPush, 0, 0);
    v.add_op(Opcode::Integer, 2, 0);
    v.add_op(Opcode::ListWrite, 0, 0);
    let inner_empty = v.make_label();
    v.add_op(Opcode::ListRead, 0, inner_empty);
    v.add_op(Opcode::Pop, 1, 0);
    v.resolve_label(inner_empty);
    v.add_op(Opcode::ListPop, 0, 0);
    let outer_empty = v.make_label();
    v.add_op(Opcode::ListRead, 0, outer_empty);
    v.add_op(Opcode::Callback, 1, 0);
    v.resolve_label(outer_empty);
    v.add_op(Opcode::Halt, 0, 0);
    let rows = run_rows(&mut conn, &mut v);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0][0].to_int(), 1);
}

#[test]
fn set_iteration_with_setfirst_setnext() {
    let mut conn = Connection::open(":memory:").unwrap();
    let mut v = Vdbe::new();
    for name in ["x", "y"] {
        v.add_op_p3(Opcode::SetInsert, 0, 0, P3::Static(name));
    }
    let empty = v.make_label();
    v.add_op(Opcode::SetFirst, 0, empty);
    let body = v.current_addr();
    v.add_op(Opcode::Callback, 1, 0);
    v.add_op(Opcode::SetNext, 0, body as i32);
    v.resolve_label(empty);
    v.add_op(Opcode::Halt, 0, 0);
    let rows = run_rows(&mut conn, &mut v);
    let mut vals: Vec<String> = rows.iter().map(|r| r[0].to_text()).collect();
    vals.sort();
    assert_eq!(vals, vec!["x", "y"]);
}

#[test]
fn pseudo_cursor_round_trip() {
    let mut conn = Connection::open(":memory:").unwrap();
    let mut v = Vdbe::new();
    v.add_op(Opcode::OpenPseudo, 0, 0);
    v.add_op(Opcode::Integer, 9, 0);
    // A two-field record as the pseudo row's data.
    v.add_op_p3(Opcode::String, 0, 0, P3::Static("hello"));
    v.add_op_p3(Opcode::String, 0, 0, P3::Static("world"));
    v.add_op(Opcode::MakeRecord, 2, 0);
    v.add_op(Opcode::PutIntKey, 0, 0);
    v.add_op(Opcode::Recno, 0, 0);
    v.add_op(Opcode::Column, 0, 0);
    v.add_op(Opcode::Column, 0, 1);
    v.add_op(Opcode::Callback, 3, 0);
    v.add_op(Opcode::Halt, 0, 0);
    let rows = run_rows(&mut conn, &mut v);
    assert_eq!(rows[0][0].to_int(), 9);
    assert_eq!(rows[0][1].to_text(), "hello");
    assert_eq!(rows[0][2].to_text(), "world");
}

#[test]
fn temp_table_movelt_and_fullkey() {
    let mut conn = Connection::open(":memory:").unwrap();
    let mut v = Vdbe::new();
    v.add_op(Opcode::OpenTemp, 0, 1);
    for key in ["b", "d"] {
        v.add_op_p3(Opcode::String, 0, 0, P3::Static(key));
        v.add_op_p3(Opcode::String, 0, 0, P3::None);
        v.add_op(Opcode::PutStrKey, 0, 0);
    }
    // MoveLt 'c' lands on 'b'.
    let missed = v.make_label();
    v.add_op_p3(Opcode::String, 0, 0, P3::Static("c"));
    v.add_op(Opcode::MoveLt, 0, missed);
    v.add_op(Opcode::FullKey, 0, 0);
    v.add_op(Opcode::Callback, 1, 0);
    v.resolve_label(missed);
    v.add_op(Opcode::Halt, 0, 0);
    let rows = run_rows(&mut conn, &mut v);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0][0].to_text(), "b");
}

#[test]
fn comparison_jump_and_store_modes() {
    let mut conn = Connection::open(":memory:").unwrap();
    let mut v = Vdbe::new();
    // Store mode: push the boolean.
    v.add_op(Opcode::Integer, 2, 0);
    v.add_op(Opcode::Integer, 3, 0);
    v.add_op(Opcode::Lt, 0, 0);
    // Text comparison: '10' < '2' lexicographically.
    v.add_op_p3(Opcode::String, 0, 0, P3::Static("10"));
    v.add_op_p3(Opcode::String, 0, 0, P3::Static("2"));
    v.add_op(Opcode::StrLt, 0, 0);
    // Numeric comparison of the same strings goes the other way.
    v.add_op_p3(Opcode::String, 0, 0, P3::Static("10"));
    v.add_op_p3(Opcode::String, 0, 0, P3::Static("2"));
    v.add_op(Opcode::Lt, 0, 0);
    v.add_op(Opcode::Callback, 3, 0);
    v.add_op(Opcode::Halt, 0, 0);
    let rows = run_rows(&mut conn, &mut v);
    assert_eq!(rows[0][0].to_int(), 1);
    assert_eq!(rows[0][1].to_int(), 1);
    assert_eq!(rows[0][2].to_int(), 0);
}
