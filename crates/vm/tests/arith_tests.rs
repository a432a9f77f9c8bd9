//! The arithmetic tower as observed through bytecode.

use lumen_vm::{arith, CodeBuilder, Opcode, Thread, Value, Vm};

fn fix(n: i64) -> Value {
    Value::Fixnum(n)
}

fn new_vm() -> Vm {
    let mut vm = Vm::new();
    vm.set_quantum(10_000);
    vm
}

fn closure(vm: &mut Vm, cb: CodeBuilder) -> Value {
    let code = cb.finish(&mut vm.heap, "arith").expect("assemble");
    vm.mkclosure(code, Value::Nil).expect("closure")
}

fn call(vm: &mut Vm, clos: Value) -> Thread {
    let mut thr = vm.make_thread();
    vm.call_thread(&mut thr, clos, &[]).expect("call");
    thr
}

fn binop(vm: &mut Vm, left: Value, right: Value, op: Opcode) -> Value {
    let mut cb = CodeBuilder::new();
    let l_left = cb.literal(left);
    let l_right = cb.literal(right);
    cb.emit1(Opcode::Ldl, l_left as i64);
    cb.emit(Opcode::Push);
    cb.emit1(Opcode::Ldl, l_right as i64);
    cb.emit(op);
    cb.emit(Opcode::Hlt);
    let clos = closure(vm, cb);
    call(vm, clos).value()
}

#[test]
fn fixnum_overflow_promotes_and_demotes() {
    let mut vm = new_vm();
    let big = binop(&mut vm, fix(i64::MAX), fix(i64::MAX), Opcode::Add);
    assert_eq!(vm.heap.type_name(big), "bignum");

    // Subtracting back down demotes to a fixnum again.
    let back = binop(&mut vm, big, fix(i64::MAX), Opcode::Sub);
    assert_eq!(back, fix(i64::MAX));

    // A bignum that lands in fixnum range is indistinguishable from
    // the fixnum by `is`.
    let same = binop(&mut vm, back, fix(i64::MAX), Opcode::Is);
    assert_eq!(same, Value::True);
}

#[test]
fn fixnum_arithmetic_matches_arbitrary_precision() {
    let mut vm = new_vm();
    // 20! is the largest factorial in fixnum range.
    let mut acc_fix = fix(1);
    for n in 1..=20 {
        acc_fix = binop(&mut vm, acc_fix, fix(n), Opcode::Mul);
    }
    assert_eq!(acc_fix, fix(2_432_902_008_176_640_000));

    // 21! forces the bignum layer; dividing 21 back out lands on the
    // same fixnum.
    let mut acc_big = fix(1);
    for n in 1..=21 {
        acc_big = binop(&mut vm, acc_big, fix(n), Opcode::Mul);
    }
    assert_eq!(vm.heap.type_name(acc_big), "bignum");
    let back = binop(&mut vm, acc_big, fix(21), Opcode::Div);
    assert_eq!(back, acc_fix);
    assert!(arith::is(&vm.heap, back, acc_fix));
}

#[test]
fn rational_division_through_the_vm() {
    let mut vm = new_vm();
    let third = binop(&mut vm, fix(1), fix(3), Opcode::Div);
    assert_eq!(vm.heap.type_name(third), "rational");
    let one = binop(&mut vm, third, fix(3), Opcode::Mul);
    assert_eq!(one, fix(1));
}

#[test]
fn division_by_zero_faults() {
    let mut vm = new_vm();
    let seen = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
    let sink = seen.clone();
    vm.set_error_sink(Box::new(move |m| sink.borrow_mut().push(m.to_string())));

    let mut cb = CodeBuilder::new();
    cb.emit_ldi(fix(1)).expect("immediate");
    cb.emit(Opcode::Push);
    cb.emit_ldi(fix(0)).expect("immediate");
    cb.emit(Opcode::Div);
    cb.emit(Opcode::Hlt);
    let clos = closure(&mut vm, cb);
    let thr = call(&mut vm, clos);
    assert_eq!(thr.state, lumen_vm::ThreadState::Broken);
    assert_eq!(seen.borrow().as_slice(), ["division by zero"]);
}

#[test]
fn flonum_contagion() {
    let mut vm = new_vm();
    let half = vm.heap.flonum(0.5).expect("flonum");
    let sum = binop(&mut vm, fix(1), half, Opcode::Add);
    assert_eq!(vm.heap.type_name(sum), "flonum");
    let expected = vm.heap.flonum(1.5).expect("flonum");
    assert!(arith::is(&vm.heap, sum, expected));
}

#[test]
fn add_overloads_on_sequences() {
    let mut vm = new_vm();
    let a = vm.heap.list(&[fix(1), fix(2)]).expect("list");
    let b = vm.heap.list(&[fix(3)]).expect("list");
    let joined = binop(&mut vm, a, b, Opcode::Add);
    assert_eq!(
        vm.heap.list_to_vec(joined).expect("list"),
        vec![fix(1), fix(2), fix(3)]
    );

    let s1 = vm.heap.string("foo").expect("string");
    let s2 = vm.heap.string("bar").expect("string");
    let cat = binop(&mut vm, s1, s2, Opcode::Add);
    assert_eq!(vm.heap.str_value(cat), Some("foobar"));

    let with_char = binop(&mut vm, Value::Char('>'), s1, Opcode::Add);
    assert_eq!(vm.heap.str_value(with_char), Some(">foo"));
}

#[test]
fn comparisons_span_the_tower() {
    let mut vm = new_vm();
    let half = vm.heap.flonum(0.5).expect("flonum");
    assert_eq!(binop(&mut vm, fix(0), half, Opcode::Lt), Value::True);
    assert_eq!(binop(&mut vm, fix(1), half, Opcode::Gt), Value::True);

    let third = arith::div(&mut vm.heap, fix(1), fix(3)).expect("div");
    assert_eq!(binop(&mut vm, third, half, Opcode::Lt), Value::True);

    let a = vm.heap.string("abc").expect("string");
    let b = vm.heap.string("abd").expect("string");
    assert_eq!(binop(&mut vm, a, b, Opcode::Lt), Value::True);
}

#[test]
fn every_value_isos_itself() {
    let mut vm = new_vm();
    let values = [
        Value::Nil,
        Value::True,
        fix(42),
        Value::Char('x'),
        vm.intern("sym"),
        vm.heap.string("str").expect("string"),
        vm.heap.flonum(2.5).expect("flonum"),
        vm.heap.list(&[fix(1), fix(2)]).expect("list"),
    ];
    for v in values {
        assert!(arith::iso(&vm.heap, v, v), "{} != itself", vm.display(v));
    }
}
