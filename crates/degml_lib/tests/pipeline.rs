use degml_lib::ast::{CallExpr, Scalar};
use degml_lib::instr::{Operand, PushValue};
use degml_lib::render;
use degml_lib::*;
use pretty_assertions::assert_eq;

fn symbols() -> Symbols {
    serde_json::from_str(
        r#"{
            "symbols": [
                {"name": "x", "kind": "Variable"},
                {"name": "flag", "kind": "Variable"},
                {"name": "show_message", "kind": "Function"},
                {"name": "a", "kind": "Variable"},
                {"name": "b", "kind": "Variable"}
            ],
            "strings": ["hi"],
            "objects": ["obj_wall", "obj_player"]
        }"#,
    )
    .unwrap()
}

fn lower(text: &str) -> Vec<Instr> {
    assemble(text).unwrap().lower(&symbols()).unwrap()
}

fn decompile(text: &str, options: DecompileOptions) -> Result<String, DegmlError> {
    let stmts = decompile_function(&lower(text), &symbols(), options)?;
    render_function("f", &stmts)
}

#[test]
fn addition_assigns_to_self() {
    let x = VarRef { index: 0, kind: VariableType::Plain };
    let instrs = vec![
        Instr::new(0, OpCode::Push, Operand::Push { ty: DataType::Int32, value: PushValue::Int32(2) }),
        Instr::new(8, OpCode::Push, Operand::Push { ty: DataType::Int32, value: PushValue::Int32(3) }),
        Instr::new(16, OpCode::Add, Operand::Double { t1: DataType::Int32, t2: DataType::Int32 }),
        Instr::new(
            20,
            OpCode::Set,
            Operand::Set { t1: DataType::Int32, t2: DataType::Variable, instance: InstanceType::SelfRef, var: x },
        ),
    ];
    let stmts = decompile_function(&instrs, &symbols(), DecompileOptions::default()).unwrap();
    assert_eq!(stmts.len(), 1);
    assert_eq!(render::statement(&stmts[0]).unwrap(), "(self.x = (+ 2 3))");
}

#[test]
fn false_branch_to_the_end_offset() {
    let instrs = lower("push var self:flag\nbrf end\nexit int\nend:\n");
    assert_eq!(instrs[1].offset, 8);
    assert_eq!(instrs[1].target(), Some(0x10));

    let stmts = decompile_function(&instrs, &symbols(), DecompileOptions::default()).unwrap();
    let Statement::Branch { ty, condition: Some(Expression::Variable(v)), target } = &stmts[0] else {
        panic!("{stmts:?}")
    };
    assert_eq!((*ty, v.symbol.name.as_str(), v.scope, *target), (BranchType::IfFalse, "flag", InstanceType::SelfRef, 0x10));
    assert_eq!(
        render_function("f", &stmts).unwrap(),
        "function f {\n    if !self.flag goto 0x000010\n    exit\n    0x000010:\n}\n"
    );
}

#[test]
fn labels_can_be_switched_off() {
    let options = DecompileOptions { labels: false, ..DecompileOptions::default() };
    let out = decompile("push var self:flag\nbrf end\nexit int\nend:\n", options).unwrap();
    assert_eq!(out, "function f {\n    if !self.flag goto 0x000010\n    exit\n}\n");
}

const LOOP: &str = "\
pushi short 0s
set short:var self:x
top:
push var self:x
pushi short 10s
cmp lt var:short
brf done
push var self:x
pushi short 1s
add var:short
set var:var self:x
br top
done:
exit int
";

const LOOP_OUT: &str = "\
function loop {
    (self.x = 0s)
    0x00000C:
    if !(< self.x 10s) goto 0x00003C
    (self.x = (+ self.x 1s))
    goto 0x00000C
    0x00003C:
    exit
}
";

#[test]
fn loop_decompiles_from_either_dialect() {
    let asm = assemble(LOOP).unwrap();
    for dialect in [Dialect::E, Dialect::F] {
        let code = asm.encode(&symbols(), dialect).unwrap();
        let options = DecompileOptions { dialect, ..DecompileOptions::default() };
        let stmts = decompile_code(&code, &symbols(), options).unwrap();
        assert_eq!(render_function("loop", &stmts).unwrap(), LOOP_OUT, "{dialect:?}");
    }
}

#[test]
fn dialect_f_decodes_exactly_what_was_lowered() {
    let instrs = lower(LOOP);
    let code = encode(&instrs, Dialect::F).unwrap();
    assert_eq!(code.len(), 64);
    assert_eq!(decode(&code, Dialect::F).unwrap(), instrs);
}

#[test]
fn env_pair_becomes_a_scoped_block() {
    let text = "\
pushi short 100s
pushenv end
body:
push int 1
set int:var self:x
end:
popenv body
exit int
";
    let out = decompile(text, DecompileOptions::default()).unwrap();
    assert_eq!(out, "function f {\n    pushenv 100s {\n        (self.x = 1)\n    }\n    exit\n}\n");
}

#[test]
fn pushenv_without_popenv_is_unbalanced() {
    let text = "\
pushi short 100s
pushenv end
push int 1
end:
set int:var self:x
";
    let err = decompile(text, DecompileOptions::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnbalancedScope);
    assert_eq!(err.offset(), Some(4));
}

#[test]
fn discarded_call_is_a_call_statement() {
    let stmts = decompile_function(
        &lower("push string \"hi\"\ncall var:1 show_message\npopz var\n"),
        &symbols(),
        DecompileOptions::default(),
    )
    .unwrap();
    assert_eq!(
        stmts,
        vec![Statement::Call(CallExpr {
            function: SymbolRef::function("show_message"),
            kind: VariableType::Plain,
            args: vec![Expression::literal(DataType::String, Scalar::String("hi".into()))],
            ty: DataType::Variable,
        })]
    );
    assert_eq!(render::statement(&stmts[0]).unwrap(), "call (show_message:var \"hi\")");
}

#[test]
fn lenient_stack_keeps_going() {
    let text = "popz var\nexit int\n";
    let err = decompile(text, DecompileOptions::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StackUnderflow);
    let options = DecompileOptions { lenient_stack: true, ..DecompileOptions::default() };
    assert_eq!(decompile(text, options).unwrap(), "function f {\n    pop\n    exit\n}\n");
}

#[test]
fn one_bad_function_does_not_sink_the_batch() {
    let bodies = vec![
        FunctionBody { name: "good".into(), instrs: lower("exit int\n") },
        FunctionBody { name: "bad".into(), instrs: lower("ret var\n") },
        FunctionBody { name: "also_good".into(), instrs: lower("push var self:x\nret var\n") },
    ];
    let results = decompile_functions(&bodies, &symbols(), DecompileOptions::default());
    assert!(results[0].is_ok());
    let err = results[1].as_ref().unwrap_err();
    assert_eq!((err.function.as_str(), err.error.kind()), ("bad", ErrorKind::StackUnderflow));
    assert_eq!(results[2].as_ref().unwrap(), "function also_good {\n    ret var self.x\n}\n");

    let text = decompile_to_string(&bodies, &symbols(), DecompileOptions::default());
    assert_eq!(
        text,
        "function good {\n    exit\n}\n\n// bad: operand stack underflow at 0x0\n\nfunction also_good {\n    ret var self.x\n}\n"
    );
}

#[test]
fn branch_into_the_middle_of_an_instruction_is_rejected() {
    let x = VarRef { index: 0, kind: VariableType::Plain };
    let instrs = vec![
        Instr::new(0, OpCode::Br, Operand::Goto { target: 8 }),
        Instr::new(4, OpCode::Push, Operand::Push { ty: DataType::Variable, value: PushValue::Variable { instance: InstanceType::SelfRef, var: x } }),
        Instr::new(12, OpCode::Exit, Operand::Single { ty: DataType::Int32 }),
    ];
    let err = decompile_function(&instrs, &symbols(), DecompileOptions::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadBranchTarget);
    assert_eq!(err.offset(), Some(0));
}

const AND: &str = "\
push var self:a
conv var:bool
brf no
push var self:b
conv var:bool
br join
no:
push bool false
join:
set bool:var self:x
exit int
";

#[test]
fn short_circuit_and_carries_values_into_the_join() {
    let out = decompile(AND, DecompileOptions::default()).unwrap();
    assert_eq!(out, "function f {\n    (self.x = (? (bool self.a) (bool self.b) false))\n    exit\n}\n");
    let lenient = DecompileOptions { lenient_stack: true, ..DecompileOptions::default() };
    assert_eq!(decompile(AND, lenient).unwrap(), out);
}

#[test]
fn short_circuit_or_takes_the_constant_on_the_true_arm() {
    let text = "\
push var self:a
brt yes
push var self:b
br join
yes:
push bool true
join:
set var:var self:x
exit int
";
    let out = decompile(text, DecompileOptions::default()).unwrap();
    assert_eq!(out, "function f {\n    (self.x = (? self.a true self.b))\n    exit\n}\n");
}

#[test]
fn named_instance_lowers_to_the_object_index() {
    let instrs = lower("push var obj_player:x\nset var:var self:flag\n");
    let stmts = decompile_function(&instrs, &symbols(), DecompileOptions::default()).unwrap();
    assert_eq!(render::statement(&stmts[0]).unwrap(), "(self.flag = 1.x)");
}

