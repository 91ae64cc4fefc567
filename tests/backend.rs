//! End-to-end module emission over small typed programs.

mod common;

use common::*;
use moss_wasm::ir::{Constant, Expr, IrType, LocalDef, Stmt};
use moss_wasm::{BackendOptions, compile};

/// Animal { speak() -> 1 }, Dog : Animal { speak() -> 2 }, and a call site
/// whose static type cannot prove the concrete class.
fn animals_program() -> moss_wasm::ir::Program {
    let mut p = TestProgram::new();
    let animal = p.add_class("Animal", OBJECT);
    let dog = p.add_class("Dog", animal);
    let speak = p.add_method(animal, "speak", Vec::new(), IrType::Int, Some(int_body(1)));
    p.add_method(dog, "speak", Vec::new(), IrType::Int, Some(int_body(2)));
    let animal_ctor = p.add_constructor(animal, empty_body());
    let dog_ctor = p.add_constructor(dog, chaining_ctor(animal_ctor));

    let mut main = moss_wasm::ir::Body::new(Vec::new(), 0);
    let a = main.add_local("a", IrType::class(animal));
    let new_dog = main.add_expr(Expr::New {
        class: dog,
        ctor: dog_ctor,
        args: Vec::new(),
        named_args: Vec::new(),
    });
    let receiver = main.add_expr(Expr::LocalGet(a));
    let call = main.add_expr(Expr::CallVirtual {
        receiver,
        interface_target: speak,
        args: Vec::new(),
        named_args: Vec::new(),
    });
    main.stmts = vec![
        Stmt::Let {
            local: a,
            value: Some(new_dog),
        },
        Stmt::Expr(call),
        Stmt::Return(None),
    ];
    let entry = p.add_function("main", IrType::Void, main);
    p.finish(entry)
}

#[test]
fn virtual_dispatch_compiles_through_the_table() {
    let program = animals_program();
    let compiled = compile(&program, &BackendOptions::default()).unwrap();
    assert_eq!(&compiled.bytes[..4], &WASM_MAGIC);
    // Dog overrides speak, so the call stays indirect: the module carries a
    // dispatch table with an element segment.
    let ids = section_ids(&compiled.bytes);
    assert!(ids.contains(&4), "table section present: {ids:?}");
    assert!(ids.contains(&9), "element section present: {ids:?}");
    assert_eq!(compiled.exports[0].symbol, "main");
}

#[test]
fn dispatch_strategies_agree_on_the_export_surface() {
    let program = animals_program();
    let baseline = compile(&program, &BackendOptions::default()).unwrap();
    let variants = [
        BackendOptions {
            devirtualize: false,
            ..BackendOptions::default()
        },
        BackendOptions {
            polymorphic_specialization: true,
            ..BackendOptions::default()
        },
        BackendOptions {
            inline_trivial_calls: true,
            ..BackendOptions::default()
        },
        BackendOptions {
            nullable_locals: true,
            ..BackendOptions::default()
        },
    ];
    for options in variants {
        let compiled = compile(&program, &options).unwrap();
        // Strategy toggles change the emitted instructions, never the
        // module's external surface.
        assert_eq!(compiled.exports, baseline.exports, "{options:?}");
        assert_eq!(&compiled.bytes[..8], &baseline.bytes[..8]);
    }
}

#[test]
fn single_implementation_devirtualizes_without_a_table() {
    let mut p = TestProgram::new();
    let animal = p.add_class("Animal", OBJECT);
    let speak = p.add_method(animal, "speak", Vec::new(), IrType::Int, Some(int_body(1)));
    let ctor = p.add_constructor(animal, empty_body());

    let mut main = moss_wasm::ir::Body::new(Vec::new(), 0);
    let new_animal = main.add_expr(Expr::New {
        class: animal,
        ctor,
        args: Vec::new(),
        named_args: Vec::new(),
    });
    let call = main.add_expr(Expr::CallVirtual {
        receiver: new_animal,
        interface_target: speak,
        args: Vec::new(),
        named_args: Vec::new(),
    });
    main.stmts = vec![Stmt::Expr(call), Stmt::Return(None)];
    let entry = p.add_function("main", IrType::Void, main);
    let program = p.finish(entry);

    // Devirtualized: no call site touches the table, but the row still
    // exists for the strategy switch; compiling with devirtualization off
    // must also succeed.
    compile(&program, &BackendOptions::default()).unwrap();
    compile(
        &program,
        &BackendOptions {
            devirtualize: false,
            ..BackendOptions::default()
        },
    )
    .unwrap();
}

/// `const [1, 2, 3]` used from two different functions must share one
/// backing global.
#[test]
fn constants_are_memoized_across_functions() {
    let list = Constant::List {
        elem: IrType::Int,
        values: vec![Constant::Int(1), Constant::Int(2), Constant::Int(3)],
    };
    let mut p = TestProgram::new();
    let mut side = moss_wasm::ir::Body::new(Vec::new(), 0);
    let constant = side.add_expr(Expr::Const(list.clone()));
    side.stmts = vec![Stmt::Expr(constant), Stmt::Return(None)];
    let helper = p.add_function("helper", IrType::Void, side);

    let mut main = moss_wasm::ir::Body::new(Vec::new(), 0);
    let constant = main.add_expr(Expr::Const(list));
    let call = main.add_expr(Expr::CallDirect {
        target: helper,
        receiver: None,
        args: Vec::new(),
        named_args: Vec::new(),
    });
    main.stmts = vec![
        Stmt::Expr(constant),
        Stmt::Expr(call),
        Stmt::Return(None),
    ];
    let entry = p.add_function("main", IrType::Void, main);
    let program = p.finish(entry);

    let compiled = compile(&program, &BackendOptions::default()).unwrap();
    let globals = section_payload(&compiled.bytes, 6).expect("global section");
    assert_eq!(leading_count(&globals), 1, "one interned constant global");
}

#[test]
fn eager_constants_run_from_a_start_function() {
    let mut p = TestProgram::new();
    let mut main = moss_wasm::ir::Body::new(Vec::new(), 0);
    let constant = main.add_expr(Expr::Const(Constant::List {
        elem: IrType::Int,
        values: vec![Constant::Int(4)],
    }));
    main.stmts = vec![Stmt::Expr(constant), Stmt::Return(None)];
    let entry = p.add_function("main", IrType::Void, main);
    let program = p.finish(entry);

    let lazy = compile(&program, &BackendOptions::default()).unwrap();
    assert!(
        !section_ids(&lazy.bytes).contains(&8),
        "lazy mode has no start section"
    );
    let eager = compile(
        &program,
        &BackendOptions {
            eager_constants: true,
            ..BackendOptions::default()
        },
    )
    .unwrap();
    assert!(
        section_ids(&eager.bytes).contains(&8),
        "eager mode drives initializers from start"
    );
}

#[test]
fn string_literals_share_data_segments() {
    let mut p = TestProgram::new();
    let mut main = moss_wasm::ir::Body::new(Vec::new(), 0);
    let first = main.add_expr(Expr::StringLit("hello".into()));
    let second = main.add_expr(Expr::StringLit("hello".into()));
    main.stmts = vec![
        Stmt::Expr(first),
        Stmt::Expr(second),
        Stmt::Return(None),
    ];
    let entry = p.add_function("main", IrType::Void, main);
    let program = p.finish(entry);

    let compiled = compile(&program, &BackendOptions::default()).unwrap();
    let ids = section_ids(&compiled.bytes);
    assert!(ids.contains(&5), "memory section accompanies data: {ids:?}");
    assert!(ids.contains(&12), "data-count section present: {ids:?}");
    let data = section_payload(&compiled.bytes, 11).expect("data section");
    assert_eq!(leading_count(&data), 1, "identical literals share a segment");
}

#[test]
fn lambdas_capture_locals_through_contexts() {
    let mut p = TestProgram::new();
    let mut main = moss_wasm::ir::Body::new(Vec::new(), 0);
    let counter = main.add_local("counter", IrType::Int);
    let x = main.add_local("x", IrType::Int);

    let init = main.add_expr(Expr::IntLit(10));
    let get_counter = main.add_expr(Expr::LocalGet(counter));
    let lambda = main.add_expr(Expr::Lambda {
        params: vec![x],
        return_ty: IrType::Int,
        body: vec![Stmt::Return(Some(get_counter))],
    });
    let f = main.add_local(
        "f",
        IrType::Func {
            params: vec![IrType::Int],
            ret: Box::new(IrType::Int),
            nullable: false,
        },
    );
    let get_f = main.add_expr(Expr::LocalGet(f));
    let arg = main.add_expr(Expr::IntLit(1));
    let call = main.add_expr(Expr::CallClosure {
        callee: get_f,
        args: vec![arg],
    });
    main.stmts = vec![
        Stmt::Let {
            local: counter,
            value: Some(init),
        },
        Stmt::Let {
            local: f,
            value: Some(lambda),
        },
        Stmt::Expr(call),
        Stmt::Return(None),
    ];
    let entry = p.add_function("main", IrType::Void, main);
    let program = p.finish(entry);

    compile(&program, &BackendOptions::default()).unwrap();
}

#[test]
fn export_all_mangles_members_and_setters() {
    let mut p = TestProgram::new();
    let animal = p.add_class("Animal", OBJECT);
    p.add_field(animal, "sound", IrType::Int);
    p.add_method(animal, "speak", Vec::new(), IrType::Int, Some(int_body(1)));
    let mut setter_body = moss_wasm::ir::Body::new(
        vec![LocalDef {
            name: "value".into(),
            ty: IrType::Int,
        }],
        1,
    );
    let this = setter_body.add_expr(Expr::This);
    let value = setter_body.add_expr(Expr::LocalGet(moss_wasm::ir::LocalId(0)));
    let write = setter_body.add_expr(Expr::FieldSet {
        receiver: this,
        field: moss_wasm::ir::FieldRef {
            class: animal,
            index: 0,
        },
        value,
    });
    setter_body.stmts = vec![Stmt::Expr(write)];
    p.add_setter(
        animal,
        "sound",
        moss_wasm::ir::ParamDef {
            name: "value".into(),
            ty: IrType::Int,
            default: None,
        },
        setter_body,
    );

    let mut main = moss_wasm::ir::Body::new(Vec::new(), 0);
    main.stmts = vec![Stmt::Return(None)];
    let entry = p.add_function("main", IrType::Void, main);
    let program = p.finish(entry);

    let compiled = compile(
        &program,
        &BackendOptions {
            export_all: true,
            ..BackendOptions::default()
        },
    )
    .unwrap();
    let symbols: Vec<&str> = compiled
        .exports
        .iter()
        .map(|e| e.symbol.as_str())
        .collect();
    assert!(symbols.contains(&"main"));
    assert!(symbols.contains(&"Animal.speak"), "{symbols:?}");
    assert!(symbols.contains(&"Animal.sound="), "{symbols:?}");
}

#[test]
fn boxing_carries_primitives_into_object_contexts() {
    let mut p = TestProgram::new();
    let mut main = moss_wasm::ir::Body::new(Vec::new(), 0);
    let o = main.add_local("o", IrType::nullable_class(OBJECT));
    let seven = main.add_expr(Expr::IntLit(7));
    let probe = main.add_expr(Expr::LocalGet(o));
    let test = main.add_expr(Expr::Is {
        operand: probe,
        class: BOXED_INT,
    });
    let keep = main.add_local("hit", IrType::Bool);
    let set = main.add_expr(Expr::LocalSet(keep, test));
    main.stmts = vec![
        Stmt::Let {
            local: o,
            value: Some(seven),
        },
        Stmt::Expr(set),
        Stmt::Return(None),
    ];
    let entry = p.add_function("main", IrType::Void, main);
    let program = p.finish(entry);

    compile(&program, &BackendOptions::default()).unwrap();
}

#[test]
fn trivial_callees_inline_into_a_typed_block() {
    let mut p = TestProgram::new();
    let helper = p.add_function("one", IrType::Int, int_body(1));
    let mut main = moss_wasm::ir::Body::new(Vec::new(), 0);
    let call = main.add_expr(Expr::CallDirect {
        target: helper,
        receiver: None,
        args: Vec::new(),
        named_args: Vec::new(),
    });
    let sink = main.add_local("x", IrType::Int);
    main.stmts = vec![
        Stmt::Let {
            local: sink,
            value: Some(call),
        },
        Stmt::Return(None),
    ];
    let entry = p.add_function("main", IrType::Void, main);
    let program = p.finish(entry);

    let plain = compile(&program, &BackendOptions::default()).unwrap();
    let inlined = compile(
        &program,
        &BackendOptions {
            inline_trivial_calls: true,
            ..BackendOptions::default()
        },
    )
    .unwrap();
    assert_eq!(plain.exports, inlined.exports);
    // The callee's function still exists either way; only the call site's
    // instruction sequence changes.
    assert_ne!(plain.bytes, inlined.bytes);
}

#[test]
fn primitive_arithmetic_lowers_through_intrinsics() {
    let mut p = TestProgram::new();
    // An abstract `+` declaration gives the call site its interface
    // target; the receiver's static type routes it to the intrinsic.
    let plus = p.add_method(
        OBJECT,
        "+",
        vec![moss_wasm::ir::ParamDef {
            name: "other".into(),
            ty: IrType::Int,
            default: None,
        }],
        IrType::Int,
        None,
    );
    let mut main = moss_wasm::ir::Body::new(Vec::new(), 0);
    let lhs = main.add_expr(Expr::IntLit(2));
    let rhs = main.add_expr(Expr::IntLit(3));
    let sum = main.add_expr(Expr::CallVirtual {
        receiver: lhs,
        interface_target: plus,
        args: vec![rhs],
        named_args: Vec::new(),
    });
    let sink = main.add_local("x", IrType::Int);
    main.stmts = vec![
        Stmt::Let {
            local: sink,
            value: Some(sum),
        },
        Stmt::Return(None),
    ];
    let entry = p.add_function("main", IrType::Void, main);
    let program = p.finish(entry);

    compile(&program, &BackendOptions::default()).unwrap();
}

#[test]
fn loops_break_and_continue_compile() {
    let mut p = TestProgram::new();
    let lt = p.add_method(
        OBJECT,
        "<",
        vec![moss_wasm::ir::ParamDef {
            name: "other".into(),
            ty: IrType::Int,
            default: None,
        }],
        IrType::Bool,
        None,
    );
    let mut main = moss_wasm::ir::Body::new(Vec::new(), 0);
    let i = main.add_local("i", IrType::Int);
    let zero = main.add_expr(Expr::IntLit(0));
    let get_i = main.add_expr(Expr::IntLit(0));
    let limit = main.add_expr(Expr::IntLit(10));
    let cond = main.add_expr(Expr::CallVirtual {
        receiver: get_i,
        interface_target: lt,
        args: vec![limit],
        named_args: Vec::new(),
    });
    let bump = main.add_expr(Expr::IntLit(1));
    let step = main.add_expr(Expr::LocalSet(i, bump));
    main.stmts = vec![
        Stmt::Let {
            local: i,
            value: Some(zero),
        },
        Stmt::While {
            cond,
            body: vec![Stmt::Expr(step), Stmt::Continue, Stmt::Break],
        },
        Stmt::Return(None),
    ];
    let entry = p.add_function("main", IrType::Void, main);
    let program = p.finish(entry);

    compile(&program, &BackendOptions::default()).unwrap();
}

#[test]
fn lazy_statics_read_through_accessors() {
    let mut p = TestProgram::new();
    p.add_static(
        "table",
        IrType::array(IrType::Int),
        Some(Constant::List {
            elem: IrType::Int,
            values: vec![Constant::Int(1)],
        }),
    );
    let mut main = moss_wasm::ir::Body::new(Vec::new(), 0);
    let read = main.add_expr(Expr::StaticGet(moss_wasm::ir::StaticId(0)));
    main.stmts = vec![Stmt::Expr(read), Stmt::Return(None)];
    let entry = p.add_function("main", IrType::Void, main);
    let program = p.finish(entry);

    compile(&program, &BackendOptions::default()).unwrap();
}
