//! Shared fixtures: a small builder for typed test programs.

#![allow(dead_code)]

use moss_wasm::ir::{
    Body, ClassDef, ClassId, Constant, CoreClasses, Expr, ExprId, FieldDef, HostImport, IrType,
    MemberDef, MemberId, MemberKind, ParamDef, Program, StaticDef, Stmt,
};

pub const OBJECT: ClassId = ClassId(0);
pub const BOXED_INT: ClassId = ClassId(1);
pub const BOXED_DOUBLE: ClassId = ClassId(2);
pub const BOXED_BOOL: ClassId = ClassId(3);
pub const STRING: ClassId = ClassId(4);

/// Program under construction, seeded with the core classes every test
/// needs.
pub struct TestProgram {
    pub classes: Vec<ClassDef>,
    pub members: Vec<MemberDef>,
    pub statics: Vec<StaticDef>,
    pub imports: Vec<HostImport>,
}

impl TestProgram {
    pub fn new() -> Self {
        let class = |name: &str, superclass: Option<ClassId>, fields: Vec<FieldDef>| ClassDef {
            name: name.into(),
            superclass,
            interfaces: Vec::new(),
            is_abstract: false,
            fields,
            members: Vec::new(),
        };
        let field = |name: &str, ty: IrType| FieldDef {
            name: name.into(),
            ty,
            initializer: None,
        };
        Self {
            classes: vec![
                class("Object", None, vec![]),
                class("BoxedInt", Some(OBJECT), vec![field("value", IrType::Int)]),
                class(
                    "BoxedDouble",
                    Some(OBJECT),
                    vec![field("value", IrType::Double)],
                ),
                class("BoxedBool", Some(OBJECT), vec![field("value", IrType::Bool)]),
                class("String", Some(OBJECT), vec![field("bytes", IrType::Bytes)]),
            ],
            members: Vec::new(),
            statics: Vec::new(),
            imports: Vec::new(),
        }
    }

    pub fn add_class(&mut self, name: &str, superclass: ClassId) -> ClassId {
        let id = ClassId(self.classes.len());
        self.classes.push(ClassDef {
            name: name.into(),
            superclass: Some(superclass),
            interfaces: Vec::new(),
            is_abstract: false,
            fields: Vec::new(),
            members: Vec::new(),
        });
        id
    }

    pub fn add_field(&mut self, class: ClassId, name: &str, ty: IrType) {
        self.classes[class.0].fields.push(FieldDef {
            name: name.into(),
            ty,
            initializer: None,
        });
    }

    pub fn add_method(
        &mut self,
        class: ClassId,
        name: &str,
        params: Vec<ParamDef>,
        return_ty: IrType,
        body: Option<Body>,
    ) -> MemberId {
        let id = MemberId(self.members.len());
        self.members.push(MemberDef {
            name: name.into(),
            owner: Some(class),
            kind: MemberKind::Method,
            params,
            named_params: Vec::new(),
            return_ty,
            is_abstract: body.is_none(),
            body,
            import: None,
        });
        self.classes[class.0].members.push(id);
        id
    }

    pub fn add_setter(
        &mut self,
        class: ClassId,
        name: &str,
        param: ParamDef,
        body: Body,
    ) -> MemberId {
        let id = MemberId(self.members.len());
        self.members.push(MemberDef {
            name: name.into(),
            owner: Some(class),
            kind: MemberKind::Setter,
            params: vec![param],
            named_params: Vec::new(),
            return_ty: IrType::Void,
            body: Some(body),
            is_abstract: false,
            import: None,
        });
        self.classes[class.0].members.push(id);
        id
    }

    pub fn add_constructor(&mut self, class: ClassId, body: Body) -> MemberId {
        let id = MemberId(self.members.len());
        self.members.push(MemberDef {
            name: "new".into(),
            owner: Some(class),
            kind: MemberKind::Constructor,
            params: Vec::new(),
            named_params: Vec::new(),
            return_ty: IrType::Void,
            body: Some(body),
            is_abstract: false,
            import: None,
        });
        self.classes[class.0].members.push(id);
        id
    }

    pub fn add_function(&mut self, name: &str, return_ty: IrType, body: Body) -> MemberId {
        let id = MemberId(self.members.len());
        self.members.push(MemberDef {
            name: name.into(),
            owner: None,
            kind: MemberKind::Function,
            params: Vec::new(),
            named_params: Vec::new(),
            return_ty,
            body: Some(body),
            is_abstract: false,
            import: None,
        });
        id
    }

    pub fn add_static(&mut self, name: &str, ty: IrType, constant: Option<Constant>) {
        self.statics.push(StaticDef {
            name: name.into(),
            ty,
            constant,
            initializer: None,
        });
    }

    pub fn finish(self, entry: MemberId) -> Program {
        Program {
            classes: self.classes,
            members: self.members,
            statics: self.statics,
            imports: self.imports,
            core: CoreClasses {
                object: OBJECT,
                boxed_int: BOXED_INT,
                boxed_double: BOXED_DOUBLE,
                boxed_bool: BOXED_BOOL,
                string: STRING,
            },
            entry,
        }
    }
}

/// `{ return <value>; }`
pub fn int_body(value: i64) -> Body {
    let mut body = Body::new(Vec::new(), 0);
    let literal = body.add_expr(Expr::IntLit(value));
    body.stmts = vec![Stmt::Return(Some(literal))];
    body
}

pub fn empty_body() -> Body {
    Body::new(Vec::new(), 0)
}

/// A constructor body that chains to a superclass constructor.
pub fn chaining_ctor(super_ctor: MemberId) -> Body {
    let mut body = Body::new(Vec::new(), 0);
    let this = body.add_expr(Expr::This);
    let call = body.add_expr(Expr::CallDirect {
        target: super_ctor,
        receiver: Some(this),
        args: Vec::new(),
        named_args: Vec::new(),
    });
    body.stmts = vec![Stmt::Expr(call)];
    body
}

pub fn add_expr(body: &mut Body, expr: Expr) -> ExprId {
    body.add_expr(expr)
}

// ---- binary inspection helpers ----

pub const WASM_MAGIC: [u8; 4] = [0x00, 0x61, 0x73, 0x6D];

fn read_leb(bytes: &[u8], cursor: &mut usize) -> u32 {
    let mut value = 0u32;
    let mut shift = 0;
    loop {
        let byte = bytes[*cursor];
        *cursor += 1;
        value |= u32::from(byte & 0x7F) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            break;
        }
    }
    value
}

/// The payload of the first section with the given id.
pub fn section_payload(bytes: &[u8], id: u8) -> Option<Vec<u8>> {
    let mut cursor = 8;
    while cursor < bytes.len() {
        let section_id = bytes[cursor];
        cursor += 1;
        let size = read_leb(bytes, &mut cursor) as usize;
        if section_id == id {
            return Some(bytes[cursor..cursor + size].to_vec());
        }
        cursor += size;
    }
    None
}

/// Section ids in order of appearance.
pub fn section_ids(bytes: &[u8]) -> Vec<u8> {
    let mut ids = Vec::new();
    let mut cursor = 8;
    while cursor < bytes.len() {
        ids.push(bytes[cursor]);
        cursor += 1;
        let size = read_leb(bytes, &mut cursor) as usize;
        cursor += size;
    }
    ids
}

/// First LEB of a section payload; for most sections this is the entry
/// count.
pub fn leading_count(payload: &[u8]) -> u32 {
    let mut cursor = 0;
    read_leb(payload, &mut cursor)
}
