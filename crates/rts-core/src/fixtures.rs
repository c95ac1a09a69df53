//! Class-file assembler for tests and benchmarks.
//!
//! Produces real class-file bytes for a small instruction subset, with knobs
//! for the variations a recompilation can introduce: debug attributes and
//! constant-pool layout.

use std::collections::HashMap;

use crate::models::artifact_path;

// ---------------------------------------------------------------------------
// Constant pool writer
// ---------------------------------------------------------------------------

#[derive(Default)]
struct PoolWriter {
    entries: Vec<Vec<u8>>,
    index: HashMap<Vec<u8>, u16>,
}

impl PoolWriter {
    fn intern(&mut self, entry: Vec<u8>) -> u16 {
        if let Some(&idx) = self.index.get(&entry) {
            return idx;
        }
        let idx = (self.entries.len() + 1) as u16;
        self.index.insert(entry.clone(), idx);
        self.entries.push(entry);
        idx
    }

    fn utf8(&mut self, value: &str) -> u16 {
        let mut e = vec![1];
        e.extend_from_slice(&(value.len() as u16).to_be_bytes());
        e.extend_from_slice(value.as_bytes());
        self.intern(e)
    }

    fn with_refs(&mut self, tag: u8, refs: &[u16]) -> u16 {
        let mut e = vec![tag];
        for r in refs {
            e.extend_from_slice(&r.to_be_bytes());
        }
        self.intern(e)
    }

    fn class(&mut self, dotted: &str) -> u16 {
        let name = self.utf8(&dotted.replace('.', "/"));
        self.with_refs(7, &[name])
    }

    fn string(&mut self, value: &str) -> u16 {
        let s = self.utf8(value);
        self.with_refs(8, &[s])
    }

    fn integer(&mut self, value: i32) -> u16 {
        let mut e = vec![3];
        e.extend_from_slice(&value.to_be_bytes());
        self.intern(e)
    }

    fn name_and_type(&mut self, name: &str, descriptor: &str) -> u16 {
        let n = self.utf8(name);
        let d = self.utf8(descriptor);
        self.with_refs(12, &[n, d])
    }

    fn member(&mut self, tag: u8, owner: &str, name: &str, descriptor: &str) -> u16 {
        let class = self.class(owner);
        let nat = self.name_and_type(name, descriptor);
        self.with_refs(tag, &[class, nat])
    }

    fn method_handle(&mut self, kind: u8, member: u16) -> u16 {
        let mut e = vec![15, kind];
        e.extend_from_slice(&member.to_be_bytes());
        self.intern(e)
    }

    fn method_type(&mut self, descriptor: &str) -> u16 {
        let d = self.utf8(descriptor);
        self.with_refs(16, &[d])
    }

    fn invoke_dynamic(&mut self, bootstrap: u16, name: &str, descriptor: &str) -> u16 {
        let nat = self.name_and_type(name, descriptor);
        self.with_refs(18, &[bootstrap, nat])
    }
}

fn push_u2(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn push_u4(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn push_attribute(out: &mut Vec<u8>, name: u16, body: &[u8]) {
    push_u2(out, name);
    push_u4(out, body.len() as u32);
    out.extend_from_slice(body);
}

// ---------------------------------------------------------------------------
// Code builder
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
enum Op {
    Simple(u8),
    Local(u8, u8),
    Iinc(u8, i8),
    Bipush(i8),
    LdcString(String),
    Member(u8, String, String, String),
    Type(u8, String),
    /// Branch opcode and target instruction ordinal.
    Branch(u8, usize),
    Lambda {
        name: String,
        descriptor: String,
        owner: String,
        target: String,
        target_descriptor: String,
    },
}

/// Sequence of instructions for one method body.
#[derive(Clone, Debug, Default)]
pub struct CodeBuilder {
    ops: Vec<Op>,
}

impl CodeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(mut self, op: Op) -> Self {
        self.ops.push(op);
        self
    }

    pub fn op(self, opcode: u8) -> Self {
        self.push(Op::Simple(opcode))
    }

    pub fn aload(self, index: u8) -> Self {
        self.push(Op::Local(0x19, index))
    }

    pub fn iload(self, index: u8) -> Self {
        self.push(Op::Local(0x15, index))
    }

    pub fn iconst(self, value: u8) -> Self {
        self.push(Op::Simple(0x03 + value.min(5)))
    }

    pub fn bipush(self, value: i8) -> Self {
        self.push(Op::Bipush(value))
    }

    pub fn iinc(self, index: u8, delta: i8) -> Self {
        self.push(Op::Iinc(index, delta))
    }

    pub fn ldc_str(self, value: &str) -> Self {
        self.push(Op::LdcString(value.to_string()))
    }

    pub fn pop(self) -> Self {
        self.op(0x57)
    }

    pub fn dup(self) -> Self {
        self.op(0x59)
    }

    pub fn ret(self) -> Self {
        self.op(0xb1)
    }

    pub fn ireturn(self) -> Self {
        self.op(0xac)
    }

    pub fn areturn(self) -> Self {
        self.op(0xb0)
    }

    fn member(self, opcode: u8, owner: &str, name: &str, descriptor: &str) -> Self {
        self.push(Op::Member(
            opcode,
            owner.to_string(),
            name.to_string(),
            descriptor.to_string(),
        ))
    }

    pub fn getstatic(self, owner: &str, name: &str, descriptor: &str) -> Self {
        self.member(0xb2, owner, name, descriptor)
    }

    pub fn putstatic(self, owner: &str, name: &str, descriptor: &str) -> Self {
        self.member(0xb3, owner, name, descriptor)
    }

    pub fn getfield(self, owner: &str, name: &str, descriptor: &str) -> Self {
        self.member(0xb4, owner, name, descriptor)
    }

    pub fn putfield(self, owner: &str, name: &str, descriptor: &str) -> Self {
        self.member(0xb5, owner, name, descriptor)
    }

    pub fn invokevirtual(self, owner: &str, name: &str, descriptor: &str) -> Self {
        self.member(0xb6, owner, name, descriptor)
    }

    pub fn invokespecial(self, owner: &str, name: &str, descriptor: &str) -> Self {
        self.member(0xb7, owner, name, descriptor)
    }

    pub fn invokestatic(self, owner: &str, name: &str, descriptor: &str) -> Self {
        self.member(0xb8, owner, name, descriptor)
    }

    pub fn invokeinterface(self, owner: &str, name: &str, descriptor: &str) -> Self {
        self.member(0xb9, owner, name, descriptor)
    }

    pub fn new_object(self, owner: &str) -> Self {
        self.push(Op::Type(0xbb, owner.to_string()))
    }

    pub fn ifeq(self, target: usize) -> Self {
        self.push(Op::Branch(0x99, target))
    }

    pub fn goto(self, target: usize) -> Self {
        self.push(Op::Branch(0xa7, target))
    }

    /// `invokedynamic` through `LambdaMetafactory` targeting a static method.
    pub fn invokedynamic_lambda(
        self,
        name: &str,
        descriptor: &str,
        owner: &str,
        target: &str,
        target_descriptor: &str,
    ) -> Self {
        self.push(Op::Lambda {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            owner: owner.to_string(),
            target: target.to_string(),
            target_descriptor: target_descriptor.to_string(),
        })
    }

    fn emit(&self, pool: &mut PoolWriter, bootstraps: &mut Vec<Vec<u16>>) -> Vec<u8> {
        // Resolve pool indices first so instruction sizes are known.
        let indices: Vec<u16> = self
            .ops
            .iter()
            .map(|op| match op {
                Op::LdcString(s) => pool.string(s),
                Op::Member(opcode, owner, name, desc) => {
                    let tag = if *opcode == 0xb9 {
                        11
                    } else if *opcode >= 0xb6 {
                        10
                    } else {
                        9
                    };
                    pool.member(tag, owner, name, desc)
                }
                Op::Type(_, owner) => pool.class(owner),
                Op::Lambda {
                    name,
                    descriptor,
                    owner,
                    target,
                    target_descriptor,
                } => {
                    let factory = pool.member(
                        10,
                        "java.lang.invoke.LambdaMetafactory",
                        "metafactory",
                        "(Ljava/lang/invoke/MethodHandles$Lookup;Ljava/lang/String;Ljava/lang/invoke/MethodType;Ljava/lang/invoke/MethodType;Ljava/lang/invoke/MethodHandle;Ljava/lang/invoke/MethodType;)Ljava/lang/invoke/CallSite;",
                    );
                    let factory_handle = pool.method_handle(6, factory);
                    let erased = pool.method_type(target_descriptor);
                    let implementation = pool.member(10, owner, target, target_descriptor);
                    let impl_handle = pool.method_handle(6, implementation);
                    bootstraps.push(vec![factory_handle, erased, impl_handle, erased]);
                    let index = (bootstraps.len() - 1) as u16;
                    pool.invoke_dynamic(index, name, descriptor)
                }
                _ => 0,
            })
            .collect();

        let sizes: Vec<usize> = self
            .ops
            .iter()
            .zip(&indices)
            .map(|(op, idx)| match op {
                Op::Simple(_) => 1,
                Op::Local(..) | Op::Bipush(_) => 2,
                Op::LdcString(_) if *idx <= 0xff => 2,
                Op::Iinc(..) | Op::Member(..) | Op::Type(..) | Op::Branch(..) | Op::LdcString(_) => {
                    3
                }
                Op::Lambda { .. } => 5,
            })
            .collect();
        let mut offsets = Vec::with_capacity(sizes.len());
        let mut total = 0usize;
        for size in &sizes {
            offsets.push(total);
            total += size;
        }

        let mut out = Vec::with_capacity(total);
        for (i, (op, idx)) in self.ops.iter().zip(&indices).enumerate() {
            match op {
                Op::Simple(opcode) => out.push(*opcode),
                Op::Local(opcode, index) => out.extend_from_slice(&[*opcode, *index]),
                Op::Iinc(index, delta) => out.extend_from_slice(&[0x84, *index, *delta as u8]),
                Op::Bipush(v) => out.extend_from_slice(&[0x10, *v as u8]),
                Op::LdcString(_) if *idx <= 0xff => out.extend_from_slice(&[0x12, *idx as u8]),
                Op::LdcString(_) => {
                    out.push(0x13);
                    push_u2(&mut out, *idx);
                }
                Op::Member(opcode, ..) | Op::Type(opcode, _) => {
                    out.push(*opcode);
                    push_u2(&mut out, *idx);
                    if *opcode == 0xb9 {
                        out.extend_from_slice(&[1, 0]);
                    }
                }
                Op::Branch(opcode, target) => {
                    let to = offsets.get(*target).copied().unwrap_or(total) as i64;
                    let relative = (to - offsets[i] as i64) as i16;
                    out.push(*opcode);
                    out.extend_from_slice(&relative.to_be_bytes());
                }
                Op::Lambda { .. } => {
                    out.push(0xba);
                    push_u2(&mut out, *idx);
                    push_u2(&mut out, 0);
                }
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Class builder
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
struct FieldSpec {
    access: u16,
    name: String,
    descriptor: String,
    constant: Option<i32>,
}

#[derive(Clone, Debug)]
struct MethodSpec {
    access: u16,
    name: String,
    descriptor: String,
    code: Option<CodeBuilder>,
    exceptions: Vec<String>,
    annotations: Vec<String>,
}

/// Builder for one compiled unit.
#[derive(Clone, Debug)]
pub struct ClassBuilder {
    name: String,
    access: u16,
    super_name: Option<String>,
    interfaces: Vec<String>,
    fields: Vec<FieldSpec>,
    methods: Vec<MethodSpec>,
    source_file: Option<String>,
    line_base: Option<u16>,
    padding: Vec<String>,
}

impl ClassBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            access: 0x0021,
            super_name: Some("java.lang.Object".to_string()),
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            source_file: None,
            line_base: None,
            padding: Vec::new(),
        }
    }

    /// Dotted unit name given to [`ClassBuilder::new`].
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Relative artifact path, e.g. `com/a/A.class`.
    pub fn path(&self) -> String {
        artifact_path(&self.name)
    }

    pub fn access(mut self, access: u16) -> Self {
        self.access = access;
        self
    }

    pub fn interface(self) -> Self {
        self.access(0x0601)
    }

    pub fn extends(mut self, parent: &str) -> Self {
        self.super_name = Some(parent.to_string());
        self
    }

    pub fn implements(mut self, interface: &str) -> Self {
        self.interfaces.push(interface.to_string());
        self
    }

    pub fn field(mut self, access: u16, name: &str, descriptor: &str) -> Self {
        self.fields.push(FieldSpec {
            access,
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            constant: None,
        });
        self
    }

    /// `static final int` field with a `ConstantValue` attribute.
    pub fn int_constant_field(mut self, name: &str, value: i32) -> Self {
        self.fields.push(FieldSpec {
            access: 0x0019,
            name: name.to_string(),
            descriptor: "I".to_string(),
            constant: Some(value),
        });
        self
    }

    pub fn method(mut self, access: u16, name: &str, descriptor: &str, code: CodeBuilder) -> Self {
        self.methods.push(MethodSpec {
            access,
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            code: Some(code),
            exceptions: Vec::new(),
            annotations: Vec::new(),
        });
        self
    }

    pub fn abstract_method(mut self, name: &str, descriptor: &str) -> Self {
        self.methods.push(MethodSpec {
            access: 0x0401,
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            code: None,
            exceptions: Vec::new(),
            annotations: Vec::new(),
        });
        self
    }

    /// Default constructor delegating to the super constructor.
    pub fn default_constructor(self) -> Self {
        let parent = self
            .super_name
            .clone()
            .unwrap_or_else(|| "java.lang.Object".to_string());
        self.method(
            0x0001,
            "<init>",
            "()V",
            CodeBuilder::new()
                .aload(0)
                .invokespecial(&parent, "<init>", "()V")
                .ret(),
        )
    }

    /// Declare checked exceptions on the most recently added method.
    pub fn throws(mut self, exception: &str) -> Self {
        if let Some(last) = self.methods.last_mut() {
            last.exceptions.push(exception.to_string());
        }
        self
    }

    /// Attach a marker annotation (descriptor form) to the most recent method.
    pub fn annotated(mut self, descriptor: &str) -> Self {
        if let Some(last) = self.methods.last_mut() {
            last.annotations.push(descriptor.to_string());
        }
        self
    }

    pub fn source_file(mut self, name: &str) -> Self {
        self.source_file = Some(name.to_string());
        self
    }

    /// Emit `LineNumberTable` and `LocalVariableTable` starting at `line_base`.
    pub fn debug_lines(mut self, line_base: u16) -> Self {
        self.line_base = Some(line_base);
        self
    }

    /// Insert unrelated pool entries first, shifting every later index.
    pub fn pad_pool(mut self, padding: &[String]) -> Self {
        self.padding = padding.to_vec();
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut pool = PoolWriter::default();
        for pad in &self.padding {
            pool.utf8(pad);
        }
        let mut bootstraps: Vec<Vec<u16>> = Vec::new();

        let this_class = pool.class(&self.name);
        let super_class = self.super_name.as_deref().map(|s| pool.class(s)).unwrap_or(0);
        let interfaces: Vec<u16> = self.interfaces.iter().map(|i| pool.class(i)).collect();

        let mut fields_out = Vec::new();
        push_u2(&mut fields_out, self.fields.len() as u16);
        for field in &self.fields {
            push_u2(&mut fields_out, field.access);
            push_u2(&mut fields_out, pool.utf8(&field.name));
            push_u2(&mut fields_out, pool.utf8(&field.descriptor));
            match field.constant {
                Some(value) => {
                    push_u2(&mut fields_out, 1);
                    let attr = pool.utf8("ConstantValue");
                    let idx = pool.integer(value);
                    push_attribute(&mut fields_out, attr, &idx.to_be_bytes());
                }
                None => push_u2(&mut fields_out, 0),
            }
        }

        let mut methods_out = Vec::new();
        push_u2(&mut methods_out, self.methods.len() as u16);
        for method in &self.methods {
            push_u2(&mut methods_out, method.access);
            push_u2(&mut methods_out, pool.utf8(&method.name));
            push_u2(&mut methods_out, pool.utf8(&method.descriptor));
            let mut attrs: Vec<(u16, Vec<u8>)> = Vec::new();
            if let Some(code) = &method.code {
                let bytes = code.emit(&mut pool, &mut bootstraps);
                let mut body = Vec::new();
                push_u2(&mut body, 8);
                push_u2(&mut body, 8);
                push_u4(&mut body, bytes.len() as u32);
                body.extend_from_slice(&bytes);
                push_u2(&mut body, 0);
                match self.line_base {
                    Some(base) => {
                        push_u2(&mut body, 2);
                        let mut lines = Vec::new();
                        push_u2(&mut lines, 1);
                        push_u2(&mut lines, 0);
                        push_u2(&mut lines, base);
                        push_attribute(&mut body, pool.utf8("LineNumberTable"), &lines);
                        let mut locals = Vec::new();
                        push_u2(&mut locals, 1);
                        push_u2(&mut locals, 0);
                        push_u2(&mut locals, bytes.len() as u16);
                        push_u2(&mut locals, pool.utf8("this"));
                        let this_desc = format!("L{};", self.name.replace('.', "/"));
                        push_u2(&mut locals, pool.utf8(&this_desc));
                        push_u2(&mut locals, 0);
                        push_attribute(&mut body, pool.utf8("LocalVariableTable"), &locals);
                    }
                    None => push_u2(&mut body, 0),
                }
                attrs.push((pool.utf8("Code"), body));
            }
            if !method.exceptions.is_empty() {
                let mut body = Vec::new();
                push_u2(&mut body, method.exceptions.len() as u16);
                for e in &method.exceptions {
                    push_u2(&mut body, pool.class(e));
                }
                attrs.push((pool.utf8("Exceptions"), body));
            }
            if !method.annotations.is_empty() {
                let mut body = Vec::new();
                push_u2(&mut body, method.annotations.len() as u16);
                for a in &method.annotations {
                    push_u2(&mut body, pool.utf8(a));
                    push_u2(&mut body, 0);
                }
                attrs.push((pool.utf8("RuntimeVisibleAnnotations"), body));
            }
            push_u2(&mut methods_out, attrs.len() as u16);
            for (name, body) in attrs {
                push_attribute(&mut methods_out, name, &body);
            }
        }

        let mut class_attrs: Vec<(u16, Vec<u8>)> = Vec::new();
        if let Some(source) = &self.source_file {
            let idx = pool.utf8(source);
            class_attrs.push((pool.utf8("SourceFile"), idx.to_be_bytes().to_vec()));
        }
        if !bootstraps.is_empty() {
            let mut body = Vec::new();
            push_u2(&mut body, bootstraps.len() as u16);
            for entry in &bootstraps {
                push_u2(&mut body, entry[0]);
                push_u2(&mut body, (entry.len() - 1) as u16);
                for arg in &entry[1..] {
                    push_u2(&mut body, *arg);
                }
            }
            class_attrs.push((pool.utf8("BootstrapMethods"), body));
        }

        let mut out = Vec::new();
        push_u4(&mut out, 0xCAFE_BABE);
        push_u2(&mut out, 0);
        push_u2(&mut out, 52);
        push_u2(&mut out, (pool.entries.len() + 1) as u16);
        for entry in &pool.entries {
            out.extend_from_slice(entry);
        }
        push_u2(&mut out, self.access);
        push_u2(&mut out, this_class);
        push_u2(&mut out, super_class);
        push_u2(&mut out, interfaces.len() as u16);
        for i in interfaces {
            push_u2(&mut out, i);
        }
        out.extend_from_slice(&fields_out);
        out.extend_from_slice(&methods_out);
        push_u2(&mut out, class_attrs.len() as u16);
        for (name, body) in class_attrs {
            push_attribute(&mut out, name, &body);
        }
        out
    }
}
