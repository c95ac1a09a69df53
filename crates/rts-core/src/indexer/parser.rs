//! Class-file decoding.
//!
//! A compiled unit is decoded once into an immutable [`ClassFile`]. Every
//! constant-pool reference is resolved to its symbolic value, branch offsets
//! and exception ranges are rewritten as instruction ordinals, and debug-only
//! attributes are dropped during decoding. Downstream consumers never see the
//! constant pool, so its ordering cannot leak into fingerprints.
//!
//! [`ClassFile::facts`] flattens the decoded unit into a stream of [`Fact`]
//! records consumed independently by the fact collector and the call-graph
//! builder.

use std::collections::HashMap;
use std::fmt;

use crate::errors::{RtsError, RtsResult};
use crate::models::{dotted_name, FieldKey, MethodKey};

pub const ACC_PUBLIC: u16 = 0x0001;
pub const ACC_STATIC: u16 = 0x0008;
pub const ACC_INTERFACE: u16 = 0x0200;
pub const ACC_ABSTRACT: u16 = 0x0400;

const MAGIC: u32 = 0xCAFE_BABE;

// ---------------------------------------------------------------------------
// Decoded model
// ---------------------------------------------------------------------------

/// Symbolic reference to a field or method.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberRef {
    pub owner: String,
    pub name: String,
    pub descriptor: String,
    pub interface: bool,
}

impl MemberRef {
    pub fn signature(&self) -> String {
        format!("{}{}", self.name, self.descriptor)
    }
}

impl fmt::Display for MemberRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}{}", self.owner, self.name, self.descriptor)
    }
}

/// A `CONSTANT_MethodHandle`: reference kind plus target member.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Handle {
    pub kind: u8,
    pub member: MemberRef,
}

impl Handle {
    /// Kinds 1..=4 read or write a field; the rest invoke a method.
    pub fn is_field(&self) -> bool {
        self.kind <= 4
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mh:{}:{}", self.kind, self.member)
    }
}

/// A loadable constant, resolved from the pool.
#[derive(Clone, Debug, PartialEq)]
pub enum Constant {
    Int(i32),
    Float(u32),
    Long(i64),
    Double(u64),
    Str(String),
    Class(String),
    MethodType(String),
    Handle(Handle),
    Dynamic {
        name: String,
        descriptor: String,
        bootstrap: u16,
    },
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::Int(v) => write!(f, "int:{v}"),
            Constant::Float(bits) => write!(f, "float:{bits:08x}"),
            Constant::Long(v) => write!(f, "long:{v}"),
            Constant::Double(bits) => write!(f, "double:{bits:016x}"),
            Constant::Str(s) => write!(f, "str:{s:?}"),
            Constant::Class(name) => write!(f, "class:{name}"),
            Constant::MethodType(desc) => write!(f, "mtype:{desc}"),
            Constant::Handle(handle) => handle.fmt(f),
            Constant::Dynamic {
                name,
                descriptor,
                bootstrap,
            } => write!(f, "dyn:{bootstrap}:{name}:{descriptor}"),
        }
    }
}

/// Entry of the `BootstrapMethods` attribute.
#[derive(Clone, Debug, PartialEq)]
pub struct Bootstrap {
    pub handle: Handle,
    pub arguments: Vec<Constant>,
}

impl fmt::Display for Bootstrap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[", self.handle)?;
        for (i, arg) in self.arguments.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            arg.fmt(f)?;
        }
        f.write_str("]")
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Operand {
    None,
    Int(i32),
    Local(u16),
    Iinc {
        index: u16,
        delta: i16,
    },
    Constant(Constant),
    Field(MemberRef),
    Method(MemberRef),
    Type(String),
    /// Target instruction ordinal.
    Branch(usize),
    Switch {
        default: usize,
        cases: Vec<(i32, usize)>,
    },
    MultiArray {
        element: String,
        dimensions: u8,
    },
    Dynamic {
        name: String,
        descriptor: String,
        bootstrap: Option<Bootstrap>,
    },
}

/// One decoded instruction. `ldc_w`, `goto_w`, `jsr_w` and `wide` forms are
/// folded into their short opcodes.
#[derive(Clone, Debug, PartialEq)]
pub struct Instruction {
    pub opcode: u8,
    pub operand: Operand,
}

/// Exception-table entry with instruction ordinals.
#[derive(Clone, Debug, PartialEq)]
pub struct Handler {
    pub start: usize,
    pub end: usize,
    pub target: usize,
    pub catch_type: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Code {
    pub max_stack: u16,
    pub max_locals: u16,
    pub instructions: Vec<Instruction>,
    pub handlers: Vec<Handler>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldInfo {
    pub access: u16,
    pub name: String,
    pub descriptor: String,
    pub constant: Option<Constant>,
    pub signature: Option<String>,
    pub annotations: Vec<String>,
}

impl FieldInfo {
    pub fn is_static(&self) -> bool {
        self.access & ACC_STATIC != 0
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct MethodInfo {
    pub access: u16,
    pub name: String,
    pub descriptor: String,
    pub exceptions: Vec<String>,
    pub signature: Option<String>,
    pub annotations: Vec<String>,
    pub code: Option<Code>,
}

impl MethodInfo {
    /// `name(descriptor)`: the slot identity within its unit.
    pub fn slot(&self) -> String {
        format!("{}{}", self.name, self.descriptor)
    }

    pub fn is_static(&self) -> bool {
        self.access & ACC_STATIC != 0
    }

    pub fn is_abstract(&self) -> bool {
        self.access & ACC_ABSTRACT != 0
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ClassFile {
    /// Dotted unit name.
    pub name: String,
    pub access: u16,
    pub super_name: Option<String>,
    pub interfaces: Vec<String>,
    pub signature: Option<String>,
    pub annotations: Vec<String>,
    pub fields: Vec<FieldInfo>,
    pub methods: Vec<MethodInfo>,
}

impl ClassFile {
    pub fn is_interface(&self) -> bool {
        self.access & ACC_INTERFACE != 0
    }

    pub fn is_abstract(&self) -> bool {
        self.access & ACC_ABSTRACT != 0
    }
}

// ---------------------------------------------------------------------------
// Fact stream
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvokeKind {
    Virtual,
    Interface,
    Special,
    Static,
    /// Reached through a method handle (invokedynamic bootstrap or `ldc`).
    Handle,
}

/// Immutable fact emitted while walking a decoded unit.
#[derive(Clone, Debug, PartialEq)]
pub enum Fact {
    Unit {
        name: String,
        super_name: Option<String>,
        interfaces: Vec<String>,
        is_interface: bool,
        is_abstract: bool,
    },
    Field {
        key: FieldKey,
        is_static: bool,
    },
    Method {
        key: MethodKey,
        is_static: bool,
        is_abstract: bool,
    },
    Invoke {
        caller: MethodKey,
        owner: String,
        signature: String,
        kind: InvokeKind,
    },
    FieldAccess {
        caller: MethodKey,
        field: FieldKey,
        write: bool,
        is_static: bool,
    },
}

fn handle_fact(caller: &MethodKey, handle: &Handle) -> Fact {
    let member = &handle.member;
    if handle.is_field() {
        Fact::FieldAccess {
            caller: caller.clone(),
            field: FieldKey::new(&member.owner, &member.name, &member.descriptor),
            write: handle.kind >= 3,
            is_static: handle.kind == 2 || handle.kind == 4,
        }
    } else {
        Fact::Invoke {
            caller: caller.clone(),
            owner: member.owner.clone(),
            signature: member.signature(),
            kind: InvokeKind::Handle,
        }
    }
}

fn constant_facts(caller: &MethodKey, constant: &Constant, out: &mut Vec<Fact>) {
    if let Constant::Handle(handle) = constant {
        out.push(handle_fact(caller, handle));
    }
}

impl ClassFile {
    /// Flatten the unit into declaration and use facts, in declaration order.
    pub fn facts(&self) -> Vec<Fact> {
        let mut out = vec![Fact::Unit {
            name: self.name.clone(),
            super_name: self.super_name.clone(),
            interfaces: self.interfaces.clone(),
            is_interface: self.is_interface(),
            is_abstract: self.is_abstract(),
        }];
        for field in &self.fields {
            out.push(Fact::Field {
                key: FieldKey::new(&self.name, &field.name, &field.descriptor),
                is_static: field.is_static(),
            });
        }
        for method in &self.methods {
            let caller = MethodKey::from_parts(&self.name, &method.name, &method.descriptor);
            out.push(Fact::Method {
                key: caller.clone(),
                is_static: method.is_static(),
                is_abstract: method.is_abstract(),
            });
            let Some(code) = &method.code else {
                continue;
            };
            for insn in &code.instructions {
                match &insn.operand {
                    Operand::Method(target) => {
                        let kind = match insn.opcode {
                            0xb6 => InvokeKind::Virtual,
                            0xb7 => InvokeKind::Special,
                            0xb8 => InvokeKind::Static,
                            _ => InvokeKind::Interface,
                        };
                        out.push(Fact::Invoke {
                            caller: caller.clone(),
                            owner: target.owner.clone(),
                            signature: target.signature(),
                            kind,
                        });
                    }
                    Operand::Field(target) => out.push(Fact::FieldAccess {
                        caller: caller.clone(),
                        field: FieldKey::new(&target.owner, &target.name, &target.descriptor),
                        write: matches!(insn.opcode, 0xb3 | 0xb5),
                        is_static: matches!(insn.opcode, 0xb2 | 0xb3),
                    }),
                    Operand::Constant(constant) => constant_facts(&caller, constant, &mut out),
                    Operand::Dynamic {
                        bootstrap: Some(bootstrap),
                        ..
                    } => {
                        out.push(handle_fact(&caller, &bootstrap.handle));
                        for arg in &bootstrap.arguments {
                            constant_facts(&caller, arg, &mut out);
                        }
                    }
                    _ => {}
                }
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Byte reader
// ---------------------------------------------------------------------------

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
    unit: &'a str,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8], unit: &'a str) -> Self {
        Self {
            bytes,
            pos: 0,
            unit,
        }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take(&mut self, n: usize) -> RtsResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(RtsError::class_format(
                self.unit,
                format!("truncated at byte {} (wanted {n})", self.pos),
            ));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u1(&mut self) -> RtsResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u2(&mut self) -> RtsResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u4(&mut self) -> RtsResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u8(&mut self) -> RtsResult<u64> {
        let hi = self.u4()? as u64;
        let lo = self.u4()? as u64;
        Ok((hi << 32) | lo)
    }

    fn i1(&mut self) -> RtsResult<i8> {
        Ok(self.u1()? as i8)
    }

    fn i2(&mut self) -> RtsResult<i16> {
        Ok(self.u2()? as i16)
    }

    fn i4(&mut self) -> RtsResult<i32> {
        Ok(self.u4()? as i32)
    }

    fn error(&self, message: impl Into<String>) -> RtsError {
        RtsError::class_format(self.unit, message)
    }
}

/// Decode modified UTF-8; anything undecodable is replaced, which keeps the
/// result deterministic for hashing.
fn decode_utf8(bytes: &[u8]) -> String {
    if let Ok(s) = std::str::from_utf8(bytes) {
        return s.to_string();
    }
    let mut cleaned = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == 0xC0 && bytes.get(i + 1) == Some(&0x80) {
            cleaned.push(0);
            i += 2;
        } else {
            cleaned.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&cleaned).into_owned()
}

// ---------------------------------------------------------------------------
// Constant pool
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
enum PoolEntry {
    Unusable,
    Utf8(String),
    Integer(i32),
    Float(u32),
    Long(i64),
    Double(u64),
    Class(u16),
    String(u16),
    Member { tag: u8, class: u16, nat: u16 },
    NameAndType(u16, u16),
    MethodHandle(u8, u16),
    MethodType(u16),
    Dynamic { tag: u8, bootstrap: u16, nat: u16 },
    Module,
    Package,
}

struct ConstantPool<'a> {
    entries: Vec<PoolEntry>,
    unit: &'a str,
}

impl<'a> ConstantPool<'a> {
    fn read(r: &mut Reader<'a>) -> RtsResult<Self> {
        let count = r.u2()? as usize;
        let mut entries = Vec::with_capacity(count);
        entries.push(PoolEntry::Unusable);
        while entries.len() < count {
            let tag = r.u1()?;
            let entry = match tag {
                1 => {
                    let len = r.u2()? as usize;
                    PoolEntry::Utf8(decode_utf8(r.take(len)?))
                }
                3 => PoolEntry::Integer(r.i4()?),
                4 => PoolEntry::Float(r.u4()?),
                5 => PoolEntry::Long(r.u8()? as i64),
                6 => PoolEntry::Double(r.u8()?),
                7 => PoolEntry::Class(r.u2()?),
                8 => PoolEntry::String(r.u2()?),
                9..=11 => PoolEntry::Member {
                    tag,
                    class: r.u2()?,
                    nat: r.u2()?,
                },
                12 => PoolEntry::NameAndType(r.u2()?, r.u2()?),
                15 => PoolEntry::MethodHandle(r.u1()?, r.u2()?),
                16 => PoolEntry::MethodType(r.u2()?),
                17 | 18 => PoolEntry::Dynamic {
                    tag,
                    bootstrap: r.u2()?,
                    nat: r.u2()?,
                },
                19 => {
                    r.u2()?;
                    PoolEntry::Module
                }
                20 => {
                    r.u2()?;
                    PoolEntry::Package
                }
                other => {
                    return Err(r.error(format!(
                        "unknown constant tag {other} at entry {}",
                        entries.len()
                    )))
                }
            };
            let wide = matches!(entry, PoolEntry::Long(_) | PoolEntry::Double(_));
            entries.push(entry);
            if wide {
                entries.push(PoolEntry::Unusable);
            }
        }
        if entries.len() > count {
            return Err(r.error("wide constant overruns the pool"));
        }
        Ok(Self {
            entries,
            unit: r.unit,
        })
    }

    fn entry(&self, index: u16) -> RtsResult<&PoolEntry> {
        match self.entries.get(index as usize) {
            Some(PoolEntry::Unusable) | None => Err(RtsError::class_format(
                self.unit,
                format!("invalid constant pool index {index}"),
            )),
            Some(entry) => Ok(entry),
        }
    }

    fn mismatch(&self, index: u16, wanted: &str) -> RtsError {
        RtsError::class_format(
            self.unit,
            format!("constant pool entry {index} is not a {wanted}"),
        )
    }

    fn utf8(&self, index: u16) -> RtsResult<&str> {
        match self.entry(index)? {
            PoolEntry::Utf8(s) => Ok(s),
            _ => Err(self.mismatch(index, "Utf8")),
        }
    }

    fn class_name(&self, index: u16) -> RtsResult<String> {
        match self.entry(index)? {
            PoolEntry::Class(name) => Ok(dotted_name(self.utf8(*name)?)),
            _ => Err(self.mismatch(index, "Class")),
        }
    }

    fn name_and_type(&self, index: u16) -> RtsResult<(String, String)> {
        match self.entry(index)? {
            PoolEntry::NameAndType(name, desc) => {
                Ok((self.utf8(*name)?.to_string(), self.utf8(*desc)?.to_string()))
            }
            _ => Err(self.mismatch(index, "NameAndType")),
        }
    }

    fn member(&self, index: u16) -> RtsResult<MemberRef> {
        match self.entry(index)? {
            PoolEntry::Member { tag, class, nat } => {
                let (name, descriptor) = self.name_and_type(*nat)?;
                Ok(MemberRef {
                    owner: self.class_name(*class)?,
                    name,
                    descriptor,
                    interface: *tag == 11,
                })
            }
            _ => Err(self.mismatch(index, "member reference")),
        }
    }

    fn handle(&self, index: u16) -> RtsResult<Handle> {
        match self.entry(index)? {
            PoolEntry::MethodHandle(kind, member) => Ok(Handle {
                kind: *kind,
                member: self.member(*member)?,
            }),
            _ => Err(self.mismatch(index, "MethodHandle")),
        }
    }

    fn invoke_dynamic(&self, index: u16) -> RtsResult<(u16, String, String)> {
        match self.entry(index)? {
            PoolEntry::Dynamic {
                tag: 18,
                bootstrap,
                nat,
            } => {
                let (name, descriptor) = self.name_and_type(*nat)?;
                Ok((*bootstrap, name, descriptor))
            }
            _ => Err(self.mismatch(index, "InvokeDynamic")),
        }
    }

    fn constant(&self, index: u16) -> RtsResult<Constant> {
        Ok(match self.entry(index)? {
            PoolEntry::Integer(v) => Constant::Int(*v),
            PoolEntry::Float(v) => Constant::Float(*v),
            PoolEntry::Long(v) => Constant::Long(*v),
            PoolEntry::Double(v) => Constant::Double(*v),
            PoolEntry::String(s) => Constant::Str(self.utf8(*s)?.to_string()),
            PoolEntry::Class(_) => Constant::Class(self.class_name(index)?),
            PoolEntry::MethodType(desc) => Constant::MethodType(self.utf8(*desc)?.to_string()),
            PoolEntry::MethodHandle(..) => Constant::Handle(self.handle(index)?),
            PoolEntry::Dynamic {
                tag: 17,
                bootstrap,
                nat,
            } => {
                let (name, descriptor) = self.name_and_type(*nat)?;
                Constant::Dynamic {
                    name,
                    descriptor,
                    bootstrap: *bootstrap,
                }
            }
            PoolEntry::Utf8(_)
            | PoolEntry::Member { .. }
            | PoolEntry::NameAndType(..)
            | PoolEntry::Dynamic { .. }
            | PoolEntry::Module
            | PoolEntry::Package
            | PoolEntry::Unusable => return Err(self.mismatch(index, "loadable constant")),
        })
    }
}

// ---------------------------------------------------------------------------
// Attributes
// ---------------------------------------------------------------------------

/// Attributes that only carry debug information and never reach a fingerprint.
pub const DEBUG_ATTRIBUTES: &[&str] = &[
    "SourceFile",
    "SourceDebugExtension",
    "LineNumberTable",
    "LocalVariableTable",
    "LocalVariableTypeTable",
    "StackMapTable",
];

#[derive(Default)]
struct MemberAttributes {
    signature: Option<String>,
    annotations: Vec<String>,
    constant: Option<Constant>,
    exceptions: Vec<String>,
    code: Option<RawCode>,
    bootstraps: Vec<RawBootstrap>,
}

struct RawCode {
    max_stack: u16,
    max_locals: u16,
    bytes: Vec<u8>,
    handlers: Vec<[u16; 4]>,
}

struct RawBootstrap {
    handle: u16,
    arguments: Vec<u16>,
}

fn read_attributes(r: &mut Reader<'_>, pool: &ConstantPool<'_>) -> RtsResult<MemberAttributes> {
    let mut attrs = MemberAttributes::default();
    let count = r.u2()?;
    for _ in 0..count {
        let name = pool.utf8(r.u2()?)?.to_string();
        let len = r.u4()? as usize;
        let body = r.take(len)?;
        let mut ar = Reader::new(body, r.unit);
        match name.as_str() {
            "Signature" => attrs.signature = Some(pool.utf8(ar.u2()?)?.to_string()),
            "RuntimeVisibleAnnotations" => attrs.annotations = read_annotations(&mut ar, pool)?,
            "ConstantValue" => attrs.constant = Some(pool.constant(ar.u2()?)?),
            "Exceptions" => {
                let n = ar.u2()?;
                for _ in 0..n {
                    attrs.exceptions.push(pool.class_name(ar.u2()?)?);
                }
            }
            "Code" => {
                let max_stack = ar.u2()?;
                let max_locals = ar.u2()?;
                let code_len = ar.u4()? as usize;
                let bytes = ar.take(code_len)?.to_vec();
                let handler_count = ar.u2()?;
                let mut handlers = Vec::with_capacity(handler_count as usize);
                for _ in 0..handler_count {
                    handlers.push([ar.u2()?, ar.u2()?, ar.u2()?, ar.u2()?]);
                }
                // Nested attributes are LineNumberTable, LocalVariable*,
                // StackMapTable and type annotations: none are kept.
                let nested = ar.u2()?;
                for _ in 0..nested {
                    ar.u2()?;
                    let n = ar.u4()? as usize;
                    ar.take(n)?;
                }
                attrs.code = Some(RawCode {
                    max_stack,
                    max_locals,
                    bytes,
                    handlers,
                });
            }
            "BootstrapMethods" => {
                let n = ar.u2()?;
                for _ in 0..n {
                    let handle = ar.u2()?;
                    let argc = ar.u2()?;
                    let mut arguments = Vec::with_capacity(argc as usize);
                    for _ in 0..argc {
                        arguments.push(ar.u2()?);
                    }
                    attrs.bootstraps.push(RawBootstrap { handle, arguments });
                }
            }
            _ => {}
        }
    }
    Ok(attrs)
}

fn read_annotations(r: &mut Reader<'_>, pool: &ConstantPool<'_>) -> RtsResult<Vec<String>> {
    let count = r.u2()?;
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        out.push(read_annotation(r, pool, 0)?);
    }
    Ok(out)
}

/// Nesting limit for annotation values; deeper input is rejected.
const MAX_ELEMENT_DEPTH: usize = 32;

fn read_annotation(r: &mut Reader<'_>, pool: &ConstantPool<'_>, depth: usize) -> RtsResult<String> {
    let type_name = pool.utf8(r.u2()?)?.to_string();
    let pairs = r.u2()?;
    let mut rendered = Vec::with_capacity(pairs as usize);
    for _ in 0..pairs {
        let name = pool.utf8(r.u2()?)?.to_string();
        let value = read_element_value(r, pool, depth + 1)?;
        rendered.push(format!("{name}={value}"));
    }
    Ok(format!("{type_name}({})", rendered.join(",")))
}

fn read_element_value(
    r: &mut Reader<'_>,
    pool: &ConstantPool<'_>,
    depth: usize,
) -> RtsResult<String> {
    if depth > MAX_ELEMENT_DEPTH {
        return Err(r.error(format!("annotation nesting deeper than {MAX_ELEMENT_DEPTH}")));
    }
    let tag = r.u1()?;
    Ok(match tag {
        b'B' | b'C' | b'D' | b'F' | b'I' | b'J' | b'S' | b'Z' => {
            format!("{}:{}", tag as char, pool.constant(r.u2()?)?)
        }
        b's' => format!("{:?}", pool.utf8(r.u2()?)?),
        b'e' => {
            let type_name = pool.utf8(r.u2()?)?.to_string();
            let constant = pool.utf8(r.u2()?)?;
            format!("enum:{type_name}.{constant}")
        }
        b'c' => format!("class:{}", pool.utf8(r.u2()?)?),
        b'@' => read_annotation(r, pool, depth + 1)?,
        b'[' => {
            let n = r.u2()?;
            let mut values = Vec::with_capacity(n as usize);
            for _ in 0..n {
                values.push(read_element_value(r, pool, depth + 1)?);
            }
            format!("[{}]", values.join(","))
        }
        other => return Err(r.error(format!("unknown element_value tag {other}"))),
    })
}

// ---------------------------------------------------------------------------
// Bytecode
// ---------------------------------------------------------------------------

fn branch_target(r: &Reader<'_>, offset: usize, relative: i64) -> RtsResult<usize> {
    let target = offset as i64 + relative;
    if target < 0 || target as usize >= r.bytes.len() {
        return Err(r.error(format!("branch at {offset} leaves the method")));
    }
    Ok(target as usize)
}

fn decode_code(
    raw: &RawCode,
    pool: &ConstantPool<'_>,
    bootstraps: &[Bootstrap],
    unit: &str,
) -> RtsResult<Code> {
    let mut r = Reader::new(&raw.bytes, unit);
    let mut decoded: Vec<(usize, Instruction)> = Vec::new();

    while r.remaining() > 0 {
        let offset = r.pos;
        let mut opcode = r.u1()?;
        let operand = match opcode {
            0x10 => Operand::Int(r.i1()? as i32),
            0x11 => Operand::Int(r.i2()? as i32),
            0x12 => Operand::Constant(pool.constant(r.u1()? as u16)?),
            0x13 | 0x14 => {
                let constant = pool.constant(r.u2()?)?;
                if opcode == 0x13 {
                    opcode = 0x12;
                }
                Operand::Constant(constant)
            }
            0x15..=0x19 | 0x36..=0x3a | 0xa9 => Operand::Local(r.u1()? as u16),
            0x84 => Operand::Iinc {
                index: r.u1()? as u16,
                delta: r.i1()? as i16,
            },
            0x99..=0xa8 | 0xc6 | 0xc7 => {
                let relative = r.i2()? as i64;
                Operand::Branch(branch_target(&r, offset, relative)?)
            }
            0xc8 | 0xc9 => {
                let relative = r.i4()? as i64;
                opcode = if opcode == 0xc8 { 0xa7 } else { 0xa8 };
                Operand::Branch(branch_target(&r, offset, relative)?)
            }
            0xaa | 0xab => {
                while r.pos % 4 != 0 {
                    r.u1()?;
                }
                let relative = r.i4()? as i64;
                let default = branch_target(&r, offset, relative)?;
                let mut cases = Vec::new();
                if opcode == 0xaa {
                    let low = r.i4()?;
                    let high = r.i4()?;
                    if high < low || ((high as i64 - low as i64 + 1) * 4) as usize > r.remaining() {
                        return Err(r.error(format!("malformed tableswitch at {offset}")));
                    }
                    for key in low..=high {
                        let relative = r.i4()? as i64;
                        cases.push((key, branch_target(&r, offset, relative)?));
                    }
                } else {
                    let pairs = r.i4()?;
                    if pairs < 0 || (pairs as usize).saturating_mul(8) > r.remaining() {
                        return Err(r.error(format!("malformed lookupswitch at {offset}")));
                    }
                    for _ in 0..pairs {
                        let key = r.i4()?;
                        let relative = r.i4()? as i64;
                        cases.push((key, branch_target(&r, offset, relative)?));
                    }
                }
                Operand::Switch { default, cases }
            }
            0xb2..=0xb5 => Operand::Field(pool.member(r.u2()?)?),
            0xb6..=0xb8 => Operand::Method(pool.member(r.u2()?)?),
            0xb9 => {
                let member = pool.member(r.u2()?)?;
                r.u1()?;
                r.u1()?;
                Operand::Method(member)
            }
            0xba => {
                let (index, name, descriptor) = pool.invoke_dynamic(r.u2()?)?;
                r.u2()?;
                Operand::Dynamic {
                    name,
                    descriptor,
                    bootstrap: bootstraps.get(index as usize).cloned(),
                }
            }
            0xbb | 0xbd | 0xc0 | 0xc1 => Operand::Type(pool.class_name(r.u2()?)?),
            0xbc => Operand::Int(r.u1()? as i32),
            0xc4 => {
                opcode = r.u1()?;
                match opcode {
                    0x84 => Operand::Iinc {
                        index: r.u2()?,
                        delta: r.i2()?,
                    },
                    0x15..=0x19 | 0x36..=0x3a | 0xa9 => Operand::Local(r.u2()?),
                    other => {
                        return Err(r.error(format!("invalid wide opcode 0x{other:02x}")));
                    }
                }
            }
            0xc5 => Operand::MultiArray {
                element: pool.class_name(r.u2()?)?,
                dimensions: r.u1()?,
            },
            0x00..=0x0f
            | 0x1a..=0x35
            | 0x3b..=0x83
            | 0x85..=0x98
            | 0xac..=0xb1
            | 0xbe
            | 0xbf
            | 0xc2
            | 0xc3
            | 0xca
            | 0xfe
            | 0xff => Operand::None,
            other => {
                return Err(r.error(format!("unknown opcode 0x{other:02x} at {offset}")));
            }
        };
        decoded.push((offset, Instruction { opcode, operand }));
    }

    let mut ordinals: HashMap<usize, usize> = decoded
        .iter()
        .enumerate()
        .map(|(ordinal, (offset, _))| (*offset, ordinal))
        .collect();
    ordinals.insert(raw.bytes.len(), decoded.len());
    let ordinal = |offset: usize| -> RtsResult<usize> {
        ordinals.get(&offset).copied().ok_or_else(|| {
            RtsError::class_format(unit, format!("offset {offset} is not an instruction"))
        })
    };

    let mut instructions = Vec::with_capacity(decoded.len());
    for (_, mut insn) in decoded {
        match &mut insn.operand {
            Operand::Branch(target) => *target = ordinal(*target)?,
            Operand::Switch { default, cases } => {
                *default = ordinal(*default)?;
                for (_, target) in cases.iter_mut() {
                    *target = ordinal(*target)?;
                }
            }
            _ => {}
        }
        instructions.push(insn);
    }

    let mut handlers = Vec::with_capacity(raw.handlers.len());
    for [start, end, target, catch_type] in &raw.handlers {
        handlers.push(Handler {
            start: ordinal(*start as usize)?,
            end: ordinal(*end as usize)?,
            target: ordinal(*target as usize)?,
            catch_type: match catch_type {
                0 => None,
                idx => Some(pool.class_name(*idx)?),
            },
        });
    }

    Ok(Code {
        max_stack: raw.max_stack,
        max_locals: raw.max_locals,
        instructions,
        handlers,
    })
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

struct RawMember {
    access: u16,
    name: String,
    descriptor: String,
    attrs: MemberAttributes,
}

fn read_members(r: &mut Reader<'_>, pool: &ConstantPool<'_>) -> RtsResult<Vec<RawMember>> {
    let count = r.u2()?;
    let mut members = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let access = r.u2()?;
        let name = pool.utf8(r.u2()?)?.to_string();
        let descriptor = pool.utf8(r.u2()?)?.to_string();
        let attrs = read_attributes(r, pool)?;
        members.push(RawMember {
            access,
            name,
            descriptor,
            attrs,
        });
    }
    Ok(members)
}

/// Decode a class file. `origin` names the unit in error messages.
pub fn parse_class(bytes: &[u8], origin: &str) -> RtsResult<ClassFile> {
    let mut r = Reader::new(bytes, origin);
    if r.u4()? != MAGIC {
        return Err(r.error("bad magic number"));
    }
    let _minor = r.u2()?;
    let _major = r.u2()?;
    let pool = ConstantPool::read(&mut r)?;

    let access = r.u2()?;
    let name = pool.class_name(r.u2()?)?;
    let super_name = match r.u2()? {
        0 => None,
        idx => Some(pool.class_name(idx)?),
    };
    let interface_count = r.u2()?;
    let mut interfaces = Vec::with_capacity(interface_count as usize);
    for _ in 0..interface_count {
        interfaces.push(pool.class_name(r.u2()?)?);
    }

    let raw_fields = read_members(&mut r, &pool)?;
    let raw_methods = read_members(&mut r, &pool)?;
    let class_attrs = read_attributes(&mut r, &pool)?;
    if r.remaining() != 0 {
        return Err(r.error(format!("{} trailing bytes", r.remaining())));
    }

    let mut bootstraps = Vec::with_capacity(class_attrs.bootstraps.len());
    for raw in &class_attrs.bootstraps {
        let mut arguments = Vec::with_capacity(raw.arguments.len());
        for arg in &raw.arguments {
            arguments.push(pool.constant(*arg)?);
        }
        bootstraps.push(Bootstrap {
            handle: pool.handle(raw.handle)?,
            arguments,
        });
    }

    let fields = raw_fields
        .into_iter()
        .map(|f| FieldInfo {
            access: f.access,
            name: f.name,
            descriptor: f.descriptor,
            constant: f.attrs.constant,
            signature: f.attrs.signature,
            annotations: f.attrs.annotations,
        })
        .collect();

    let mut methods = Vec::with_capacity(raw_methods.len());
    for m in raw_methods {
        let code = match &m.attrs.code {
            Some(raw) => Some(decode_code(raw, &pool, &bootstraps, origin)?),
            None => None,
        };
        methods.push(MethodInfo {
            access: m.access,
            name: m.name,
            descriptor: m.descriptor,
            exceptions: m.attrs.exceptions,
            signature: m.attrs.signature,
            annotations: m.attrs.annotations,
            code,
        });
    }

    Ok(ClassFile {
        name,
        access,
        super_name,
        interfaces,
        signature: class_attrs.signature,
        annotations: class_attrs.annotations,
        fields,
        methods,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{ClassBuilder, CodeBuilder};

    fn sample() -> ClassBuilder {
        ClassBuilder::new("com.a.Service")
            .extends("com.a.Base")
            .implements("com.a.Api")
            .field(ACC_STATIC, "COUNT", "I")
            .int_constant_field("LIMIT", 42)
            .method(
                ACC_PUBLIC,
                "run",
                "()V",
                CodeBuilder::new()
                    .aload(0)
                    .invokevirtual("com.a.Base", "helper", "()V")
                    .getstatic("com.a.Service", "COUNT", "I")
                    .pop()
                    .ldc_str("hello")
                    .pop()
                    .ret(),
            )
    }

    #[test]
    fn test_parse_header_and_members() {
        let class = parse_class(&sample().build(), "com.a.Service").unwrap();
        assert_eq!(class.name, "com.a.Service");
        assert_eq!(class.super_name.as_deref(), Some("com.a.Base"));
        assert_eq!(class.interfaces, vec!["com.a.Api".to_string()]);
        assert_eq!(class.fields.len(), 2);
        assert_eq!(class.fields[1].constant, Some(Constant::Int(42)));
        let run = class.methods.iter().find(|m| m.name == "run").unwrap();
        assert_eq!(run.slot(), "run()V");
        let code = run.code.as_ref().unwrap();
        assert_eq!(code.instructions.len(), 7);
        assert_eq!(
            code.instructions[4].operand,
            Operand::Constant(Constant::Str("hello".to_string()))
        );
    }

    #[test]
    fn test_facts_cover_invokes_and_field_access() {
        let class = parse_class(&sample().build(), "com.a.Service").unwrap();
        let facts = class.facts();
        assert!(facts.iter().any(|f| matches!(
            f,
            Fact::Invoke { owner, signature, kind: InvokeKind::Virtual, .. }
                if owner == "com.a.Base" && signature == "helper()V"
        )));
        assert!(facts.iter().any(|f| matches!(
            f,
            Fact::FieldAccess { field, write: false, is_static: true, .. }
                if field.name == "COUNT"
        )));
        assert!(matches!(facts[0], Fact::Unit { .. }));
    }

    #[test]
    fn test_debug_attributes_are_dropped() {
        let plain = parse_class(&sample().build(), "x").unwrap();
        let debug = parse_class(
            &sample().source_file("Service.java").debug_lines(100).build(),
            "x",
        )
        .unwrap();
        assert_eq!(plain, debug);
    }

    #[test]
    fn test_pool_order_does_not_change_model() {
        let plain = parse_class(&sample().build(), "x").unwrap();
        let padding: Vec<String> = (0..300).map(|i| format!("pad{i}")).collect();
        let shifted = parse_class(&sample().pad_pool(&padding).build(), "x").unwrap();
        // `ldc` became `ldc_w` in the shifted build; both decode identically.
        assert_eq!(plain, shifted);
    }

    #[test]
    fn test_branch_targets_are_ordinals() {
        let bytes = ClassBuilder::new("com.a.Loop")
            .method(
                ACC_STATIC,
                "spin",
                "(I)V",
                CodeBuilder::new().iload(0).ifeq(4).iinc(0, -1).goto(0).ret(),
            )
            .build();
        let class = parse_class(&bytes, "com.a.Loop").unwrap();
        let code = class.methods[0].code.as_ref().unwrap();
        assert_eq!(code.instructions[1].operand, Operand::Branch(4));
        assert_eq!(code.instructions[3].operand, Operand::Branch(0));
    }

    #[test]
    fn test_lambda_bootstrap_produces_handle_invoke() {
        let bytes = ClassBuilder::new("com.a.Lambdas")
            .method(
                ACC_STATIC,
                "make",
                "()Ljava/lang/Runnable;",
                CodeBuilder::new()
                    .invokedynamic_lambda("run", "()Ljava/lang/Runnable;", "com.a.Lambdas", "lambda$0", "()V")
                    .areturn(),
            )
            .method(ACC_STATIC, "lambda$0", "()V", CodeBuilder::new().ret())
            .build();
        let class = parse_class(&bytes, "com.a.Lambdas").unwrap();
        let facts = class.facts();
        assert!(facts.iter().any(|f| matches!(
            f,
            Fact::Invoke { owner, signature, kind: InvokeKind::Handle, .. }
                if owner == "com.a.Lambdas" && signature == "lambda$0()V"
        )));
    }

    #[test]
    fn test_bad_magic_is_class_format_error() {
        let err = parse_class(&[0, 1, 2, 3, 4, 5, 6, 7], "com.a.Broken").unwrap_err();
        assert!(matches!(err, RtsError::ClassFormat { ref unit, .. } if unit == "com.a.Broken"));
    }

    #[test]
    fn test_nested_annotation_values_are_bounded() {
        let pool = ConstantPool {
            entries: vec![PoolEntry::Unusable],
            unit: "com.a.Hostile",
        };
        let shallow = [b'[', 0, 1, b'[', 0, 0];
        let mut r = Reader::new(&shallow, "com.a.Hostile");
        assert_eq!(read_element_value(&mut r, &pool, 0).unwrap(), "[[]]");

        let deep: Vec<u8> = std::iter::repeat([b'[', 0, 1]).take(100_000).flatten().collect();
        let mut r = Reader::new(&deep, "com.a.Hostile");
        let err = read_element_value(&mut r, &pool, 0).unwrap_err();
        assert!(matches!(err, RtsError::ClassFormat { .. }));
    }

    #[test]
    fn test_truncated_input_is_error() {
        let bytes = sample().build();
        let err = parse_class(&bytes[..bytes.len() / 2], "com.a.Service").unwrap_err();
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_decode_utf8_handles_encoded_nul() {
        assert_eq!(decode_utf8(b"abc"), "abc");
        assert_eq!(decode_utf8(&[b'a', 0xC0, 0x80, b'b']), "a\0b");
    }
}
