//! Normalized per-member fingerprints of a decoded unit.
//!
//! The decoder has already dropped debug attributes and resolved every pool
//! reference, so the rendered lines below depend only on what the unit does.
//! Method fingerprints cover access flags, generic signature, annotations,
//! checked exceptions and the instruction stream, but not the method's own
//! name or descriptor: a renamed method with an identical body keeps its
//! fingerprint, which is how signature changes are told apart from edits.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::errors::RtsResult;
use crate::indexer::filesystem::raw_checksum;
use crate::indexer::parser::{parse_class, ClassFile, Code, FieldInfo, MethodInfo, Operand};
use crate::models::{is_initializer, DependencyId, Fingerprint};

/// Access and throws clause of one method, kept for classification.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodHeader {
    pub access: u16,
    pub exceptions: Vec<String>,
}

/// Snapshot of one unit: whole-unit fingerprint plus the four member maps.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitChecksums {
    pub name: String,
    /// CRC-32 of the raw artifact bytes.
    pub raw_crc: u32,
    pub class: Fingerprint,
    /// Access flags, generic signature and annotations of the unit itself.
    pub header: Fingerprint,
    pub super_name: Option<String>,
    pub interfaces: BTreeSet<String>,
    /// Raw declarations, `name:descriptor=constant`.
    pub fields: BTreeSet<String>,
    /// `name:descriptor` -> fingerprint.
    pub field_fingerprints: BTreeMap<String, Fingerprint>,
    /// `<init>` and `<clinit>` slots, order-insensitive.
    pub constructors: BTreeMap<String, Fingerprint>,
    pub instance_methods: BTreeMap<String, Fingerprint>,
    pub static_methods: BTreeMap<String, Fingerprint>,
    #[serde(default)]
    pub method_headers: BTreeMap<String, MethodHeader>,
}

impl UnitChecksums {
    /// Fingerprint of any method slot, whichever map holds it.
    pub fn method(&self, signature: &str) -> Option<&Fingerprint> {
        self.constructors
            .get(signature)
            .or_else(|| self.instance_methods.get(signature))
            .or_else(|| self.static_methods.get(signature))
    }

    pub fn field(&self, name: &str, descriptor: &str) -> Option<&Fingerprint> {
        self.field_fingerprints.get(&format!("{name}:{descriptor}"))
    }

    /// Current fingerprint of a dependency owned by this unit.
    pub fn fingerprint_of(&self, id: &DependencyId) -> Option<&Fingerprint> {
        match id {
            DependencyId::Class(name) if *name == self.name => Some(&self.class),
            DependencyId::Method(key) if key.owner == self.name => self.method(&key.signature),
            DependencyId::Field(key) if key.owner == self.name => {
                self.field(&key.name, &key.descriptor)
            }
            _ => None,
        }
    }

    /// Every method slot declared by the unit.
    pub fn method_signatures(&self) -> impl Iterator<Item = &String> {
        self.constructors
            .keys()
            .chain(self.instance_methods.keys())
            .chain(self.static_methods.keys())
    }
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn render_operand(operand: &Operand) -> String {
    match operand {
        Operand::None => String::new(),
        Operand::Int(v) => v.to_string(),
        Operand::Local(index) => format!("local:{index}"),
        Operand::Iinc { index, delta } => format!("local:{index} {delta:+}"),
        Operand::Constant(constant) => constant.to_string(),
        Operand::Field(member) | Operand::Method(member) => member.to_string(),
        Operand::Type(name) => format!("type:{name}"),
        Operand::Branch(target) => format!("@{target}"),
        Operand::Switch { default, cases } => {
            let rendered: Vec<String> = cases.iter().map(|(k, t)| format!("{k}:@{t}")).collect();
            format!("default:@{default} [{}]", rendered.join(","))
        }
        Operand::MultiArray {
            element,
            dimensions,
        } => format!("type:{element} dims:{dimensions}"),
        Operand::Dynamic {
            name,
            descriptor,
            bootstrap,
        } => match bootstrap {
            Some(b) => format!("indy:{name}{descriptor} {b}"),
            None => format!("indy:{name}{descriptor}"),
        },
    }
}

fn code_lines(code: &Code, out: &mut Vec<String>) {
    for insn in &code.instructions {
        out.push(format!("{:02x} {}", insn.opcode, render_operand(&insn.operand)));
    }
    for handler in &code.handlers {
        out.push(format!(
            "catch {} [@{},@{}) -> @{}",
            handler.catch_type.as_deref().unwrap_or("*"),
            handler.start,
            handler.end,
            handler.target
        ));
    }
}

fn method_lines(method: &MethodInfo) -> Vec<String> {
    let mut lines = vec![
        format!("access {:04x}", method.access),
        format!("throws {}", method.exceptions.join(",")),
    ];
    if let Some(signature) = &method.signature {
        lines.push(format!("signature {signature}"));
    }
    lines.extend(method.annotations.iter().map(|a| format!("annotation {a}")));
    if let Some(code) = &method.code {
        code_lines(code, &mut lines);
    }
    lines
}

fn field_declaration(field: &FieldInfo) -> String {
    match &field.constant {
        Some(constant) => format!("{}:{}={constant}", field.name, field.descriptor),
        None => format!("{}:{}=", field.name, field.descriptor),
    }
}

fn field_lines(field: &FieldInfo) -> Vec<String> {
    let mut lines = vec![
        format!("access {:04x}", field.access),
        field_declaration(field),
    ];
    if let Some(signature) = &field.signature {
        lines.push(format!("signature {signature}"));
    }
    lines.extend(field.annotations.iter().map(|a| format!("annotation {a}")));
    lines
}

fn header_lines(class: &ClassFile) -> Vec<String> {
    let mut lines = vec![format!("access {:04x}", class.access)];
    if let Some(signature) = &class.signature {
        lines.push(format!("signature {signature}"));
    }
    lines.extend(class.annotations.iter().map(|a| format!("annotation {a}")));
    lines
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Fingerprint a decoded unit. `raw_crc` is the checksum of the bytes it
/// was decoded from.
pub fn fingerprint_class(class: &ClassFile, raw_crc: u32) -> UnitChecksums {
    let header = Fingerprint::ordered(&header_lines(class));

    let mut fields = BTreeSet::new();
    let mut field_fingerprints = BTreeMap::new();
    for field in &class.fields {
        fields.insert(field_declaration(field));
        field_fingerprints.insert(
            format!("{}:{}", field.name, field.descriptor),
            Fingerprint::ordered(&field_lines(field)),
        );
    }

    let mut constructors = BTreeMap::new();
    let mut instance_methods = BTreeMap::new();
    let mut static_methods = BTreeMap::new();
    let mut method_headers = BTreeMap::new();
    for method in &class.methods {
        let lines = method_lines(method);
        let slot = method.slot();
        if is_initializer(&method.name) {
            constructors.insert(slot.clone(), Fingerprint::unordered(&lines));
        } else if method.is_static() {
            static_methods.insert(slot.clone(), Fingerprint::ordered(&lines));
        } else {
            instance_methods.insert(slot.clone(), Fingerprint::ordered(&lines));
        }
        method_headers.insert(
            slot,
            MethodHeader {
                access: method.access,
                exceptions: method.exceptions.clone(),
            },
        );
    }

    let interfaces: BTreeSet<String> = class.interfaces.iter().cloned().collect();

    // Members are sorted by slot so declaration order does not matter.
    let mut summary = vec![
        format!("header {header}"),
        format!("super {}", class.super_name.as_deref().unwrap_or("-")),
        format!(
            "interfaces {}",
            interfaces.iter().cloned().collect::<Vec<_>>().join(",")
        ),
    ];
    summary.extend(field_fingerprints.iter().map(|(k, fp)| format!("field {k} {fp}")));
    summary.extend(constructors.iter().map(|(k, fp)| format!("init {k} {fp}")));
    summary.extend(instance_methods.iter().map(|(k, fp)| format!("method {k} {fp}")));
    summary.extend(static_methods.iter().map(|(k, fp)| format!("static {k} {fp}")));

    UnitChecksums {
        name: class.name.clone(),
        raw_crc,
        class: Fingerprint::ordered(&summary),
        header,
        super_name: class.super_name.clone(),
        interfaces,
        fields,
        field_fingerprints,
        constructors,
        instance_methods,
        static_methods,
        method_headers,
    }
}

/// Decode and fingerprint raw artifact bytes.
pub fn fingerprint_bytes(bytes: &[u8], unit: &str) -> RtsResult<(ClassFile, UnitChecksums)> {
    let class = parse_class(bytes, unit)?;
    let checksums = fingerprint_class(&class, raw_checksum(bytes));
    Ok((class, checksums))
}
