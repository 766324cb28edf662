//! Synthetic class fixtures shared by unit tests.

use std::io::Cursor;

use ristretto_classfile::attributes::{Attribute, ExceptionTableEntry, StackFrame};
use ristretto_classfile::{ClassFile, FieldAccessFlags, FieldType, MethodAccessFlags};

pub(crate) use ristretto_classfile::attributes::Instruction as Bytecode;

use crate::bytecode::lower_code;
use crate::classfile::lift_class;
use crate::constant_pool::ConstantIndex;
use crate::ir::{
    ArrayKind, BitwiseOp, CLASS_INITIALIZER, Class, ElementKind, Instruction, InstructionList,
    MemberRef, Method, Opaque, Width,
};
use crate::jstring::{JavaString, hash_code};

const ACC_STATIC: u16 = 0x0008;
const ACC_PRIVATE_STATIC_FINAL: u16 = 0x001a;

struct PendingMethod {
    name: String,
    descriptor: String,
    access_flags: u16,
    instructions: Vec<Instruction>,
}

/// Builds a decoded class the way `decode_class` would return it.
pub(crate) struct ClassBuilder {
    name: String,
    fields: Vec<(String, String, u16)>,
    methods: Vec<PendingMethod>,
}

impl ClassBuilder {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            fields: Vec::new(),
            methods: Vec::new(),
        }
    }

    pub(crate) fn field(mut self, name: &str, descriptor: &str, access_flags: u16) -> Self {
        self.fields
            .push((name.to_string(), descriptor.to_string(), access_flags));
        self
    }

    pub(crate) fn method(
        mut self,
        name: &str,
        descriptor: &str,
        access_flags: u16,
        instructions: Vec<Instruction>,
    ) -> Self {
        self.methods.push(PendingMethod {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            access_flags,
            instructions,
        });
        self
    }

    pub(crate) fn build(self) -> Class {
        let mut cursor = Cursor::new(class_header(&self.name));
        let mut file = ClassFile::from_bytes(&mut cursor).expect("decode class header");
        let mut constants = ConstantIndex::default();

        for (name, descriptor, access_flags) in &self.fields {
            let pool = &mut file.constant_pool;
            let name_index = pool.add_utf8(name.as_str()).expect("add field name");
            let descriptor_index = pool.add_utf8(descriptor.as_str()).expect("add descriptor");
            file.fields.push(ristretto_classfile::Field {
                access_flags: FieldAccessFlags::from_bits_truncate(*access_flags),
                name_index,
                descriptor_index,
                field_type: FieldType::parse(&descriptor.to_string()).expect("field type"),
                attributes: Vec::new(),
            });
        }

        for method in self.methods {
            let instructions: InstructionList = method.instructions.into_iter().collect();
            let lowered = lower_code(&instructions, 0, &mut file.constant_pool, &mut constants)
                .expect("lower method code");
            let pool = &mut file.constant_pool;
            let code_index = pool.add_utf8("Code").expect("add Code");
            let name_index = pool.add_utf8(method.name.as_str()).expect("add method name");
            let descriptor_index = pool
                .add_utf8(method.descriptor.as_str())
                .expect("add method descriptor");
            file.methods.push(ristretto_classfile::Method {
                access_flags: MethodAccessFlags::from_bits_truncate(method.access_flags),
                name_index,
                descriptor_index,
                attributes: vec![Attribute::Code {
                    name_index: code_index,
                    max_stack: 8,
                    max_locals: 4,
                    code: lowered.code,
                    exception_table: Vec::new(),
                    attributes: Vec::new(),
                }],
            });
        }

        lift_class(file).expect("lift built class")
    }
}

/// Class file bytes declaring `name extends java/lang/Object` and nothing else.
fn class_header(name: &str) -> Vec<u8> {
    let mut bytes = vec![0xCA, 0xFE, 0xBA, 0xBE, 0, 0, 0, 52, 0, 5];
    push_utf8(&mut bytes, name);
    bytes.extend([7, 0, 1]);
    push_utf8(&mut bytes, "java/lang/Object");
    bytes.extend([7, 0, 3]);
    // access, this, super, then empty interfaces, fields, methods, attributes
    bytes.extend([0x00, 0x21, 0, 2, 0, 4, 0, 0, 0, 0, 0, 0, 0, 0]);
    bytes
}

fn push_utf8(bytes: &mut Vec<u8>, value: &str) {
    bytes.push(1);
    bytes.extend((value.len() as u16).to_be_bytes());
    bytes.extend(value.as_bytes());
}

/// Bytes of `name` with one static method `run()V`:
/// `iconst_0; istore_0; return`, a line number at 0 and local `x:I` over the
/// `return`.
pub(crate) fn class_with_debug_tables(name: &str) -> Vec<u8> {
    let mut bytes = vec![0xCA, 0xFE, 0xBA, 0xBE, 0, 0, 0, 52, 0, 12];
    push_utf8(&mut bytes, name);
    bytes.extend([7, 0, 1]);
    push_utf8(&mut bytes, "java/lang/Object");
    bytes.extend([7, 0, 3]);
    for value in [
        "run",
        "()V",
        "Code",
        "LineNumberTable",
        "LocalVariableTable",
        "x",
        "I",
    ] {
        push_utf8(&mut bytes, value);
    }
    bytes.extend([0x00, 0x21, 0, 2, 0, 4, 0, 0, 0, 0]);
    // one method: public static run()V with a single Code attribute
    bytes.extend([0, 1, 0x00, 0x09, 0, 5, 0, 6, 0, 1]);
    bytes.extend([0, 7, 0, 0, 0, 45, 0, 1, 0, 1, 0, 0, 0, 3, 0x03, 0x3b, 0xb1, 0, 0, 0, 2]);
    bytes.extend([0, 8, 0, 0, 0, 6, 0, 1, 0, 0, 0, 12]);
    bytes.extend([0, 9, 0, 0, 0, 12, 0, 1, 0, 2, 0, 1, 0, 10, 0, 11, 0, 0]);
    // class attributes
    bytes.extend([0, 0]);
    bytes
}

/// Instructions held by the `Code` attribute of `method`.
pub(crate) fn code_of(method: &Method) -> Vec<Bytecode> {
    method
        .raw
        .attributes
        .iter()
        .find_map(|attribute| match attribute {
            Attribute::Code { code, .. } => Some(code.clone()),
            _ => None,
        })
        .unwrap_or_default()
}

/// Exception table and sub-attributes of the `Code` attribute of `method`.
pub(crate) fn code_tables_mut(
    method: &mut Method,
) -> (&mut Vec<ExceptionTableEntry>, &mut Vec<Attribute>) {
    method
        .raw
        .attributes
        .iter_mut()
        .find_map(|attribute| match attribute {
            Attribute::Code {
                exception_table,
                attributes,
                ..
            } => Some((exception_table, attributes)),
            _ => None,
        })
        .expect("method has code")
}

/// Attach a `StackMapTable` to method `index` of `class`.
pub(crate) fn add_stack_map(class: &mut Class, index: usize, frames: Vec<StackFrame>) {
    let name_index = class
        .file
        .constant_pool
        .add_utf8("StackMapTable")
        .expect("add StackMapTable");
    let (_, attributes) = code_tables_mut(&mut class.methods[index]);
    attributes.push(Attribute::StackMapTable { name_index, frames });
}

pub(crate) fn stack_map_of(method: &Method) -> Vec<StackFrame> {
    let Some(Attribute::Code { attributes, .. }) = method
        .raw
        .attributes
        .iter()
        .find(|attribute| matches!(attribute, Attribute::Code { .. }))
    else {
        return Vec::new();
    };
    attributes
        .iter()
        .find_map(|attribute| match attribute {
            Attribute::StackMapTable { frames, .. } => Some(frames.clone()),
            _ => None,
        })
        .unwrap_or_default()
}

pub(crate) fn field_ref(owner: &str, name: &str, descriptor: &str) -> MemberRef {
    MemberRef::new(owner, name, descriptor)
}

pub(crate) fn xor(width: Width) -> Instruction {
    Instruction::Bitwise {
        width,
        op: BitwiseOp::Xor,
    }
}

/// `getstatic table; <index>; <value>; xastore`
pub(crate) fn table_store(
    table: &MemberRef,
    index: i32,
    value: Instruction,
    kind: ElementKind,
) -> Vec<Instruction> {
    vec![
        Instruction::GetStatic(table.clone()),
        Instruction::IntConst(index),
        value,
        Instruction::ArrayStore(kind),
    ]
}

/// `getstatic table; <index>; ldc cipher; invokestatic helper; aastore`
pub(crate) fn string_store(
    table: &MemberRef,
    index: i32,
    cipher: JavaString,
    helper: &MemberRef,
) -> Vec<Instruction> {
    vec![
        Instruction::GetStatic(table.clone()),
        Instruction::IntConst(index),
        Instruction::StringConst(cipher),
        Instruction::InvokeStatic {
            target: helper.clone(),
            interface: false,
        },
        Instruction::ArrayStore(ElementKind::Reference),
    ]
}

/// `getstatic table; <index>; xaload`
pub(crate) fn table_load(table: &MemberRef, index: i32, kind: ElementKind) -> Vec<Instruction> {
    vec![
        Instruction::GetStatic(table.clone()),
        Instruction::IntConst(index),
        Instruction::ArrayLoad(kind),
    ]
}

/// `<size>; newarray; putstatic table`
pub(crate) fn allocation(table: &MemberRef, size: i32, kind: ArrayKind) -> Vec<Instruction> {
    vec![
        Instruction::IntConst(size),
        Instruction::NewArray(kind),
        Instruction::PutStatic(table.clone()),
    ]
}

/// Body of a decryption helper that embeds `key` between two `ixor`s.
pub(crate) fn helper_body(key: i32) -> Vec<Instruction> {
    vec![
        Instruction::IntConst(0),
        Instruction::IntConst(0),
        xor(Width::Int),
        Instruction::IntConst(key),
        xor(Width::Int),
        Opaque::plain(Bytecode::Pop),
        Opaque::plain(Bytecode::Aload_0),
        Opaque::plain(Bytecode::Areturn),
    ]
}

/// Ciphertext the obfuscator would store for `plain`.
pub(crate) fn encrypt(class_name: &str, helper: &str, key: i32, plain: &str) -> JavaString {
    let effective = hash_code(&class_name.replace('/', "."))
        ^ hash_code(CLASS_INITIALIZER)
        ^ hash_code(helper)
        ^ key;
    JavaString::from(plain).xor_units(effective)
}

pub(crate) const HELPER_NAME: &str = "lIlIIl";
pub(crate) const HELPER_DESCRIPTOR: &str = "(Ljava/lang/String;)Ljava/lang/String;";
pub(crate) const HELPER_KEY: i32 = 0x1b3c_5d7e;

/// One int table with two entries, one string table with one encrypted entry
/// and its helper, plus a method reading all three slots.
pub(crate) fn obfuscated_class(name: &str) -> Class {
    let ints = field_ref(name, "IIlI", "[I");
    let strings = field_ref(name, "IlIl", "[Ljava/lang/String;");
    let helper = MemberRef::new(name, HELPER_NAME, HELPER_DESCRIPTOR);

    let mut clinit = Vec::new();
    clinit.extend(allocation(&ints, 2, ArrayKind::Int));
    clinit.extend(allocation(
        &strings,
        1,
        ArrayKind::Reference("java/lang/String".to_string()),
    ));
    clinit.extend(table_store(
        &ints,
        0,
        Instruction::IntConst(42),
        ElementKind::Int,
    ));
    // 0x0f0f ^ 0x0a0a folds to 0x0505 before resolution.
    clinit.extend(table_store(
        &ints,
        1,
        Instruction::IntConst(0x0f0f),
        ElementKind::Int,
    ));
    clinit.insert(clinit.len() - 1, Instruction::IntConst(0x0a0a));
    clinit.insert(clinit.len() - 1, xor(Width::Int));
    clinit.extend(string_store(
        &strings,
        0,
        encrypt(name, HELPER_NAME, HELPER_KEY, "hello world"),
        &helper,
    ));
    clinit.push(Opaque::plain(Bytecode::Return));

    let mut compute = Vec::new();
    compute.extend(table_load(&ints, 0, ElementKind::Int));
    compute.extend(table_load(&ints, 1, ElementKind::Int));
    compute.push(Instruction::Bitwise {
        width: Width::Int,
        op: BitwiseOp::Or,
    });
    compute.extend(table_load(&strings, 0, ElementKind::Reference));
    compute.push(Opaque::plain(Bytecode::Pop));
    compute.push(Opaque::plain(Bytecode::Ireturn));

    ClassBuilder::new(name)
        .field(&ints.name, &ints.descriptor, ACC_PRIVATE_STATIC_FINAL)
        .field(&strings.name, &strings.descriptor, ACC_PRIVATE_STATIC_FINAL)
        .method(CLASS_INITIALIZER, "()V", ACC_STATIC, clinit)
        .method("compute", "()I", 0x0009, compute)
        .method(HELPER_NAME, HELPER_DESCRIPTOR, 0x000a, helper_body(HELPER_KEY))
        .build()
}

/// Instructions of `name` in order.
pub(crate) fn instructions_of(class: &Class, name: &str) -> Vec<Instruction> {
    class
        .methods
        .iter()
        .find(|method| method.name == name)
        .map(|method| {
            method
                .instructions
                .iter()
                .map(|(_, instruction)| instruction.clone())
                .collect()
        })
        .unwrap_or_default()
}
