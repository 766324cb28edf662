use std::io::Cursor;

use anyhow::{Context, Result};
use jclassfile::class_file;
use log::debug;
use ristretto_classfile::attributes::{Attribute, StackFrame};
use ristretto_classfile::{ClassFile, ConstantPool};

use crate::bytecode::{Lowered, Relocation, decode_code, lower_code};
use crate::constant_pool::{ConstantIndex, class_name, utf8};
use crate::ir::{Class, Field, InstructionList, Method};

pub(crate) const CLASS_MAGIC: u32 = 0xCAFEBABE;

/// True when `data` starts with the class file magic and has room for a header.
pub(crate) fn looks_like_class(data: &[u8]) -> bool {
    data.len() > 8 && data[..4] == CLASS_MAGIC.to_be_bytes()
}

/// Parse class bytes into the rewrite IR.
pub(crate) fn decode_class(data: &[u8]) -> Result<Class> {
    class_file::parse(data).context("failed to parse class file bytes")?;
    let mut cursor = Cursor::new(data.to_vec());
    let file = ClassFile::from_bytes(&mut cursor).context("failed to decode class file")?;
    lift_class(file)
}

/// Build the rewrite IR over a decoded class file.
pub(crate) fn lift_class(file: ClassFile) -> Result<Class> {
    let pool = &file.constant_pool;
    let name = class_name(pool, file.this_class).context("resolve class name")?;
    let mut constants = ConstantIndex::default();

    let mut fields = Vec::with_capacity(file.fields.len());
    for raw in &file.fields {
        fields.push(Field {
            name: utf8(pool, raw.name_index).context("resolve field name")?,
            descriptor: utf8(pool, raw.descriptor_index).context("resolve field descriptor")?,
            raw: raw.clone(),
        });
    }

    let mut methods = Vec::with_capacity(file.methods.len());
    for raw in &file.methods {
        let method_name = utf8(pool, raw.name_index).context("resolve method name")?;
        let descriptor = utf8(pool, raw.descriptor_index).context("resolve method descriptor")?;
        let code = raw.attributes.iter().find_map(|attribute| match attribute {
            Attribute::Code { code, .. } => Some(code),
            _ => None,
        });
        let instructions = match code {
            Some(code) => decode_code(code, pool, &mut constants)
                .with_context(|| format!("decode code of {}{}", method_name, descriptor))?,
            None => InstructionList::new(),
        };
        methods.push(Method {
            name: method_name,
            descriptor,
            instructions,
            raw: raw.clone(),
        });
    }

    Ok(Class {
        name,
        fields,
        methods,
        file,
        constants,
    })
}

/// Serialize the IR back to class bytes and re-validate them.
pub(crate) fn encode_class(class: &Class) -> Result<Vec<u8>> {
    let mut file = class.file.clone();
    let mut constants = class.constants.clone();
    file.fields = class.fields.iter().map(|field| field.raw.clone()).collect();

    let mut methods = Vec::with_capacity(class.methods.len());
    for method in &class.methods {
        let mut raw = method.raw.clone();
        rewrite_code(
            &mut raw,
            &method.instructions,
            &mut file.constant_pool,
            &mut constants,
        )
        .with_context(|| format!("encode method {}{}", method.name, method.descriptor))?;
        methods.push(raw);
    }
    file.methods = methods;

    let mut bytes = Vec::new();
    file.to_bytes(&mut bytes).context("failed to serialize class file")?;
    class_file::parse(&bytes).context("re-encoded class failed validation")?;
    Ok(bytes)
}

/// Replace the `Code` of `method` with the lowered IR and move every table
/// indexed by instruction along with it.
fn rewrite_code(
    method: &mut ristretto_classfile::Method,
    instructions: &InstructionList,
    pool: &mut ConstantPool,
    constants: &mut ConstantIndex,
) -> Result<()> {
    let Some(Attribute::Code {
        code,
        exception_table,
        attributes,
        ..
    }) = method
        .attributes
        .iter_mut()
        .find(|attribute| matches!(attribute, Attribute::Code { .. }))
    else {
        return Ok(());
    };

    let Lowered {
        code: lowered,
        relocation,
    } = lower_code(instructions, code.len(), pool, constants)?;
    if lowered == *code {
        return Ok(());
    }

    for entry in exception_table.iter_mut() {
        entry.range_pc.start = relocation.map(entry.range_pc.start);
        entry.range_pc.end = relocation.map(entry.range_pc.end);
        entry.handler_pc = relocation.map(entry.handler_pc);
    }
    // Every covered instruction was removed.
    exception_table.retain(|entry| entry.range_pc.start < entry.range_pc.end);

    let before = attributes.len();
    attributes.retain(|attribute| {
        matches!(
            attribute,
            Attribute::StackMapTable { .. }
                | Attribute::LineNumberTable { .. }
                | Attribute::LocalVariableTable { .. }
        )
    });
    if attributes.len() < before {
        debug!(
            "dropping {} code attributes that cannot be relocated",
            before - attributes.len()
        );
    }

    for attribute in attributes.iter_mut() {
        match attribute {
            Attribute::StackMapTable { frames, .. } => {
                *frames = relocate_frames(frames, &relocation)?;
            }
            Attribute::LineNumberTable { line_numbers, .. } => {
                for line in line_numbers.iter_mut() {
                    line.start_pc = relocation.map(line.start_pc);
                }
                line_numbers.retain(|line| line.start_pc < relocation.end());
            }
            Attribute::LocalVariableTable { variables, .. } => {
                for variable in variables.iter_mut() {
                    let end = u32::from(variable.start_pc) + u32::from(variable.length);
                    let end = relocation.map(u16::try_from(end).unwrap_or(u16::MAX));
                    variable.start_pc = relocation.map(variable.start_pc);
                    variable.length = end.saturating_sub(variable.start_pc);
                }
                variables.retain(|variable| variable.length > 0);
            }
            _ => {}
        }
    }

    *code = lowered;
    Ok(())
}

/// Re-anchor stack map frames on the lowered code. Frames are delta encoded,
/// so two frames landing on one instruction cannot be expressed.
fn relocate_frames(frames: &[StackFrame], relocation: &Relocation) -> Result<Vec<StackFrame>> {
    let mut relocated = Vec::with_capacity(frames.len());
    let mut original: Option<u16> = None;
    let mut previous: Option<u16> = None;
    for frame in frames {
        let delta = frame.offset_delta();
        let index = match original {
            None => delta,
            Some(original) => original
                .checked_add(delta)
                .and_then(|index| index.checked_add(1))
                .context("stack map frame offset overflows")?,
        };
        original = Some(index);

        let target = relocation.map(index);
        if target >= relocation.end() {
            anyhow::bail!("stack map frame at instruction {} lost its instruction", index);
        }
        let delta = match previous {
            None => target,
            Some(previous) if target > previous => target - previous - 1,
            Some(_) => anyhow::bail!("stack map frames collapsed onto instruction {}", target),
        };
        previous = Some(target);
        relocated.push(with_offset_delta(frame, delta));
    }
    Ok(relocated)
}

fn with_offset_delta(frame: &StackFrame, offset_delta: u16) -> StackFrame {
    match frame {
        StackFrame::SameFrame { .. } | StackFrame::SameFrameExtended { .. } => {
            if offset_delta <= 63 {
                StackFrame::SameFrame {
                    frame_type: offset_delta as u8,
                }
            } else {
                StackFrame::SameFrameExtended {
                    frame_type: 251,
                    offset_delta,
                }
            }
        }
        StackFrame::SameLocals1StackItemFrame { stack, .. }
        | StackFrame::SameLocals1StackItemFrameExtended { stack, .. } => {
            if offset_delta <= 63 {
                StackFrame::SameLocals1StackItemFrame {
                    frame_type: 64 + offset_delta as u8,
                    stack: stack.clone(),
                }
            } else {
                StackFrame::SameLocals1StackItemFrameExtended {
                    frame_type: 247,
                    offset_delta,
                    stack: stack.clone(),
                }
            }
        }
        StackFrame::ChopFrame { frame_type, .. } => StackFrame::ChopFrame {
            frame_type: *frame_type,
            offset_delta,
        },
        StackFrame::AppendFrame {
            frame_type, locals, ..
        } => StackFrame::AppendFrame {
            frame_type: *frame_type,
            offset_delta,
            locals: locals.clone(),
        },
        StackFrame::FullFrame {
            frame_type,
            locals,
            stack,
            ..
        } => StackFrame::FullFrame {
            frame_type: *frame_type,
            offset_delta,
            locals: locals.clone(),
            stack: stack.clone(),
        },
    }
}
