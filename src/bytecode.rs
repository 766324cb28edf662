use std::collections::HashMap;

use anyhow::{Context, Result};
use ristretto_classfile::ConstantPool;
use ristretto_classfile::attributes::{ArrayType, Instruction as Bytecode};

use crate::constant_pool::{ConstantIndex, PoolKey};
use crate::ir::{
    ArrayKind, BitwiseOp, ElementKind, Instruction, InstructionList, NodeId, Opaque, Width,
};
use crate::jstring::JavaString;

/// Lowered instructions plus where each original instruction went.
pub(crate) struct Lowered {
    pub(crate) code: Vec<Bytecode>,
    pub(crate) relocation: Relocation,
}

/// Maps instruction indices of the decoded code to the lowered code.
///
/// A removed instruction maps to the next surviving one; removals at the end
/// map to the end of the code.
pub(crate) struct Relocation {
    targets: Vec<u16>,
    end: u16,
}

impl Relocation {
    pub(crate) fn map(&self, index: u16) -> u16 {
        self.targets.get(usize::from(index)).copied().unwrap_or(self.end)
    }

    /// Length of the lowered code.
    pub(crate) fn end(&self) -> u16 {
        self.end
    }
}

/// Map decoded instructions into the rewrite IR. Node `i` of the result is
/// instruction `i` of `code`.
pub(crate) fn decode_code(
    code: &[Bytecode],
    pool: &ConstantPool,
    constants: &mut ConstantIndex,
) -> Result<InstructionList> {
    let mut instructions = InstructionList::new();
    for (index, instruction) in code.iter().enumerate() {
        let lifted = lift(instruction, pool, constants)
            .with_context(|| format!("decode instruction {} ({:?})", index, instruction))?;
        instructions.push(lifted);
    }
    Ok(instructions)
}

/// Lower the IR back to instructions. `original_len` is the length of the
/// code the list was decoded from.
pub(crate) fn lower_code(
    instructions: &InstructionList,
    original_len: usize,
    pool: &mut ConstantPool,
    constants: &mut ConstantIndex,
) -> Result<Lowered> {
    let end = u16::try_from(instructions.len()).context("method exceeds 65535 instructions")?;
    let positions: HashMap<NodeId, u16> = instructions
        .iter()
        .zip(0u16..)
        .map(|((id, _), position)| (id, position))
        .collect();
    let position = |id: NodeId| {
        instructions
            .resolve(id)
            .and_then(|live| positions.get(&live).copied())
            .unwrap_or(end)
    };

    let mut code = Vec::with_capacity(instructions.len());
    for (_, instruction) in instructions.iter() {
        let lowered = match instruction {
            Instruction::Opaque(Opaque::Jump {
                instruction,
                targets,
            }) => {
                let mut lowered = instruction.clone();
                let mut remaining = targets.iter();
                retarget(&mut lowered, |_| {
                    let target = remaining.next().context("jump lost a target")?;
                    Ok(usize::from(position(*target)))
                })?;
                lowered
            }
            other => lower(other, pool, constants)?,
        };
        code.push(lowered);
    }

    let relocation = Relocation {
        targets: (0..original_len)
            .map(|index| position(NodeId::from_index(index)))
            .collect(),
        end,
    };
    Ok(Lowered { code, relocation })
}

fn lift(
    instruction: &Bytecode,
    pool: &ConstantPool,
    constants: &mut ConstantIndex,
) -> Result<Instruction> {
    Ok(match instruction {
        Bytecode::Iconst_m1 => Instruction::IntConst(-1),
        Bytecode::Iconst_0 => Instruction::IntConst(0),
        Bytecode::Iconst_1 => Instruction::IntConst(1),
        Bytecode::Iconst_2 => Instruction::IntConst(2),
        Bytecode::Iconst_3 => Instruction::IntConst(3),
        Bytecode::Iconst_4 => Instruction::IntConst(4),
        Bytecode::Iconst_5 => Instruction::IntConst(5),
        Bytecode::Bipush(value) => Instruction::IntConst(i32::from(*value)),
        Bytecode::Sipush(value) => Instruction::IntConst(i32::from(*value)),
        Bytecode::Lconst_0 => Instruction::LongConst(0),
        Bytecode::Lconst_1 => Instruction::LongConst(1),
        Bytecode::Aconst_null => Instruction::NullConst,
        Bytecode::Ldc(index) => lift_loadable(instruction, u16::from(*index), pool, constants)?,
        Bytecode::Ldc_w(index) | Bytecode::Ldc2_w(index) => {
            lift_loadable(instruction, *index, pool, constants)?
        }
        Bytecode::Iand => bitwise(Width::Int, BitwiseOp::And),
        Bytecode::Ior => bitwise(Width::Int, BitwiseOp::Or),
        Bytecode::Ixor => bitwise(Width::Int, BitwiseOp::Xor),
        Bytecode::Land => bitwise(Width::Long, BitwiseOp::And),
        Bytecode::Lor => bitwise(Width::Long, BitwiseOp::Or),
        Bytecode::Lxor => bitwise(Width::Long, BitwiseOp::Xor),
        Bytecode::Getstatic(index) => Instruction::GetStatic(constants.field_ref(pool, *index)?),
        Bytecode::Putstatic(index) => Instruction::PutStatic(constants.field_ref(pool, *index)?),
        Bytecode::Invokestatic(index) => {
            let (target, interface) = constants.method_ref(pool, *index)?;
            Instruction::InvokeStatic { target, interface }
        }
        Bytecode::Newarray(ArrayType::Int) => Instruction::NewArray(ArrayKind::Int),
        Bytecode::Newarray(ArrayType::Long) => Instruction::NewArray(ArrayKind::Long),
        Bytecode::Anewarray(index) => {
            Instruction::NewArray(ArrayKind::Reference(constants.class(pool, *index)?))
        }
        Bytecode::Iaload => Instruction::ArrayLoad(ElementKind::Int),
        Bytecode::Laload => Instruction::ArrayLoad(ElementKind::Long),
        Bytecode::Aaload => Instruction::ArrayLoad(ElementKind::Reference),
        Bytecode::Iastore => Instruction::ArrayStore(ElementKind::Int),
        Bytecode::Lastore => Instruction::ArrayStore(ElementKind::Long),
        Bytecode::Aastore => Instruction::ArrayStore(ElementKind::Reference),
        other => {
            let mut scratch = other.clone();
            let mut targets = Vec::new();
            let jumps = retarget(&mut scratch, |index| {
                targets.push(NodeId::from_index(index));
                Ok(index)
            })?;
            if jumps {
                Instruction::Opaque(Opaque::Jump {
                    instruction: other.clone(),
                    targets,
                })
            } else {
                Opaque::plain(other.clone())
            }
        }
    })
}

fn lift_loadable(
    instruction: &Bytecode,
    index: u16,
    pool: &ConstantPool,
    constants: &mut ConstantIndex,
) -> Result<Instruction> {
    Ok(match constants.loadable(pool, index)? {
        Some(PoolKey::Integer(value)) => Instruction::IntConst(value),
        Some(PoolKey::Long(value)) => Instruction::LongConst(value),
        Some(PoolKey::String(value)) => Instruction::StringConst(JavaString::from(value.as_str())),
        _ => Opaque::plain(instruction.clone()),
    })
}

fn bitwise(width: Width, op: BitwiseOp) -> Instruction {
    Instruction::Bitwise { width, op }
}

/// Smallest encoding of every constant, so javac output lowers to itself.
fn lower(
    instruction: &Instruction,
    pool: &mut ConstantPool,
    constants: &mut ConstantIndex,
) -> Result<Bytecode> {
    Ok(match instruction {
        Instruction::IntConst(value) => match *value {
            -1 => Bytecode::Iconst_m1,
            0 => Bytecode::Iconst_0,
            1 => Bytecode::Iconst_1,
            2 => Bytecode::Iconst_2,
            3 => Bytecode::Iconst_3,
            4 => Bytecode::Iconst_4,
            5 => Bytecode::Iconst_5,
            value => match (i8::try_from(value), i16::try_from(value)) {
                (Ok(byte), _) => Bytecode::Bipush(byte),
                (_, Ok(short)) => Bytecode::Sipush(short),
                _ => ldc(constants.intern(pool, &PoolKey::Integer(value))?),
            },
        },
        Instruction::LongConst(0) => Bytecode::Lconst_0,
        Instruction::LongConst(1) => Bytecode::Lconst_1,
        Instruction::LongConst(value) => {
            Bytecode::Ldc2_w(constants.intern(pool, &PoolKey::Long(*value))?)
        }
        Instruction::StringConst(value) => {
            ldc(constants.intern(pool, &PoolKey::String(value.to_utf8()?))?)
        }
        Instruction::NullConst => Bytecode::Aconst_null,
        Instruction::Bitwise { width, op } => match (width, op) {
            (Width::Int, BitwiseOp::And) => Bytecode::Iand,
            (Width::Int, BitwiseOp::Or) => Bytecode::Ior,
            (Width::Int, BitwiseOp::Xor) => Bytecode::Ixor,
            (Width::Long, BitwiseOp::And) => Bytecode::Land,
            (Width::Long, BitwiseOp::Or) => Bytecode::Lor,
            (Width::Long, BitwiseOp::Xor) => Bytecode::Lxor,
        },
        Instruction::GetStatic(field) => {
            Bytecode::Getstatic(constants.intern(pool, &PoolKey::Field(field.clone()))?)
        }
        Instruction::PutStatic(field) => {
            Bytecode::Putstatic(constants.intern(pool, &PoolKey::Field(field.clone()))?)
        }
        Instruction::InvokeStatic { target, interface } => {
            let key = if *interface {
                PoolKey::InterfaceMethod(target.clone())
            } else {
                PoolKey::Method(target.clone())
            };
            Bytecode::Invokestatic(constants.intern(pool, &key)?)
        }
        Instruction::NewArray(ArrayKind::Int) => Bytecode::Newarray(ArrayType::Int),
        Instruction::NewArray(ArrayKind::Long) => Bytecode::Newarray(ArrayType::Long),
        Instruction::NewArray(ArrayKind::Reference(class)) => {
            Bytecode::Anewarray(constants.intern(pool, &PoolKey::Class(class.clone()))?)
        }
        Instruction::ArrayLoad(ElementKind::Int) => Bytecode::Iaload,
        Instruction::ArrayLoad(ElementKind::Long) => Bytecode::Laload,
        Instruction::ArrayLoad(ElementKind::Reference) => Bytecode::Aaload,
        Instruction::ArrayStore(ElementKind::Int) => Bytecode::Iastore,
        Instruction::ArrayStore(ElementKind::Long) => Bytecode::Lastore,
        Instruction::ArrayStore(ElementKind::Reference) => Bytecode::Aastore,
        Instruction::Opaque(Opaque::Plain(instruction)) => instruction.clone(),
        Instruction::Opaque(Opaque::Jump { .. }) => {
            anyhow::bail!("jumps are lowered against the code layout")
        }
    })
}

fn ldc(index: u16) -> Bytecode {
    match u8::try_from(index) {
        Ok(index) => Bytecode::Ldc(index),
        Err(_) => Bytecode::Ldc_w(index),
    }
}

/// Rewrite every code index operand of `instruction` in operand order:
/// the branch target, or a switch default followed by its cases. Returns
/// false when there is none.
fn retarget(
    instruction: &mut Bytecode,
    mut map: impl FnMut(usize) -> Result<usize>,
) -> Result<bool> {
    match instruction {
        Bytecode::Ifeq(target)
        | Bytecode::Ifne(target)
        | Bytecode::Iflt(target)
        | Bytecode::Ifge(target)
        | Bytecode::Ifgt(target)
        | Bytecode::Ifle(target)
        | Bytecode::If_icmpeq(target)
        | Bytecode::If_icmpne(target)
        | Bytecode::If_icmplt(target)
        | Bytecode::If_icmpge(target)
        | Bytecode::If_icmpgt(target)
        | Bytecode::If_icmple(target)
        | Bytecode::If_acmpeq(target)
        | Bytecode::If_acmpne(target)
        | Bytecode::Goto(target)
        | Bytecode::Jsr(target)
        | Bytecode::Ifnull(target)
        | Bytecode::Ifnonnull(target) => {
            *target = u16::try_from(map(usize::from(*target))?).context("jump target overflows")?;
        }
        Bytecode::Goto_w(target) | Bytecode::Jsr_w(target) => {
            *target = wide(&mut map, *target)?;
        }
        Bytecode::Tableswitch { default, offsets, .. } => {
            *default = wide(&mut map, *default)?;
            for target in offsets.iter_mut() {
                *target = wide(&mut map, *target)?;
            }
        }
        Bytecode::Lookupswitch { default, pairs } => {
            *default = wide(&mut map, *default)?;
            for target in pairs.values_mut() {
                *target = wide(&mut map, *target)?;
            }
        }
        _ => return Ok(false),
    }
    Ok(true)
}

fn wide(map: &mut impl FnMut(usize) -> Result<usize>, target: i32) -> Result<i32> {
    let index = usize::try_from(target).context("negative jump target")?;
    i32::try_from(map(index)?).context("jump target overflows")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::MemberRef;
    use crate::testing::{ClassBuilder, code_of};

    const OWNER: &str = "demo/Lower";

    fn lowered(instructions: Vec<Instruction>) -> Vec<Bytecode> {
        let class = ClassBuilder::new(OWNER)
            .method("run", "()V", 0x0009, instructions)
            .build();
        code_of(&class.methods[0])
    }

    #[test]
    fn constants_take_their_smallest_form() {
        let code = lowered(vec![
            Instruction::IntConst(-1),
            Instruction::IntConst(5),
            Instruction::IntConst(-128),
            Instruction::IntConst(300),
            Instruction::LongConst(1),
            Instruction::NullConst,
        ]);
        assert_eq!(
            code,
            vec![
                Bytecode::Iconst_m1,
                Bytecode::Iconst_5,
                Bytecode::Bipush(-128),
                Bytecode::Sipush(300),
                Bytecode::Lconst_1,
                Bytecode::Aconst_null,
            ]
        );
    }

    #[test]
    fn wide_constants_go_through_the_pool_and_back() {
        let instructions = vec![
            Instruction::IntConst(1_000_000),
            Instruction::LongConst(-7),
            Instruction::StringConst(JavaString::from("caf\u{e9}")),
            Instruction::InvokeStatic {
                target: MemberRef::new(OWNER, "id", "(Ljava/lang/String;)Ljava/lang/String;"),
                interface: false,
            },
            Instruction::NewArray(ArrayKind::Reference("java/lang/String".to_string())),
        ];
        let class = ClassBuilder::new(OWNER)
            .method("run", "()V", 0x0009, instructions.clone())
            .build();

        let code = code_of(&class.methods[0]);
        assert!(matches!(code[0], Bytecode::Ldc(_) | Bytecode::Ldc_w(_)));
        assert!(matches!(code[1], Bytecode::Ldc2_w(_)));
        let decoded: Vec<Instruction> = class.methods[0]
            .instructions
            .iter()
            .map(|(_, instruction)| instruction.clone())
            .collect();
        assert_eq!(decoded, instructions);
    }

    #[test]
    fn jumps_decode_to_nodes_and_lower_to_new_positions() {
        let mut class = ClassBuilder::new(OWNER)
            .method(
                "run",
                "()V",
                0x0009,
                vec![
                    Instruction::IntConst(0),
                    Instruction::IntConst(1),
                    Opaque::plain(Bytecode::Pop),
                    Instruction::Opaque(Opaque::Jump {
                        instruction: Bytecode::Ifeq(0),
                        targets: vec![NodeId::from_index(5)],
                    }),
                    Opaque::plain(Bytecode::Nop),
                    Opaque::plain(Bytecode::Return),
                ],
            )
            .build();
        let method = &mut class.methods[0];
        assert_eq!(code_of(method)[3], Bytecode::Ifeq(5));
        assert_eq!(
            method.instructions.get(NodeId::from_index(3)),
            Some(&Instruction::Opaque(Opaque::Jump {
                instruction: Bytecode::Ifeq(5),
                targets: vec![NodeId::from_index(5)],
            }))
        );

        method.instructions.remove(NodeId::from_index(1));
        method.instructions.remove(NodeId::from_index(2));
        let mut pool = class.file.constant_pool.clone();
        let lowered = lower_code(&method.instructions, 6, &mut pool, &mut class.constants)
            .expect("lower");

        assert_eq!(
            lowered.code,
            vec![
                Bytecode::Iconst_0,
                Bytecode::Ifeq(3),
                Bytecode::Nop,
                Bytecode::Return,
            ]
        );
        let moved: Vec<u16> = (0..=6).map(|index| lowered.relocation.map(index)).collect();
        assert_eq!(moved, vec![0, 1, 1, 1, 2, 3, 4]);
        assert_eq!(lowered.relocation.end(), 4);
    }

    #[test]
    fn unmodelled_instructions_pass_through() {
        let code = lowered(vec![Opaque::plain(Bytecode::Fconst_2)]);
        assert_eq!(code, vec![Bytecode::Fconst_2]);
    }
}
