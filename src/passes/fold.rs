use crate::ir::{Class, Instruction, InstructionList, NodeId, Width};
use crate::passes::{LongFoldMode, Pass, PassMetadata, TransformContext, TransformError};

/// Collapses `const a; const b; <and|or|xor>` in the static initializer.
pub(crate) struct FoldPass {
    width: Width,
}

impl FoldPass {
    pub(crate) const INT: Self = Self { width: Width::Int };
    pub(crate) const LONG: Self = Self { width: Width::Long };
}

impl Pass for FoldPass {
    fn metadata(&self) -> PassMetadata {
        match self.width {
            Width::Int => PassMetadata {
                id: "fold-int",
                description: "Fold 32-bit bitwise constant expressions",
            },
            Width::Long => PassMetadata {
                id: "fold-long",
                description: "Fold 64-bit bitwise constant expressions",
            },
        }
    }

    fn run(
        &self,
        class: &mut Class,
        context: &mut TransformContext,
    ) -> Result<usize, TransformError> {
        let legacy = context.options.long_fold == LongFoldMode::Legacy;
        let instructions = &mut class.methods[context.initializer].instructions;
        let mut folded = 0;
        let mut cursor = instructions.first();
        while let Some(id) = cursor {
            if let Some((value, operands)) = match_fold(instructions, id, self.width, legacy) {
                for node in operands {
                    instructions.remove(node);
                }
                instructions.replace(id, value);
                folded += 1;
            }
            cursor = instructions.next(id);
        }
        context.stats.folded += folded;
        Ok(folded)
    }
}

/// Folded constant at `id` plus the two trailing nodes it replaces.
fn match_fold(
    instructions: &InstructionList,
    id: NodeId,
    width: Width,
    legacy: bool,
) -> Option<(Instruction, [NodeId; 2])> {
    let [(_, first), (second_id, second), (op_id, op)] = instructions.window::<3>(id)?;
    let Instruction::Bitwise { width: op_width, op } = op else {
        return None;
    };
    if *op_width != width {
        return None;
    }
    let value = match width {
        Width::Int => Instruction::IntConst(op.apply_int(first.as_int()?, second.as_int()?)),
        Width::Long => {
            let left = first.as_long()?;
            let right = second.as_long()?;
            Instruction::LongConst(op.apply_long(left, if legacy { left } else { right }))
        }
    };
    Some((value, [second_id, op_id]))
}
