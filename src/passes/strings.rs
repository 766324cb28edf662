use crate::ir::{BitwiseOp, CLASS_INITIALIZER, Instruction, InstructionList, Width};
use crate::jstring::{JavaString, hash_code};

/// Key embedded in a decryption helper: `k` in the first `ixor; <k>; ixor`.
///
/// Helpers without the pattern contribute 0.
pub(crate) fn embedded_key(instructions: &InstructionList) -> i32 {
    instructions
        .iter()
        .find_map(|(id, instruction)| {
            if !is_int_xor(instruction) {
                return None;
            }
            let [_, (_, key), (_, closing)] = instructions.window::<3>(id)?;
            if is_int_xor(closing) { key.as_int() } else { None }
        })
        .unwrap_or(0)
}

/// Key the helper applies for strings stored from `<clinit>` of `class_name`.
pub(crate) fn effective_key(class_name: &str, helper_name: &str, embedded: i32) -> i32 {
    hash_code(&class_name.replace('/', "."))
        ^ hash_code(CLASS_INITIALIZER)
        ^ hash_code(helper_name)
        ^ embedded
}

/// Recover the literal a helper would return for `cipher`.
pub(crate) fn decrypt(
    class_name: &str,
    helper_name: &str,
    helper: &InstructionList,
    cipher: &JavaString,
) -> JavaString {
    let key = effective_key(class_name, helper_name, embedded_key(helper));
    cipher.xor_units(key)
}

fn is_int_xor(instruction: &Instruction) -> bool {
    matches!(
        instruction,
        Instruction::Bitwise {
            width: Width::Int,
            op: BitwiseOp::Xor,
        }
    )
}
