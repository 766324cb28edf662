use log::{debug, warn};
use ristretto_classfile::attributes::Attribute;

use crate::ir::{
    CLASS_INITIALIZER, Class, ElementKind, Instruction, InstructionList, MemberKey, MemberRef,
    NodeId,
};
use crate::passes::tables::{StoreSite, match_store};
use crate::passes::{Pass, PassMetadata, TransformContext, TransformError, initializer_index};

/// Delete the fields and helper methods marked during table resolution.
///
/// A marked field goes only when nothing but its allocation and its
/// remaining constant stores touch it; those stores are stripped with it.
/// A marked helper goes only when no `invokestatic` still targets it.
pub(crate) fn remove_marked(class: &mut Class, context: &mut TransformContext) {
    let owner = class.name.clone();

    for key in context.marked_fields.clone() {
        let field = MemberRef::new(&owner, &key.name, &key.descriptor);
        let initializer = &class.methods[context.initializer].instructions;
        let stores = leftover_stores(initializer, &field, &owner);
        let allocations = allocation_sites(initializer, &field).len();
        let references = field_references(class, &field);
        if references != stores.len() + allocations {
            warn!(
                "{}: keeping field {}: {} references outside its table scaffold",
                owner,
                key,
                references - stores.len() - allocations
            );
            continue;
        }

        let initializer = &mut class.methods[context.initializer].instructions;
        for node in stores.iter().flat_map(|store| &store.nodes) {
            initializer.remove(*node);
        }
        context.stats.stripped_stores += stores.len();

        let before = class.fields.len();
        class.fields.retain(|declared| declared.key() != key);
        context.stats.removed_fields += before - class.fields.len();
        debug!("{}: removed field {}", owner, key);
        context.removed_fields.insert(key);
    }

    for key in context.marked_methods.clone() {
        if key.name == CLASS_INITIALIZER {
            continue;
        }
        let calls = helper_calls(class, &owner, &key);
        if calls > 0 {
            warn!("{}: keeping helper {}: {} calls remain", owner, key, calls);
            continue;
        }
        let before = class.methods.len();
        class.methods.retain(|method| method.key() != key);
        context.stats.removed_methods += before - class.methods.len();
        debug!("{}: removed helper {}", owner, key);
    }

    if let Some(index) = initializer_index(class) {
        context.initializer = index;
    }
}

/// Deletes `<size>; newarray; putstatic T` for removed tables `T`.
pub(crate) struct OrphanAllocationPass;

impl Pass for OrphanAllocationPass {
    fn metadata(&self) -> PassMetadata {
        PassMetadata {
            id: "clean-allocations",
            description: "Remove allocations of deleted table fields",
        }
    }

    fn run(
        &self,
        class: &mut Class,
        context: &mut TransformContext,
    ) -> Result<usize, TransformError> {
        let instructions = &mut class.methods[context.initializer].instructions;
        let mut removed = 0;
        let mut cursor = instructions.first();
        while let Some(id) = cursor {
            if let Some(nodes) = match_allocation(instructions, id, |field| {
                field.owner == class.name && context.removed_fields.contains(&field.key())
            }) {
                for node in nodes {
                    instructions.remove(node);
                }
                removed += 1;
            }
            cursor = instructions.next(id);
        }
        context.stats.removed_allocations += removed;
        Ok(removed)
    }
}

/// Drop local variable tables on every method. Line numbers stay.
pub(crate) fn clear_local_variables(class: &mut Class) {
    for method in &mut class.methods {
        for attribute in &mut method.raw.attributes {
            if let Attribute::Code { attributes, .. } = attribute {
                attributes.retain(|attribute| {
                    !matches!(
                        attribute,
                        Attribute::LocalVariableTable { .. }
                            | Attribute::LocalVariableTypeTable { .. }
                    )
                });
            }
        }
    }
}

fn match_allocation(
    instructions: &InstructionList,
    id: NodeId,
    is_target: impl Fn(&MemberRef) -> bool,
) -> Option<[NodeId; 3]> {
    let [(size_id, size), (new_id, new), (put_id, put)] = instructions.window::<3>(id)?;
    let Instruction::PutStatic(field) = put else {
        return None;
    };
    if size.as_int().is_none() || !matches!(new, Instruction::NewArray(_)) || !is_target(field) {
        return None;
    }
    Some([size_id, new_id, put_id])
}

fn allocation_sites(instructions: &InstructionList, field: &MemberRef) -> Vec<[NodeId; 3]> {
    instructions
        .iter()
        .filter_map(|(id, _)| match_allocation(instructions, id, |target| target == field))
        .collect()
}

fn leftover_stores(
    instructions: &InstructionList,
    field: &MemberRef,
    owner: &str,
) -> Vec<StoreSite> {
    instructions
        .iter()
        .filter_map(|(id, _)| {
            [ElementKind::Int, ElementKind::Long, ElementKind::Reference]
                .into_iter()
                .find_map(|kind| match_store(instructions, id, field, kind, owner))
        })
        .collect()
}

fn field_references(class: &Class, field: &MemberRef) -> usize {
    class
        .methods
        .iter()
        .flat_map(|method| method.instructions.iter())
        .filter(|(_, instruction)| match instruction {
            Instruction::GetStatic(target) | Instruction::PutStatic(target) => target == field,
            _ => false,
        })
        .count()
}

fn helper_calls(class: &Class, owner: &str, key: &MemberKey) -> usize {
    class
        .methods
        .iter()
        .flat_map(|method| method.instructions.iter())
        .filter(|(_, instruction)| match instruction {
            Instruction::InvokeStatic { target, .. } => {
                target.owner == owner && target.key() == *key
            }
            _ => false,
        })
        .count()
}
