use log::debug;

use crate::ir::{Class, ElementKind, Instruction, InstructionList, MemberRef, NodeId};
use crate::passes::strings;
use crate::passes::{Pass, PassMetadata, TransformContext, TransformError};

/// Replaces `getstatic T; <i>; xaload` with the value stored at `T[i]` in the
/// static initializer.
pub(crate) struct TablePass {
    kind: ElementKind,
}

impl TablePass {
    pub(crate) const INT: Self = Self {
        kind: ElementKind::Int,
    };
    pub(crate) const LONG: Self = Self {
        kind: ElementKind::Long,
    };
    pub(crate) const STRING: Self = Self {
        kind: ElementKind::Reference,
    };
}

struct UseSite {
    field: MemberRef,
    index: i32,
    tail: [NodeId; 2],
}

/// Matched `getstatic T; <i>; <value>; [invokestatic helper;] xastore`.
pub(crate) struct StoreSite {
    pub(crate) nodes: Vec<NodeId>,
    pub(crate) index: i32,
    pub(crate) value: Instruction,
    pub(crate) helper: Option<MemberRef>,
}

impl Pass for TablePass {
    fn metadata(&self) -> PassMetadata {
        match self.kind {
            ElementKind::Int => PassMetadata {
                id: "resolve-int-table",
                description: "Inline constant loads from static int tables",
            },
            ElementKind::Long => PassMetadata {
                id: "resolve-long-table",
                description: "Inline constant loads from static long tables",
            },
            ElementKind::Reference => PassMetadata {
                id: "resolve-string-table",
                description: "Inline and decrypt loads from static string tables",
            },
        }
    }

    fn run(
        &self,
        class: &mut Class,
        context: &mut TransformContext,
    ) -> Result<usize, TransformError> {
        let mut resolved = 0;
        for method_index in 0..class.methods.len() {
            let mut cursor = class.methods[method_index].instructions.first();
            while let Some(id) = cursor {
                let site = match_use_site(
                    &class.methods[method_index].instructions,
                    id,
                    &class.name,
                    self.kind,
                );
                if let Some(site) = site {
                    let value = self.resolve(class, context, &site)?;
                    let method = &mut class.methods[method_index];
                    debug!(
                        "{}: {}[{}] in {}{} -> {:?}",
                        class.name, site.field, site.index, method.name, method.descriptor, value
                    );
                    for node in site.tail {
                        method.instructions.remove(node);
                    }
                    method.instructions.replace(id, value);
                    resolved += 1;
                }
                cursor = class.methods[method_index].instructions.next(id);
            }
        }
        Ok(resolved)
    }
}

impl TablePass {
    /// Value for one use site, consuming its store from the initializer.
    ///
    /// The first resolution of a (field, index) slot is memoised, so later
    /// reads of that slot get the same value even though its store is gone.
    /// Only a slot that never had a matching store falls back to zero or
    /// null. `repeated_slot_reads_share_one_store` pins this.
    fn resolve(
        &self,
        class: &mut Class,
        context: &mut TransformContext,
        site: &UseSite,
    ) -> Result<Instruction, TransformError> {
        if let Some(value) = context.resolved_value(&site.field, site.index) {
            let value = value.clone();
            self.count(context);
            return Ok(value);
        }

        let initializer = &class.methods[context.initializer].instructions;
        let Some(store) = find_store_at(initializer, &site.field, site.index, self.kind, &class.name)
        else {
            context.stats.defaulted += 1;
            return Ok(default_value(self.kind));
        };

        if class.field(&site.field.key()).is_none() {
            return Err(TransformError::missing_field(&site.field));
        }

        let value = match (&store.value, &store.helper) {
            (Instruction::StringConst(cipher), Some(helper)) => {
                let helper_key = helper.key();
                let method = class
                    .method(&helper_key)
                    .ok_or_else(|| TransformError::missing_method(helper))?;
                context.marked_methods.insert(helper_key);
                Instruction::StringConst(strings::decrypt(
                    &class.name,
                    &helper.name,
                    &method.instructions,
                    cipher,
                ))
            }
            (value, _) => value.clone(),
        };

        context.marked_fields.insert(site.field.key());
        let initializer = &mut class.methods[context.initializer].instructions;
        for node in &store.nodes {
            initializer.remove(*node);
        }
        context.remember(&site.field, site.index, value.clone());
        self.count(context);
        Ok(value)
    }

    fn count(&self, context: &mut TransformContext) {
        match self.kind {
            ElementKind::Int => context.stats.resolved_ints += 1,
            ElementKind::Long => context.stats.resolved_longs += 1,
            ElementKind::Reference => context.stats.resolved_strings += 1,
        }
    }
}

fn match_use_site(
    instructions: &InstructionList,
    id: NodeId,
    class_name: &str,
    kind: ElementKind,
) -> Option<UseSite> {
    let [(_, head), (index_id, index), (load_id, load)] = instructions.window::<3>(id)?;
    let Instruction::GetStatic(field) = head else {
        return None;
    };
    if field.owner != class_name || *load != Instruction::ArrayLoad(kind) {
        return None;
    }
    Some(UseSite {
        field: field.clone(),
        index: index.as_int()?,
        tail: [index_id, load_id],
    })
}

/// First store into `field[index]` in initializer order.
fn find_store_at(
    initializer: &InstructionList,
    field: &MemberRef,
    index: i32,
    kind: ElementKind,
    class_name: &str,
) -> Option<StoreSite> {
    initializer.iter().find_map(|(id, _)| {
        match_store(initializer, id, field, kind, class_name).filter(|store| store.index == index)
    })
}

/// Store into `field` starting at `id`, at any index.
pub(crate) fn match_store(
    instructions: &InstructionList,
    id: NodeId,
    field: &MemberRef,
    kind: ElementKind,
    class_name: &str,
) -> Option<StoreSite> {
    match kind {
        ElementKind::Int | ElementKind::Long => {
            let [(head_id, head), (index_id, index), (value_id, value), (store_id, store)] =
                instructions.window::<4>(id)?;
            let value_matches = match kind {
                ElementKind::Int => value.as_int().is_some(),
                _ => value.as_long().is_some(),
            };
            if !is_table_read(head, field)
                || !value_matches
                || *store != Instruction::ArrayStore(kind)
            {
                return None;
            }
            Some(StoreSite {
                nodes: vec![head_id, index_id, value_id, store_id],
                index: index.as_int()?,
                value: value.clone(),
                helper: None,
            })
        }
        ElementKind::Reference => {
            let [
                (head_id, head),
                (index_id, index),
                (value_id, value),
                (call_id, call),
                (store_id, store),
            ] = instructions.window::<5>(id)?;
            let Instruction::InvokeStatic { target, .. } = call else {
                return None;
            };
            if !is_table_read(head, field)
                || value.as_string().is_none()
                || target.owner != class_name
                || *store != Instruction::ArrayStore(ElementKind::Reference)
            {
                return None;
            }
            Some(StoreSite {
                nodes: vec![head_id, index_id, value_id, call_id, store_id],
                index: index.as_int()?,
                value: value.clone(),
                helper: Some(target.clone()),
            })
        }
    }
}

fn is_table_read(instruction: &Instruction, field: &MemberRef) -> bool {
    matches!(instruction, Instruction::GetStatic(read) if read == field)
}

fn default_value(kind: ElementKind) -> Instruction {
    match kind {
        ElementKind::Int => Instruction::IntConst(0),
        ElementKind::Long => Instruction::LongConst(0),
        ElementKind::Reference => Instruction::NullConst,
    }
}
