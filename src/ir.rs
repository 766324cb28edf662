use std::fmt;

use ristretto_classfile::ClassFile;
use ristretto_classfile::attributes::Instruction as Bytecode;

use crate::constant_pool::ConstantIndex;
use crate::jstring::JavaString;

/// Name of the JVM static initializer.
pub(crate) const CLASS_INITIALIZER: &str = "<clinit>";

/// Intermediate representation for a parsed JVM class.
#[derive(Clone, Debug)]
pub(crate) struct Class {
    pub(crate) name: String,
    pub(crate) fields: Vec<Field>,
    pub(crate) methods: Vec<Method>,
    /// Decoded class file. Its field and method tables are rebuilt from
    /// `fields` and `methods` on encode.
    pub(crate) file: ClassFile,
    /// Pool entries the decoded code refers to.
    pub(crate) constants: ConstantIndex,
}

impl Class {
    pub(crate) fn field(&self, key: &MemberKey) -> Option<&Field> {
        self.fields.iter().find(|field| field.name == key.name && field.descriptor == key.descriptor)
    }

    pub(crate) fn method(&self, key: &MemberKey) -> Option<&Method> {
        self.methods
            .iter()
            .find(|method| method.name == key.name && method.descriptor == key.descriptor)
    }
}

/// Field and method identity inside one class.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub(crate) struct MemberKey {
    pub(crate) name: String,
    pub(crate) descriptor: String,
}

impl MemberKey {
    pub(crate) fn new(name: impl Into<String>, descriptor: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            descriptor: descriptor.into(),
        }
    }
}

impl fmt::Display for MemberKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.descriptor)
    }
}

#[derive(Clone, Debug)]
pub(crate) struct Field {
    pub(crate) name: String,
    pub(crate) descriptor: String,
    pub(crate) raw: ristretto_classfile::Field,
}

impl Field {
    pub(crate) fn key(&self) -> MemberKey {
        MemberKey::new(&self.name, &self.descriptor)
    }
}

#[derive(Clone, Debug)]
pub(crate) struct Method {
    pub(crate) name: String,
    pub(crate) descriptor: String,
    /// Empty for abstract and native methods.
    pub(crate) instructions: InstructionList,
    /// Decoded method. Its `Code` attribute still holds the original
    /// instructions; node `i` of `instructions` started out as entry `i`.
    pub(crate) raw: ristretto_classfile::Method,
}

impl Method {
    pub(crate) fn key(&self) -> MemberKey {
        MemberKey::new(&self.name, &self.descriptor)
    }
}

/// Stable handle of an instruction slot.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub(crate) struct NodeId(usize);

impl NodeId {
    /// Handle of the `index`-th instruction pushed into a list.
    pub(crate) fn from_index(index: usize) -> Self {
        Self(index)
    }
}

#[derive(Clone, Debug)]
struct Slot {
    instruction: Option<Instruction>,
    prev: Option<NodeId>,
    next: Option<NodeId>,
}

/// Doubly linked instruction sequence stored in an arena.
///
/// Removing a node leaves its slot vacant with its forward link intact, so a
/// cursor parked on a removed node can still step to the next live node and
/// branch targets that pointed at it resolve forward.
#[derive(Clone, Debug, Default)]
pub(crate) struct InstructionList {
    slots: Vec<Slot>,
    head: Option<NodeId>,
    tail: Option<NodeId>,
    len: usize,
}

impl InstructionList {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn first(&self) -> Option<NodeId> {
        self.head
    }

    pub(crate) fn push(&mut self, instruction: Instruction) -> NodeId {
        let id = NodeId(self.slots.len());
        self.slots.push(Slot {
            instruction: Some(instruction),
            prev: self.tail,
            next: None,
        });
        match self.tail {
            Some(tail) => self.slots[tail.0].next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        self.len += 1;
        id
    }

    pub(crate) fn get(&self, id: NodeId) -> Option<&Instruction> {
        self.slots.get(id.0).and_then(|slot| slot.instruction.as_ref())
    }

    pub(crate) fn is_live(&self, id: NodeId) -> bool {
        self.get(id).is_some()
    }

    /// Next live node after `id`; works for vacant nodes too.
    pub(crate) fn next(&self, id: NodeId) -> Option<NodeId> {
        let mut cursor = self.slots.get(id.0)?.next;
        while let Some(candidate) = cursor {
            if self.is_live(candidate) {
                return Some(candidate);
            }
            cursor = self.slots[candidate.0].next;
        }
        None
    }

    /// `id` itself when live, otherwise the first live node after it.
    pub(crate) fn resolve(&self, id: NodeId) -> Option<NodeId> {
        if self.is_live(id) { Some(id) } else { self.next(id) }
    }

    /// Collect `N` consecutive live instructions starting at `id`.
    pub(crate) fn window<const N: usize>(&self, id: NodeId) -> Option<[(NodeId, &Instruction); N]> {
        let mut ids = [id; N];
        for index in 1..N {
            ids[index] = self.next(ids[index - 1])?;
        }
        let mut window = [(id, self.get(id)?); N];
        for (slot, node) in window.iter_mut().zip(ids) {
            *slot = (node, self.get(node)?);
        }
        Some(window)
    }

    pub(crate) fn replace(&mut self, id: NodeId, instruction: Instruction) -> Option<Instruction> {
        let slot = self.slots.get_mut(id.0)?;
        if slot.instruction.is_none() {
            return None;
        }
        slot.instruction.replace(instruction)
    }

    /// Unlink a live node. The slot keeps its forward link.
    pub(crate) fn remove(&mut self, id: NodeId) -> Option<Instruction> {
        let instruction = self.slots.get_mut(id.0)?.instruction.take()?;
        let (prev, next) = (self.slots[id.0].prev, self.slots[id.0].next);
        match prev {
            Some(prev) => self.slots[prev.0].next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.slots[next.0].prev = prev,
            None => self.tail = prev,
        }
        self.len -= 1;
        Some(instruction)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (NodeId, &Instruction)> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let id = cursor?;
            cursor = self.next(id);
            self.get(id).map(|instruction| (id, instruction))
        })
    }

    #[cfg(test)]
    pub(crate) fn ids(&self) -> Vec<NodeId> {
        self.iter().map(|(id, _)| id).collect()
    }
}

impl FromIterator<Instruction> for InstructionList {
    fn from_iter<T: IntoIterator<Item = Instruction>>(iter: T) -> Self {
        let mut list = Self::new();
        for instruction in iter {
            list.push(instruction);
        }
        list
    }
}

/// Owner, name and descriptor of a field or method reference.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub(crate) struct MemberRef {
    pub(crate) owner: String,
    pub(crate) name: String,
    pub(crate) descriptor: String,
}

impl MemberRef {
    pub(crate) fn new(
        owner: impl Into<String>,
        name: impl Into<String>,
        descriptor: impl Into<String>,
    ) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
            descriptor: descriptor.into(),
        }
    }

    pub(crate) fn key(&self) -> MemberKey {
        MemberKey::new(&self.name, &self.descriptor)
    }
}

impl fmt::Display for MemberRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}:{}", self.owner, self.name, self.descriptor)
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub(crate) enum Width {
    Int,
    Long,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub(crate) enum BitwiseOp {
    And,
    Or,
    Xor,
}

impl BitwiseOp {
    pub(crate) fn apply_int(self, left: i32, right: i32) -> i32 {
        match self {
            Self::And => left & right,
            Self::Or => left | right,
            Self::Xor => left ^ right,
        }
    }

    pub(crate) fn apply_long(self, left: i64, right: i64) -> i64 {
        match self {
            Self::And => left & right,
            Self::Or => left | right,
            Self::Xor => left ^ right,
        }
    }
}

/// Array element family of the load and store opcodes the passes track.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub(crate) enum ElementKind {
    Int,
    Long,
    Reference,
}

/// Array allocation: `newarray int`, `newarray long` or `anewarray <class>`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum ArrayKind {
    Int,
    Long,
    Reference(String),
}

/// Instruction as seen by the rewrite passes.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Instruction {
    IntConst(i32),
    LongConst(i64),
    StringConst(JavaString),
    NullConst,
    Bitwise { width: Width, op: BitwiseOp },
    GetStatic(MemberRef),
    PutStatic(MemberRef),
    NewArray(ArrayKind),
    ArrayLoad(ElementKind),
    ArrayStore(ElementKind),
    InvokeStatic { target: MemberRef, interface: bool },
    Opaque(Opaque),
}

impl Instruction {
    pub(crate) fn as_int(&self) -> Option<i32> {
        match self {
            Self::IntConst(value) => Some(*value),
            _ => None,
        }
    }

    pub(crate) fn as_long(&self) -> Option<i64> {
        match self {
            Self::LongConst(value) => Some(*value),
            _ => None,
        }
    }

    pub(crate) fn as_string(&self) -> Option<&JavaString> {
        match self {
            Self::StringConst(value) => Some(value),
            _ => None,
        }
    }
}

/// Instruction passed through untouched.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Opaque {
    /// No operand refers to a code index.
    Plain(Bytecode),
    /// Branch or switch. `targets` follows the operand order of `instruction`
    /// so the encoder can write relocated indices back.
    Jump {
        instruction: Bytecode,
        targets: Vec<NodeId>,
    },
}

impl Opaque {
    pub(crate) fn plain(instruction: Bytecode) -> Instruction {
        Instruction::Opaque(Self::Plain(instruction))
    }
}
