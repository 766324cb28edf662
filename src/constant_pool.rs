use std::collections::HashMap;

use anyhow::{Context, Result};
use ristretto_classfile::{Constant, ConstantPool};

use crate::ir::MemberRef;

/// Pool entry named by value instead of by index.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub(crate) enum PoolKey {
    Integer(i32),
    Long(i64),
    String(String),
    Class(String),
    Field(MemberRef),
    Method(MemberRef),
    InterfaceMethod(MemberRef),
}

/// Value-to-index map over the entries of one constant pool.
///
/// Every lookup made while decoding records where its entry lives, so
/// lowering an untouched instruction lands on the index it was read from.
/// Entries the passes introduce are appended to the pool once and reused
/// afterwards. Existing entries never move, including ciphertexts nothing
/// loads any more.
#[derive(Clone, Debug, Default)]
pub(crate) struct ConstantIndex {
    entries: HashMap<PoolKey, u16>,
}

impl ConstantIndex {
    /// Integer, long or string constant behind an `ldc` at `index`, or
    /// `None` for any other loadable kind.
    pub(crate) fn loadable(&mut self, pool: &ConstantPool, index: u16) -> Result<Option<PoolKey>> {
        let key = match pool.try_get(index)? {
            Constant::Integer(value) => PoolKey::Integer(*value),
            Constant::Long(value) => PoolKey::Long(*value),
            Constant::String(utf8_index) => PoolKey::String(utf8(pool, *utf8_index)?),
            _ => return Ok(None),
        };
        self.record(key.clone(), index);
        Ok(Some(key))
    }

    pub(crate) fn class(&mut self, pool: &ConstantPool, index: u16) -> Result<String> {
        let name = class_name(pool, index)?;
        self.record(PoolKey::Class(name.clone()), index);
        Ok(name)
    }

    pub(crate) fn field_ref(&mut self, pool: &ConstantPool, index: u16) -> Result<MemberRef> {
        let Constant::FieldRef {
            class_index,
            name_and_type_index,
        } = pool.try_get(index)?
        else {
            anyhow::bail!("constant #{} is not a field reference", index);
        };
        let field = member_ref(pool, *class_index, *name_and_type_index)?;
        self.record(PoolKey::Field(field.clone()), index);
        Ok(field)
    }

    /// Method at `index`, and whether it is an interface method.
    pub(crate) fn method_ref(
        &mut self,
        pool: &ConstantPool,
        index: u16,
    ) -> Result<(MemberRef, bool)> {
        let (class_index, name_and_type_index, interface) = match pool.try_get(index)? {
            Constant::MethodRef {
                class_index,
                name_and_type_index,
            } => (*class_index, *name_and_type_index, false),
            Constant::InterfaceMethodRef {
                class_index,
                name_and_type_index,
            } => (*class_index, *name_and_type_index, true),
            _ => anyhow::bail!("constant #{} is not a method reference", index),
        };
        let method = member_ref(pool, class_index, name_and_type_index)?;
        let key = if interface {
            PoolKey::InterfaceMethod(method.clone())
        } else {
            PoolKey::Method(method.clone())
        };
        self.record(key, index);
        Ok((method, interface))
    }

    /// Index of `key`, appending it to `pool` on first use.
    pub(crate) fn intern(&mut self, pool: &mut ConstantPool, key: &PoolKey) -> Result<u16> {
        if let Some(index) = self.entries.get(key) {
            return Ok(*index);
        }
        let index = match key {
            PoolKey::Integer(value) => pool.add_integer(*value)?,
            PoolKey::Long(value) => pool.add_long(*value)?,
            PoolKey::String(value) => pool.add_string(value.as_str())?,
            PoolKey::Class(name) => pool.add_class(name.as_str())?,
            PoolKey::Field(field) => {
                let class_index = self.intern(pool, &PoolKey::Class(field.owner.clone()))?;
                pool.add_field_ref(class_index, field.name.as_str(), field.descriptor.as_str())?
            }
            PoolKey::Method(method) => {
                let class_index = self.intern(pool, &PoolKey::Class(method.owner.clone()))?;
                pool.add_method_ref(class_index, method.name.as_str(), method.descriptor.as_str())?
            }
            PoolKey::InterfaceMethod(method) => {
                let class_index = self.intern(pool, &PoolKey::Class(method.owner.clone()))?;
                pool.add_interface_method_ref(
                    class_index,
                    method.name.as_str(),
                    method.descriptor.as_str(),
                )?
            }
        };
        self.entries.insert(key.clone(), index);
        Ok(index)
    }

    fn record(&mut self, key: PoolKey, index: u16) {
        self.entries.entry(key).or_insert(index);
    }
}

pub(crate) fn utf8(pool: &ConstantPool, index: u16) -> Result<String> {
    Ok(pool
        .try_get_utf8(index)
        .with_context(|| format!("constant #{} is not a Utf8 entry", index))?
        .to_string())
}

pub(crate) fn class_name(pool: &ConstantPool, index: u16) -> Result<String> {
    let Constant::Class(name_index) = pool.try_get(index)? else {
        anyhow::bail!("constant #{} is not a class", index);
    };
    utf8(pool, *name_index)
}

fn member_ref(pool: &ConstantPool, class_index: u16, name_and_type_index: u16) -> Result<MemberRef> {
    let owner = class_name(pool, class_index)?;
    let Constant::NameAndType {
        name_index,
        descriptor_index,
    } = pool.try_get(name_and_type_index)?
    else {
        anyhow::bail!("constant #{} is not a name and type", name_and_type_index);
    };
    Ok(MemberRef::new(
        owner,
        utf8(pool, *name_index)?,
        utf8(pool, *descriptor_index)?,
    ))
}
