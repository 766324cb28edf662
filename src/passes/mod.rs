use std::collections::{BTreeSet, HashMap};

use log::debug;
use serde::Serialize;
use thiserror::Error;

use crate::ir::{CLASS_INITIALIZER, Class, Instruction, MemberKey, MemberRef};

pub(crate) mod cleanup;
pub(crate) mod fold;
pub(crate) mod strings;
pub(crate) mod tables;

use cleanup::OrphanAllocationPass;
use fold::FoldPass;
use tables::TablePass;

/// How `lconst a; lconst b; l<op>` is folded.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum LongFoldMode {
    /// `a <op> b`.
    #[default]
    Combine,
    /// `a <op> a`, matching the historical tool output.
    Legacy,
}

/// Engine configuration.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct TransformOptions {
    pub(crate) long_fold: LongFoldMode,
}

/// Class shapes the rewrite engine does not understand.
#[derive(Debug, Error)]
pub(crate) enum TransformError {
    #[error("table store references undeclared field {owner}.{name}:{descriptor}")]
    MissingField {
        owner: String,
        name: String,
        descriptor: String,
    },
    #[error("string store calls undeclared helper {owner}.{name}{descriptor}")]
    MissingMethod {
        owner: String,
        name: String,
        descriptor: String,
    },
}

impl TransformError {
    pub(crate) fn missing_field(field: &MemberRef) -> Self {
        Self::MissingField {
            owner: field.owner.clone(),
            name: field.name.clone(),
            descriptor: field.descriptor.clone(),
        }
    }

    pub(crate) fn missing_method(method: &MemberRef) -> Self {
        Self::MissingMethod {
            owner: method.owner.clone(),
            name: method.name.clone(),
            descriptor: method.descriptor.clone(),
        }
    }
}

/// Rewrite counters for one class.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub(crate) struct TransformStats {
    pub(crate) folded: usize,
    pub(crate) resolved_ints: usize,
    pub(crate) resolved_longs: usize,
    pub(crate) resolved_strings: usize,
    /// Use sites with no matching store, replaced by the element default.
    pub(crate) defaulted: usize,
    pub(crate) stripped_stores: usize,
    pub(crate) removed_fields: usize,
    pub(crate) removed_methods: usize,
    pub(crate) removed_allocations: usize,
}

impl TransformStats {
    pub(crate) fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub(crate) fn add(&mut self, other: &Self) {
        self.folded += other.folded;
        self.resolved_ints += other.resolved_ints;
        self.resolved_longs += other.resolved_longs;
        self.resolved_strings += other.resolved_strings;
        self.defaulted += other.defaulted;
        self.stripped_stores += other.stripped_stores;
        self.removed_fields += other.removed_fields;
        self.removed_methods += other.removed_methods;
        self.removed_allocations += other.removed_allocations;
    }
}

/// State shared by the passes of one `transform` call.
pub(crate) struct TransformContext {
    pub(crate) options: TransformOptions,
    /// Index of the static initializer in `Class::methods`.
    pub(crate) initializer: usize,
    pub(crate) marked_fields: BTreeSet<MemberKey>,
    pub(crate) marked_methods: BTreeSet<MemberKey>,
    pub(crate) removed_fields: BTreeSet<MemberKey>,
    resolved: HashMap<(MemberKey, i32), Instruction>,
    pub(crate) stats: TransformStats,
}

impl TransformContext {
    pub(crate) fn new(options: TransformOptions, initializer: usize) -> Self {
        Self {
            options,
            initializer,
            marked_fields: BTreeSet::new(),
            marked_methods: BTreeSet::new(),
            removed_fields: BTreeSet::new(),
            resolved: HashMap::new(),
            stats: TransformStats::default(),
        }
    }

    /// Value already taken out of the initializer for `field[index]`.
    pub(crate) fn resolved_value(&self, field: &MemberRef, index: i32) -> Option<&Instruction> {
        self.resolved.get(&(field.key(), index))
    }

    pub(crate) fn remember(&mut self, field: &MemberRef, index: i32, value: Instruction) {
        self.resolved.insert((field.key(), index), value);
    }
}

/// Metadata describing a rewrite pass.
#[derive(Clone, Debug)]
pub(crate) struct PassMetadata {
    pub(crate) id: &'static str,
    pub(crate) description: &'static str,
}

/// One scan over a class. Returns how many rewrites it made.
pub(crate) trait Pass {
    fn metadata(&self) -> PassMetadata;
    fn run(&self, class: &mut Class, context: &mut TransformContext)
    -> Result<usize, TransformError>;
}

/// Index of the first method named `<clinit>`.
pub(crate) fn initializer_index(class: &Class) -> Option<usize> {
    class
        .methods
        .iter()
        .position(|method| method.name == CLASS_INITIALIZER)
}

/// Rewrite every scaffold of `class` in place.
///
/// Classes without a static initializer are returned untouched with empty
/// stats.
pub(crate) fn transform(
    class: &mut Class,
    options: &TransformOptions,
) -> Result<TransformStats, TransformError> {
    let Some(initializer) = initializer_index(class) else {
        debug!("{}: no static initializer", class.name);
        return Ok(TransformStats::default());
    };
    let mut context = TransformContext::new(*options, initializer);

    let resolution: [&dyn Pass; 5] = [
        &FoldPass::LONG,
        &FoldPass::INT,
        &TablePass::INT,
        &TablePass::LONG,
        &TablePass::STRING,
    ];
    for pass in resolution {
        run_to_fixed_point(pass, class, &mut context)?;
    }

    cleanup::remove_marked(class, &mut context);
    run_to_fixed_point(&OrphanAllocationPass, class, &mut context)?;
    cleanup::clear_local_variables(class);

    Ok(context.stats)
}

fn run_to_fixed_point(
    pass: &dyn Pass,
    class: &mut Class,
    context: &mut TransformContext,
) -> Result<(), TransformError> {
    let metadata = pass.metadata();
    debug!("{}: {} ({})", class.name, metadata.id, metadata.description);
    let mut iteration = 0usize;
    loop {
        let rewritten = pass.run(class, context)?;
        iteration += 1;
        debug!(
            "{}: {} iteration {} rewrote {}",
            class.name, metadata.id, iteration, rewritten
        );
        if rewritten == 0 {
            return Ok(());
        }
    }
}
