//! Call-site and prototype descriptors.
//!
//! These types are the interface to the prototype-modeling collaborator. The guard pass
//! asks each call site how it affects a storage range and whether the range could be one of
//! its parameters or return values; the answers decide which synthetic operations are
//! inserted around the call.

use crate::ir::{OpId, Storage};

/// How a call affects a storage range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EffectType {
    /// The call preserves the range.
    Unaffected,
    /// The call overwrites the range with an unrelated value.
    KilledByCall,
    /// The call may or may not modify the range.
    Unknown,
    /// The range holds the call's return address.
    ReturnAddress,
}

/// Effect of a call on one storage range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectRecord {
    /// Affected storage.
    pub storage: Storage,
    /// Kind of effect.
    pub effect: EffectType,
}

/// How a storage range relates to the parameter slots of a prototype.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Containment {
    /// The range shares nothing with any slot.
    NoContainment,
    /// A slot contains the range, starting at the slot's first byte.
    ContainsJustified,
    /// A slot contains the range, but not at its first byte.
    ContainsUnjustified,
    /// The range contains at least one whole slot.
    ContainedBy,
}

/// Parameter or return-value trials that are being recovered for a prototype.
#[derive(Debug, Clone, Default)]
pub struct ParamActive {
    trials: Vec<Storage>,
}

impl ParamActive {
    /// Creates an empty trial set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `storage` as a trial.
    pub fn register_trial(&mut self, storage: Storage) {
        self.trials.push(storage);
    }

    /// Index of the trial matching `storage` exactly.
    pub fn which_trial(&self, storage: &Storage) -> Option<usize> {
        self.trials.iter().position(|t| t == storage)
    }

    /// Registered trials.
    pub fn trials(&self) -> &[Storage] {
        &self.trials
    }
}

fn characterize(slots: &[Storage], range: &Storage) -> Containment {
    let mut result = Containment::NoContainment;
    for slot in slots {
        if slot.contains_justified(range) {
            return Containment::ContainsJustified;
        }
        if slot.contains(range) {
            result = Containment::ContainsUnjustified;
        } else if range.contains(slot) && result == Containment::NoContainment {
            result = Containment::ContainedBy;
        }
    }
    result
}

fn biggest_contained(slots: &[Storage], range: &Storage) -> Option<Storage> {
    slots
        .iter()
        .filter(|slot| range.contains(slot))
        .max_by_key(|slot| (slot.size, std::cmp::Reverse(slot.addr)))
        .copied()
}

/// Descriptor for one call site.
#[derive(Debug, Clone)]
pub struct CallSpec {
    op: OpId,
    effects: Vec<EffectRecord>,
    default_effect: EffectType,
    input_slots: Vec<Storage>,
    output_slots: Vec<Storage>,
    active_input: Option<ParamActive>,
    active_output: Option<ParamActive>,
    stack_offset: Option<u64>,
}

impl CallSpec {
    /// Creates a descriptor for the call `op` with every range classified as
    /// [`EffectType::Unknown`].
    #[must_use]
    pub fn new(op: OpId) -> Self {
        Self {
            op,
            effects: Vec::new(),
            default_effect: EffectType::Unknown,
            input_slots: Vec::new(),
            output_slots: Vec::new(),
            active_input: None,
            active_output: None,
            stack_offset: None,
        }
    }

    /// Adds an explicit effect for `storage`.
    #[must_use]
    pub fn with_effect(mut self, storage: Storage, effect: EffectType) -> Self {
        self.effects.push(EffectRecord { storage, effect });
        self
    }

    /// Sets the effect on ranges not covered by an explicit record.
    #[must_use]
    pub fn with_default_effect(mut self, effect: EffectType) -> Self {
        self.default_effect = effect;
        self
    }

    /// Declares candidate input slots and starts recovering input trials.
    ///
    /// Stack slots are expressed relative to the stack pointer at the call.
    #[must_use]
    pub fn with_active_inputs(mut self, slots: Vec<Storage>) -> Self {
        self.input_slots = slots;
        self.active_input = Some(ParamActive::new());
        self
    }

    /// Declares candidate output slots and starts recovering output trials.
    #[must_use]
    pub fn with_active_outputs(mut self, slots: Vec<Storage>) -> Self {
        self.output_slots = slots;
        self.active_output = Some(ParamActive::new());
        self
    }

    /// Sets the stack pointer offset at the call, relative to function entry.
    #[must_use]
    pub fn with_stack_offset(mut self, offset: u64) -> Self {
        self.stack_offset = Some(offset);
        self
    }

    /// The call operation.
    pub fn op(&self) -> OpId {
        self.op
    }

    /// Effect of the call on `range`.
    ///
    /// A record containing the range decides; a record that only partially overlaps makes
    /// the effect unknown.
    pub fn effect(&self, range: &Storage) -> EffectType {
        let mut partial = false;
        for record in &self.effects {
            if record.storage.contains(range) {
                return record.effect;
            }
            if record.storage.overlaps(range) {
                partial = true;
            }
        }
        if partial {
            EffectType::Unknown
        } else {
            self.default_effect
        }
    }

    /// True while input trials are being recovered.
    pub fn is_input_active(&self) -> bool {
        self.active_input.is_some()
    }

    /// True while output trials are being recovered.
    pub fn is_output_active(&self) -> bool {
        self.active_output.is_some()
    }

    /// Input trial set.
    pub fn active_input(&self) -> Option<&ParamActive> {
        self.active_input.as_ref()
    }

    /// Mutable input trial set.
    pub fn active_input_mut(&mut self) -> Option<&mut ParamActive> {
        self.active_input.as_mut()
    }

    /// Output trial set.
    pub fn active_output(&self) -> Option<&ParamActive> {
        self.active_output.as_ref()
    }

    /// Mutable output trial set.
    pub fn active_output_mut(&mut self) -> Option<&mut ParamActive> {
        self.active_output.as_mut()
    }

    /// Relation of `range` to the input slots.
    pub fn characterize_as_input(&self, range: &Storage) -> Containment {
        characterize(&self.input_slots, range)
    }

    /// Relation of `range` to the output slots.
    pub fn characterize_as_output(&self, range: &Storage) -> Containment {
        characterize(&self.output_slots, range)
    }

    /// Largest input slot lying entirely inside `range`.
    pub fn biggest_contained_input(&self, range: &Storage) -> Option<Storage> {
        biggest_contained(&self.input_slots, range)
    }

    /// Stack pointer offset at the call, if known.
    pub fn stack_offset(&self) -> Option<u64> {
        self.stack_offset
    }
}

/// The function's own prototype, as far as return values are concerned.
#[derive(Debug, Clone, Default)]
pub struct FuncProto {
    output_slots: Vec<Storage>,
    active_output: Option<ParamActive>,
}

impl FuncProto {
    /// A prototype whose return value is already decided.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A prototype recovering its return value from the given candidate slots.
    #[must_use]
    pub fn with_active_outputs(slots: Vec<Storage>) -> Self {
        Self {
            output_slots: slots,
            active_output: Some(ParamActive::new()),
        }
    }

    /// Relation of `range` to the output slots.
    pub fn characterize_as_output(&self, range: &Storage) -> Containment {
        characterize(&self.output_slots, range)
    }

    /// Largest output slot lying entirely inside `range`.
    pub fn biggest_contained_output(&self, range: &Storage) -> Option<Storage> {
        biggest_contained(&self.output_slots, range)
    }

    /// Output trial set.
    pub fn active_output(&self) -> Option<&ParamActive> {
        self.active_output.as_ref()
    }

    /// Mutable output trial set.
    pub fn active_output_mut(&mut self) -> Option<&mut ParamActive> {
        self.active_output.as_mut()
    }
}
