/// Register store holding the operator's logical register map
///
/// The store owns four ordered collections (holding registers, input registers,
/// coils and discrete inputs). Every mutation goes through an explicit method
/// that returns a [`ChangeSet`]; consumers apply the deltas instead of
/// subscribing to individual entries.
///
/// Raw words and their display text are always recomputed together, so a
/// refresh never has to be forced from outside.

use std::fmt;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::codec::{self, DataType, RegisterValue, WordOrder};
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::ModbusFunction;

/// The four Modbus data tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RegisterKind {
    HoldingRegisters,
    InputRegisters,
    Coils,
    DiscreteInputs,
}

impl RegisterKind {
    pub const ALL: [RegisterKind; 4] = [
        RegisterKind::HoldingRegisters,
        RegisterKind::InputRegisters,
        RegisterKind::Coils,
        RegisterKind::DiscreteInputs,
    ];

    /// Single-bit tables (coils, discrete inputs)
    pub fn is_bit(self) -> bool {
        matches!(self, RegisterKind::Coils | RegisterKind::DiscreteInputs)
    }

    /// Tables a remote master may write to
    pub fn is_writable(self) -> bool {
        matches!(self, RegisterKind::HoldingRegisters | RegisterKind::Coils)
    }

    /// Function code used to read this table
    pub fn read_function(self) -> ModbusFunction {
        match self {
            RegisterKind::HoldingRegisters => ModbusFunction::ReadHoldingRegisters,
            RegisterKind::InputRegisters => ModbusFunction::ReadInputRegisters,
            RegisterKind::Coils => ModbusFunction::ReadCoils,
            RegisterKind::DiscreteInputs => ModbusFunction::ReadDiscreteInputs,
        }
    }
}

impl fmt::Display for RegisterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RegisterKind::HoldingRegisters => "holding registers",
            RegisterKind::InputRegisters => "input registers",
            RegisterKind::Coils => "coils",
            RegisterKind::DiscreteInputs => "discrete inputs",
        };
        f.write_str(name)
    }
}

/// Stable identity of a store entry
///
/// Addresses move during resequencing; ids do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryId(u64);

impl EntryId {
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A logical register value spanning one or more words
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterDefinition {
    id: EntryId,
    address: u16,
    data_type: DataType,
    words: Vec<u16>,
    display: String,
    name: String,
    description: String,
    recently_modified: bool,
}

impl RegisterDefinition {
    /// A zero-valued entry of `data_type` at `address`
    pub fn new(address: u16, data_type: DataType) -> Self {
        let words = vec![0; data_type.fixed_span().unwrap_or(1)];
        let display = codec::display(&words, data_type, WordOrder::default());
        Self {
            id: EntryId(0),
            address,
            data_type,
            words,
            display,
            name: String::new(),
            description: String::new(),
            recently_modified: false,
        }
    }

    pub fn with_name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_description<S: Into<String>>(mut self, description: S) -> Self {
        self.description = description.into();
        self
    }

    /// Set the initial raw words
    ///
    /// Fixed-width types are truncated or zero-padded to their span.
    pub fn with_words(mut self, words: &[u16]) -> Self {
        self.words = fit_words(words, self.data_type);
        self.refresh(WordOrder::default());
        self
    }

    pub fn id(&self) -> EntryId {
        self.id
    }

    pub fn address(&self) -> u16 {
        self.address
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn words(&self) -> &[u16] {
        &self.words
    }

    /// Text the operator sees and edits
    pub fn display(&self) -> &str {
        &self.display
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn recently_modified(&self) -> bool {
        self.recently_modified
    }

    pub fn word_span(&self) -> usize {
        self.words.len()
    }

    /// Whether `address` falls inside this entry's span
    pub fn covers(&self, address: u16) -> bool {
        let start = self.address as usize;
        let address = address as usize;
        address >= start && address < start + self.word_span()
    }

    /// Decoded value under `order`
    pub fn value(&self, order: WordOrder) -> Option<RegisterValue> {
        codec::decode(&self.words, self.data_type, order).map(|decoded| decoded.value)
    }

    fn refresh(&mut self, order: WordOrder) {
        self.display = codec::display(&self.words, self.data_type, order);
    }

    fn value_change(&self) -> FieldChange {
        FieldChange::Value {
            words: self.words.clone(),
            display: self.display.clone(),
        }
    }
}

/// A single-bit coil or discrete input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BooleanRegisterDefinition {
    id: EntryId,
    address: u16,
    value: bool,
    name: String,
    description: String,
    recently_modified: bool,
}

impl BooleanRegisterDefinition {
    pub fn new(address: u16, value: bool) -> Self {
        Self {
            id: EntryId(0),
            address,
            value,
            name: String::new(),
            description: String::new(),
            recently_modified: false,
        }
    }

    pub fn with_name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_description<S: Into<String>>(mut self, description: S) -> Self {
        self.description = description.into();
        self
    }

    pub fn id(&self) -> EntryId {
        self.id
    }

    pub fn address(&self) -> u16 {
        self.address
    }

    pub fn value(&self) -> bool {
        self.value
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn recently_modified(&self) -> bool {
        self.recently_modified
    }
}

/// Where a mutation came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeOrigin {
    /// Operator edit; must be pushed to the bus
    Operator,
    /// Remote master wrote to this node; must not be echoed back
    Remote,
    /// Refresh from a decoded response
    Response,
}

/// A single changed field
#[derive(Debug, Clone, PartialEq)]
pub enum FieldChange {
    Added { address: u16 },
    Removed { address: u16 },
    Address { from: u16, to: u16 },
    DataType { from: DataType, to: DataType },
    /// Raw words together with their display projection
    Value { words: Vec<u16>, display: String },
    /// Display-only refresh, the words are unchanged
    Display { display: String },
    Coil { value: bool },
    RecentlyModified { value: bool },
}

/// One (entry, field, new value) tuple
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub kind: RegisterKind,
    pub id: EntryId,
    pub field: FieldChange,
}

/// Ordered delta produced by a store mutation
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeSet {
    origin: ChangeOrigin,
    changes: Vec<Change>,
}

impl ChangeSet {
    pub fn new(origin: ChangeOrigin) -> Self {
        Self {
            origin,
            changes: Vec::new(),
        }
    }

    pub fn origin(&self) -> ChangeOrigin {
        self.origin
    }

    pub fn push(&mut self, kind: RegisterKind, id: EntryId, field: FieldChange) {
        self.changes.push(Change { kind, id, field });
    }

    /// Append another set's changes, keeping this set's origin
    pub fn extend(&mut self, other: ChangeSet) {
        self.changes.extend(other.changes);
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Change> {
        self.changes.iter()
    }

    /// Changes touching a single entry
    pub fn for_entry(&self, id: EntryId) -> impl Iterator<Item = &Change> {
        self.changes.iter().filter(move |change| change.id == id)
    }

    /// Whether the transport-facing path has to write these values out
    pub fn requires_write_back(&self) -> bool {
        self.origin == ChangeOrigin::Operator
            && self
                .changes
                .iter()
                .any(|change| matches!(change.field, FieldChange::Value { .. } | FieldChange::Coil { .. }))
    }
}

impl IntoIterator for ChangeSet {
    type Item = Change;
    type IntoIter = std::vec::IntoIter<Change>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.into_iter()
    }
}

/// One address reassignment in a resequencing plan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressMove {
    pub id: EntryId,
    pub from: u16,
    pub to: u16,
}

/// Compute contiguous addresses for register entries
///
/// Entries are walked in address order starting at 0, each advancing the
/// running address by its word span. Only entries that actually move are
/// returned.
pub fn plan_resequence(entries: &[RegisterDefinition]) -> ModbusResult<Vec<AddressMove>> {
    let mut order: Vec<&RegisterDefinition> = entries.iter().collect();
    order.sort_by_key(|entry| entry.address);

    let mut running: u32 = 0;
    let mut moves = Vec::new();
    for entry in order {
        let span = entry.word_span() as u32;
        if running + span > u16::MAX as u32 + 1 {
            return Err(ModbusError::invalid_address(entry.address, span as u16));
        }
        let to = running as u16;
        if to != entry.address {
            moves.push(AddressMove {
                id: entry.id,
                from: entry.address,
                to,
            });
        }
        running += span;
    }
    Ok(moves)
}

/// Compute contiguous addresses for coils or discrete inputs
///
/// Numbering starts at the lowest existing address rather than 0.
pub fn plan_bit_resequence(entries: &[BooleanRegisterDefinition]) -> ModbusResult<Vec<AddressMove>> {
    let mut order: Vec<&BooleanRegisterDefinition> = entries.iter().collect();
    order.sort_by_key(|entry| entry.address);

    let mut running = match order.first() {
        Some(first) => first.address as u32,
        None => return Ok(Vec::new()),
    };
    let mut moves = Vec::new();
    for entry in order {
        let to = u16::try_from(running).map_err(|_| ModbusError::invalid_address(entry.address, 1))?;
        if to != entry.address {
            moves.push(AddressMove {
                id: entry.id,
                from: entry.address,
                to,
            });
        }
        running += 1;
    }
    Ok(moves)
}

/// Serialized form of one entry, exchanged with the persistence layer
///
/// `value` is the display text. `words` holds the raw register contents and
/// wins over `value` on restore when present, so ASCII entries keep their span
/// and bytes the text cannot express.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedEntry {
    pub address: u16,
    pub data_type: DataType,
    pub value: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub words: Vec<u16>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// Serialized register map, one list per table
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    #[serde(default)]
    pub holding_registers: Vec<SerializedEntry>,
    #[serde(default)]
    pub input_registers: Vec<SerializedEntry>,
    #[serde(default)]
    pub coils: Vec<SerializedEntry>,
    #[serde(default)]
    pub discrete_inputs: Vec<SerializedEntry>,
}

impl StoreSnapshot {
    pub fn entries(&self, kind: RegisterKind) -> &[SerializedEntry] {
        match kind {
            RegisterKind::HoldingRegisters => &self.holding_registers,
            RegisterKind::InputRegisters => &self.input_registers,
            RegisterKind::Coils => &self.coils,
            RegisterKind::DiscreteInputs => &self.discrete_inputs,
        }
    }

    fn entries_mut(&mut self, kind: RegisterKind) -> &mut Vec<SerializedEntry> {
        match kind {
            RegisterKind::HoldingRegisters => &mut self.holding_registers,
            RegisterKind::InputRegisters => &mut self.input_registers,
            RegisterKind::Coils => &mut self.coils,
            RegisterKind::DiscreteInputs => &mut self.discrete_inputs,
        }
    }

    pub fn to_json(&self) -> ModbusResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> ModbusResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// The operator's register map
#[derive(Debug, Clone, Default)]
pub struct RegisterStore {
    holding_registers: Vec<RegisterDefinition>,
    input_registers: Vec<RegisterDefinition>,
    coils: Vec<BooleanRegisterDefinition>,
    discrete_inputs: Vec<BooleanRegisterDefinition>,
    word_order: WordOrder,
    next_id: u64,
}

impl RegisterStore {
    /// Create an empty store using the default word order
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_word_order(word_order: WordOrder) -> Self {
        Self {
            word_order,
            ..Self::default()
        }
    }

    /// Rebuild a store from a persisted snapshot
    ///
    /// Registers take their raw words when the snapshot carries them and
    /// otherwise parse the text with the recorded data type. Coil values accept
    /// `true`/`false` or `1`/`0`.
    pub fn from_snapshot(snapshot: &StoreSnapshot, word_order: WordOrder) -> ModbusResult<Self> {
        let mut store = Self::with_word_order(word_order);
        for kind in [RegisterKind::HoldingRegisters, RegisterKind::InputRegisters] {
            for entry in snapshot.entries(kind) {
                let words = if entry.words.is_empty() {
                    codec::encode(&entry.value, entry.data_type, word_order)?
                } else {
                    entry.words.clone()
                };
                let definition = RegisterDefinition::new(entry.address, entry.data_type)
                    .with_words(&words)
                    .with_name(entry.name.clone())
                    .with_description(entry.description.clone());
                store.add_register(kind, definition)?;
            }
        }
        for kind in [RegisterKind::Coils, RegisterKind::DiscreteInputs] {
            for entry in snapshot.entries(kind) {
                let value = parse_bool(&entry.value)?;
                let definition = BooleanRegisterDefinition::new(entry.address, value)
                    .with_name(entry.name.clone())
                    .with_description(entry.description.clone());
                store.add_coil(kind, definition)?;
            }
        }
        Ok(store)
    }

    /// Serialize every entry for the persistence layer
    pub fn snapshot(&self) -> StoreSnapshot {
        let mut snapshot = StoreSnapshot::default();
        for kind in [RegisterKind::HoldingRegisters, RegisterKind::InputRegisters] {
            let entries = self.registers(kind).iter().map(|entry| SerializedEntry {
                address: entry.address,
                data_type: entry.data_type,
                value: entry.display.clone(),
                words: entry.words.clone(),
                name: entry.name.clone(),
                description: entry.description.clone(),
            });
            snapshot.entries_mut(kind).extend(entries);
        }
        for kind in [RegisterKind::Coils, RegisterKind::DiscreteInputs] {
            let entries = self.coils(kind).iter().map(|entry| SerializedEntry {
                address: entry.address,
                data_type: DataType::Binary,
                value: entry.value.to_string(),
                words: Vec::new(),
                name: entry.name.clone(),
                description: entry.description.clone(),
            });
            snapshot.entries_mut(kind).extend(entries);
        }
        snapshot
    }

    pub fn word_order(&self) -> WordOrder {
        self.word_order
    }

    /// Switch the word order and re-render every register
    pub fn set_word_order(&mut self, word_order: WordOrder) -> ChangeSet {
        let mut changes = ChangeSet::new(ChangeOrigin::Operator);
        if word_order == self.word_order {
            return changes;
        }
        self.word_order = word_order;
        for (kind, table) in [
            (RegisterKind::HoldingRegisters, &mut self.holding_registers),
            (RegisterKind::InputRegisters, &mut self.input_registers),
        ] {
            for entry in table.iter_mut() {
                entry.refresh(word_order);
                changes.push(
                    kind,
                    entry.id,
                    FieldChange::Display {
                        display: entry.display.clone(),
                    },
                );
            }
        }
        changes
    }

    /// Register entries of a word table
    ///
    /// Bit tables yield an empty slice.
    pub fn registers(&self, kind: RegisterKind) -> &[RegisterDefinition] {
        match kind {
            RegisterKind::HoldingRegisters => &self.holding_registers,
            RegisterKind::InputRegisters => &self.input_registers,
            _ => &[],
        }
    }

    /// Entries of a bit table
    ///
    /// Word tables yield an empty slice.
    pub fn coils(&self, kind: RegisterKind) -> &[BooleanRegisterDefinition] {
        match kind {
            RegisterKind::Coils => &self.coils,
            RegisterKind::DiscreteInputs => &self.discrete_inputs,
            _ => &[],
        }
    }

    pub fn register(&self, kind: RegisterKind, address: u16) -> Option<&RegisterDefinition> {
        self.registers(kind).iter().find(|entry| entry.address == address)
    }

    pub fn register_by_id(&self, kind: RegisterKind, id: EntryId) -> Option<&RegisterDefinition> {
        self.registers(kind).iter().find(|entry| entry.id == id)
    }

    /// The entry whose span contains `address`
    pub fn register_covering(&self, kind: RegisterKind, address: u16) -> Option<&RegisterDefinition> {
        self.registers(kind).iter().find(|entry| entry.covers(address))
    }

    /// The first entry sharing a word with `[address, address + span)`
    pub fn overlapping(&self, kind: RegisterKind, address: u16, span: usize) -> Option<&RegisterDefinition> {
        let start = address as usize;
        let end = start + span;
        self.registers(kind).iter().find(|entry| {
            let entry_start = entry.address as usize;
            entry_start < end && start < entry_start + entry.word_span()
        })
    }

    pub fn coil(&self, kind: RegisterKind, address: u16) -> Option<&BooleanRegisterDefinition> {
        self.coils(kind).iter().find(|entry| entry.address == address)
    }

    pub fn coil_by_id(&self, kind: RegisterKind, id: EntryId) -> Option<&BooleanRegisterDefinition> {
        self.coils(kind).iter().find(|entry| entry.id == id)
    }

    /// Total number of entries across all tables
    pub fn len(&self) -> usize {
        self.holding_registers.len() + self.input_registers.len() + self.coils.len() + self.discrete_inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert a register entry
    ///
    /// # Errors
    ///
    /// `InvalidData` for a bit table, `InvalidAddress` if the span runs past
    /// 65535, `DuplicateAddress` if any word of the span is already taken.
    pub fn add_register(
        &mut self,
        kind: RegisterKind,
        mut definition: RegisterDefinition,
    ) -> ModbusResult<(EntryId, ChangeSet)> {
        let (address, span) = (definition.address, definition.word_span());
        if address as usize + span > u16::MAX as usize + 1 {
            return Err(ModbusError::invalid_address(address, span as u16));
        }
        if let Some(other) = self.overlapping(kind, address, span) {
            debug!("{} at {} collides with entry {} at {}", definition.data_type, address, other.id, other.address);
            return Err(ModbusError::duplicate_address(kind, address));
        }
        definition.id = self.allocate_id();
        definition.refresh(self.word_order);

        let mut changes = ChangeSet::new(ChangeOrigin::Operator);
        changes.push(kind, definition.id, FieldChange::Added { address: definition.address });
        changes.push(kind, definition.id, definition.value_change());

        let (id, address) = (definition.id, definition.address);
        self.register_table(kind)?.push(definition);
        debug!("Added entry {} at {} to {}", id, address, kind);
        Ok((id, changes))
    }

    /// Append a zero-valued register right after the last entry
    pub fn append_register(&mut self, kind: RegisterKind, data_type: DataType) -> ModbusResult<(EntryId, ChangeSet)> {
        let next = self
            .registers(kind)
            .iter()
            .map(|entry| entry.address as u32 + entry.word_span() as u32)
            .max()
            .unwrap_or(0);
        let address = u16::try_from(next).map_err(|_| ModbusError::invalid_address(u16::MAX, 1))?;
        self.add_register(kind, RegisterDefinition::new(address, data_type))
    }

    /// Insert a coil or discrete input
    pub fn add_coil(
        &mut self,
        kind: RegisterKind,
        mut definition: BooleanRegisterDefinition,
    ) -> ModbusResult<(EntryId, ChangeSet)> {
        if self.coil(kind, definition.address).is_some() {
            return Err(ModbusError::duplicate_address(kind, definition.address));
        }
        definition.id = self.allocate_id();

        let mut changes = ChangeSet::new(ChangeOrigin::Operator);
        changes.push(kind, definition.id, FieldChange::Added { address: definition.address });
        changes.push(kind, definition.id, FieldChange::Coil { value: definition.value });

        let id = definition.id;
        self.bit_table(kind)?.push(definition);
        Ok((id, changes))
    }

    /// Remove the entry at `address`
    pub fn remove(&mut self, kind: RegisterKind, address: u16) -> ModbusResult<ChangeSet> {
        let id = if kind.is_bit() {
            let table = self.bit_table(kind)?;
            let position = table
                .iter()
                .position(|entry| entry.address == address)
                .ok_or_else(|| ModbusError::unknown_entry(kind, address))?;
            table.remove(position).id
        } else {
            let table = self.register_table(kind)?;
            let position = table
                .iter()
                .position(|entry| entry.address == address)
                .ok_or_else(|| ModbusError::unknown_entry(kind, address))?;
            table.remove(position).id
        };

        let mut changes = ChangeSet::new(ChangeOrigin::Operator);
        changes.push(kind, id, FieldChange::Removed { address });
        Ok(changes)
    }

    /// Set a register from operator text
    ///
    /// The text is parsed with the entry's data type and encoded with the
    /// store's word order. An ASCII value whose length changes the span
    /// triggers a resequence in the same change set.
    pub fn set_value(
        &mut self,
        kind: RegisterKind,
        address: u16,
        text: &str,
        origin: ChangeOrigin,
    ) -> ModbusResult<ChangeSet> {
        let data_type = self
            .register(kind, address)
            .ok_or_else(|| ModbusError::unknown_entry(kind, address))?
            .data_type;
        let mut words = codec::encode(text, data_type, self.word_order)?;
        if words.is_empty() {
            words.push(0);
        }
        self.set_words(kind, address, &words, origin)
    }

    /// Replace all raw words of a register
    ///
    /// Fixed-width types must receive exactly their span.
    pub fn set_words(
        &mut self,
        kind: RegisterKind,
        address: u16,
        words: &[u16],
        origin: ChangeOrigin,
    ) -> ModbusResult<ChangeSet> {
        let mut entry = self
            .register(kind, address)
            .ok_or_else(|| ModbusError::unknown_entry(kind, address))?
            .clone();
        if let Some(span) = entry.data_type.fixed_span() {
            if words.len() != span {
                return Err(ModbusError::invalid_data(format!(
                    "{} at {} takes {} words, got {}",
                    entry.data_type,
                    address,
                    span,
                    words.len()
                )));
            }
        } else if words.is_empty() {
            return Err(ModbusError::invalid_data("an ASCII entry needs at least one word"));
        }

        entry.words = words.to_vec();
        entry.refresh(self.word_order);

        let mut changes = ChangeSet::new(origin);
        changes.push(kind, entry.id, entry.value_change());
        self.replace_register(kind, entry, &mut changes)?;
        Ok(changes)
    }

    /// Overwrite individual words of an entry in place
    ///
    /// `patch` holds (offset within the span, word) pairs; offsets outside the
    /// span are ignored. Words not named in the patch keep their value.
    pub fn patch_words(
        &mut self,
        kind: RegisterKind,
        id: EntryId,
        patch: &[(usize, u16)],
        origin: ChangeOrigin,
    ) -> ModbusResult<ChangeSet> {
        let order = self.word_order;
        let entry = self
            .register_table(kind)?
            .iter_mut()
            .find(|entry| entry.id == id)
            .ok_or_else(|| ModbusError::internal(format!("entry {} vanished from {}", id, kind)))?;

        for &(offset, word) in patch {
            if let Some(slot) = entry.words.get_mut(offset) {
                *slot = word;
            }
        }
        entry.refresh(order);

        let mut changes = ChangeSet::new(origin);
        changes.push(kind, entry.id, entry.value_change());
        Ok(changes)
    }

    /// Change the data type of a register
    ///
    /// Existing words are kept as far as the new span allows and zero-padded
    /// otherwise. A span change resequences the table in the same change set.
    pub fn set_data_type(&mut self, kind: RegisterKind, address: u16, data_type: DataType) -> ModbusResult<ChangeSet> {
        let mut entry = self
            .register(kind, address)
            .ok_or_else(|| ModbusError::unknown_entry(kind, address))?
            .clone();
        let mut changes = ChangeSet::new(ChangeOrigin::Operator);
        if entry.data_type == data_type {
            return Ok(changes);
        }

        let from = entry.data_type;
        entry.data_type = data_type;
        entry.words = fit_words(&entry.words, data_type);
        entry.refresh(self.word_order);

        changes.push(kind, entry.id, FieldChange::DataType { from, to: data_type });
        changes.push(kind, entry.id, entry.value_change());
        self.replace_register(kind, entry, &mut changes)?;
        Ok(changes)
    }

    /// Set a coil or discrete input
    pub fn set_coil(&mut self, kind: RegisterKind, address: u16, value: bool, origin: ChangeOrigin) -> ModbusResult<ChangeSet> {
        let entry = self
            .bit_table(kind)?
            .iter_mut()
            .find(|entry| entry.address == address)
            .ok_or_else(|| ModbusError::unknown_entry(kind, address))?;
        entry.value = value;

        let mut changes = ChangeSet::new(origin);
        changes.push(kind, entry.id, FieldChange::Coil { value });
        Ok(changes)
    }

    /// Set or clear the "recently modified" flag
    ///
    /// Returns `None` when the entry no longer exists or the flag already had
    /// the requested value.
    pub fn set_recently_modified(&mut self, kind: RegisterKind, id: EntryId, value: bool) -> Option<Change> {
        let flag = if kind.is_bit() {
            self.bit_table(kind)
                .ok()?
                .iter_mut()
                .find(|entry| entry.id == id)
                .map(|entry| &mut entry.recently_modified)?
        } else {
            self.register_table(kind)
                .ok()?
                .iter_mut()
                .find(|entry| entry.id == id)
                .map(|entry| &mut entry.recently_modified)?
        };
        if *flag == value {
            return None;
        }
        *flag = value;
        Some(Change {
            kind,
            id,
            field: FieldChange::RecentlyModified { value },
        })
    }

    /// Reassign contiguous addresses in one table
    ///
    /// The plan is computed first and applied as a single diff; the table is
    /// left sorted by address.
    pub fn resequence(&mut self, kind: RegisterKind) -> ModbusResult<ChangeSet> {
        let mut changes = ChangeSet::new(ChangeOrigin::Operator);
        if kind.is_bit() {
            let table = self.bit_table(kind)?;
            let moves = plan_bit_resequence(table)?;
            for entry in table.iter_mut() {
                if let Some(step) = moves.iter().find(|step| step.id == entry.id) {
                    entry.address = step.to;
                }
            }
            table.sort_by_key(|entry| entry.address);
            push_moves(&mut changes, kind, &moves);
        } else {
            let table = self.register_table(kind)?;
            let moves = plan_resequence(table)?;
            for entry in table.iter_mut() {
                if let Some(step) = moves.iter().find(|step| step.id == entry.id) {
                    entry.address = step.to;
                }
            }
            table.sort_by_key(|entry| entry.address);
            push_moves(&mut changes, kind, &moves);
        }

        if !changes.is_empty() {
            debug!("Resequenced {}: {} entries moved", kind, changes.len());
        }
        Ok(changes)
    }

    /// (address, word) pairs for every word of every entry in a word table
    pub fn word_image(&self, kind: RegisterKind) -> Vec<(u16, u16)> {
        self.registers(kind)
            .iter()
            .flat_map(|entry| {
                entry
                    .words
                    .iter()
                    .enumerate()
                    .map(move |(offset, &word)| (entry.address.wrapping_add(offset as u16), word))
            })
            .collect()
    }

    /// (address, value) pairs for a bit table
    pub fn bit_image(&self, kind: RegisterKind) -> Vec<(u16, bool)> {
        self.coils(kind).iter().map(|entry| (entry.address, entry.value)).collect()
    }

    fn allocate_id(&mut self) -> EntryId {
        self.next_id += 1;
        EntryId(self.next_id)
    }

    fn register_table(&mut self, kind: RegisterKind) -> ModbusResult<&mut Vec<RegisterDefinition>> {
        match kind {
            RegisterKind::HoldingRegisters => Ok(&mut self.holding_registers),
            RegisterKind::InputRegisters => Ok(&mut self.input_registers),
            _ => Err(ModbusError::invalid_data(format!("{} hold single bits, not registers", kind))),
        }
    }

    fn bit_table(&mut self, kind: RegisterKind) -> ModbusResult<&mut Vec<BooleanRegisterDefinition>> {
        match kind {
            RegisterKind::Coils => Ok(&mut self.coils),
            RegisterKind::DiscreteInputs => Ok(&mut self.discrete_inputs),
            _ => Err(ModbusError::invalid_data(format!("{} hold registers, not bits", kind))),
        }
    }

    /// Swap in an edited copy of an entry
    ///
    /// A span change resequences the table. The plan is checked against the
    /// edited layout first, so on error the store is left untouched.
    fn replace_register(&mut self, kind: RegisterKind, updated: RegisterDefinition, changes: &mut ChangeSet) -> ModbusResult<()> {
        let table = self.register_table(kind)?;
        let position = table
            .iter()
            .position(|entry| entry.id == updated.id)
            .ok_or_else(|| ModbusError::internal(format!("entry {} vanished from {}", updated.id, kind)))?;
        let span_changed = table[position].word_span() != updated.word_span();
        if span_changed {
            let mut layout = table.clone();
            layout[position] = updated.clone();
            plan_resequence(&layout)?;
        }

        table[position] = updated;
        if span_changed {
            changes.extend(self.resequence(kind)?);
        }
        Ok(())
    }
}

fn push_moves(changes: &mut ChangeSet, kind: RegisterKind, moves: &[AddressMove]) {
    for step in moves {
        changes.push(
            kind,
            step.id,
            FieldChange::Address {
                from: step.from,
                to: step.to,
            },
        );
    }
}

fn fit_words(words: &[u16], data_type: DataType) -> Vec<u16> {
    let span = data_type.fixed_span().unwrap_or_else(|| words.len().max(1));
    let mut fitted: Vec<u16> = words.iter().copied().take(span).collect();
    fitted.resize(span, 0);
    fitted
}

fn parse_bool(text: &str) -> ModbusResult<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "on" => Ok(true),
        "false" | "0" | "off" => Ok(false),
        _ => Err(ModbusError::format(DataType::Binary, text, "expected true/false")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOLDING: RegisterKind = RegisterKind::HoldingRegisters;

    fn addresses(store: &RegisterStore, kind: RegisterKind) -> Vec<u16> {
        store.registers(kind).iter().map(|entry| entry.address()).collect()
    }

    #[test]
    fn test_resequence_allocates_by_span() {
        let mut store = RegisterStore::new();
        store.add_register(HOLDING, RegisterDefinition::new(40, DataType::UInt16)).unwrap();
        store.add_register(HOLDING, RegisterDefinition::new(57, DataType::Float32)).unwrap();
        store.add_register(HOLDING, RegisterDefinition::new(90, DataType::UInt16)).unwrap();

        let changes = store.resequence(HOLDING).unwrap();
        assert_eq!(addresses(&store, HOLDING), vec![0, 1, 3]);
        assert_eq!(changes.len(), 3);
        assert!(changes.iter().all(|change| matches!(change.field, FieldChange::Address { .. })));

        // Already contiguous: nothing moves
        assert!(store.resequence(HOLDING).unwrap().is_empty());
    }

    #[test]
    fn test_plan_is_pure() {
        let mut store = RegisterStore::new();
        store.add_register(HOLDING, RegisterDefinition::new(10, DataType::Float64)).unwrap();
        store.add_register(HOLDING, RegisterDefinition::new(2, DataType::Int32)).unwrap();

        let moves = plan_resequence(store.registers(HOLDING)).unwrap();
        assert_eq!(moves.len(), 2);
        assert_eq!((moves[0].from, moves[0].to), (2, 0));
        assert_eq!((moves[1].from, moves[1].to), (10, 2));
        // Planning does not touch the store
        assert_eq!(addresses(&store, HOLDING), vec![10, 2]);
    }

    #[test]
    fn test_data_type_change_resequences() {
        let mut store = RegisterStore::new();
        store.add_register(HOLDING, RegisterDefinition::new(0, DataType::UInt16)).unwrap();
        store.add_register(HOLDING, RegisterDefinition::new(1, DataType::UInt16)).unwrap();
        store.add_register(HOLDING, RegisterDefinition::new(2, DataType::UInt16)).unwrap();

        let changes = store.set_data_type(HOLDING, 0, DataType::Float64).unwrap();
        assert_eq!(addresses(&store, HOLDING), vec![0, 4, 5]);
        assert_eq!(store.register(HOLDING, 0).unwrap().words(), &[0, 0, 0, 0]);

        let moved: Vec<_> = changes
            .iter()
            .filter_map(|change| match change.field {
                FieldChange::Address { from, to } => Some((from, to)),
                _ => None,
            })
            .collect();
        assert_eq!(moved, vec![(1, 4), (2, 5)]);
    }

    #[test]
    fn test_ascii_growth_resequences() {
        let mut store = RegisterStore::new();
        store.add_register(HOLDING, RegisterDefinition::new(0, DataType::AsciiString)).unwrap();
        store.add_register(HOLDING, RegisterDefinition::new(1, DataType::UInt16)).unwrap();

        store.set_value(HOLDING, 0, "HELLO", ChangeOrigin::Operator).unwrap();
        let entry = store.register(HOLDING, 0).unwrap();
        assert_eq!(entry.word_span(), 3);
        assert_eq!(entry.display(), "HELLO");
        assert_eq!(addresses(&store, HOLDING), vec![0, 3]);
    }

    #[test]
    fn test_value_and_display_move_together() {
        let mut store = RegisterStore::new();
        store.add_register(HOLDING, RegisterDefinition::new(5, DataType::Float32)).unwrap();

        let changes = store.set_value(HOLDING, 5, "1.5", ChangeOrigin::Operator).unwrap();
        let entry = store.register(HOLDING, 5).unwrap();
        assert_eq!(entry.display(), "1.5");
        assert_eq!(entry.value(store.word_order()), Some(RegisterValue::Float32(1.5)));
        assert!(changes.requires_write_back());

        let changes = store.set_word_order(WordOrder::HighWordFirst);
        assert_eq!(changes.len(), 1);
        assert!(!changes.requires_write_back());
        assert_ne!(store.register(HOLDING, 5).unwrap().display(), "1.5");
    }

    #[test]
    fn test_remote_changes_are_not_written_back() {
        let mut store = RegisterStore::new();
        store.add_register(HOLDING, RegisterDefinition::new(0, DataType::UInt16)).unwrap();
        let changes = store.set_value(HOLDING, 0, "7", ChangeOrigin::Remote).unwrap();
        assert!(!changes.requires_write_back());
        assert_eq!(store.register(HOLDING, 0).unwrap().words(), &[7]);
    }

    #[test]
    fn test_bad_input_leaves_entry_untouched() {
        let mut store = RegisterStore::new();
        store
            .add_register(HOLDING, RegisterDefinition::new(0, DataType::UInt16).with_words(&[42]))
            .unwrap();
        let err = store.set_value(HOLDING, 0, "forty-two", ChangeOrigin::Operator).unwrap_err();
        assert!(err.is_format_error());
        assert_eq!(store.register(HOLDING, 0).unwrap().display(), "42");
    }

    #[test]
    fn test_duplicate_and_unknown_addresses() {
        let mut store = RegisterStore::new();
        store.add_register(HOLDING, RegisterDefinition::new(3, DataType::UInt16)).unwrap();
        assert_eq!(
            store.add_register(HOLDING, RegisterDefinition::new(3, DataType::Int16)).unwrap_err(),
            ModbusError::duplicate_address(HOLDING, 3)
        );
        // Same address in another table is fine
        store
            .add_register(RegisterKind::InputRegisters, RegisterDefinition::new(3, DataType::Int16))
            .unwrap();
        assert_eq!(
            store.remove(HOLDING, 9).unwrap_err(),
            ModbusError::unknown_entry(HOLDING, 9)
        );
        assert!(store.add_register(RegisterKind::Coils, RegisterDefinition::new(0, DataType::UInt16)).is_err());
    }

    #[test]
    fn test_entry_inside_another_span_is_rejected() {
        let mut store = RegisterStore::new();
        store.add_register(HOLDING, RegisterDefinition::new(10, DataType::UInt32)).unwrap();

        assert_eq!(
            store.add_register(HOLDING, RegisterDefinition::new(11, DataType::UInt16)).unwrap_err(),
            ModbusError::duplicate_address(HOLDING, 11)
        );
        // A Float32 at 9 would reach into word 10
        assert!(store.add_register(HOLDING, RegisterDefinition::new(9, DataType::Float32)).is_err());
        assert!(store.add_register(HOLDING, RegisterDefinition::new(8, DataType::Float32)).is_ok());
        assert!(store.add_register(HOLDING, RegisterDefinition::new(12, DataType::UInt16)).is_ok());
        assert!(matches!(
            store.add_register(HOLDING, RegisterDefinition::new(65535, DataType::UInt32)),
            Err(ModbusError::InvalidAddress { .. })
        ));
        assert_eq!(addresses(&store, HOLDING), vec![10, 8, 12]);
    }

    #[test]
    fn test_failed_resequence_leaves_store_unchanged() {
        let mut store = RegisterStore::new();
        let text = RegisterDefinition::new(0, DataType::AsciiString).with_words(&vec![0x4141; 65535]);
        store.add_register(HOLDING, text).unwrap();
        store.add_register(HOLDING, RegisterDefinition::new(65535, DataType::UInt16)).unwrap();
        let before: Vec<RegisterDefinition> = store.registers(HOLDING).to_vec();

        // Growing the last entry would push it past 65535
        assert!(store.set_data_type(HOLDING, 65535, DataType::Float32).is_err());
        assert_eq!(store.registers(HOLDING), &before[..]);

        assert!(store
            .set_words(HOLDING, 0, &vec![0x4242; 65536], ChangeOrigin::Operator)
            .is_err());
        assert_eq!(store.registers(HOLDING), &before[..]);
    }

    #[test]
    fn test_snapshot_keeps_ascii_span_and_raw_bytes() {
        let mut store = RegisterStore::new();
        store.add_register(HOLDING, RegisterDefinition::new(0, DataType::AsciiString)).unwrap();
        store.set_value(HOLDING, 0, "PUMP-ONE", ChangeOrigin::Operator).unwrap();
        store.add_register(HOLDING, RegisterDefinition::new(4, DataType::UInt16)).unwrap();
        store.add_register(HOLDING, RegisterDefinition::new(5, DataType::AsciiString)).unwrap();

        // A remote master shortens the text and stores a non-ASCII byte pair
        store
            .set_words(HOLDING, 0, &[0x4142, 0, 0, 0], ChangeOrigin::Remote)
            .unwrap();
        store.set_words(HOLDING, 5, &[0xC3A9], ChangeOrigin::Remote).unwrap();
        assert_eq!(store.register(HOLDING, 0).unwrap().display(), "AB");

        let json = store.snapshot().to_json().unwrap();
        let restored =
            RegisterStore::from_snapshot(&StoreSnapshot::from_json(&json).unwrap(), WordOrder::default()).unwrap();

        assert_eq!(restored.register(HOLDING, 0).unwrap().words(), &[0x4142, 0, 0, 0]);
        assert_eq!(restored.register(HOLDING, 0).unwrap().word_span(), 4);
        assert_eq!(restored.register(HOLDING, 5).unwrap().words(), &[0xC3A9]);
        assert_eq!(addresses(&restored, HOLDING), vec![0, 4, 5]);
    }

    #[test]
    fn test_snapshot_without_words_parses_text() {
        let snapshot = StoreSnapshot::from_json(
            r#"{"holding_registers": [{"address": 3, "data_type": "Int16", "value": "-12"}]}"#,
        )
        .unwrap();
        let store = RegisterStore::from_snapshot(&snapshot, WordOrder::default()).unwrap();
        assert_eq!(store.register(HOLDING, 3).unwrap().words(), &[0xFFF4]);
    }

    #[test]
    fn test_coil_resequence_keeps_base_address() {
        let mut store = RegisterStore::new();
        for address in [100, 105, 103] {
            store
                .add_coil(RegisterKind::Coils, BooleanRegisterDefinition::new(address, false))
                .unwrap();
        }
        store.resequence(RegisterKind::Coils).unwrap();
        let coils: Vec<u16> = store.coils(RegisterKind::Coils).iter().map(|c| c.address()).collect();
        assert_eq!(coils, vec![100, 101, 102]);
    }

    #[test]
    fn test_append_register_follows_last_span() {
        let mut store = RegisterStore::new();
        store.add_register(HOLDING, RegisterDefinition::new(0, DataType::Float64)).unwrap();
        let (id, _) = store.append_register(HOLDING, DataType::UInt16).unwrap();
        assert_eq!(store.register_by_id(HOLDING, id).unwrap().address(), 4);
        assert_eq!(store.register_covering(HOLDING, 3).unwrap().data_type(), DataType::Float64);
    }

    #[test]
    fn test_recently_modified_flag() {
        let mut store = RegisterStore::new();
        let (id, _) = store
            .add_coil(RegisterKind::Coils, BooleanRegisterDefinition::new(0, false))
            .unwrap();
        assert!(store.set_recently_modified(RegisterKind::Coils, id, true).is_some());
        assert!(store.set_recently_modified(RegisterKind::Coils, id, true).is_none());
        assert!(store.coil(RegisterKind::Coils, 0).unwrap().recently_modified());
    }

    #[test]
    fn test_snapshot_round_trip() {
        let mut store = RegisterStore::new();
        store
            .add_register(
                HOLDING,
                RegisterDefinition::new(0, DataType::Float32).with_name("setpoint").with_description("bar"),
            )
            .unwrap();
        store.set_value(HOLDING, 0, "2.5", ChangeOrigin::Operator).unwrap();
        store
            .add_register(RegisterKind::InputRegisters, RegisterDefinition::new(7, DataType::AsciiString))
            .unwrap();
        store
            .set_value(RegisterKind::InputRegisters, 7, "PUMP", ChangeOrigin::Operator)
            .unwrap();
        store
            .add_coil(RegisterKind::DiscreteInputs, BooleanRegisterDefinition::new(4, true))
            .unwrap();

        let json = store.snapshot().to_json().unwrap();
        let snapshot = StoreSnapshot::from_json(&json).unwrap();
        let restored = RegisterStore::from_snapshot(&snapshot, WordOrder::default()).unwrap();

        let setpoint = restored.register(HOLDING, 0).unwrap();
        assert_eq!(setpoint.display(), "2.5");
        assert_eq!(setpoint.name(), "setpoint");
        assert_eq!(restored.register(RegisterKind::InputRegisters, 7).unwrap().display(), "PUMP");
        assert!(restored.coil(RegisterKind::DiscreteInputs, 4).unwrap().value());
    }

    #[test]
    fn test_word_image() {
        let mut store = RegisterStore::new();
        store
            .add_register(HOLDING, RegisterDefinition::new(10, DataType::UInt32).with_words(&[2, 1]))
            .unwrap();
        assert_eq!(store.word_image(HOLDING), vec![(10, 2), (11, 1)]);
    }
}
