/// Raw register image served by the local node in slave mode
///
/// The bank is the transport-facing copy of the register map: flat 16-bit words
/// and single bits keyed by address. It is shared with the transport task, so
/// each table sits behind its own `Arc<RwLock<_>>`. The logical register map
/// lives in [`RegisterStore`](crate::register_store::RegisterStore); the bank is
/// refreshed from it and only from operator-originated change sets, so writes
/// made by a remote master are never echoed back.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use log::debug;

use crate::error::{ModbusError, ModbusResult};
use crate::register_store::{ChangeSet, FieldChange, RegisterKind, RegisterStore};

type WordTable = Arc<RwLock<HashMap<u16, u16>>>;
type BitTable = Arc<RwLock<HashMap<u16, bool>>>;

/// Flat word/bit image of the four Modbus tables
#[derive(Debug, Clone, Default)]
pub struct ModbusRegisterBank {
    coils: BitTable,
    discrete_inputs: BitTable,
    holding_registers: WordTable,
    input_registers: WordTable,
}

impl ModbusRegisterBank {
    /// Create a new register bank with empty data
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a bank holding the store's current contents
    pub fn from_store(store: &RegisterStore) -> ModbusResult<Self> {
        let bank = Self::new();
        bank.load_store(store)?;
        Ok(bank)
    }

    /// Replace every table with the store's current contents
    pub fn load_store(&self, store: &RegisterStore) -> ModbusResult<()> {
        for kind in RegisterKind::ALL {
            if kind.is_bit() {
                let mut table = self.lock_bits_mut(kind)?;
                table.clear();
                table.extend(store.bit_image(kind));
            } else {
                let mut table = self.lock_words_mut(kind)?;
                table.clear();
                table.extend(store.word_image(kind));
            }
        }
        Ok(())
    }

    /// Mirror an operator change set into the image
    ///
    /// Sets that add, remove or move entries rebuild the whole image. Otherwise
    /// sets that do not require write-back (remote or response origin) are
    /// ignored. Returns the number of values written.
    pub fn apply_changes(&self, changes: &ChangeSet, store: &RegisterStore) -> ModbusResult<usize> {
        let relayout = changes.iter().any(|change| {
            matches!(
                change.field,
                FieldChange::Added { .. } | FieldChange::Removed { .. } | FieldChange::Address { .. }
            )
        });
        if relayout {
            // Addresses moved; the flat image has to be rebuilt
            self.load_store(store)?;
            return Ok(changes.len());
        }
        if !changes.requires_write_back() {
            return Ok(0);
        }

        let mut written = 0;
        for change in changes.iter() {
            match &change.field {
                FieldChange::Value { words, .. } => {
                    if let Some(entry) = store.register_by_id(change.kind, change.id) {
                        self.write_words(change.kind, entry.address(), words)?;
                        written += words.len();
                    }
                }
                FieldChange::Coil { value } => {
                    if let Some(entry) = store.coil_by_id(change.kind, change.id) {
                        self.write_bits(change.kind, entry.address(), &[*value])?;
                        written += 1;
                    }
                }
                _ => {}
            }
        }
        debug!("Register bank mirrored {} values", written);
        Ok(written)
    }

    /// Read `quantity` words starting at `address`; unset addresses read as 0
    pub fn read_words(&self, kind: RegisterKind, address: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
        let table = self.lock_words(kind)?;
        Ok((0..quantity)
            .map(|i| table.get(&address.wrapping_add(i)).copied().unwrap_or(0))
            .collect())
    }

    /// Read `quantity` bits starting at `address`; unset addresses read as false
    pub fn read_bits(&self, kind: RegisterKind, address: u16, quantity: u16) -> ModbusResult<Vec<bool>> {
        let table = self.lock_bits(kind)?;
        Ok((0..quantity)
            .map(|i| table.get(&address.wrapping_add(i)).copied().unwrap_or(false))
            .collect())
    }

    pub fn write_words(&self, kind: RegisterKind, address: u16, values: &[u16]) -> ModbusResult<()> {
        let mut table = self.lock_words_mut(kind)?;
        for (i, &value) in values.iter().enumerate() {
            table.insert(address.wrapping_add(i as u16), value);
        }
        Ok(())
    }

    pub fn write_bits(&self, kind: RegisterKind, address: u16, values: &[bool]) -> ModbusResult<()> {
        let mut table = self.lock_bits_mut(kind)?;
        for (i, &value) in values.iter().enumerate() {
            table.insert(address.wrapping_add(i as u16), value);
        }
        Ok(())
    }

    /// Get register bank statistics
    pub fn get_stats(&self) -> ModbusResult<RegisterBankStats> {
        Ok(RegisterBankStats {
            coils_count: self.lock_bits(RegisterKind::Coils)?.len(),
            discrete_inputs_count: self.lock_bits(RegisterKind::DiscreteInputs)?.len(),
            holding_registers_count: self.lock_words(RegisterKind::HoldingRegisters)?.len(),
            input_registers_count: self.lock_words(RegisterKind::InputRegisters)?.len(),
        })
    }

    fn word_table(&self, kind: RegisterKind) -> ModbusResult<&WordTable> {
        match kind {
            RegisterKind::HoldingRegisters => Ok(&self.holding_registers),
            RegisterKind::InputRegisters => Ok(&self.input_registers),
            _ => Err(ModbusError::invalid_data(format!("{} are not a word table", kind))),
        }
    }

    fn bit_table(&self, kind: RegisterKind) -> ModbusResult<&BitTable> {
        match kind {
            RegisterKind::Coils => Ok(&self.coils),
            RegisterKind::DiscreteInputs => Ok(&self.discrete_inputs),
            _ => Err(ModbusError::invalid_data(format!("{} are not a bit table", kind))),
        }
    }

    fn lock_words(&self, kind: RegisterKind) -> ModbusResult<std::sync::RwLockReadGuard<'_, HashMap<u16, u16>>> {
        self.word_table(kind)?
            .read()
            .map_err(|_| ModbusError::internal(format!("Failed to lock {}", kind)))
    }

    fn lock_words_mut(&self, kind: RegisterKind) -> ModbusResult<std::sync::RwLockWriteGuard<'_, HashMap<u16, u16>>> {
        self.word_table(kind)?
            .write()
            .map_err(|_| ModbusError::internal(format!("Failed to lock {}", kind)))
    }

    fn lock_bits(&self, kind: RegisterKind) -> ModbusResult<std::sync::RwLockReadGuard<'_, HashMap<u16, bool>>> {
        self.bit_table(kind)?
            .read()
            .map_err(|_| ModbusError::internal(format!("Failed to lock {}", kind)))
    }

    fn lock_bits_mut(&self, kind: RegisterKind) -> ModbusResult<std::sync::RwLockWriteGuard<'_, HashMap<u16, bool>>> {
        self.bit_table(kind)?
            .write()
            .map_err(|_| ModbusError::internal(format!("Failed to lock {}", kind)))
    }
}

/// Register bank statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterBankStats {
    pub coils_count: usize,
    pub discrete_inputs_count: usize,
    pub holding_registers_count: usize,
    pub input_registers_count: usize,
}
