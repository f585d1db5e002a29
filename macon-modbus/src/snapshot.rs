//! Decoded device state of one poll cycle.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;

use crate::registers::{RegisterMap, Value};

/// A fault register with a nonzero raw word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveFault {
    pub register: &'static str,
    pub address: u16,
    pub raw: u16,
    /// Named bits that are set; unnamed bits only show in `raw`.
    pub bits: Vec<&'static str>,
}

impl std::fmt::Display for ActiveFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (reg {}) = 0x{:04X}", self.register, self.address, self.raw)?;
        if !self.bits.is_empty() {
            write!(f, " [{}]", self.bits.join(", "))?;
        }
        Ok(())
    }
}

/// Complete, immutable result of one successful poll cycle.
#[derive(Debug, Clone)]
pub struct DeviceSnapshot {
    timestamp: DateTime<Utc>,
    values: BTreeMap<&'static str, Value>,
    /// Raw words of the fault registers, by address.
    error_words: BTreeMap<u16, u16>,
    map: &'static RegisterMap,
}

impl DeviceSnapshot {
    /// Build a snapshot from decoded values.
    pub fn new(
        timestamp: DateTime<Utc>,
        values: BTreeMap<&'static str, Value>,
        map: &'static RegisterMap,
    ) -> Self {
        let error_words = map
            .fault_registers()
            .filter_map(|desc| {
                values
                    .get(desc.name)
                    .and_then(Value::as_bits)
                    .map(|bits| (desc.address, bits.raw()))
            })
            .collect();

        Self {
            timestamp,
            values,
            error_words,
            map,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn values(&self) -> &BTreeMap<&'static str, Value> {
        &self.values
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn number(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(Value::as_number)
    }

    /// State of a named status bit, looked up across all registers.
    pub fn flag(&self, bit_name: &str) -> Option<bool> {
        let (desc, _) = self.map.bit(bit_name)?;
        self.get(desc.name)?.as_bits()?.get(bit_name)
    }

    /// Raw fault register words, by address.
    pub fn error_words(&self) -> &BTreeMap<u16, u16> {
        &self.error_words
    }

    /// Fault registers reporting a fault.
    pub fn active_faults(&self) -> Vec<ActiveFault> {
        self.map
            .fault_registers()
            .filter_map(|desc| {
                let bits = self.get(desc.name)?.as_bits()?;
                (bits.raw() != 0).then(|| ActiveFault {
                    register: desc.name,
                    address: desc.address,
                    raw: bits.raw(),
                    bits: bits.active(),
                })
            })
            .collect()
    }

    pub fn has_faults(&self) -> bool {
        self.error_words.values().any(|raw| *raw != 0)
    }

    /// Flatten into one pivot row: a column per value register and a
    /// `bit<N>_<label>` column per named status bit.
    pub fn to_record(&self) -> Map<String, JsonValue> {
        let mut row = Map::new();
        row.insert(
            "timestamp".to_string(),
            JsonValue::String(self.timestamp.to_rfc3339()),
        );

        for (name, value) in &self.values {
            match value {
                Value::Number(n) => {
                    row.insert(name.to_string(), JsonValue::from(*n));
                }
                Value::Bits(bits) => {
                    row.insert(name.to_string(), JsonValue::from(bits.raw()));
                    for (field, set) in bits.named() {
                        row.insert(
                            format!("bit{}_{}", field.bit, field.name),
                            JsonValue::from(u8::from(set)),
                        );
                    }
                }
            }
        }

        row
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::{BRINE_PUMP, ERROR_CODE_2, SYSTEM_STATUS_3};

    fn snapshot(status: u16, error: u16) -> DeviceSnapshot {
        let map = RegisterMap::macon();
        let mut values = BTreeMap::new();
        values.insert("water_tank_temperature", Value::Number(45.0));
        values.insert(
            SYSTEM_STATUS_3,
            map.lookup(SYSTEM_STATUS_3).unwrap().decode(&[status]).unwrap(),
        );
        values.insert(
            ERROR_CODE_2,
            map.lookup(ERROR_CODE_2).unwrap().decode(&[error]).unwrap(),
        );
        DeviceSnapshot::new(Utc::now(), values, map)
    }

    #[test]
    fn test_flag_lookup() {
        let snap = snapshot(0x0008, 0);
        assert_eq!(snap.flag(BRINE_PUMP), Some(true));
        assert_eq!(snap.flag("defrost"), Some(false));
        assert_eq!(snap.flag("compressor"), None);
        assert_eq!(snap.flag("no_such_bit"), None);
    }

    #[test]
    fn test_no_faults() {
        let snap = snapshot(0x0008, 0);
        assert!(!snap.has_faults());
        assert!(snap.active_faults().is_empty());
        assert_eq!(snap.error_words().get(&2137), Some(&0));
    }

    #[test]
    fn test_active_faults() {
        let snap = snapshot(0, 0b0000_0001_0000_0100);
        assert!(snap.has_faults());

        let faults = snap.active_faults();
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].address, 2137);
        assert_eq!(faults[0].raw, 0x0104);
        assert_eq!(
            faults[0].bits,
            vec!["inlet_water_temp_error", "ambient_temp_error"]
        );
        assert_eq!(
            faults[0].to_string(),
            "error_code_2 (reg 2137) = 0x0104 [inlet_water_temp_error, ambient_temp_error]"
        );
    }

    #[test]
    fn test_unnamed_fault_bit_still_counts() {
        let snap = snapshot(0, 0x8000);
        let faults = snap.active_faults();
        assert_eq!(faults.len(), 1);
        assert!(faults[0].bits.is_empty());
    }

    #[test]
    fn test_to_record() {
        let snap = snapshot(0x0008, 0);
        let row = snap.to_record();

        assert_eq!(row["water_tank_temperature"], JsonValue::from(45.0));
        assert_eq!(row["system_status_3"], JsonValue::from(8));
        assert_eq!(row["bit3_brine_pump"], JsonValue::from(1));
        assert_eq!(row["bit5_defrost"], JsonValue::from(0));
        assert_eq!(row["bit2_inlet_water_temp_error"], JsonValue::from(0));
        assert!(row.contains_key("timestamp"));
    }
}
