//! Register map of the Macon heat pump controller.
//!
//! The map is the single source of truth for register semantics: address,
//! width, signedness, scaling, packed status bits and writability. No other
//! module hardcodes addresses or scale factors.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::RegisterError;

/// How the raw words of a register are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterKind {
    /// Unsigned 16-bit integer times scale.
    UnsignedScaled,
    /// Two's complement 16-bit integer times scale.
    SignedScaled,
    /// 16 independent status bits.
    BitPacked,
    /// Two registers, high word first, combined to 32 bits before scaling.
    VolumeFlowComposite,
}

impl RegisterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegisterKind::UnsignedScaled => "unsigned",
            RegisterKind::SignedScaled => "signed",
            RegisterKind::BitPacked => "bits",
            RegisterKind::VolumeFlowComposite => "volume_flow",
        }
    }
}

/// Whether the host may write a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    ReadWrite,
}

/// Rational scale factor: engineering value = raw * num / den.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scale {
    num: u32,
    den: u32,
}

impl Scale {
    pub const ONE: Scale = Scale::new(1, 1);
    pub const TENTH: Scale = Scale::new(1, 10);

    pub const fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    pub fn apply(&self, raw: i64) -> f64 {
        raw as f64 * self.num as f64 / self.den as f64
    }

    /// Inverse of [`apply`](Self::apply), rounded to the nearest raw step.
    pub fn invert(&self, value: f64) -> f64 {
        (value * self.den as f64 / self.num as f64).round()
    }
}

impl fmt::Display for Scale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.num as f64 / self.den as f64)
    }
}

/// A named bit inside a bit-packed register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitField {
    pub bit: u8,
    pub name: &'static str,
}

const fn bit(bit: u8, name: &'static str) -> BitField {
    BitField { bit, name }
}

/// Static description of one device register.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegisterDescriptor {
    pub name: &'static str,
    pub address: u16,
    pub kind: RegisterKind,
    pub scale: Scale,
    pub unit: Option<&'static str>,
    pub access: Access,
    /// Named bits, for bit-packed registers.
    pub bits: &'static [BitField],
    /// Allowed engineering range for writes, inclusive.
    pub domain: Option<(f64, f64)>,
    /// Read during each poll cycle.
    pub polled: bool,
    /// A nonzero raw word signals an active device fault.
    pub fault: bool,
}

impl RegisterDescriptor {
    const fn value(name: &'static str, address: u16, kind: RegisterKind) -> Self {
        Self {
            name,
            address,
            kind,
            scale: Scale::ONE,
            unit: None,
            access: Access::ReadOnly,
            bits: &[],
            domain: None,
            polled: true,
            fault: false,
        }
    }

    const fn unsigned(name: &'static str, address: u16) -> Self {
        Self::value(name, address, RegisterKind::UnsignedScaled)
    }

    const fn signed(name: &'static str, address: u16) -> Self {
        Self::value(name, address, RegisterKind::SignedScaled)
    }

    const fn temperature(name: &'static str, address: u16) -> Self {
        Self::signed(name, address).unit("°C")
    }

    const fn status(name: &'static str, address: u16, bits: &'static [BitField]) -> Self {
        let mut desc = Self::value(name, address, RegisterKind::BitPacked);
        desc.bits = bits;
        desc
    }

    const fn unit(mut self, unit: &'static str) -> Self {
        self.unit = Some(unit);
        self
    }

    const fn scaled(mut self, scale: Scale) -> Self {
        self.scale = scale;
        self
    }

    const fn writable(mut self) -> Self {
        self.access = Access::ReadWrite;
        self
    }

    const fn domain(mut self, min: f64, max: f64) -> Self {
        self.domain = Some((min, max));
        self
    }

    const fn not_polled(mut self) -> Self {
        self.polled = false;
        self
    }

    const fn fault(mut self) -> Self {
        self.fault = true;
        self
    }

    /// Number of consecutive registers this descriptor spans.
    pub const fn count(&self) -> u16 {
        match self.kind {
            RegisterKind::VolumeFlowComposite => 2,
            _ => 1,
        }
    }

    /// Last address covered by this descriptor.
    pub const fn end_address(&self) -> u16 {
        self.address + self.count() - 1
    }

    pub fn is_writable(&self) -> bool {
        self.access == Access::ReadWrite
    }

    /// Look up a named bit of this register.
    pub fn bit(&self, name: &str) -> Option<&'static BitField> {
        self.bits.iter().find(|b| b.name == name)
    }

    /// Decode raw register words into a typed value.
    pub fn decode(&self, raw: &[u16]) -> Result<Value, RegisterError> {
        decode(self, raw)
    }

    /// Encode a value into raw register words.
    pub fn encode(&self, value: &Value) -> Result<Vec<u16>, RegisterError> {
        encode(self, value)
    }
}

/// Decoded status bits of a bit-packed register.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitSet {
    raw: u16,
    fields: &'static [BitField],
}

impl BitSet {
    pub fn new(raw: u16, fields: &'static [BitField]) -> Self {
        Self { raw, fields }
    }

    pub fn raw(&self) -> u16 {
        self.raw
    }

    /// Whether bit `index` is set.
    pub fn is_set(&self, index: u8) -> bool {
        index < 16 && self.raw & (1 << index) != 0
    }

    /// State of a named bit, if this register defines it.
    pub fn get(&self, name: &str) -> Option<bool> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .map(|f| self.is_set(f.bit))
    }

    /// Every named bit with its state, in bit order.
    pub fn named(&self) -> impl Iterator<Item = (&'static BitField, bool)> + '_ {
        self.fields.iter().map(move |f| (f, self.is_set(f.bit)))
    }

    /// Names of the named bits that are set.
    pub fn active(&self) -> Vec<&'static str> {
        self.named()
            .filter(|(_, set)| *set)
            .map(|(f, _)| f.name)
            .collect()
    }
}

/// A decoded register value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Scaled engineering quantity (temperature, frequency, flow, mode...).
    Number(f64),
    /// Status or error bits.
    Bits(BitSet),
}

impl Value {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Bits(_) => None,
        }
    }

    pub fn as_bits(&self) -> Option<&BitSet> {
        match self {
            Value::Bits(bits) => Some(bits),
            Value::Number(_) => None,
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Number(v)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(n) => write!(f, "{}", n),
            Value::Bits(bits) => write!(f, "0x{:04X}", bits.raw),
        }
    }
}

/// Decode raw register words according to `desc`.
pub fn decode(desc: &RegisterDescriptor, raw: &[u16]) -> Result<Value, RegisterError> {
    let needed = desc.count() as usize;
    if raw.len() < needed {
        return Err(RegisterError::ShortRead {
            register: desc.name,
            expected: needed,
            actual: raw.len(),
        });
    }

    let value = match desc.kind {
        RegisterKind::UnsignedScaled => Value::Number(desc.scale.apply(raw[0] as i64)),
        RegisterKind::SignedScaled => Value::Number(desc.scale.apply(raw[0] as i16 as i64)),
        RegisterKind::BitPacked => Value::Bits(BitSet::new(raw[0], desc.bits)),
        RegisterKind::VolumeFlowComposite => {
            let combined = ((raw[0] as u32) << 16) | raw[1] as u32;
            Value::Number(desc.scale.apply(combined as i64))
        }
    };
    Ok(value)
}

/// Encode `value` into raw register words according to `desc`.
///
/// Fails with [`RegisterError::Unwritable`] for read-only registers and with
/// [`RegisterError::OutOfRange`] when the value falls outside the register's
/// domain or its raw representation.
pub fn encode(desc: &RegisterDescriptor, value: &Value) -> Result<Vec<u16>, RegisterError> {
    if !desc.is_writable() {
        return Err(RegisterError::Unwritable(desc.name));
    }
    encode_raw(desc, value)
}

fn out_of_range(desc: &RegisterDescriptor, value: f64, detail: impl Into<String>) -> RegisterError {
    RegisterError::OutOfRange {
        register: desc.name,
        value,
        detail: detail.into(),
    }
}

/// Encoding without the writability check; the inverse of [`decode`].
pub(crate) fn encode_raw(desc: &RegisterDescriptor, value: &Value) -> Result<Vec<u16>, RegisterError> {
    let number = match value {
        Value::Number(number) => *number,
        Value::Bits(bits) => {
            return match desc.kind {
                RegisterKind::BitPacked => Ok(vec![bits.raw()]),
                _ => Err(out_of_range(
                    desc,
                    bits.raw() as f64,
                    "bit set for a numeric register",
                )),
            };
        }
    };
    if !number.is_finite() {
        return Err(out_of_range(desc, number, "not a finite number"));
    }
    if let Some((min, max)) = desc.domain {
        if number < min || number > max {
            return Err(out_of_range(desc, number, format!("allowed {}..={}", min, max)));
        }
    }

    let raw = match desc.kind {
        RegisterKind::BitPacked => number.round(),
        _ => desc.scale.invert(number),
    };
    let (min, max) = match desc.kind {
        RegisterKind::UnsignedScaled | RegisterKind::BitPacked => (0.0, u16::MAX as f64),
        RegisterKind::SignedScaled => (i16::MIN as f64, i16::MAX as f64),
        RegisterKind::VolumeFlowComposite => (0.0, u32::MAX as f64),
    };
    if raw < min || raw > max {
        return Err(out_of_range(
            desc,
            number,
            format!("raw {} outside {}..={}", raw, min, max),
        ));
    }

    let words = match desc.kind {
        RegisterKind::UnsignedScaled | RegisterKind::BitPacked => vec![raw as u16],
        RegisterKind::SignedScaled => vec![raw as i16 as u16],
        RegisterKind::VolumeFlowComposite => {
            let combined = raw as u32;
            vec![(combined >> 16) as u16, combined as u16]
        }
    };
    Ok(words)
}

/// Reset toggle: 0 = unit off, 1 = unit on.
pub const UNIT_ON_OFF: &str = "unit_on_off";
pub const HOT_WATER_SETPOINT: &str = "hot_water_setpoint";
pub const HOT_WATER_TANK_DELTA_T: &str = "hot_water_tank_delta_t";
/// Host frequency control: 0 = no, 1 = yes.
pub const HOST_FREQUENCY_CONTROL: &str = "host_frequency_control";
pub const HOST_COMPRESSOR_FREQUENCY: &str = "host_compressor_frequency";
pub const SYSTEM_STATUS_3: &str = "system_status_3";
pub const ERROR_CODE_2: &str = "error_code_2";
/// Bit of `system_status_3` set while the brine side pump runs.
pub const BRINE_PUMP: &str = "brine_pump";

const SYSTEM_STATUS_2_BITS: &[BitField] = &[
    bit(1, "compressor"),
    bit(5, "water_pump"),
    bit(6, "four_way_valve"),
    bit(7, "electric_heater"),
    bit(8, "water_flow_switch"),
    bit(9, "high_pressure_switch"),
    bit(10, "low_pressure_switch"),
    bit(13, "three_way_valve_1"),
    bit(14, "three_way_valve_2"),
];

const SYSTEM_STATUS_3_BITS: &[BitField] = &[
    bit(3, BRINE_PUMP),
    bit(5, "defrost"),
    bit(8, "wired_controller"),
    bit(9, "energy_saving"),
    bit(10, "primary_antifreeze"),
    bit(11, "secondary_antifreeze"),
    bit(12, "sterilizing"),
    bit(13, "secondary_pump"),
];

const ERROR_CODE_2_BITS: &[BitField] = &[
    bit(2, "inlet_water_temp_error"),
    bit(3, "outlet_water_temp_error"),
    bit(5, "external_coil_temp_error"),
    bit(6, "discharge_temp_error"),
    bit(7, "suction_temp_error"),
    bit(8, "ambient_temp_error"),
    bit(9, "comm_drive_error"),
    bit(10, "comm_controller_error"),
];

const ERROR_CODE_3_BITS: &[BitField] = &[
    bit(5, "high_discharge_protect"),
    bit(6, "high_pressure_protect"),
    bit(7, "low_pressure_protect"),
    bit(8, "water_flow_protect"),
    bit(10, "low_ambient_protect"),
    bit(14, "low_outlet_temp_protect"),
];

/// Macon protocol V1.3 register table, ordered by address.
static MACON_REGISTERS: [RegisterDescriptor; 31] = [
    RegisterDescriptor::unsigned(UNIT_ON_OFF, 2000)
        .writable()
        .domain(0.0, 1.0)
        .not_polled(),
    RegisterDescriptor::temperature(HOT_WATER_SETPOINT, 2004).writable(),
    RegisterDescriptor::temperature(HOT_WATER_TANK_DELTA_T, 2007).writable(),
    RegisterDescriptor::unsigned("frequency_reduction", 2047).writable(),
    RegisterDescriptor::unsigned("water_pump_mode", 2052).writable(),
    RegisterDescriptor::unsigned(HOST_FREQUENCY_CONTROL, 2056)
        .writable()
        .domain(0.0, 1.0),
    RegisterDescriptor::unsigned(HOST_COMPRESSOR_FREQUENCY, 2057)
        .scaled(Scale::TENTH)
        .unit("Hz")
        .writable()
        .domain(0.0, 120.0),
    RegisterDescriptor::temperature("water_tank_temperature", 2100),
    RegisterDescriptor::temperature("outlet_water_temperature", 2102),
    RegisterDescriptor::temperature("inlet_water_temperature", 2103),
    RegisterDescriptor::temperature("discharge_temperature", 2104),
    RegisterDescriptor::temperature("suction_temperature", 2105),
    RegisterDescriptor::temperature("external_coil_temperature", 2107),
    RegisterDescriptor::temperature("cooling_coil_temperature", 2108),
    RegisterDescriptor::temperature("outdoor_ambient_temperature", 2110),
    RegisterDescriptor::temperature("ipm_temperature", 2114),
    RegisterDescriptor::temperature("brine_inlet_temperature", 2115),
    RegisterDescriptor::temperature("brine_outlet_temperature", 2116),
    RegisterDescriptor::unsigned("compressor_frequency", 2118).unit("Hz"),
    RegisterDescriptor::unsigned("ac_voltage", 2120).unit("V"),
    RegisterDescriptor::unsigned("ac_current", 2121).unit("A"),
    RegisterDescriptor::unsigned("dc_voltage", 2122).unit("V"),
    RegisterDescriptor::unsigned("primary_eev_opening", 2124).unit("%"),
    RegisterDescriptor::unsigned("secondary_eev_opening", 2125).unit("%"),
    RegisterDescriptor::value("volume_flow", 2126, RegisterKind::VolumeFlowComposite)
        .scaled(Scale::TENTH)
        .unit("l/h"),
    RegisterDescriptor::status("system_status_1", 2133, &[]),
    RegisterDescriptor::status("error_code_1", 2134, &[]).fault(),
    RegisterDescriptor::status("system_status_2", 2135, SYSTEM_STATUS_2_BITS),
    RegisterDescriptor::status(SYSTEM_STATUS_3, 2136, SYSTEM_STATUS_3_BITS),
    RegisterDescriptor::status(ERROR_CODE_2, 2137, ERROR_CODE_2_BITS).fault(),
    RegisterDescriptor::status("error_code_3", 2138, ERROR_CODE_3_BITS).fault(),
];

static MACON: RegisterMap = RegisterMap {
    registers: &MACON_REGISTERS,
};

/// Immutable table of known registers.
#[derive(Debug)]
pub struct RegisterMap {
    registers: &'static [RegisterDescriptor],
}

impl RegisterMap {
    /// The Macon heat pump register map.
    pub fn macon() -> &'static RegisterMap {
        &MACON
    }

    pub fn iter(&self) -> impl Iterator<Item = &'static RegisterDescriptor> {
        self.registers.iter()
    }

    pub fn len(&self) -> usize {
        self.registers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&'static RegisterDescriptor> {
        self.registers.iter().find(|d| d.name == name)
    }

    /// Like [`get`](Self::get), but fails with `UnknownRegister`.
    pub fn lookup(&self, name: &str) -> Result<&'static RegisterDescriptor, RegisterError> {
        self.get(name)
            .ok_or_else(|| RegisterError::UnknownRegister(name.to_string()))
    }

    /// Find the register that owns a named status bit.
    pub fn bit(&self, name: &str) -> Option<(&'static RegisterDescriptor, &'static BitField)> {
        self.registers
            .iter()
            .find_map(|d| d.bit(name).map(|b| (d, b)))
    }

    /// Registers read during each poll cycle.
    pub fn polled(&self) -> impl Iterator<Item = &'static RegisterDescriptor> {
        self.registers.iter().filter(|d| d.polled)
    }

    /// Registers whose nonzero value signals a device fault.
    pub fn fault_registers(&self) -> impl Iterator<Item = &'static RegisterDescriptor> {
        self.registers.iter().filter(|d| d.fault)
    }

    /// Decode every register fully contained in a block read from `start`.
    pub fn decode_block(
        &self,
        start: u16,
        words: &[u16],
    ) -> Result<BTreeMap<&'static str, Value>, RegisterError> {
        let end = start as usize + words.len();
        let mut values = BTreeMap::new();
        for desc in self.registers {
            if (desc.address as usize) < start as usize || desc.end_address() as usize >= end {
                continue;
            }
            let offset = (desc.address - start) as usize;
            values.insert(desc.name, desc.decode(&words[offset..])?);
        }
        Ok(values)
    }
}
