//! Decodes raw register blocks into named, typed measurement values.
//!
//! One `ParameterParser` lives for the duration of a poll cycle and
//! accumulates results across every queried range; a field whose registers
//! are split across ranges resolves once the last of its ranges has been
//! fed in. Fields not fully covered by the current block are skipped, not
//! errors.

use std::collections::HashMap;

use crate::schema::{FieldDefinition, ParseRule, Schema, Validation};

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Text(String),
    /// One hexadecimal string per register, used by the bit-field rule.
    TextList(Vec<String>),
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{n}"),
            Value::Float(n) => write!(f, "{n}"),
            Value::Text(s) => f.write_str(s),
            Value::TextList(items) => f.write_str(&items.join(" ")),
        }
    }
}

impl serde::Serialize for Value {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Int(n) => serializer.serialize_i64(*n),
            Value::Float(n) => serializer.serialize_f64(*n),
            Value::Text(s) => serializer.serialize_str(s),
            Value::TextList(items) => items.serialize(serializer),
        }
    }
}

/// A validation rule with `invalidate_all` fired; the whole cycle's dataset
/// must be discarded, not just this field.
#[derive(thiserror::Error, Debug)]
#[error("value {value} of field `{field}` is out of bounds, invalidating the complete dataset")]
pub struct DatasetInvalidated {
    pub field: String,
    pub value: f64,
}

pub struct ParameterParser<'a> {
    schema: &'a Schema,
    result: HashMap<String, Value>,
}

impl<'a> ParameterParser<'a> {
    pub fn new(schema: &'a Schema) -> Self {
        Self { schema, result: HashMap::new() }
    }

    /// Feeds one range's register block into the accumulator.
    ///
    /// `data` holds `length` big-endian register words read starting at
    /// address `start`. Every schema field is attempted; those whose
    /// registers all fall within `[start, start + length)` are decoded into
    /// the shared result map.
    pub fn parse(&mut self, data: &[u8], start: u16, length: u16) -> Result<(), DatasetInvalidated> {
        let schema = self.schema;
        for field in schema.fields() {
            try_parse_field(&mut self.result, field, data, start, length)?;
        }
        Ok(())
    }

    pub fn result(&self) -> &HashMap<String, Value> {
        &self.result
    }

    pub fn into_result(self) -> HashMap<String, Value> {
        self.result
    }
}

/// Extracts the field's register words, first register first, or `None` if
/// any of its registers lies outside the current block.
fn field_words(field: &FieldDefinition, data: &[u8], start: u16, length: u16) -> Option<Vec<u16>> {
    let mut words = Vec::with_capacity(field.registers.len());
    for register in &field.registers {
        let index = register.checked_sub(start)?;
        if index >= length {
            return None;
        }
        let offset = usize::from(index) * 2;
        let bytes = data.get(offset..offset + 2)?;
        words.push(u16::from_be_bytes([bytes[0], bytes[1]]));
    }
    Some(words)
}

fn try_parse_field(
    result: &mut HashMap<String, Value>,
    field: &FieldDefinition,
    data: &[u8],
    start: u16,
    length: u16,
) -> Result<(), DatasetInvalidated> {
    let Some(words) = field_words(field, data, start, length) else {
        return Ok(());
    };
    let value = match field.rule {
        ParseRule::UnsignedInt => parse_unsigned(field, &words)?,
        ParseRule::SignedInt => parse_signed(field, &words)?,
        ParseRule::Ascii => Some(parse_ascii(&words)),
        ParseRule::BitField => Some(parse_bits(&words)),
        ParseRule::VersionString => Some(parse_version(&words)),
        ParseRule::DateTime => Some(parse_datetime(&words)),
        ParseRule::TimeOfDay => Some(parse_time_of_day(&words)),
    };
    if let Some(value) = value {
        result.insert(field.name.clone(), value);
    }
    Ok(())
}

/// Concatenates words with the first register as the most significant one.
fn concatenate(words: &[u16]) -> u128 {
    words.iter().fold(0u128, |value, word| (value << 16) | u128::from(*word))
}

/// Applies min/max validation. `Ok(false)` drops the field for this cycle;
/// an `invalidate_all` violation poisons the whole dataset.
fn validate(
    field: &FieldDefinition,
    validation: &Validation,
    value: f64,
) -> Result<bool, DatasetInvalidated> {
    let out_of_bounds = validation.min.is_some_and(|min| value < min)
        || validation.max.is_some_and(|max| value > max);
    if out_of_bounds && validation.invalidate_all {
        return Err(DatasetInvalidated { field: field.name.clone(), value });
    }
    Ok(!out_of_bounds)
}

/// Whole numbers are published as integers, everything else as floats.
fn numeric(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        Value::Int(value as i64)
    } else {
        Value::Float(value)
    }
}

fn parse_unsigned(
    field: &FieldDefinition,
    words: &[u16],
) -> Result<Option<Value>, DatasetInvalidated> {
    let mut raw = concatenate(words);
    if let Some(mask) = field.mask {
        raw &= u128::from(mask);
    }
    if let Some(lookup) = &field.lookup {
        // An exact key match maps to its label; misses pass the raw value
        // through unchanged.
        let value = lookup
            .iter()
            .find(|entry| u128::try_from(entry.key).is_ok_and(|key| key == raw))
            .map(|entry| Value::Text(entry.value.clone()))
            .unwrap_or(Value::Int(raw as i64));
        return Ok(Some(value));
    }
    let mut value = raw as f64;
    if let Some(offset) = field.offset {
        value -= offset;
    }
    value *= field.scale;
    if let Some(validation) = &field.validation {
        if !validate(field, validation, value)? {
            return Ok(None);
        }
    }
    Ok(Some(numeric(value)))
}

fn parse_signed(
    field: &FieldDefinition,
    words: &[u16],
) -> Result<Option<Value>, DatasetInvalidated> {
    // Saturate for fields wider than u128 can hold; the schema validator
    // caps numeric fields well below that, but nothing stops a caller from
    // building such a field by hand.
    let max_value = match 1u128.checked_shl(16 * words.len() as u32) {
        Some(limit) => limit - 1,
        None => u128::MAX,
    };
    let mut raw = concatenate(words) as i128;
    if let Some(offset) = field.offset {
        raw -= offset as i128;
    }
    let signed = if raw > (max_value / 2) as i128 {
        raw - (max_value as i128 + 1)
    } else {
        raw
    };
    let value = signed as f64 * field.scale;
    if let Some(validation) = &field.validation {
        if !validate(field, validation, value)? {
            return Ok(None);
        }
    }
    Ok(Some(numeric(value)))
}

/// Two characters per register, high byte first.
fn parse_ascii(words: &[u16]) -> Value {
    let mut text = String::with_capacity(words.len() * 2);
    for word in words {
        text.push(char::from((word >> 8) as u8));
        text.push(char::from((word & 0xFF) as u8));
    }
    Value::Text(text)
}

fn parse_bits(words: &[u16]) -> Value {
    Value::TextList(words.iter().map(|word| format!("{word:#x}")).collect())
}

fn parse_version(words: &[u16]) -> Value {
    let mut text = String::new();
    for word in words {
        text.push_str(&format!(
            "{}.{}.{}.{}",
            word >> 12,
            (word >> 8) & 0x0F,
            (word >> 4) & 0x0F,
            word & 0x0F
        ));
    }
    Value::Text(text)
}

/// Positional date/time rendering kept byte-for-byte compatible with the
/// format consumers already display.
fn parse_datetime(words: &[u16]) -> Value {
    let mut text = String::new();
    for (i, word) in words.iter().enumerate() {
        let (high, low) = (word >> 8, word & 0xFF);
        match i {
            0 => text.push_str(&format!("{high}/{low}/")),
            1 => text.push_str(&format!("{high} {low}:")),
            2 => text.push_str(&format!("{high}:{low}")),
            _ => text.push_str(&format!("{high}{low}")),
        }
    }
    Value::Text(text)
}

/// A single register holding `HHMM` as a decimal number.
fn parse_time_of_day(words: &[u16]) -> Value {
    let raw = words[0];
    Value::Text(format!("{:02}:{:02}", raw / 100, raw % 100))
}
