//! Register-map schema describing what to poll and how to interpret it.
//!
//! The shape mirrors the vendor definition files: a `requests` list of
//! register ranges to query and a `parameters` list of field groups, each
//! field naming the registers it spans and a decode rule.

use std::path::{Path, PathBuf};

use crate::v5::MAX_READ_COUNT;

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Schema {
    pub requests: Vec<RegisterRange>,
    pub parameters: Vec<ParameterGroup>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct RegisterRange {
    pub start: u16,
    pub end: u16,
    #[serde(rename = "mb_functioncode", default)]
    pub function_code: FunctionCode,
    /// Minimum seconds between successful queries of this range. Absent
    /// means the range is queried on every poll cycle.
    #[serde(default)]
    pub interval: Option<u32>,
}

impl RegisterRange {
    pub fn count(&self) -> u16 {
        self.end - self.start + 1
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display, serde::Deserialize, serde::Serialize,
)]
#[serde(try_from = "u8", into = "u8")]
pub enum FunctionCode {
    #[default]
    ReadHoldings,
    ReadInputs,
}

impl TryFrom<u8> for FunctionCode {
    type Error = String;
    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            3 => Ok(FunctionCode::ReadHoldings),
            4 => Ok(FunctionCode::ReadInputs),
            other => Err(format!("unsupported modbus function code {other}")),
        }
    }
}

impl From<FunctionCode> for u8 {
    fn from(code: FunctionCode) -> u8 {
        match code {
            FunctionCode::ReadHoldings => 3,
            FunctionCode::ReadInputs => 4,
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ParameterGroup {
    pub group: String,
    pub items: Vec<FieldDefinition>,
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct FieldDefinition {
    pub name: String,
    pub rule: ParseRule,
    /// Absolute register addresses, first register most significant.
    pub registers: Vec<u16>,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub offset: Option<f64>,
    #[serde(default)]
    pub mask: Option<u16>,
    #[serde(default)]
    pub lookup: Option<Vec<LookupEntry>>,
    #[serde(default)]
    pub validation: Option<Validation>,
    /// Unit of measurement, informational only.
    #[serde(default)]
    pub uom: Option<String>,
}

fn default_scale() -> f64 {
    1.0
}

/// Decode rule, stored as the vendor's rule number in definition files.
/// Numbers 1 and 3 share the unsigned decode, 2 and 4 the signed one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, serde::Deserialize, serde::Serialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ParseRule {
    UnsignedInt,
    SignedInt,
    Ascii,
    BitField,
    VersionString,
    DateTime,
    TimeOfDay,
}

impl TryFrom<u8> for ParseRule {
    type Error = String;
    fn try_from(rule: u8) -> Result<Self, Self::Error> {
        match rule {
            1 | 3 => Ok(ParseRule::UnsignedInt),
            2 | 4 => Ok(ParseRule::SignedInt),
            5 => Ok(ParseRule::Ascii),
            6 => Ok(ParseRule::BitField),
            7 => Ok(ParseRule::VersionString),
            8 => Ok(ParseRule::DateTime),
            9 => Ok(ParseRule::TimeOfDay),
            other => Err(format!("unknown parse rule {other}")),
        }
    }
}

impl From<ParseRule> for u8 {
    fn from(rule: ParseRule) -> u8 {
        match rule {
            ParseRule::UnsignedInt => 1,
            ParseRule::SignedInt => 2,
            ParseRule::Ascii => 5,
            ParseRule::BitField => 6,
            ParseRule::VersionString => 7,
            ParseRule::DateTime => 8,
            ParseRule::TimeOfDay => 9,
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct LookupEntry {
    pub key: i64,
    pub value: String,
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct Validation {
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    /// When set, a violation poisons the entire poll cycle's dataset instead
    /// of just dropping this field.
    #[serde(default)]
    pub invalidate_all: bool,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not open the register map at {1:?}")]
    Open(#[source] std::io::Error, PathBuf),
    #[error("could not parse the register map at {1:?}")]
    Parse(#[source] serde_yaml::Error, PathBuf),
    #[error("register range {0:#06X}..={1:#06X} is inverted")]
    InvertedRange(u16, u16),
    #[error(
        "register range {0:#06X}..={1:#06X} spans {2} registers, more than the modbus limit of {limit}",
        limit = MAX_READ_COUNT
    )]
    RangeTooLong(u16, u16, u16),
    #[error("field `{0}` names no registers")]
    EmptyField(String),
    #[error("numeric field `{0}` spans {1} registers, more than the {limit} supported", limit = MAX_NUMERIC_REGISTERS)]
    FieldTooWide(String, usize),
}

/// Widest numeric field accepted: four registers already exhaust the 64-bit
/// range of the published integer values.
pub const MAX_NUMERIC_REGISTERS: usize = 4;

impl Schema {
    pub fn load(path: &Path) -> Result<Schema, Error> {
        let file = std::fs::File::open(path).map_err(|e| Error::Open(e, path.to_path_buf()))?;
        let schema: Schema =
            serde_yaml::from_reader(file).map_err(|e| Error::Parse(e, path.to_path_buf()))?;
        schema.validate()?;
        Ok(schema)
    }

    pub fn validate(&self) -> Result<(), Error> {
        for range in &self.requests {
            if range.end < range.start {
                return Err(Error::InvertedRange(range.start, range.end));
            }
            if range.count() > MAX_READ_COUNT {
                return Err(Error::RangeTooLong(range.start, range.end, range.count()));
            }
        }
        for field in self.fields() {
            if field.registers.is_empty() {
                return Err(Error::EmptyField(field.name.clone()));
            }
            let numeric = matches!(field.rule, ParseRule::UnsignedInt | ParseRule::SignedInt);
            if numeric && field.registers.len() > MAX_NUMERIC_REGISTERS {
                return Err(Error::FieldTooWide(field.name.clone(), field.registers.len()));
            }
        }
        Ok(())
    }

    /// Flattens the parameter groups into one field list.
    pub fn fields(&self) -> impl Iterator<Item = &FieldDefinition> {
        self.parameters.iter().flat_map(|group| group.items.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
requests:
  - start: 0x0003
    end: 0x000E
    mb_functioncode: 0x03
  - start: 0x003B
    end: 0x0070
    mb_functioncode: 0x04
    interval: 300
parameters:
  - group: solar
    items:
      - name: "PV1 Voltage"
        rule: 1
        registers: [0x006D]
        scale: 0.1
        uom: V
      - name: "Running Status"
        rule: 1
        registers: [0x003B]
        lookup:
          - key: 0
            value: "Standby"
          - key: 1
            value: "Generating"
  - group: device
    items:
      - name: "Daily Production"
        rule: 2
        registers: [0x0041, 0x0042]
        scale: 1
        validation:
          min: 0
          max: 100000
          invalidate_all: true
"#;

    #[test]
    fn deserializes_vendor_yaml() {
        let schema: Schema = serde_yaml::from_str(EXAMPLE).unwrap();
        schema.validate().unwrap();
        assert_eq!(schema.requests.len(), 2);
        assert_eq!(schema.requests[0].function_code, FunctionCode::ReadHoldings);
        assert_eq!(schema.requests[0].interval, None);
        assert_eq!(schema.requests[1].function_code, FunctionCode::ReadInputs);
        assert_eq!(schema.requests[1].interval, Some(300));
        assert_eq!(schema.requests[1].count(), 0x0070 - 0x003B + 1);

        let fields: Vec<_> = schema.fields().collect();
        assert_eq!(fields.len(), 3);
        assert_eq!(fields[0].rule, ParseRule::UnsignedInt);
        assert_eq!(fields[0].scale, 0.1);
        assert_eq!(fields[1].lookup.as_ref().unwrap().len(), 2);
        assert_eq!(fields[2].rule, ParseRule::SignedInt);
        assert!(fields[2].validation.as_ref().unwrap().invalidate_all);
    }

    #[test]
    fn rejects_inverted_range() {
        let schema = Schema {
            requests: vec![RegisterRange {
                start: 10,
                end: 5,
                function_code: FunctionCode::ReadHoldings,
                interval: None,
            }],
            parameters: vec![],
        };
        assert!(matches!(schema.validate(), Err(Error::InvertedRange(10, 5))));
    }

    #[test]
    fn rejects_overlong_range() {
        let schema = Schema {
            requests: vec![RegisterRange {
                start: 0,
                end: 200,
                function_code: FunctionCode::ReadHoldings,
                interval: None,
            }],
            parameters: vec![],
        };
        assert!(matches!(schema.validate(), Err(Error::RangeTooLong(0, 200, 201))));
    }

    #[test]
    fn rejects_overwide_numeric_field() {
        let schema = Schema {
            requests: vec![],
            parameters: vec![ParameterGroup {
                group: "device".to_string(),
                items: vec![FieldDefinition {
                    name: "wide".to_string(),
                    rule: ParseRule::SignedInt,
                    registers: (0..5).collect(),
                    scale: 1.0,
                    offset: None,
                    mask: None,
                    lookup: None,
                    validation: None,
                    uom: None,
                }],
            }],
        };
        assert!(matches!(schema.validate(), Err(Error::FieldTooWide(_, 5))));
    }

    #[test]
    fn unknown_rule_number_fails_to_parse() {
        let result: Result<ParseRule, _> = serde_yaml::from_str("17");
        assert!(result.is_err());
    }
}
