//! Coercion between OPC UA variants and supervisor tag values.
//!
//! Projection (read side) and set-value conversion (write side) are pure
//! functions; everything stateful lives in the registry.

use crate::types::TagValue;
use chrono::{NaiveDateTime, TimeZone, Utc};
use opcua::types::{Array, DateTime as UaDateTime, UAString, Variant};
use serde_json::Value as JsonValue;
use uabridge_error::{BridgeError, BridgeResult};
use uabridge_model::{TagConfig, TagKind};

/// Longest string the supervisor accepts for a `string` tag. The truncation
/// is observable on the wire and must not change.
const STRING_VALUE_LIMIT: usize = 16;

/// `0x5af3107a4000` == 10^14, the limb divisor for 64-bit decimal rendering.
const LIMB_DIVISOR: u64 = 0x5af3_107a_4000;

/// Supervisor date format accepted on writes.
const SET_DATETIME_FORMAT: &str = "%d.%m.%Y %H:%M:%S";

/// Project a raw variant into the supervisor value for one tag.
///
/// `None` input (never observed) projects to `None`. A tag with
/// `arrayIndex >= 0` projects the addressed element of an array-typed value;
/// out-of-range indices and non-array values project to `None`.
pub fn project_value(cfg: &TagConfig, raw: Option<&Variant>) -> Option<TagValue> {
    let raw = raw?;
    if cfg.array_index < 0 {
        return project_scalar(cfg.kind, raw);
    }
    match raw {
        Variant::Array(arr) => arr
            .values
            .get(cfg.array_index as usize)
            .and_then(|v| project_scalar(cfg.kind, v)),
        _ => None,
    }
}

/// Project a scalar variant through the tag's declared supervisor type.
pub fn project_scalar(kind: TagKind, v: &Variant) -> Option<TagValue> {
    match kind {
        TagKind::Datetime => match v {
            Variant::DateTime(dt) => Some(TagValue::Int(dt.as_chrono().timestamp_millis())),
            _ => None,
        },
        TagKind::Bool => Some(TagValue::Int(if variant_truthy(v) { 1 } else { 0 })),
        TagKind::String => {
            let text = variant_display(v)?;
            Some(TagValue::Text(text.chars().take(STRING_VALUE_LIMIT).collect()))
        }
        TagKind::Int | TagKind::Float => project_numeric(v),
    }
}

/// Numeric pass-through with 64-bit correction.
///
/// `Int64`/`UInt64` render as exact decimal strings via the two-limb word
/// algorithm; smaller integers and floats pass through numerically; strings
/// that parse as finite numbers pass through numerically, anything else as
/// the string itself.
fn project_numeric(v: &Variant) -> Option<TagValue> {
    match v {
        Variant::Int64(n) => {
            let words = *n as u64;
            Some(TagValue::Text(int64_words_to_decimal(
                (words >> 32) as u32,
                words as u32,
                true,
            )))
        }
        Variant::UInt64(n) => Some(TagValue::Text(int64_words_to_decimal(
            (*n >> 32) as u32,
            *n as u32,
            false,
        ))),
        Variant::SByte(n) => Some(TagValue::Int(*n as i64)),
        Variant::Byte(n) => Some(TagValue::Int(*n as i64)),
        Variant::Int16(n) => Some(TagValue::Int(*n as i64)),
        Variant::UInt16(n) => Some(TagValue::Int(*n as i64)),
        Variant::Int32(n) => Some(TagValue::Int(*n as i64)),
        Variant::UInt32(n) => Some(TagValue::Int(*n as i64)),
        Variant::Float(f) => Some(TagValue::Float(*f as f64)),
        Variant::Double(f) => Some(TagValue::Float(*f)),
        Variant::Boolean(b) => Some(TagValue::Int(if *b { 1 } else { 0 })),
        Variant::DateTime(dt) => Some(TagValue::Int(dt.as_chrono().timestamp_millis())),
        Variant::String(s) => {
            let raw = s.as_ref();
            match raw.trim().parse::<f64>() {
                Ok(n) if n.is_finite() => {
                    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
                        Some(TagValue::Int(n as i64))
                    } else {
                        Some(TagValue::Float(n))
                    }
                }
                _ => Some(TagValue::Text(raw.to_string())),
            }
        }
        _ => None,
    }
}

/// Render a 64-bit value given as two 32-bit words into its exact decimal
/// form. The signed case negates via two's-complement over the pair and
/// prefixes `-`; both cases reduce through the fixed 10^14 limb divisor and
/// zero-pad the low limb to 14 digits when a high limb is present.
pub fn int64_words_to_decimal(hi: u32, lo: u32, signed: bool) -> String {
    let mut value = ((hi as u64) << 32) | lo as u64;
    let negative = signed && hi & 0x8000_0000 != 0;
    if negative {
        value = value.wrapping_neg();
    }
    let high_limb = value / LIMB_DIVISOR;
    let low_limb = value % LIMB_DIVISOR;
    let digits = if high_limb > 0 {
        format!("{high_limb}{low_limb:014}")
    } else {
        low_limb.to_string()
    };
    if negative {
        format!("-{digits}")
    } else {
        digits
    }
}

fn variant_truthy(v: &Variant) -> bool {
    match v {
        Variant::Boolean(b) => *b,
        Variant::SByte(n) => *n != 0,
        Variant::Byte(n) => *n != 0,
        Variant::Int16(n) => *n != 0,
        Variant::UInt16(n) => *n != 0,
        Variant::Int32(n) => *n != 0,
        Variant::UInt32(n) => *n != 0,
        Variant::Int64(n) => *n != 0,
        Variant::UInt64(n) => *n != 0,
        Variant::Float(f) => *f != 0.0,
        Variant::Double(f) => *f != 0.0,
        Variant::String(s) => !s.as_ref().is_empty(),
        Variant::Empty => false,
        _ => true,
    }
}

fn variant_display(v: &Variant) -> Option<String> {
    match v {
        Variant::String(s) => Some(s.as_ref().to_string()),
        Variant::Boolean(b) => Some(b.to_string()),
        Variant::SByte(n) => Some(n.to_string()),
        Variant::Byte(n) => Some(n.to_string()),
        Variant::Int16(n) => Some(n.to_string()),
        Variant::UInt16(n) => Some(n.to_string()),
        Variant::Int32(n) => Some(n.to_string()),
        Variant::UInt32(n) => Some(n.to_string()),
        Variant::Int64(n) => Some(n.to_string()),
        Variant::UInt64(n) => Some(n.to_string()),
        Variant::Float(f) => Some(f.to_string()),
        Variant::Double(f) => Some(f.to_string()),
        Variant::DateTime(dt) => Some(dt.as_chrono().to_rfc3339()),
        _ => None,
    }
}

/// OPC UA DataType numeric code observed for a variant (0 if unavailable).
/// Arrays report their element type.
pub fn variant_data_type_code(v: &Variant) -> u32 {
    match v {
        Variant::Boolean(_) => 1,
        Variant::SByte(_) => 2,
        Variant::Byte(_) => 3,
        Variant::Int16(_) => 4,
        Variant::UInt16(_) => 5,
        Variant::Int32(_) => 6,
        Variant::UInt32(_) => 7,
        Variant::Int64(_) => 8,
        Variant::UInt64(_) => 9,
        Variant::Float(_) => 10,
        Variant::Double(_) => 11,
        Variant::String(_) => 12,
        Variant::DateTime(_) => 13,
        Variant::Guid(_) => 14,
        Variant::ByteString(_) => 15,
        Variant::Array(arr) => arr
            .values
            .first()
            .map(variant_data_type_code)
            .unwrap_or(0),
        _ => 0,
    }
}

/// Coerce a supervisor set-value into the variant matching the tag's
/// declared OPC UA node type.
pub fn set_value_to_variant(cfg: &TagConfig, value: &JsonValue) -> BridgeResult<Variant> {
    match cfg.node_type {
        1 => Ok(Variant::Boolean(json_truthy(value))),
        2 => narrow(cfg, json_i64(cfg, value)?, i8::try_from).map(Variant::SByte),
        3 => narrow(cfg, json_i64(cfg, value)?, u8::try_from).map(Variant::Byte),
        4 => narrow(cfg, json_i64(cfg, value)?, i16::try_from).map(Variant::Int16),
        5 => narrow(cfg, json_i64(cfg, value)?, u16::try_from).map(Variant::UInt16),
        6 => narrow(cfg, json_i64(cfg, value)?, i32::try_from).map(Variant::Int32),
        7 => narrow(cfg, json_i64(cfg, value)?, u32::try_from).map(Variant::UInt32),
        8 => Ok(Variant::Int64(json_i64(cfg, value)?)),
        9 => Ok(Variant::UInt64(json_u64(cfg, value)?)),
        10 => Ok(Variant::Float(json_f64(cfg, value)? as f32)),
        11 => Ok(Variant::Double(json_f64(cfg, value)?)),
        12 => Ok(Variant::String(UAString::from(json_text(value)))),
        13 => {
            let millis = json_datetime_millis(cfg, value)?;
            let dt = Utc
                .timestamp_millis_opt(millis)
                .single()
                .ok_or_else(|| write_fail(cfg, "timestamp out of range"))?;
            Ok(Variant::DateTime(Box::new(UaDateTime::from(dt))))
        }
        other => Err(BridgeError::ConfigError(format!(
            "tag {}: unsupported node type {other}",
            cfg.name
        ))),
    }
}

/// Build the write payload for an indexed write: copy the last observed
/// array value, replace the addressed element, return the whole array.
pub fn splice_array_element(
    original: &Variant,
    cfg: &TagConfig,
    value: &JsonValue,
) -> BridgeResult<Variant> {
    let arr = match original {
        Variant::Array(arr) => arr,
        _ => {
            return Err(BridgeError::WriteFail(format!(
                "tag {}: observed value is not array-typed",
                cfg.name
            )))
        }
    };
    let idx = cfg.array_index as usize;
    if cfg.array_index < 0 || idx >= arr.values.len() {
        return Err(BridgeError::WriteFail(format!(
            "tag {}: array index {} out of range ({} elements)",
            cfg.name,
            cfg.array_index,
            arr.values.len()
        )));
    }
    let mut values = arr.values.clone();
    values[idx] = set_value_to_variant(cfg, value)?;
    let rebuilt = Array::new(arr.value_type, values)
        .map_err(|e| BridgeError::WriteFail(format!("tag {}: array rebuild: {e:?}", cfg.name)))?;
    Ok(Variant::Array(Box::new(rebuilt)))
}

/// Parse the supervisor date format `DD.MM.YYYY HH:mm:ss` as UTC.
pub fn parse_supervisor_datetime(s: &str) -> BridgeResult<i64> {
    let naive = NaiveDateTime::parse_from_str(s.trim(), SET_DATETIME_FORMAT)
        .map_err(|e| BridgeError::WriteFail(format!("bad datetime {s:?}: {e}")))?;
    Ok(naive.and_utc().timestamp_millis())
}

fn json_truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        JsonValue::String(s) => !s.is_empty(),
        JsonValue::Null => false,
        _ => true,
    }
}

fn json_text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn json_i64(cfg: &TagConfig, value: &JsonValue) -> BridgeResult<i64> {
    match value {
        JsonValue::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.round() as i64))
            .ok_or_else(|| write_fail(cfg, "not an integer")),
        JsonValue::String(s) => s
            .trim()
            .parse::<i64>()
            .or_else(|_| s.trim().parse::<f64>().map(|f| f.round() as i64))
            .map_err(|_| write_fail(cfg, "not an integer")),
        JsonValue::Bool(b) => Ok(if *b { 1 } else { 0 }),
        _ => Err(write_fail(cfg, "not an integer")),
    }
}

fn json_u64(cfg: &TagConfig, value: &JsonValue) -> BridgeResult<u64> {
    match value {
        JsonValue::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f.round() as u64))
            .ok_or_else(|| write_fail(cfg, "not an unsigned integer")),
        JsonValue::String(s) => s
            .trim()
            .parse::<u64>()
            .map_err(|_| write_fail(cfg, "not an unsigned integer")),
        JsonValue::Bool(b) => Ok(if *b { 1 } else { 0 }),
        _ => Err(write_fail(cfg, "not an unsigned integer")),
    }
}

fn json_f64(cfg: &TagConfig, value: &JsonValue) -> BridgeResult<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64().ok_or_else(|| write_fail(cfg, "not a number")),
        JsonValue::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| write_fail(cfg, "not a number")),
        JsonValue::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        _ => Err(write_fail(cfg, "not a number")),
    }
}

fn json_datetime_millis(cfg: &TagConfig, value: &JsonValue) -> BridgeResult<i64> {
    match value {
        JsonValue::String(s) => parse_supervisor_datetime(s),
        JsonValue::Number(_) => json_i64(cfg, value),
        _ => Err(write_fail(cfg, "not a datetime")),
    }
}

fn narrow<T, E>(cfg: &TagConfig, wide: i64, conv: impl FnOnce(i64) -> Result<T, E>) -> BridgeResult<T> {
    conv(wide).map_err(|_| write_fail(cfg, "value out of range"))
}

fn write_fail(cfg: &TagConfig, why: &str) -> BridgeError {
    BridgeError::WriteFail(format!("tag {}: {why}", cfg.name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use opcua::types::VariantScalarTypeId;

    fn cfg(kind: TagKind, node_type: u32, array_index: i64) -> TagConfig {
        TagConfig {
            name: "t".into(),
            kind,
            read: true,
            write: true,
            node_id: "ns=2;s=T".into(),
            node_type,
            array_index,
        }
    }

    fn words_i64(v: i64) -> (u32, u32) {
        let w = v as u64;
        ((w >> 32) as u32, w as u32)
    }

    #[test]
    fn int64_decimal_matches_arbitrary_precision() {
        for v in [
            0i64,
            1,
            -1,
            42,
            -42,
            99_999_999_999_999,
            100_000_000_000_000,
            100_000_000_000_007,
            i64::MAX,
            i64::MIN,
            i64::MIN + 1,
        ] {
            let (hi, lo) = words_i64(v);
            assert_eq!(
                int64_words_to_decimal(hi, lo, true),
                (v as i128).to_string(),
                "signed {v}"
            );
        }
    }

    #[test]
    fn uint64_decimal_matches_arbitrary_precision() {
        for v in [
            0u64,
            1,
            99_999_999_999_999,
            100_000_000_000_000,
            u64::MAX,
            u64::MAX - 1,
            1 << 63,
        ] {
            assert_eq!(
                int64_words_to_decimal((v >> 32) as u32, v as u32, false),
                v.to_string(),
                "unsigned {v}"
            );
        }
    }

    #[test]
    fn unobserved_value_projects_to_none() {
        assert_eq!(project_value(&cfg(TagKind::Float, 11, -1), None), None);
    }

    #[test]
    fn array_index_projection() {
        let arr = Array::new(
            VariantScalarTypeId::Int32,
            vec![Variant::Int32(1), Variant::Int32(2), Variant::Int32(3), Variant::Int32(4)],
        )
        .unwrap();
        let raw = Variant::Array(Box::new(arr));

        let first = cfg(TagKind::Int, 6, 0);
        let last = cfg(TagKind::Int, 6, 3);
        let beyond = cfg(TagKind::Int, 6, 9);
        assert_eq!(project_value(&first, Some(&raw)), Some(TagValue::Int(1)));
        assert_eq!(project_value(&last, Some(&raw)), Some(TagValue::Int(4)));
        assert_eq!(project_value(&beyond, Some(&raw)), None);
        // scalar raw under an indexed tag projects to nothing
        assert_eq!(project_value(&beyond, Some(&Variant::Int32(7))), None);
    }

    #[test]
    fn string_projection_truncates_to_sixteen_chars() {
        let long = Variant::String(UAString::from("abcdefghijklmnopqrstuvwxyz"));
        assert_eq!(
            project_scalar(TagKind::String, &long),
            Some(TagValue::Text("abcdefghijklmnop".into()))
        );
    }

    #[test]
    fn bool_projection_is_numeric() {
        assert_eq!(
            project_scalar(TagKind::Bool, &Variant::Boolean(true)),
            Some(TagValue::Int(1))
        );
        assert_eq!(
            project_scalar(TagKind::Bool, &Variant::Int32(0)),
            Some(TagValue::Int(0))
        );
        assert_eq!(
            project_scalar(TagKind::Bool, &Variant::String(UAString::from(""))),
            Some(TagValue::Int(0))
        );
    }

    #[test]
    fn datetime_round_trips_modulo_seconds() {
        let written = set_value_to_variant(
            &cfg(TagKind::Datetime, 13, -1),
            &JsonValue::from("05.03.2021 07:08:09"),
        )
        .unwrap();
        let projected = project_scalar(TagKind::Datetime, &written).unwrap();
        let expected = parse_supervisor_datetime("05.03.2021 07:08:09").unwrap();
        assert_eq!(projected, TagValue::Int(expected));
        // and the parse itself is UTC
        assert_eq!(expected % 1000, 0);
    }

    #[test]
    fn numeric_strings_pass_through_numerically() {
        assert_eq!(
            project_scalar(TagKind::Float, &Variant::String(UAString::from("12.5"))),
            Some(TagValue::Float(12.5))
        );
        assert_eq!(
            project_scalar(TagKind::Int, &Variant::String(UAString::from("17"))),
            Some(TagValue::Int(17))
        );
        assert_eq!(
            project_scalar(TagKind::Int, &Variant::String(UAString::from("off"))),
            Some(TagValue::Text("off".into()))
        );
    }

    #[test]
    fn set_value_respects_node_type() {
        let v = set_value_to_variant(&cfg(TagKind::Int, 4, -1), &JsonValue::from(12)).unwrap();
        assert_eq!(v, Variant::Int16(12));
        let v = set_value_to_variant(&cfg(TagKind::Bool, 1, -1), &JsonValue::from(0)).unwrap();
        assert_eq!(v, Variant::Boolean(false));
        let v =
            set_value_to_variant(&cfg(TagKind::Float, 11, -1), &JsonValue::from(2.25)).unwrap();
        assert_eq!(v, Variant::Double(2.25));
        assert!(set_value_to_variant(&cfg(TagKind::Int, 3, -1), &JsonValue::from(-1)).is_err());
    }

    #[test]
    fn splice_replaces_single_element() {
        let arr = Array::new(
            VariantScalarTypeId::Int32,
            vec![
                Variant::Int32(10),
                Variant::Int32(20),
                Variant::Int32(30),
                Variant::Int32(40),
            ],
        )
        .unwrap();
        let original = Variant::Array(Box::new(arr));
        let spliced =
            splice_array_element(&original, &cfg(TagKind::Int, 6, 2), &JsonValue::from(99))
                .unwrap();
        match spliced {
            Variant::Array(out) => {
                let got: Vec<_> = out.values.clone();
                assert_eq!(
                    got,
                    vec![
                        Variant::Int32(10),
                        Variant::Int32(20),
                        Variant::Int32(99),
                        Variant::Int32(40)
                    ]
                );
            }
            other => panic!("expected array, got {other:?}"),
        }
        // prior scalar observation cannot satisfy an indexed write
        assert!(splice_array_element(
            &Variant::Int32(1),
            &cfg(TagKind::Int, 6, 2),
            &JsonValue::from(99)
        )
        .is_err());
    }

    #[test]
    fn browse_type_codes() {
        assert_eq!(variant_data_type_code(&Variant::Double(1.0)), 11);
        assert_eq!(variant_data_type_code(&Variant::Boolean(true)), 1);
        let arr = Array::new(VariantScalarTypeId::UInt16, vec![Variant::UInt16(1)]).unwrap();
        assert_eq!(variant_data_type_code(&Variant::Array(Box::new(arr))), 5);
    }
}
