//! Shard-key values, key patterns and key ranges.
//!
//! Values of different types compare by a fixed canonical type order, never by
//! value: `MinKey < Null < numbers < String < Object < Array < Bool < MaxKey`.
//! Numbers compare numerically regardless of integer/double representation.

use crate::error::{Result, ShardgateError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::cmp::Ordering;
use std::fmt;

const RANK_MIN_KEY: u8 = 0;
const RANK_NULL: u8 = 1;
const RANK_NUMBER: u8 = 2;
const RANK_STRING: u8 = 3;
const RANK_OBJECT: u8 = 4;
const RANK_ARRAY: u8 = 5;
const RANK_BOOL: u8 = 6;
const RANK_MAX_KEY: u8 = 7;

fn is_min_key_json(v: &Value) -> bool {
    matches!(v, Value::Object(m) if m.len() == 1 && m.contains_key("$minKey"))
}

fn is_max_key_json(v: &Value) -> bool {
    matches!(v, Value::Object(m) if m.len() == 1 && m.contains_key("$maxKey"))
}

pub(crate) fn json_rank(v: &Value) -> u8 {
    match v {
        Value::Null => RANK_NULL,
        Value::Number(_) => RANK_NUMBER,
        Value::String(_) => RANK_STRING,
        Value::Object(_) if is_min_key_json(v) => RANK_MIN_KEY,
        Value::Object(_) if is_max_key_json(v) => RANK_MAX_KEY,
        Value::Object(_) => RANK_OBJECT,
        Value::Array(_) => RANK_ARRAY,
        Value::Bool(_) => RANK_BOOL,
    }
}

fn cmp_f64(a: f64, b: f64) -> Ordering {
    // NaN sorts below every other number.
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        _ => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}

/// Exact integer/double comparison. Casting the integer to `f64` would
/// round above 2^53 and break transitivity.
fn cmp_int_f64(i: i128, d: f64) -> Ordering {
    const LIMIT: f64 = 170_141_183_460_469_231_731_687_303_715_884_105_728.0; // 2^127
    if d.is_nan() {
        return Ordering::Greater;
    }
    if d >= LIMIT {
        return Ordering::Less;
    }
    if d < -LIMIT {
        return Ordering::Greater;
    }
    let whole = d.trunc();
    i.cmp(&(whole as i128)).then_with(|| cmp_f64(whole, d))
}

fn json_int(n: &Number) -> Option<i128> {
    n.as_i64().map(i128::from).or_else(|| n.as_u64().map(i128::from))
}

fn cmp_json_numbers(a: &Number, b: &Number) -> Ordering {
    match (json_int(a), json_int(b)) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(x), None) => cmp_int_f64(x, b.as_f64().unwrap_or(f64::NAN)),
        (None, Some(y)) => cmp_int_f64(y, a.as_f64().unwrap_or(f64::NAN)).reverse(),
        (None, None) => cmp_f64(
            a.as_f64().unwrap_or(f64::NAN),
            b.as_f64().unwrap_or(f64::NAN),
        ),
    }
}

/// Total order over arbitrary JSON values using the canonical type order.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    let (ra, rb) = (json_rank(a), json_rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => cmp_json_numbers(x, y),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (l, r) in x.iter().zip(y.iter()) {
                let ord = compare_values(l, r);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) if ra == RANK_OBJECT => compare_objects(x, y),
        _ => Ordering::Equal,
    }
}

fn compare_objects(x: &Map<String, Value>, y: &Map<String, Value>) -> Ordering {
    for ((lk, lv), (rk, rv)) in x.iter().zip(y.iter()) {
        let ord = json_rank(lv)
            .cmp(&json_rank(rv))
            .then_with(|| lk.cmp(rk))
            .then_with(|| compare_values(lv, rv));
        if ord != Ordering::Equal {
            return ord;
        }
    }
    x.len().cmp(&y.len())
}

/// Walk a dotted path through nested objects.
pub fn get_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cur = doc;
    for part in path.split('.') {
        cur = cur.as_object()?.get(part)?;
    }
    Some(cur)
}

/// One typed field of a shard key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum KeyValue {
    MinKey,
    Null,
    Int(i64),
    Double(f64),
    String(String),
    Object(Vec<(String, KeyValue)>),
    Bool(bool),
    MaxKey,
}

impl KeyValue {
    fn rank(&self) -> u8 {
        match self {
            KeyValue::MinKey => RANK_MIN_KEY,
            KeyValue::Null => RANK_NULL,
            KeyValue::Int(_) | KeyValue::Double(_) => RANK_NUMBER,
            KeyValue::String(_) => RANK_STRING,
            KeyValue::Object(_) => RANK_OBJECT,
            KeyValue::Bool(_) => RANK_BOOL,
            KeyValue::MaxKey => RANK_MAX_KEY,
        }
    }

    pub fn from_json(value: &Value) -> Result<Self> {
        Ok(match value {
            Value::Null => KeyValue::Null,
            Value::Bool(b) => KeyValue::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => KeyValue::Int(i),
                None => KeyValue::Double(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => KeyValue::String(s.clone()),
            Value::Array(_) => {
                return Err(ShardgateError::BadValue(
                    "shard key values cannot be arrays".to_string(),
                ))
            }
            v if is_min_key_json(v) => KeyValue::MinKey,
            v if is_max_key_json(v) => KeyValue::MaxKey,
            Value::Object(map) => KeyValue::Object(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), KeyValue::from_json(v)?)))
                    .collect::<Result<Vec<_>>>()?,
            ),
        })
    }

    pub fn to_json(&self) -> Value {
        match self {
            KeyValue::MinKey => serde_json::json!({ "$minKey": 1 }),
            KeyValue::MaxKey => serde_json::json!({ "$maxKey": 1 }),
            KeyValue::Null => Value::Null,
            KeyValue::Int(i) => Value::from(*i),
            KeyValue::Double(d) => Number::from_f64(*d).map(Value::Number).unwrap_or(Value::Null),
            KeyValue::String(s) => Value::String(s.clone()),
            KeyValue::Bool(b) => Value::Bool(*b),
            KeyValue::Object(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    pub fn is_min(&self) -> bool {
        matches!(self, KeyValue::MinKey)
    }

    pub fn is_max(&self) -> bool {
        matches!(self, KeyValue::MaxKey)
    }

    /// True for strings and for objects holding a string anywhere; such values
    /// order differently under a non-simple collation.
    pub fn contains_string(&self) -> bool {
        match self {
            KeyValue::String(_) => true,
            KeyValue::Object(fields) => fields.iter().any(|(_, v)| v.contains_string()),
            _ => false,
        }
    }
}

impl Ord for KeyValue {
    fn cmp(&self, other: &Self) -> Ordering {
        let (ra, rb) = (self.rank(), other.rank());
        if ra != rb {
            return ra.cmp(&rb);
        }
        match (self, other) {
            (KeyValue::Int(a), KeyValue::Int(b)) => a.cmp(b),
            (KeyValue::Int(a), KeyValue::Double(b)) => cmp_int_f64(i128::from(*a), *b),
            (KeyValue::Double(a), KeyValue::Int(b)) => cmp_int_f64(i128::from(*b), *a).reverse(),
            (KeyValue::Double(a), KeyValue::Double(b)) => cmp_f64(*a, *b),
            (KeyValue::String(a), KeyValue::String(b)) => a.cmp(b),
            (KeyValue::Bool(a), KeyValue::Bool(b)) => a.cmp(b),
            (KeyValue::Object(a), KeyValue::Object(b)) => {
                for ((lk, lv), (rk, rv)) in a.iter().zip(b.iter()) {
                    let ord = lv
                        .rank()
                        .cmp(&rv.rank())
                        .then_with(|| lk.cmp(rk))
                        .then_with(|| lv.cmp(rv));
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            _ => Ordering::Equal,
        }
    }
}

impl PartialOrd for KeyValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for KeyValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for KeyValue {}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::MinKey => f.write_str("MinKey"),
            KeyValue::MaxKey => f.write_str("MaxKey"),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

impl From<i64> for KeyValue {
    fn from(value: i64) -> Self {
        KeyValue::Int(value)
    }
}

impl From<&str> for KeyValue {
    fn from(value: &str) -> Self {
        KeyValue::String(value.to_string())
    }
}

/// Tuple of field values, ordered lexicographically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardKey(Vec<KeyValue>);

impl ShardKey {
    pub fn new(values: Vec<KeyValue>) -> Self {
        Self(values)
    }

    pub fn global_min(len: usize) -> Self {
        Self(vec![KeyValue::MinKey; len])
    }

    pub fn global_max(len: usize) -> Self {
        Self(vec![KeyValue::MaxKey; len])
    }

    pub fn values(&self) -> &[KeyValue] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_global_min(&self) -> bool {
        !self.0.is_empty() && self.0.iter().all(KeyValue::is_min)
    }

    pub fn is_global_max(&self) -> bool {
        !self.0.is_empty() && self.0.iter().all(KeyValue::is_max)
    }

    /// Append `fill` until the key has `len` fields.
    pub fn extend_with(&self, len: usize, fill: KeyValue) -> Self {
        let mut values = self.0.clone();
        while values.len() < len {
            values.push(fill.clone());
        }
        Self(values)
    }

    pub fn prefix(&self, len: usize) -> Self {
        Self(self.0.iter().take(len).cloned().collect())
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{ ")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{v}")?;
        }
        f.write_str(" }")
    }
}

impl From<Vec<KeyValue>> for ShardKey {
    fn from(values: Vec<KeyValue>) -> Self {
        Self(values)
    }
}

/// Ordered list of dotted field paths describing how a key is extracted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardKeyPattern {
    fields: Vec<String>,
}

impl ShardKeyPattern {
    pub fn new<S: Into<String>>(fields: Vec<S>) -> Result<Self> {
        let fields: Vec<String> = fields.into_iter().map(Into::into).collect();
        if fields.is_empty() {
            return Err(ShardgateError::BadValue(
                "shard key pattern must have at least one field".to_string(),
            ));
        }
        for (i, field) in fields.iter().enumerate() {
            if field.is_empty() || field.starts_with('$') || field.split('.').any(str::is_empty) {
                return Err(ShardgateError::BadValue(format!(
                    "invalid shard key field '{field}'"
                )));
            }
            if fields[..i].contains(field) {
                return Err(ShardgateError::BadValue(format!(
                    "duplicate shard key field '{field}'"
                )));
            }
        }
        Ok(Self { fields })
    }

    /// Parse `{"a": 1, "b.c": 1}`. Only ascending range keys are supported.
    pub fn from_json(value: &Value) -> Result<Self> {
        let obj = value.as_object().ok_or_else(|| {
            ShardgateError::BadValue("shard key pattern must be an object".to_string())
        })?;
        let mut fields = Vec::with_capacity(obj.len());
        for (field, dir) in obj {
            if dir.as_i64() != Some(1) {
                return Err(ShardgateError::BadValue(format!(
                    "unsupported shard key direction for '{field}': {dir}"
                )));
            }
            fields.push(field.clone());
        }
        Self::new(fields)
    }

    pub fn to_json(&self) -> Value {
        Value::Object(
            self.fields
                .iter()
                .map(|f| (f.clone(), Value::from(1)))
                .collect(),
        )
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn global_min(&self) -> ShardKey {
        ShardKey::global_min(self.len())
    }

    pub fn global_max(&self) -> ShardKey {
        ShardKey::global_max(self.len())
    }

    pub fn global_range(&self) -> KeyRange {
        KeyRange {
            min: self.global_min(),
            max: self.global_max(),
        }
    }

    /// Extract the key of a document. Missing fields extract as `Null`.
    pub fn extract_from_document(&self, doc: &Value) -> Result<ShardKey> {
        let mut values = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            let mut cur = Some(doc);
            for part in field.split('.') {
                cur = match cur {
                    Some(Value::Object(map)) => map.get(part),
                    Some(Value::Array(_)) => {
                        return Err(ShardgateError::BadValue(format!(
                            "shard key path '{field}' traverses an array"
                        )))
                    }
                    _ => None,
                };
            }
            values.push(match cur {
                Some(v) => KeyValue::from_json(v)?,
                None => KeyValue::Null,
            });
        }
        Ok(ShardKey(values))
    }

    /// Parse a key given as an object naming every pattern field.
    pub fn parse_key(&self, value: &Value) -> Result<ShardKey> {
        let obj = value
            .as_object()
            .ok_or_else(|| ShardgateError::BadValue(format!("shard key must be an object: {value}")))?;
        if obj.len() != self.fields.len() {
            return Err(ShardgateError::BadValue(format!(
                "key {value} does not match shard key pattern {}",
                self.to_json()
            )));
        }
        let values = self
            .fields
            .iter()
            .map(|f| {
                obj.get(f).map(KeyValue::from_json).unwrap_or_else(|| {
                    Err(ShardgateError::BadValue(format!(
                        "key {value} is missing shard key field '{f}'"
                    )))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(ShardKey(values))
    }

    pub fn to_json_key(&self, key: &ShardKey) -> Value {
        Value::Object(
            self.fields
                .iter()
                .zip(key.values())
                .map(|(f, v)| (f.clone(), v.to_json()))
                .collect(),
        )
    }

    pub fn is_prefix_of(&self, other: &ShardKeyPattern) -> bool {
        self.fields.len() <= other.fields.len()
            && self.fields.iter().zip(other.fields.iter()).all(|(a, b)| a == b)
    }

    /// A pattern may only be refined by appending fields.
    pub fn validate_refinement(&self, refined: &ShardKeyPattern) -> Result<()> {
        if refined.len() <= self.len() || !self.is_prefix_of(refined) {
            return Err(ShardgateError::BadValue(format!(
                "refined shard key {} must extend current shard key {} by appending fields",
                refined.to_json(),
                self.to_json()
            )));
        }
        Ok(())
    }

    pub fn is_valid_key(&self, key: &ShardKey) -> bool {
        key.len() == self.len()
    }
}

impl fmt::Display for ShardKeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

/// Half-open interval `[min, max)` of shard keys.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyRange {
    pub min: ShardKey,
    pub max: ShardKey,
}

impl KeyRange {
    pub fn new(min: ShardKey, max: ShardKey) -> Result<Self> {
        if min >= max {
            return Err(ShardgateError::BadValue(format!(
                "range min {min} must be less than max {max}"
            )));
        }
        if min.len() != max.len() {
            return Err(ShardgateError::BadValue(format!(
                "range bounds {min} and {max} have different shapes"
            )));
        }
        Ok(Self { min, max })
    }

    pub fn contains(&self, key: &ShardKey) -> bool {
        *key >= self.min && (*key < self.max || (self.max.is_global_max() && *key == self.max))
    }

    pub fn overlaps(&self, other: &KeyRange) -> bool {
        self.min < other.max && other.min < self.max
    }

    pub fn covers(&self, other: &KeyRange) -> bool {
        self.min <= other.min && other.max <= self.max
    }

    pub fn is_global_min(&self) -> bool {
        self.min.is_global_min()
    }

    pub fn is_global_max(&self) -> bool {
        self.max.is_global_max()
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.min, self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(values: Vec<KeyValue>) -> ShardKey {
        ShardKey::new(values)
    }

    #[test]
    fn mixed_types_use_canonical_order() {
        let ordered = vec![
            KeyValue::MinKey,
            KeyValue::Null,
            KeyValue::Int(-5),
            KeyValue::Double(2.5),
            KeyValue::Int(3),
            KeyValue::String("a".into()),
            KeyValue::String("b".into()),
            KeyValue::Object(vec![("x".into(), KeyValue::Int(1))]),
            KeyValue::Bool(false),
            KeyValue::Bool(true),
            KeyValue::MaxKey,
        ];
        for pair in ordered.windows(2) {
            assert!(pair[0] < pair[1], "{} < {}", pair[0], pair[1]);
        }
        assert_eq!(KeyValue::Int(2), KeyValue::Double(2.0));
        // A huge number still sorts before any string.
        assert!(KeyValue::Double(1e300) < KeyValue::String(String::new()));
    }

    #[test]
    fn mixed_int_double_comparison_is_exact() {
        let big = 1i64 << 53;
        let (lo, hi, d) = (KeyValue::Int(big), KeyValue::Int(big + 1), KeyValue::Double(big as f64));
        assert_eq!(lo, d);
        assert!(hi > d);
        assert!(hi > lo);
        assert!(d < hi);
        assert!(KeyValue::Int(i64::MAX) < KeyValue::Double(9.3e18));
        assert!(KeyValue::Int(i64::MIN) == KeyValue::Double(i64::MIN as f64));
        assert!(KeyValue::Int(-3) < KeyValue::Double(-2.5));
        assert!(KeyValue::Int(-2) > KeyValue::Double(-2.5));
        assert!(KeyValue::Int(i64::MIN) > KeyValue::Double(f64::NEG_INFINITY));
        assert!(KeyValue::Int(0) > KeyValue::Double(f64::NAN));

        let (j_hi, j_d) = (json!(9_007_199_254_740_993i64), json!(9_007_199_254_740_992.0));
        assert_eq!(compare_values(&j_hi, &j_d), Ordering::Greater);
        assert_eq!(compare_values(&j_d, &j_hi), Ordering::Less);
        assert_eq!(compare_values(&json!(u64::MAX), &json!(1e19)), Ordering::Greater);
        assert_eq!(compare_values(&json!(u64::MAX), &json!(2e19)), Ordering::Less);
    }

    #[test]
    fn json_comparison_matches_key_comparison() {
        assert_eq!(compare_values(&json!(1), &json!(1.0)), Ordering::Equal);
        assert_eq!(compare_values(&json!(null), &json!(0)), Ordering::Less);
        assert_eq!(compare_values(&json!("z"), &json!({})), Ordering::Less);
        assert_eq!(compare_values(&json!({}), &json!([])), Ordering::Less);
        assert_eq!(compare_values(&json!([]), &json!(false)), Ordering::Less);
        assert_eq!(
            compare_values(&json!({"$maxKey": 1}), &json!(true)),
            Ordering::Greater
        );
        assert_eq!(compare_values(&json!([1, 2]), &json!([1, 3])), Ordering::Less);
    }

    #[test]
    fn extracts_keys_from_documents() {
        let pattern = ShardKeyPattern::new(vec!["user", "addr.zip"]).unwrap();
        let doc = json!({"user": "ann", "addr": {"zip": 10115}, "x": 1});
        let k = pattern.extract_from_document(&doc).unwrap();
        assert_eq!(k, key(vec!["ann".into(), KeyValue::Int(10115)]));

        let missing = pattern.extract_from_document(&json!({"user": "bob"})).unwrap();
        assert_eq!(missing, key(vec!["bob".into(), KeyValue::Null]));

        assert!(pattern
            .extract_from_document(&json!({"user": ["a", "b"]}))
            .is_err());
        assert!(pattern
            .extract_from_document(&json!({"user": "c", "addr": [{"zip": 1}]}))
            .is_err());
    }

    #[test]
    fn pattern_round_trips_and_refines() {
        let pattern = ShardKeyPattern::from_json(&json!({"b": 1, "a": 1})).unwrap();
        assert_eq!(pattern.fields(), &["b".to_string(), "a".to_string()]);
        assert_eq!(pattern.to_json(), json!({"b": 1, "a": 1}));

        let refined = ShardKeyPattern::new(vec!["b", "a", "c"]).unwrap();
        assert!(pattern.validate_refinement(&refined).is_ok());
        let reordered = ShardKeyPattern::new(vec!["a", "b", "c"]).unwrap();
        assert!(pattern.validate_refinement(&reordered).is_err());
        assert!(pattern.validate_refinement(&pattern).is_err());

        assert!(ShardKeyPattern::from_json(&json!({"a": "hashed"})).is_err());
        assert!(ShardKeyPattern::new(vec!["a", "a"]).is_err());
        assert!(ShardKeyPattern::new(Vec::<String>::new()).is_err());
    }

    #[test]
    fn parse_key_and_json_key_agree() {
        let pattern = ShardKeyPattern::new(vec!["a", "b"]).unwrap();
        let parsed = pattern
            .parse_key(&json!({"a": 5, "b": {"$maxKey": 1}}))
            .unwrap();
        assert_eq!(parsed, key(vec![KeyValue::Int(5), KeyValue::MaxKey]));
        assert_eq!(
            pattern.to_json_key(&parsed),
            json!({"a": 5, "b": {"$maxKey": 1}})
        );
        assert!(pattern.parse_key(&json!({"a": 5})).is_err());
    }

    #[test]
    fn ranges_are_half_open() {
        let r = KeyRange::new(key(vec![KeyValue::Int(0)]), key(vec![KeyValue::Int(10)])).unwrap();
        assert!(r.contains(&key(vec![KeyValue::Int(0)])));
        assert!(r.contains(&key(vec![KeyValue::Int(9)])));
        assert!(!r.contains(&key(vec![KeyValue::Int(10)])));
        assert!(KeyRange::new(key(vec![KeyValue::Int(3)]), key(vec![KeyValue::Int(3)])).is_err());

        let top = KeyRange::new(key(vec![KeyValue::Int(10)]), ShardKey::global_max(1)).unwrap();
        assert!(top.is_global_max());
        assert!(top.contains(&ShardKey::global_max(1)));
        assert!(!r.overlaps(&top));
    }
}
