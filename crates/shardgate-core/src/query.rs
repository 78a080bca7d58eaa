//! Query helpers shared by the router and the reference shard: turning a
//! filter into shard-key intervals for targeting, matching documents, sort
//! keys and projections.

use crate::error::{Result, ShardgateError};
use crate::key::{compare_values, get_path, json_rank, KeyValue, ShardKey, ShardKeyPattern};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;

/// Field every shard adds to a document when the router asks for a sort.
pub const SORT_KEY_FIELD: &str = "$sortKey";

/// Cap on the number of point intervals a compound equality/`$in` filter may
/// expand to before targeting falls back to a covering range.
const MAX_POINT_EXPANSION: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collation {
    pub locale: String,
}

impl Collation {
    pub fn simple() -> Self {
        Self {
            locale: "simple".to_string(),
        }
    }

    pub fn is_simple(&self) -> bool {
        self.locale.is_empty() || self.locale == "simple"
    }
}

impl Default for Collation {
    fn default() -> Self {
        Self::simple()
    }
}

/// Closed-or-half-open interval of full shard keys produced from a filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyInterval {
    pub min: ShardKey,
    pub max: ShardKey,
    pub max_inclusive: bool,
}

impl KeyInterval {
    pub fn full(pattern: &ShardKeyPattern) -> Self {
        Self {
            min: pattern.global_min(),
            max: pattern.global_max(),
            max_inclusive: true,
        }
    }

    pub fn is_full(&self) -> bool {
        self.min.is_global_min() && self.max.is_global_max()
    }
}

#[derive(Debug, Clone, PartialEq)]
struct FieldInterval {
    lo: KeyValue,
    lo_incl: bool,
    hi: KeyValue,
    hi_incl: bool,
}

impl FieldInterval {
    fn full() -> Self {
        Self {
            lo: KeyValue::MinKey,
            lo_incl: true,
            hi: KeyValue::MaxKey,
            hi_incl: true,
        }
    }

    fn point(v: KeyValue) -> Self {
        Self {
            lo: v.clone(),
            lo_incl: true,
            hi: v,
            hi_incl: true,
        }
    }

    fn is_point(&self) -> bool {
        self.lo_incl && self.hi_incl && self.lo == self.hi
    }

    fn is_empty(&self) -> bool {
        match self.lo.cmp(&self.hi) {
            Ordering::Greater => true,
            Ordering::Equal => !(self.lo_incl && self.hi_incl),
            Ordering::Less => false,
        }
    }

    fn intersect(&self, other: &FieldInterval) -> FieldInterval {
        let (lo, lo_incl) = match self.lo.cmp(&other.lo) {
            Ordering::Greater => (self.lo.clone(), self.lo_incl),
            Ordering::Less => (other.lo.clone(), other.lo_incl),
            Ordering::Equal => (self.lo.clone(), self.lo_incl && other.lo_incl),
        };
        let (hi, hi_incl) = match self.hi.cmp(&other.hi) {
            Ordering::Less => (self.hi.clone(), self.hi_incl),
            Ordering::Greater => (other.hi.clone(), other.hi_incl),
            Ordering::Equal => (self.hi.clone(), self.hi_incl && other.hi_incl),
        };
        FieldInterval {
            lo,
            lo_incl,
            hi,
            hi_incl,
        }
    }
}

fn intersect_lists(a: &[FieldInterval], b: &[FieldInterval]) -> Vec<FieldInterval> {
    let mut out = Vec::new();
    for x in a {
        for y in b {
            let i = x.intersect(y);
            if !i.is_empty() {
                out.push(i);
            }
        }
    }
    out
}

fn is_operator_object(v: &Value) -> bool {
    matches!(v, Value::Object(m) if !m.is_empty() && m.keys().all(|k| k.starts_with('$')))
}

/// Key value usable for targeting, or `None` when the value cannot narrow the
/// key range (arrays, or strings under a non-simple collation).
fn targetable(v: &Value, collation: &Collation) -> Option<KeyValue> {
    let kv = KeyValue::from_json(v).ok()?;
    if !collation.is_simple() && kv.contains_string() {
        return None;
    }
    Some(kv)
}

/// Interval list for a single field, `None` when unconstrained.
fn field_intervals(cond: &Value, collation: &Collation) -> Option<Vec<FieldInterval>> {
    if !is_operator_object(cond) {
        return targetable(cond, collation).map(|v| vec![FieldInterval::point(v)]);
    }
    let ops = cond.as_object()?;
    let mut acc = vec![FieldInterval::full()];
    let mut constrained = false;
    for (op, arg) in ops {
        let next = match op.as_str() {
            "$eq" => targetable(arg, collation).map(|v| vec![FieldInterval::point(v)]),
            "$in" => arg.as_array().and_then(|items| {
                items
                    .iter()
                    .map(|item| targetable(item, collation).map(FieldInterval::point))
                    .collect::<Option<Vec<_>>>()
            }),
            "$gt" | "$gte" => targetable(arg, collation).map(|v| {
                vec![FieldInterval {
                    lo: v,
                    lo_incl: op == "$gte",
                    hi: KeyValue::MaxKey,
                    hi_incl: true,
                }]
            }),
            "$lt" | "$lte" => targetable(arg, collation).map(|v| {
                vec![FieldInterval {
                    lo: KeyValue::MinKey,
                    lo_incl: true,
                    hi: v,
                    hi_incl: op == "$lte",
                }]
            }),
            _ => None,
        };
        if let Some(list) = next {
            acc = intersect_lists(&acc, &list);
            constrained = true;
        }
    }
    constrained.then_some(acc)
}

/// Collect per-field constraints from a conjunction, descending into `$and`.
fn collect_constraints(
    filter: &Map<String, Value>,
    pattern: &ShardKeyPattern,
    collation: &Collation,
    out: &mut Vec<Option<Vec<FieldInterval>>>,
) {
    for (field, cond) in filter {
        if field == "$and" {
            if let Some(clauses) = cond.as_array() {
                for clause in clauses {
                    if let Some(obj) = clause.as_object() {
                        collect_constraints(obj, pattern, collation, out);
                    }
                }
            }
            continue;
        }
        let Some(idx) = pattern.fields().iter().position(|f| f == field) else {
            continue;
        };
        if let Some(list) = field_intervals(cond, collation) {
            out[idx] = Some(match out[idx].take() {
                Some(prev) => intersect_lists(&prev, &list),
                None => list,
            });
        }
    }
}

/// Convert a filter into shard-key intervals. An unusable filter yields the
/// full key range; a contradictory one yields no intervals at all.
pub fn bounds_for_filter(
    pattern: &ShardKeyPattern,
    filter: &Value,
    collation: &Collation,
) -> Vec<KeyInterval> {
    let Some(obj) = filter.as_object() else {
        return vec![KeyInterval::full(pattern)];
    };

    // A lone top-level $or targets the union of its branches.
    if obj.len() == 1 {
        if let Some(branches) = obj.get("$or").and_then(Value::as_array) {
            let mut out = Vec::new();
            for branch in branches {
                let b = bounds_for_filter(pattern, branch, collation);
                if b.iter().any(KeyInterval::is_full) {
                    return vec![KeyInterval::full(pattern)];
                }
                out.extend(b);
            }
            return out;
        }
    }

    let mut per_field: Vec<Option<Vec<FieldInterval>>> = vec![None; pattern.len()];
    collect_constraints(obj, pattern, collation, &mut per_field);
    build_intervals(pattern, per_field)
}

fn build_intervals(
    pattern: &ShardKeyPattern,
    per_field: Vec<Option<Vec<FieldInterval>>>,
) -> Vec<KeyInterval> {
    let n = pattern.len();
    let mut prefixes: Vec<Vec<KeyValue>> = vec![Vec::new()];

    for (i, constraint) in per_field.into_iter().enumerate() {
        let list = constraint.unwrap_or_else(|| vec![FieldInterval::full()]);
        if list.is_empty() {
            return Vec::new();
        }
        let all_points = list.iter().all(FieldInterval::is_point);
        if all_points && prefixes.len() * list.len() <= MAX_POINT_EXPANSION {
            prefixes = prefixes
                .iter()
                .flat_map(|p| {
                    list.iter().map(move |iv| {
                        let mut next = p.clone();
                        next.push(iv.lo.clone());
                        next
                    })
                })
                .collect();
            continue;
        }

        // A range on this field ends the prefix; remaining fields are free.
        let covering = if all_points {
            let lo = list.iter().map(|iv| iv.lo.clone()).min();
            let hi = list.iter().map(|iv| iv.hi.clone()).max();
            match (lo, hi) {
                (Some(lo), Some(hi)) => vec![FieldInterval {
                    lo,
                    lo_incl: true,
                    hi,
                    hi_incl: true,
                }],
                _ => return Vec::new(),
            }
        } else {
            list
        };
        let rest = n - i - 1;
        let mut out = Vec::new();
        for p in &prefixes {
            for iv in &covering {
                let mut min = p.clone();
                min.push(iv.lo.clone());
                let mut max = p.clone();
                max.push(iv.hi.clone());
                let lo_fill = if iv.lo_incl { KeyValue::MinKey } else { KeyValue::MaxKey };
                let hi_fill = if iv.hi_incl { KeyValue::MaxKey } else { KeyValue::MinKey };
                let max_inclusive = iv.hi_incl || rest > 0;
                out.push(KeyInterval {
                    min: ShardKey::new(min).extend_with(n, lo_fill),
                    max: ShardKey::new(max).extend_with(n, hi_fill),
                    max_inclusive,
                });
            }
        }
        return out;
    }

    prefixes
        .into_iter()
        .map(|p| {
            let key = ShardKey::new(p);
            KeyInterval {
                min: key.clone(),
                max: key,
                max_inclusive: true,
            }
        })
        .collect()
}

/// Shard key of the single document a filter pins down by equality on every
/// key field, if it does.
pub fn exact_key_for_filter(pattern: &ShardKeyPattern, filter: &Value) -> Option<ShardKey> {
    let intervals = bounds_for_filter(pattern, filter, &Collation::simple());
    match intervals.as_slice() {
        [only] if only.min == only.max => Some(only.min.clone()),
        _ => None,
    }
}

/// Values a path resolves to; a trailing array contributes both itself and
/// its elements.
fn values_at_path<'a>(doc: &'a Value, path: &str) -> Vec<&'a Value> {
    match get_path(doc, path) {
        Some(whole @ Value::Array(items)) => {
            let mut out: Vec<&Value> = items.iter().collect();
            out.push(whole);
            out
        }
        Some(v) => vec![v],
        None => Vec::new(),
    }
}

fn cmp_same_type(a: &Value, b: &Value) -> Option<Ordering> {
    (json_rank(a) == json_rank(b)).then(|| compare_values(a, b))
}

fn eq_value(candidates: &[&Value], target: &Value) -> bool {
    if candidates.is_empty() {
        return target.is_null();
    }
    candidates
        .iter()
        .any(|c| compare_values(c, target) == Ordering::Equal)
}

fn match_operator(candidates: &[&Value], op: &str, arg: &Value) -> Result<bool> {
    let cmp_any = |want: fn(Ordering) -> bool| {
        candidates
            .iter()
            .any(|c| cmp_same_type(c, arg).map(want).unwrap_or(false))
    };
    Ok(match op {
        "$eq" => eq_value(candidates, arg),
        "$ne" => !eq_value(candidates, arg),
        "$gt" => cmp_any(|o| o == Ordering::Greater),
        "$gte" => cmp_any(|o| o != Ordering::Less),
        "$lt" => cmp_any(|o| o == Ordering::Less),
        "$lte" => cmp_any(|o| o != Ordering::Greater),
        "$in" | "$nin" => {
            let items = arg.as_array().ok_or_else(|| {
                ShardgateError::BadValue(format!("{op} needs an array, got {arg}"))
            })?;
            let hit = items.iter().any(|item| eq_value(candidates, item));
            if op == "$in" {
                hit
            } else {
                !hit
            }
        }
        "$exists" => {
            let want = arg.as_bool().unwrap_or_else(|| arg.as_i64() != Some(0));
            want != candidates.is_empty()
        }
        other => {
            return Err(ShardgateError::BadValue(format!(
                "unsupported query operator {other}"
            )))
        }
    })
}

/// Evaluate a filter against a document.
pub fn matches_filter(doc: &Value, filter: &Value) -> Result<bool> {
    let Some(obj) = filter.as_object() else {
        return Err(ShardgateError::BadValue(format!(
            "filter must be an object, got {filter}"
        )));
    };
    for (field, cond) in obj {
        let ok = match field.as_str() {
            "$and" | "$or" | "$nor" => {
                let clauses = cond.as_array().ok_or_else(|| {
                    ShardgateError::BadValue(format!("{field} needs an array"))
                })?;
                let mut results = Vec::with_capacity(clauses.len());
                for clause in clauses {
                    results.push(matches_filter(doc, clause)?);
                }
                match field.as_str() {
                    "$and" => results.iter().all(|r| *r),
                    "$or" => results.iter().any(|r| *r),
                    _ => !results.iter().any(|r| *r),
                }
            }
            f if f.starts_with('$') => {
                return Err(ShardgateError::BadValue(format!(
                    "unsupported top-level operator {f}"
                )))
            }
            path => {
                let candidates = values_at_path(doc, path);
                if is_operator_object(cond) {
                    let mut all = true;
                    for (op, arg) in cond.as_object().into_iter().flatten() {
                        if !match_operator(&candidates, op, arg)? {
                            all = false;
                            break;
                        }
                    }
                    all
                } else {
                    eq_value(&candidates, cond)
                }
            }
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Ordered sort specification, e.g. `{"a": 1, "b": -1}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortPattern {
    fields: Vec<(String, bool)>,
}

impl SortPattern {
    pub fn from_json(value: &Value) -> Result<Self> {
        let obj = value.as_object().ok_or_else(|| {
            ShardgateError::BadValue(format!("sort must be an object, got {value}"))
        })?;
        let mut fields = Vec::with_capacity(obj.len());
        for (field, dir) in obj {
            let ascending = match dir.as_i64() {
                Some(1) => true,
                Some(-1) => false,
                _ => {
                    return Err(ShardgateError::BadValue(format!(
                        "sort direction for '{field}' must be 1 or -1"
                    )))
                }
            };
            fields.push((field.clone(), ascending));
        }
        if fields.is_empty() {
            return Err(ShardgateError::BadValue("empty sort".to_string()));
        }
        Ok(Self { fields })
    }

    /// `$sortKey` value for a document: one entry per sort field.
    pub fn sort_key(&self, doc: &Value) -> Value {
        Value::Array(
            self.fields
                .iter()
                .map(|(f, _)| get_path(doc, f).cloned().unwrap_or(Value::Null))
                .collect(),
        )
    }

    /// Compare two `$sortKey` values honouring per-field direction.
    pub fn compare_sort_keys(&self, a: &Value, b: &Value) -> Ordering {
        let empty = Vec::new();
        let left = a.as_array().unwrap_or(&empty);
        let right = b.as_array().unwrap_or(&empty);
        for (i, (_, ascending)) in self.fields.iter().enumerate() {
            let l = left.get(i).unwrap_or(&Value::Null);
            let r = right.get(i).unwrap_or(&Value::Null);
            let ord = compare_values(l, r);
            let ord = if *ascending { ord } else { ord.reverse() };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    pub fn compare_documents(&self, a: &Value, b: &Value) -> Ordering {
        self.compare_sort_keys(&self.sort_key(a), &self.sort_key(b))
    }
}

/// Apply an inclusion (`{a: 1}`) or exclusion (`{a: 0}`) projection to
/// top-level fields. `_id` is kept unless excluded explicitly.
pub fn apply_projection(doc: &Value, projection: &Value) -> Result<Value> {
    let Some(spec) = projection.as_object() else {
        return Err(ShardgateError::BadValue(format!(
            "projection must be an object, got {projection}"
        )));
    };
    let Some(src) = doc.as_object() else {
        return Ok(doc.clone());
    };
    if spec.is_empty() {
        return Ok(doc.clone());
    }
    let truthy = |v: &Value| v.as_bool().unwrap_or_else(|| v.as_i64().unwrap_or(1) != 0);
    let includes: Vec<&String> = spec
        .iter()
        .filter(|(k, v)| k.as_str() != "_id" && truthy(v))
        .map(|(k, _)| k)
        .collect();
    let excludes: Vec<&String> = spec
        .iter()
        .filter(|(k, v)| k.as_str() != "_id" && !truthy(v))
        .map(|(k, _)| k)
        .collect();
    if !includes.is_empty() && !excludes.is_empty() {
        return Err(ShardgateError::BadValue(
            "cannot mix inclusion and exclusion in a projection".to_string(),
        ));
    }
    let keep_id = spec.get("_id").map(truthy).unwrap_or(true);
    let mut out = Map::new();
    if includes.is_empty() {
        for (k, v) in src {
            if excludes.contains(&k) || (k == "_id" && !keep_id) {
                continue;
            }
            out.insert(k.clone(), v.clone());
        }
    } else {
        for (k, v) in src {
            if (k == "_id" && keep_id) || includes.contains(&k) || k == SORT_KEY_FIELD {
                out.insert(k.clone(), v.clone());
            }
        }
    }
    Ok(Value::Object(out))
}

/// Remove the router-internal sort key from a document.
pub fn strip_sort_key(doc: &mut Value) {
    if let Some(obj) = doc.as_object_mut() {
        obj.remove(SORT_KEY_FIELD);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn single() -> ShardKeyPattern {
        ShardKeyPattern::new(vec!["x"]).unwrap()
    }

    fn k(v: i64) -> ShardKey {
        ShardKey::new(vec![KeyValue::Int(v)])
    }

    #[test]
    fn equality_and_in_become_points() {
        let p = single();
        let b = bounds_for_filter(&p, &json!({"x": 5}), &Collation::simple());
        assert_eq!(b.len(), 1);
        assert_eq!(b[0].min, k(5));
        assert_eq!(b[0].max, k(5));

        let b = bounds_for_filter(&p, &json!({"x": {"$in": [1, 7, 3]}}), &Collation::simple());
        assert_eq!(b.len(), 3);
        assert!(b.iter().all(|iv| iv.min == iv.max));
    }

    #[test]
    fn ranges_intersect_and_respect_exclusivity() {
        let p = single();
        let b = bounds_for_filter(
            &p,
            &json!({"x": {"$gte": 3, "$lt": 10}, "$and": [{"x": {"$gt": 4}}]}),
            &Collation::simple(),
        );
        assert_eq!(b.len(), 1);
        assert_eq!(b[0].min, k(4));
        assert_eq!(b[0].max, k(10));
        assert!(!b[0].max_inclusive);

        let contradictory = bounds_for_filter(&p, &json!({"x": {"$gt": 10, "$lt": 2}}), &Collation::simple());
        assert!(contradictory.is_empty());
    }

    #[test]
    fn unsupported_predicates_widen_to_full_range() {
        let p = single();
        for filter in [
            json!({}),
            json!({"y": 1}),
            json!({"x": {"$ne": 4}}),
            json!({"x": [1, 2]}),
            json!({"$or": [{"x": 1}, {"y": 2}]}),
        ] {
            let b = bounds_for_filter(&p, &filter, &Collation::simple());
            assert_eq!(b.len(), 1, "{filter}");
            assert!(b[0].is_full(), "{filter}");
        }
        let b = bounds_for_filter(&p, &json!({"$or": [{"x": 1}, {"x": 9}]}), &Collation::simple());
        assert_eq!(b.len(), 2);
    }

    #[test]
    fn non_simple_collation_ignores_string_bounds() {
        let p = single();
        let fr = Collation {
            locale: "fr".to_string(),
        };
        let b = bounds_for_filter(&p, &json!({"x": "abc"}), &fr);
        assert!(b[0].is_full());
        let b = bounds_for_filter(&p, &json!({"x": 12}), &fr);
        assert_eq!(b[0].min, k(12));
    }

    #[test]
    fn compound_keys_expand_prefix_points() {
        let p = ShardKeyPattern::new(vec!["a", "b"]).unwrap();
        let b = bounds_for_filter(&p, &json!({"a": {"$in": [1, 2]}, "b": {"$gte": 5}}), &Collation::simple());
        assert_eq!(b.len(), 2);
        assert_eq!(b[0].min, ShardKey::new(vec![KeyValue::Int(1), KeyValue::Int(5)]));
        assert_eq!(b[0].max, ShardKey::new(vec![KeyValue::Int(1), KeyValue::MaxKey]));

        let b = bounds_for_filter(&p, &json!({"a": 1}), &Collation::simple());
        assert_eq!(b[0].min, ShardKey::new(vec![KeyValue::Int(1), KeyValue::MinKey]));
        assert_eq!(b[0].max, ShardKey::new(vec![KeyValue::Int(1), KeyValue::MaxKey]));

        assert_eq!(
            exact_key_for_filter(&p, &json!({"a": 1, "b": "z"})),
            Some(ShardKey::new(vec![KeyValue::Int(1), "z".into()]))
        );
        assert_eq!(exact_key_for_filter(&p, &json!({"a": 1})), None);
    }

    #[test]
    fn matcher_handles_common_operators() -> Result<()> {
        let doc = json!({"_id": 1, "x": 5, "tags": ["a", "b"], "n": {"y": "z"}});
        assert!(matches_filter(&doc, &json!({"x": 5}))?);
        assert!(matches_filter(&doc, &json!({"x": {"$gt": 4, "$lte": 5}}))?);
        assert!(!matches_filter(&doc, &json!({"x": {"$gt": "a"}}))?);
        assert!(matches_filter(&doc, &json!({"tags": "b"}))?);
        assert!(matches_filter(&doc, &json!({"n.y": "z"}))?);
        assert!(matches_filter(&doc, &json!({"missing": null}))?);
        assert!(matches_filter(&doc, &json!({"missing": {"$exists": false}}))?);
        assert!(matches_filter(&doc, &json!({"$or": [{"x": 1}, {"x": {"$in": [5, 6]}}]}))?);
        assert!(matches_filter(&doc, &json!({"$nor": [{"x": 1}]}))?);
        assert!(matches_filter(&doc, &json!({"x": {"$regex": "a"}})).is_err());
        Ok(())
    }

    #[test]
    fn sort_keys_respect_direction() -> Result<()> {
        let sort = SortPattern::from_json(&json!({"a": 1, "b": -1}))?;
        let d1 = json!({"a": 1, "b": 9});
        let d2 = json!({"a": 1, "b": 3});
        let d3 = json!({"a": 2});
        assert_eq!(sort.sort_key(&d3), json!([2, null]));
        assert_eq!(sort.compare_documents(&d1, &d2), Ordering::Less);
        assert_eq!(sort.compare_documents(&d2, &d3), Ordering::Less);
        assert!(SortPattern::from_json(&json!({"a": 2})).is_err());
        Ok(())
    }

    #[test]
    fn projections_include_or_exclude() -> Result<()> {
        let doc = json!({"_id": 1, "a": 2, "b": 3, "$sortKey": [2]});
        assert_eq!(
            apply_projection(&doc, &json!({"a": 1}))?,
            json!({"_id": 1, "a": 2, "$sortKey": [2]})
        );
        assert_eq!(
            apply_projection(&doc, &json!({"b": 0, "_id": 0}))?,
            json!({"a": 2, "$sortKey": [2]})
        );
        assert!(apply_projection(&doc, &json!({"a": 1, "b": 0})).is_err());
        let mut d = doc.clone();
        strip_sort_key(&mut d);
        assert_eq!(d, json!({"_id": 1, "a": 2, "b": 3}));
        Ok(())
    }
}
