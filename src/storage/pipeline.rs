//! In-memory aggregation pipeline and the shared projection/sort helpers.

use bson::{Bson, Document};
use std::cmp::Ordering;
use std::collections::HashMap;

use super::StoreError;
use crate::data::literal::int_to_bson;
use crate::data::value::{as_f64, is_null};
use crate::data::{compare, lookup_path, set_path};
use crate::query::matches;

/// Accumulator for `$group` output fields
pub trait Accumulator: Send + Sync {
    /// Add a value to the accumulator
    fn accumulate(&mut self, value: &Bson);

    /// Get the final result
    fn result(&self) -> Bson;

    /// Create a fresh copy of this accumulator
    fn clone_box(&self) -> Box<dyn Accumulator>;
}

/// `$sum`: integers stay integral until a double is seen
#[derive(Debug, Clone, Default)]
pub struct SumAccumulator {
    int_sum: i64,
    float_sum: f64,
    saw_float: bool,
}

impl SumAccumulator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Accumulator for SumAccumulator {
    fn accumulate(&mut self, value: &Bson) {
        match value {
            Bson::Int32(v) => self.int_sum = self.int_sum.saturating_add(*v as i64),
            Bson::Int64(v) => self.int_sum = self.int_sum.saturating_add(*v),
            Bson::Double(v) => {
                self.float_sum += v;
                self.saw_float = true;
            }
            _ => {}
        }
    }

    fn result(&self) -> Bson {
        if self.saw_float {
            Bson::Double(self.float_sum + self.int_sum as f64)
        } else {
            int_to_bson(self.int_sum)
        }
    }

    fn clone_box(&self) -> Box<dyn Accumulator> {
        Box::new(self.clone())
    }
}

#[derive(Debug, Clone, Default)]
pub struct AvgAccumulator {
    sum: f64,
    count: u64,
}

impl AvgAccumulator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Accumulator for AvgAccumulator {
    fn accumulate(&mut self, value: &Bson) {
        if let Some(v) = as_f64(value) {
            self.sum += v;
            self.count += 1;
        }
    }

    fn result(&self) -> Bson {
        if self.count == 0 {
            Bson::Null
        } else {
            Bson::Double(self.sum / self.count as f64)
        }
    }

    fn clone_box(&self) -> Box<dyn Accumulator> {
        Box::new(self.clone())
    }
}

/// `$min` / `$max`, ignoring nulls
#[derive(Debug, Clone)]
pub struct ExtremumAccumulator {
    best: Option<Bson>,
    keep: Ordering,
}

impl ExtremumAccumulator {
    pub fn min() -> Self {
        Self {
            best: None,
            keep: Ordering::Less,
        }
    }

    pub fn max() -> Self {
        Self {
            best: None,
            keep: Ordering::Greater,
        }
    }
}

impl Accumulator for ExtremumAccumulator {
    fn accumulate(&mut self, value: &Bson) {
        if is_null(value) {
            return;
        }
        let replace = match &self.best {
            None => true,
            Some(best) => compare(value, best) == self.keep,
        };
        if replace {
            self.best = Some(value.clone());
        }
    }

    fn result(&self) -> Bson {
        self.best.clone().unwrap_or(Bson::Null)
    }

    fn clone_box(&self) -> Box<dyn Accumulator> {
        Box::new(self.clone())
    }
}

/// `$first` / `$last`
#[derive(Debug, Clone)]
pub struct PositionalAccumulator {
    value: Option<Bson>,
    last: bool,
}

impl PositionalAccumulator {
    pub fn first() -> Self {
        Self {
            value: None,
            last: false,
        }
    }

    pub fn last() -> Self {
        Self {
            value: None,
            last: true,
        }
    }
}

impl Accumulator for PositionalAccumulator {
    fn accumulate(&mut self, value: &Bson) {
        if self.last || self.value.is_none() {
            self.value = Some(value.clone());
        }
    }

    fn result(&self) -> Bson {
        self.value.clone().unwrap_or(Bson::Null)
    }

    fn clone_box(&self) -> Box<dyn Accumulator> {
        Box::new(self.clone())
    }
}

/// Create an accumulator for a `$group` operator name
pub fn create_accumulator(op: &str) -> Option<Box<dyn Accumulator>> {
    let acc: Box<dyn Accumulator> = match op {
        "$sum" => Box::new(SumAccumulator::new()),
        "$avg" => Box::new(AvgAccumulator::new()),
        "$min" => Box::new(ExtremumAccumulator::min()),
        "$max" => Box::new(ExtremumAccumulator::max()),
        "$first" => Box::new(PositionalAccumulator::first()),
        "$last" => Box::new(PositionalAccumulator::last()),
        _ => return None,
    };
    Some(acc)
}

/// Evaluate a pipeline expression: `"$path"` reads a field, documents
/// evaluate member-wise, anything else is a constant
pub fn evaluate(expr: &Bson, doc: &Document) -> Bson {
    match expr {
        Bson::String(s) if s.starts_with('$') && s.len() > 1 => {
            lookup_path(doc, &s[1..]).cloned().unwrap_or(Bson::Null)
        }
        Bson::Document(fields) => Bson::Document(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), evaluate(v, doc)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Apply a projection document (inclusion or exclusion) to one document
pub fn project(doc: &Document, spec: &Document) -> Result<Document, StoreError> {
    if spec.is_empty() {
        return Ok(doc.clone());
    }

    let flag = |v: &Bson| match v {
        Bson::Boolean(b) => Some(*b),
        other => as_f64(other).map(|n| n != 0.0),
    };

    let inclusive = spec
        .iter()
        .filter(|(k, _)| k.as_str() != "_id")
        .any(|(_, v)| flag(v) != Some(false));
    let include_id = spec.get("_id").map_or(true, |v| flag(v) != Some(false));

    if !inclusive {
        let mut out = doc.clone();
        for (field, value) in spec {
            if flag(value) == Some(false) {
                out.remove(field);
            }
        }
        return Ok(out);
    }

    let mut out = Document::new();
    if include_id {
        if let Some(id) = doc.get("_id") {
            out.insert("_id", id.clone());
        }
    }
    for (field, value) in spec {
        // a computed _id falls through to the general case
        if field == "_id" && flag(value).is_some() {
            continue;
        }
        match flag(value) {
            Some(true) => {
                if let Some(v) = lookup_path(doc, field) {
                    set_path(&mut out, field, v.clone());
                }
            }
            Some(false) => {
                return Err(StoreError::InvalidCommand(format!(
                    "cannot exclude '{}' in an inclusion projection",
                    field
                )))
            }
            None => {
                out.insert(field.clone(), evaluate(value, doc));
            }
        }
    }
    Ok(out)
}

/// Stable sort by a `{field: 1 | -1}` document; missing fields sort as null
pub fn sort_documents(docs: &mut [Document], spec: &Document) {
    if spec.is_empty() {
        return;
    }
    let keys: Vec<(String, bool)> = spec
        .iter()
        .map(|(k, v)| (k.clone(), as_f64(v).map_or(true, |d| d >= 0.0)))
        .collect();

    docs.sort_by(|a, b| {
        for (field, ascending) in &keys {
            let left = lookup_path(a, field).unwrap_or(&Bson::Null);
            let right = lookup_path(b, field).unwrap_or(&Bson::Null);
            let ord = compare(left, right);
            let ord = if *ascending { ord } else { ord.reverse() };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
}

fn count_arg(stage: &str, value: &Bson) -> Result<usize, StoreError> {
    match value {
        Bson::Int32(v) if *v >= 0 => Ok(*v as usize),
        Bson::Int64(v) if *v >= 0 => Ok(*v as usize),
        Bson::Double(v) if *v >= 0.0 && v.fract() == 0.0 => Ok(*v as usize),
        other => Err(StoreError::InvalidCommand(format!(
            "{} requires a non-negative integer, got {}",
            stage, other
        ))),
    }
}

/// Run `pipeline` over `docs`
pub fn run(mut docs: Vec<Document>, pipeline: &[Document]) -> Result<Vec<Document>, StoreError> {
    for stage in pipeline {
        let (name, spec) = match stage.iter().next() {
            Some(entry) if stage.len() == 1 => entry,
            _ => {
                return Err(StoreError::InvalidCommand(
                    "each pipeline stage must have exactly one key".into(),
                ))
            }
        };

        docs = match (name.as_str(), spec) {
            ("$match", Bson::Document(filter)) => {
                let mut kept = Vec::with_capacity(docs.len());
                for doc in docs {
                    if matches(filter, &doc)? {
                        kept.push(doc);
                    }
                }
                kept
            }
            ("$project", Bson::Document(projection)) => docs
                .iter()
                .map(|d| project(d, projection))
                .collect::<Result<Vec<_>, _>>()?,
            ("$sort", Bson::Document(sort)) => {
                sort_documents(&mut docs, sort);
                docs
            }
            ("$skip", value) => {
                let n = count_arg("$skip", value)?;
                docs.into_iter().skip(n).collect()
            }
            ("$limit", value) => {
                let n = count_arg("$limit", value)?;
                docs.truncate(n);
                docs
            }
            ("$count", Bson::String(field)) => {
                if docs.is_empty() {
                    Vec::new()
                } else {
                    let mut out = Document::new();
                    out.insert(field.clone(), int_to_bson(docs.len() as i64));
                    vec![out]
                }
            }
            ("$group", Bson::Document(group)) => run_group(&docs, group)?,
            (other, _) => {
                return Err(StoreError::InvalidCommand(format!(
                    "unsupported pipeline stage {}",
                    other
                )))
            }
        };
    }
    Ok(docs)
}

fn run_group(docs: &[Document], spec: &Document) -> Result<Vec<Document>, StoreError> {
    let key_expr = spec
        .get("_id")
        .ok_or_else(|| StoreError::InvalidCommand("$group requires an _id".into()))?;

    let mut outputs: Vec<(String, Box<dyn Accumulator>, Bson)> = Vec::new();
    for (field, value) in spec.iter().filter(|(k, _)| k.as_str() != "_id") {
        let (op, arg) = match value {
            Bson::Document(d) if d.len() == 1 => d.iter().next().ok_or_else(|| {
                StoreError::InvalidCommand(format!("empty accumulator for '{}'", field))
            })?,
            _ => {
                return Err(StoreError::InvalidCommand(format!(
                    "'{}' must be an accumulator object",
                    field
                )))
            }
        };
        let acc = create_accumulator(op)
            .ok_or_else(|| StoreError::InvalidCommand(format!("unknown accumulator {}", op)))?;
        outputs.push((field.clone(), acc, arg.clone()));
    }

    // groups keep first-seen order
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<(Bson, Vec<Box<dyn Accumulator>>)> = Vec::new();

    for doc in docs {
        let key = evaluate(key_expr, doc);
        let fingerprint = key.clone().into_relaxed_extjson().to_string();
        let slot = *index.entry(fingerprint).or_insert_with(|| {
            groups.push((
                key.clone(),
                outputs.iter().map(|(_, acc, _)| acc.clone_box()).collect(),
            ));
            groups.len() - 1
        });
        for (acc, (_, _, arg)) in groups[slot].1.iter_mut().zip(&outputs) {
            acc.accumulate(&evaluate(arg, doc));
        }
    }

    Ok(groups
        .into_iter()
        .map(|(key, accs)| {
            let mut out = Document::new();
            out.insert("_id", key);
            for ((field, _, _), acc) in outputs.iter().zip(accs) {
                out.insert(field.clone(), acc.result());
            }
            out
        })
        .collect())
}
