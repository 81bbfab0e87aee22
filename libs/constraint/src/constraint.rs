//! Constraint pairs and their comparison operators.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use crate::env::{extract_refs, interpolate, FlatMap};
use crate::error::ConstraintError;

/// Comparison operator carried at the start of the right side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    /// `=`
    Equal,
    /// `!=`
    NotEqual,
    /// `<`
    Less,
    /// `<=`
    LessOrEqual,
    /// `>`
    Greater,
    /// `>=`
    GreaterOrEqual,
    /// `~`: every left element is present in the operand set.
    In,
    /// `!~`: no left element is present in the operand set.
    NotIn,
}

impl Operator {
    /// Parse an operator token.
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "=" => Some(Self::Equal),
            "!=" => Some(Self::NotEqual),
            "<" => Some(Self::Less),
            "<=" => Some(Self::LessOrEqual),
            ">" => Some(Self::Greater),
            ">=" => Some(Self::GreaterOrEqual),
            "~" => Some(Self::In),
            "!~" => Some(Self::NotIn),
            _ => None,
        }
    }

    /// Evaluate `left <op> operand`.
    pub fn eval(self, left: &str, operand: &str) -> bool {
        match self {
            Self::Equal => left == operand,
            Self::NotEqual => left != operand,
            Self::Less => compare(left, operand) == Ordering::Less,
            Self::LessOrEqual => compare(left, operand) != Ordering::Greater,
            Self::Greater => compare(left, operand) == Ordering::Greater,
            Self::GreaterOrEqual => compare(left, operand) != Ordering::Less,
            Self::In => {
                let set = split_set(operand);
                left.split(',').all(|chunk| set.contains(chunk.trim()))
            }
            Self::NotIn => {
                let set = split_set(operand);
                !left.split(',').any(|chunk| set.contains(chunk.trim()))
            }
        }
    }
}

/// Numeric comparison when both sides parse as numbers, lexicographic
/// otherwise.
fn compare(left: &str, right: &str) -> Ordering {
    match (left.parse::<f64>(), right.parse::<f64>()) {
        (Ok(l), Ok(r)) => l.partial_cmp(&r).unwrap_or_else(|| left.cmp(right)),
        _ => left.cmp(right),
    }
}

fn split_set(operand: &str) -> BTreeSet<&str> {
    operand.split(',').map(str::trim).collect()
}

/// Evaluate a single interpolated pair.
fn check_pair(left: &str, right: &str) -> bool {
    let Some((token, operand)) = right.split_once(' ') else {
        return left == right;
    };
    match Operator::parse(token) {
        Some(op) => op.eval(left, operand),
        None => left == right,
    }
}

/// Set of `left -> right` template pairs.
///
/// Both sides may reference the environment with `${namespace.key}`. The
/// right side may begin with an operator followed by a single space
/// (`"< ${meta.cpu}"`); without one the pair is a plain equality.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Constraint(BTreeMap<String, String>);

impl Constraint {
    /// Create an empty constraint.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pair, replacing any previous right side for `left`.
    pub fn with(mut self, left: impl Into<String>, right: impl Into<String>) -> Self {
        self.0.insert(left.into(), right.into());
        self
    }

    /// Returns true if the constraint has no pairs.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of pairs.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterate pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    /// Check the constraint against `env`.
    ///
    /// Pairs are evaluated in key order and the first failing pair is
    /// reported.
    pub fn check(&self, env: &FlatMap) -> Result<(), ConstraintError> {
        for (raw_left, raw_right) in &self.0 {
            let left = interpolate(raw_left, &[env]);
            let right = interpolate(raw_right, &[env]);
            if !check_pair(&left, &right) {
                return Err(ConstraintError::Unsatisfied {
                    left,
                    right,
                    raw_left: raw_left.clone(),
                    raw_right: raw_right.clone(),
                });
            }
        }
        Ok(())
    }

    /// Referenced fields grouped by namespace, each list sorted.
    ///
    /// `${meta.zone}` yields `{"meta": ["zone"]}`. References without a
    /// namespace separator are skipped.
    pub fn extract_fields(&self) -> BTreeMap<String, Vec<String>> {
        let collected: BTreeSet<String> = self
            .0
            .iter()
            .flat_map(|(k, v)| extract_refs(&format!("{k}{v}")))
            .collect();

        let mut res: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for field in collected {
            if let Some((ns, key)) = field.split_once('.') {
                res.entry(ns.to_string()).or_default().push(key.to_string());
            }
        }
        for fields in res.values_mut() {
            fields.sort();
        }
        res
    }

    /// Union with `others`; pairs of `self` win on conflicting keys.
    pub fn merge(&self, others: &[&Constraint]) -> Constraint {
        let mut res = BTreeMap::new();
        for other in others.iter().copied().chain(std::iter::once(self)) {
            res.extend(other.0.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        Constraint(res)
    }

    /// Drop every pair that references one of `names`.
    pub fn ignore(&self, names: &[&str]) -> Constraint {
        let res = self
            .0
            .iter()
            .filter(|(k, v)| {
                !extract_refs(&format!("{k} {v}"))
                    .iter()
                    .any(|r| names.contains(&r.as_str()))
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Constraint(res)
    }
}

impl<K, V> FromIterator<(K, V)> for Constraint
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Constraint(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl From<BTreeMap<String, String>> for Constraint {
    fn from(pairs: BTreeMap<String, String>) -> Self {
        Constraint(pairs)
    }
}
