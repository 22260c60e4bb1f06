//! Schema compatibility checking
//!
//! Compares two contract schemas under a [`CompatibilityMode`] and reports
//! every field-level change, each flagged as breaking or not for that mode.
//!
//! Every change is classified in both directions first:
//!
//! - *backward*: can a reader on the new schema accept all data valid under
//!   the old one? Removing required fields, narrowing types, tightening
//!   constraints, dropping enum values and adding required fields without
//!   defaults all break it.
//! - *forward*: can readers still on the old schema accept data written under
//!   the new one? This only counts when the change touches a field referenced
//!   by an active registration.
//!
//! `full` breaks when either direction does; `none` performs no check.
//! The checker is pure: identical inputs always give identical, ordered output.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::checksum::Checksum;
use crate::model::TeamId;
use crate::schema::{BoundKind, FieldSpec, FieldTree, SchemaDocument};
use crate::version::ContractVersion;

/// Policy deciding which schema changes are breaking for an asset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompatibilityMode {
    #[default]
    Backward,
    Forward,
    Full,
    None,
}

impl CompatibilityMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompatibilityMode::Backward => "backward",
            CompatibilityMode::Forward => "forward",
            CompatibilityMode::Full => "full",
            CompatibilityMode::None => "none",
        }
    }
}

impl fmt::Display for CompatibilityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompatibilityMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "backward" => Ok(CompatibilityMode::Backward),
            "forward" => Ok(CompatibilityMode::Forward),
            "full" => Ok(CompatibilityMode::Full),
            "none" => Ok(CompatibilityMode::None),
            other => Err(format!(
                "unknown compatibility mode '{}' (expected backward, forward, full or none)",
                other
            )),
        }
    }
}

/// Type of schema change
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    FieldAdded,
    FieldRemoved,
    RequiredAdded,
    RequiredRemoved,
    TypeChanged,
    TypeWidened,
    TypeNarrowed,
    EnumValuesAdded,
    EnumValuesRemoved,
    ConstraintTightened,
    ConstraintRelaxed,
    DefaultAdded,
    DefaultRemoved,
    DefaultChanged,
}

/// A detected change between schema versions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaChange {
    pub kind: ChangeKind,
    /// Field path (`id`, `customer.email`, `lines[].sku`; `$` for the root object)
    pub field: String,
    /// Whether this change is breaking under the checked mode
    pub breaking: bool,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<String>,
}

/// Result of a compatibility check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompatibilityOutcome {
    pub mode: CompatibilityMode,
    pub changes: Vec<SchemaChange>,
}

impl CompatibilityOutcome {
    fn unchecked(mode: CompatibilityMode) -> Self {
        Self {
            mode,
            changes: Vec::new(),
        }
    }

    pub fn is_compatible(&self) -> bool {
        !self.changes.iter().any(|c| c.breaking)
    }

    pub fn breaking_changes(&self) -> Vec<SchemaChange> {
        self.changes.iter().filter(|c| c.breaking).cloned().collect()
    }

    pub fn summary(&self) -> String {
        let breaking = self.changes.iter().filter(|c| c.breaking).count();
        match (self.changes.len(), breaking) {
            (0, _) => "No changes detected".to_string(),
            (n, 0) => format!("{} compatible changes detected", n),
            (n, b) => format!("{} breaking of {} changes detected ({} mode)", b, n, self.mode),
        }
    }

    /// Next version a producer should publish after `current`
    pub fn suggested_version(&self, current: &ContractVersion) -> ContractVersion {
        if !self.is_compatible() {
            current.bump_major()
        } else if !self.changes.is_empty() {
            current.bump_minor()
        } else {
            current.bump_patch()
        }
    }
}

/// A consumer registration's view of the schema it depends on
#[derive(Debug, Clone, Copy)]
pub struct RegisteredSchema<'a> {
    pub team: &'a TeamId,
    pub schema: &'a SchemaDocument,
}

/// Field paths any active registration depends on
#[derive(Debug, Default)]
struct ReferencedFields {
    any: bool,
    paths: BTreeSet<String>,
}

impl ReferencedFields {
    fn from_registrations(registrations: &[RegisteredSchema<'_>]) -> Self {
        let mut refs = Self::default();
        for reg in registrations {
            refs.any = true;
            refs.paths.extend(reg.schema.field_tree().fields.into_keys());
        }
        refs
    }

    fn contains(&self, path: &str) -> bool {
        if path == ROOT {
            return self.any;
        }
        self.paths.contains(path)
    }

    fn fingerprint(&self) -> String {
        let joined: Vec<&str> = self.paths.iter().map(String::as_str).collect();
        format!("{}:{}", self.any, Checksum::combine(joined))
    }
}

const ROOT: &str = "$";

/// Compatibility checker for contract schemas
#[derive(Debug, Clone, Copy, Default)]
pub struct CompatibilityChecker;

impl CompatibilityChecker {
    pub fn new() -> Self {
        Self
    }

    /// Check `new` against `old` under `mode` for the given registrations
    pub fn check(
        &self,
        old: &SchemaDocument,
        new: &SchemaDocument,
        mode: CompatibilityMode,
        registrations: &[RegisteredSchema<'_>],
    ) -> CompatibilityOutcome {
        if mode == CompatibilityMode::None {
            return CompatibilityOutcome::unchecked(mode);
        }
        let referenced = ReferencedFields::from_registrations(registrations);
        self.check_with_refs(old, new, mode, &referenced)
    }

    fn check_with_refs(
        &self,
        old: &SchemaDocument,
        new: &SchemaDocument,
        mode: CompatibilityMode,
        referenced: &ReferencedFields,
    ) -> CompatibilityOutcome {
        let old_tree = old.field_tree();
        let new_tree = new.field_tree();

        let mut changes: Vec<SchemaChange> = detect_changes(&old_tree, &new_tree)
            .into_iter()
            .map(|raw| {
                let forward = raw.breaks_forward && referenced.contains(&raw.gate);
                let breaking = match mode {
                    CompatibilityMode::Backward => raw.breaks_backward,
                    CompatibilityMode::Forward => forward,
                    CompatibilityMode::Full => raw.breaks_backward || forward,
                    CompatibilityMode::None => false,
                };
                SchemaChange {
                    kind: raw.kind,
                    field: raw.field,
                    breaking,
                    description: raw.description,
                    old_value: raw.old_value,
                    new_value: raw.new_value,
                }
            })
            .collect();

        changes.sort_by(|a, b| a.field.cmp(&b.field).then(a.kind.cmp(&b.kind)));
        CompatibilityOutcome { mode, changes }
    }
}

/// A change before mode-specific classification
struct RawChange {
    kind: ChangeKind,
    field: String,
    /// Path whose registration reference decides forward breakage
    gate: String,
    breaks_backward: bool,
    breaks_forward: bool,
    description: String,
    old_value: Option<String>,
    new_value: Option<String>,
}

impl RawChange {
    fn new(kind: ChangeKind, field: &str, backward: bool, forward: bool, description: String) -> Self {
        Self {
            kind,
            field: display_path(field),
            gate: display_path(field),
            breaks_backward: backward,
            breaks_forward: forward,
            description,
            old_value: None,
            new_value: None,
        }
    }

    fn gated_on(mut self, path: &str) -> Self {
        self.gate = display_path(path);
        self
    }

    fn values(mut self, old: Option<String>, new: Option<String>) -> Self {
        self.old_value = old;
        self.new_value = new;
        self
    }
}

fn display_path(path: &str) -> String {
    if path.is_empty() {
        ROOT.to_string()
    } else {
        path.to_string()
    }
}

fn parent_of(path: &str) -> &str {
    if let Some(stripped) = path.strip_suffix("[]") {
        return stripped;
    }
    path.rfind('.').map(|idx| &path[..idx]).unwrap_or("")
}

fn describe_types(spec: &FieldSpec) -> String {
    if spec.types.is_empty() {
        "any".to_string()
    } else {
        spec.types.iter().cloned().collect::<Vec<_>>().join("|")
    }
}

fn detect_changes(old: &FieldTree, new: &FieldTree) -> Vec<RawChange> {
    let mut changes = Vec::new();

    for (path, old_spec) in &old.fields {
        match new.get(path) {
            Some(new_spec) => compare_field(path, old_spec, new_spec, &mut changes),
            None => {
                // Only report the outermost removed field
                let parent = parent_of(path);
                if !parent.is_empty() && old.get(parent).is_some() && new.get(parent).is_none() {
                    continue;
                }
                let backward = old_spec.required || new.parent_is_closed(path);
                let qualifier = if old_spec.required { "Required field" } else { "Field" };
                changes.push(
                    RawChange::new(
                        ChangeKind::FieldRemoved,
                        path,
                        backward,
                        true,
                        format!("{} '{}' was removed", qualifier, path),
                    )
                    .values(Some(describe_types(old_spec)), None),
                );
            }
        }
    }

    for (path, new_spec) in &new.fields {
        if old.get(path).is_some() {
            continue;
        }
        let parent = parent_of(path);
        if !parent.is_empty() && new.get(parent).is_some() && old.get(parent).is_none() {
            continue;
        }
        let forward = old.parent_is_closed(path);
        let change = if new_spec.required && !new_spec.has_default() {
            RawChange::new(
                ChangeKind::RequiredAdded,
                path,
                true,
                forward,
                format!("Required field '{}' was added without a default", path),
            )
        } else {
            RawChange::new(
                ChangeKind::FieldAdded,
                path,
                false,
                forward,
                format!("Field '{}' was added", path),
            )
        };
        changes.push(
            change
                .gated_on(parent)
                .values(None, Some(describe_types(new_spec))),
        );
    }

    let closed_paths: BTreeSet<&String> = old
        .closed_objects
        .iter()
        .chain(new.closed_objects.iter())
        .collect();
    for path in closed_paths {
        // Objects that only exist on one side are covered by added/removed
        let exists_in_both = path.is_empty() || (old.get(path).is_some() && new.get(path).is_some());
        if !exists_in_both {
            continue;
        }
        match (old.closed_objects.contains(path), new.closed_objects.contains(path)) {
            (false, true) => changes.push(RawChange::new(
                ChangeKind::ConstraintTightened,
                path,
                true,
                false,
                format!("Object '{}' no longer accepts additional properties", display_path(path)),
            )),
            (true, false) => changes.push(RawChange::new(
                ChangeKind::ConstraintRelaxed,
                path,
                false,
                true,
                format!("Object '{}' now accepts additional properties", display_path(path)),
            )),
            _ => {}
        }
    }

    changes
}

fn compare_field(path: &str, old: &FieldSpec, new: &FieldSpec, changes: &mut Vec<RawChange>) {
    match (old.required, new.required) {
        (false, true) => changes.push(RawChange::new(
            ChangeKind::RequiredAdded,
            path,
            !new.has_default(),
            true,
            format!("Field '{}' became required", path),
        )),
        (true, false) => changes.push(RawChange::new(
            ChangeKind::RequiredRemoved,
            path,
            false,
            true,
            format!("Field '{}' is no longer required", path),
        )),
        _ => {}
    }

    compare_types(path, old, new, changes);
    compare_enums(path, old, new, changes);
    compare_constraints(path, old, new, changes);

    match (&old.default, &new.default) {
        (None, Some(v)) => changes.push(
            RawChange::new(
                ChangeKind::DefaultAdded,
                path,
                false,
                false,
                format!("Field '{}' gained a default", path),
            )
            .values(None, Some(v.to_string())),
        ),
        (Some(v), None) => changes.push(
            RawChange::new(
                ChangeKind::DefaultRemoved,
                path,
                false,
                false,
                format!("Field '{}' lost its default", path),
            )
            .values(Some(v.to_string()), None),
        ),
        (Some(a), Some(b)) if a != b => changes.push(
            RawChange::new(
                ChangeKind::DefaultChanged,
                path,
                false,
                false,
                format!("Default of field '{}' changed", path),
            )
            .values(Some(a.to_string()), Some(b.to_string())),
        ),
        _ => {}
    }
}

fn compare_types(path: &str, old: &FieldSpec, new: &FieldSpec, changes: &mut Vec<RawChange>) {
    // An empty type set accepts everything
    let new_covers_old = if old.types.is_empty() {
        new.types.is_empty()
    } else {
        old.types.iter().all(|t| new.accepts_type(t))
    };
    let old_covers_new = if new.types.is_empty() {
        old.types.is_empty()
    } else {
        new.types.iter().all(|t| old.accepts_type(t))
    };

    let (kind, backward, forward, verb) = match (new_covers_old, old_covers_new) {
        (true, true) => return,
        (true, false) => (ChangeKind::TypeWidened, false, true, "widened"),
        (false, true) => (ChangeKind::TypeNarrowed, true, false, "narrowed"),
        (false, false) => (ChangeKind::TypeChanged, true, true, "changed"),
    };
    changes.push(
        RawChange::new(
            kind,
            path,
            backward,
            forward,
            format!(
                "Type of field '{}' {} from {} to {}",
                path,
                verb,
                describe_types(old),
                describe_types(new)
            ),
        )
        .values(Some(describe_types(old)), Some(describe_types(new))),
    );
}

fn compare_enums(path: &str, old: &FieldSpec, new: &FieldSpec, changes: &mut Vec<RawChange>) {
    match (&old.enum_values, &new.enum_values) {
        (Some(old_values), Some(new_values)) => {
            let removed: Vec<&String> = old_values.difference(new_values).collect();
            let added: Vec<&String> = new_values.difference(old_values).collect();
            if !removed.is_empty() {
                let listed = join(&removed);
                changes.push(
                    RawChange::new(
                        ChangeKind::EnumValuesRemoved,
                        path,
                        true,
                        false,
                        format!("Enum values {} removed from field '{}'", listed, path),
                    )
                    .values(Some(listed), None),
                );
            }
            if !added.is_empty() {
                let listed = join(&added);
                changes.push(
                    RawChange::new(
                        ChangeKind::EnumValuesAdded,
                        path,
                        false,
                        true,
                        format!("Enum values {} added to field '{}'", listed, path),
                    )
                    .values(None, Some(listed)),
                );
            }
        }
        (None, Some(_)) => changes.push(RawChange::new(
            ChangeKind::ConstraintTightened,
            path,
            true,
            false,
            format!("Field '{}' is now restricted to an enum", path),
        )),
        (Some(_), None) => changes.push(RawChange::new(
            ChangeKind::ConstraintRelaxed,
            path,
            false,
            true,
            format!("Field '{}' is no longer restricted to an enum", path),
        )),
        (None, None) => {}
    }
}

fn join(values: &[&String]) -> String {
    values.iter().map(|v| v.as_str()).collect::<Vec<_>>().join(", ")
}

fn compare_constraints(path: &str, old: &FieldSpec, new: &FieldSpec, changes: &mut Vec<RawChange>) {
    let old_bounds = old.constraints.bounds();
    let new_bounds = new.constraints.bounds();

    for ((keyword, bound, old_value), (_, _, new_value)) in old_bounds.iter().zip(new_bounds.iter()) {
        let tightened = match (old_value, new_value) {
            (None, None) => continue,
            (None, Some(_)) => true,
            (Some(_), None) => false,
            (Some(a), Some(b)) if a == b => continue,
            (Some(a), Some(b)) => match bound {
                BoundKind::Lower => b > a,
                BoundKind::Upper => b < a,
            },
        };
        changes.push(constraint_change(
            path,
            keyword,
            tightened,
            old_value.map(|v| v.to_string()),
            new_value.map(|v| v.to_string()),
        ));
    }

    for ((keyword, old_value), (_, new_value)) in old
        .constraints
        .textual()
        .iter()
        .zip(new.constraints.textual().iter())
    {
        let tightened = match (old_value, new_value) {
            (None, None) => continue,
            (Some(a), Some(b)) if a == b => continue,
            (Some(_), None) => false,
            _ => true,
        };
        let mut change = constraint_change(
            path,
            keyword,
            tightened,
            old_value.map(String::from),
            new_value.map(String::from),
        );
        // A replaced pattern or format is not comparable; old readers may reject new data too
        if old_value.is_some() && new_value.is_some() {
            change.breaks_forward = true;
        }
        changes.push(change);
    }
}

fn constraint_change(
    path: &str,
    keyword: &str,
    tightened: bool,
    old: Option<String>,
    new: Option<String>,
) -> RawChange {
    let (kind, verb) = if tightened {
        (ChangeKind::ConstraintTightened, "tightened")
    } else {
        (ChangeKind::ConstraintRelaxed, "relaxed")
    };
    RawChange::new(
        kind,
        path,
        tightened,
        !tightened,
        format!("Constraint '{}' on field '{}' was {}", keyword, path, verb),
    )
    .values(old, new)
}

/// Memoises outcomes by fingerprint of (old, new, mode, registered fields)
#[derive(Debug)]
pub struct CompatibilityCache {
    checker: CompatibilityChecker,
    capacity: usize,
    inner: Mutex<CacheInner>,
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<Checksum, CompatibilityOutcome>,
    order: VecDeque<Checksum>,
}

impl CompatibilityCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            checker: CompatibilityChecker::new(),
            capacity: capacity.max(1),
            inner: Mutex::new(CacheInner::default()),
        }
    }

    pub fn check(
        &self,
        old: &SchemaDocument,
        new: &SchemaDocument,
        mode: CompatibilityMode,
        registrations: &[RegisteredSchema<'_>],
    ) -> CompatibilityOutcome {
        if mode == CompatibilityMode::None {
            return CompatibilityOutcome::unchecked(mode);
        }
        let referenced = ReferencedFields::from_registrations(registrations);
        let old_fp = old.fingerprint();
        let new_fp = new.fingerprint();
        let refs_fp = referenced.fingerprint();
        let key = Checksum::combine([old_fp.as_str(), new_fp.as_str(), mode.as_str(), refs_fp.as_str()]);

        if let Some(hit) = self.inner.lock().entries.get(&key) {
            return hit.clone();
        }

        let outcome = self.checker.check_with_refs(old, new, mode, &referenced);

        let mut inner = self.inner.lock();
        if inner.entries.insert(key.clone(), outcome.clone()).is_none() {
            inner.order.push_back(key);
        }
        while inner.order.len() > self.capacity {
            if let Some(evicted) = inner.order.pop_front() {
                inner.entries.remove(&evicted);
            }
        }
        outcome
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CompatibilityCache {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: serde_json::Value) -> SchemaDocument {
        SchemaDocument::new(value)
    }

    fn orders_v1() -> SchemaDocument {
        doc(json!({
            "type": "object",
            "properties": {
                "id": { "type": "integer" },
                "status": { "type": "string", "enum": ["open", "closed"] },
                "note": { "type": "string", "maxLength": 200 }
            },
            "required": ["id"]
        }))
    }

    fn kinds(outcome: &CompatibilityOutcome) -> Vec<(ChangeKind, &str, bool)> {
        outcome
            .changes
            .iter()
            .map(|c| (c.kind, c.field.as_str(), c.breaking))
            .collect()
    }

    fn check(old: &SchemaDocument, new: &SchemaDocument, mode: CompatibilityMode) -> CompatibilityOutcome {
        CompatibilityChecker::new().check(old, new, mode, &[])
    }

    #[test]
    fn test_identical_schemas_are_compatible() {
        for mode in [
            CompatibilityMode::Backward,
            CompatibilityMode::Forward,
            CompatibilityMode::Full,
            CompatibilityMode::None,
        ] {
            let outcome = check(&orders_v1(), &orders_v1(), mode);
            assert!(outcome.is_compatible());
            assert!(outcome.changes.is_empty());
        }
    }

    #[test]
    fn test_backward_required_field_removed() {
        let new = doc(json!({
            "type": "object",
            "properties": {
                "status": { "type": "string", "enum": ["open", "closed"] },
                "note": { "type": "string", "maxLength": 200 }
            }
        }));
        let outcome = check(&orders_v1(), &new, CompatibilityMode::Backward);
        assert!(!outcome.is_compatible());
        assert_eq!(kinds(&outcome), vec![(ChangeKind::FieldRemoved, "id", true)]);
    }

    #[test]
    fn test_backward_optional_additions_are_compatible() {
        let new = doc(json!({
            "type": "object",
            "properties": {
                "id": { "type": "integer" },
                "status": { "type": "string", "enum": ["open", "closed", "cancelled"] },
                "note": { "type": "string", "maxLength": 500 },
                "channel": { "type": "string" }
            },
            "required": ["id"]
        }));
        let outcome = check(&orders_v1(), &new, CompatibilityMode::Backward);
        assert!(outcome.is_compatible(), "{:?}", outcome);
        assert_eq!(
            kinds(&outcome),
            vec![
                (ChangeKind::FieldAdded, "channel", false),
                (ChangeKind::ConstraintRelaxed, "note", false),
                (ChangeKind::EnumValuesAdded, "status", false),
            ]
        );
    }

    #[test]
    fn test_backward_required_addition_needs_default() {
        let with_default = doc(json!({
            "type": "object",
            "properties": {
                "id": { "type": "integer" },
                "status": { "type": "string", "enum": ["open", "closed"] },
                "note": { "type": "string", "maxLength": 200 },
                "currency": { "type": "string", "default": "EUR" }
            },
            "required": ["id", "currency"]
        }));
        assert!(check(&orders_v1(), &with_default, CompatibilityMode::Backward).is_compatible());

        let mut without = with_default.as_value().clone();
        without["properties"]["currency"]
            .as_object_mut()
            .unwrap()
            .remove("default");
        let outcome = check(&orders_v1(), &doc(without), CompatibilityMode::Backward);
        assert_eq!(kinds(&outcome), vec![(ChangeKind::RequiredAdded, "currency", true)]);
    }

    #[test]
    fn test_type_narrowing_and_widening() {
        let old = doc(json!({ "properties": { "amount": { "type": "number" } } }));
        let narrowed = doc(json!({ "properties": { "amount": { "type": "integer" } } }));
        let changed = doc(json!({ "properties": { "amount": { "type": "string" } } }));

        let outcome = check(&old, &narrowed, CompatibilityMode::Backward);
        assert_eq!(kinds(&outcome), vec![(ChangeKind::TypeNarrowed, "amount", true)]);

        let outcome = check(&narrowed, &old, CompatibilityMode::Backward);
        assert_eq!(kinds(&outcome), vec![(ChangeKind::TypeWidened, "amount", false)]);

        let outcome = check(&old, &changed, CompatibilityMode::Backward);
        assert_eq!(kinds(&outcome), vec![(ChangeKind::TypeChanged, "amount", true)]);
    }

    #[test]
    fn test_constraint_tightening_is_breaking_backward() {
        let old = doc(json!({ "properties": { "qty": { "type": "integer", "minimum": 0 } } }));
        let new = doc(json!({ "properties": { "qty": { "type": "integer", "minimum": 1, "maximum": 99 } } }));
        let outcome = check(&old, &new, CompatibilityMode::Backward);
        assert_eq!(
            kinds(&outcome),
            vec![
                (ChangeKind::ConstraintTightened, "qty", true),
                (ChangeKind::ConstraintTightened, "qty", true),
            ]
        );
    }

    #[test]
    fn test_forward_only_counts_referenced_fields() {
        let old = orders_v1();
        let new = doc(json!({
            "type": "object",
            "properties": {
                "id": { "type": "integer" },
                "status": { "type": "string", "enum": ["open", "closed"] }
            },
            "required": ["id"]
        }));

        // Nobody registered: removing `note` cannot break a reader
        let outcome = check(&old, &new, CompatibilityMode::Forward);
        assert!(outcome.is_compatible());
        assert_eq!(kinds(&outcome), vec![(ChangeKind::FieldRemoved, "note", false)]);

        let team = TeamId::new("team-b");
        let regs = [RegisteredSchema { team: &team, schema: &old }];
        let outcome = CompatibilityChecker::new().check(&old, &new, CompatibilityMode::Forward, &regs);
        assert!(!outcome.is_compatible());
        assert_eq!(kinds(&outcome), vec![(ChangeKind::FieldRemoved, "note", true)]);

        // Optional removal is fine for backward readers
        assert!(CompatibilityChecker::new()
            .check(&old, &new, CompatibilityMode::Backward, &regs)
            .is_compatible());
    }

    #[test]
    fn test_forward_enum_addition_breaks_registered_readers() {
        let old = orders_v1();
        let new = doc(json!({
            "type": "object",
            "properties": {
                "id": { "type": "integer" },
                "status": { "type": "string", "enum": ["open", "closed", "void"] },
                "note": { "type": "string", "maxLength": 200 }
            },
            "required": ["id"]
        }));
        let team = TeamId::new("team-b");
        let regs = [RegisteredSchema { team: &team, schema: &old }];
        let checker = CompatibilityChecker::new();
        assert!(checker.check(&old, &new, CompatibilityMode::Backward, &regs).is_compatible());
        assert!(!checker.check(&old, &new, CompatibilityMode::Forward, &regs).is_compatible());
        assert!(!checker.check(&old, &new, CompatibilityMode::Full, &regs).is_compatible());
    }

    #[test]
    fn test_full_mode_is_union_of_directions() {
        let old = orders_v1();
        let new = doc(json!({
            "type": "object",
            "properties": {
                "id": { "type": "integer" },
                "status": { "type": "string", "enum": ["open"] },
                "note": { "type": "string", "maxLength": 200 }
            },
            "required": ["id"]
        }));
        // Enum value removal only breaks backward
        assert!(!check(&old, &new, CompatibilityMode::Full).is_compatible());
        assert!(check(&old, &new, CompatibilityMode::Forward).is_compatible());
    }

    #[test]
    fn test_none_mode_skips_checking() {
        let outcome = check(&orders_v1(), &doc(json!({})), CompatibilityMode::None);
        assert!(outcome.is_compatible());
        assert!(outcome.changes.is_empty());
    }

    #[test]
    fn test_nested_removal_reports_outermost_only() {
        let old = doc(json!({
            "properties": {
                "customer": {
                    "type": "object",
                    "properties": { "email": { "type": "string" } },
                    "required": ["email"]
                }
            },
            "required": ["customer"]
        }));
        let new = doc(json!({ "properties": {} }));
        let outcome = check(&old, &new, CompatibilityMode::Backward);
        assert_eq!(kinds(&outcome), vec![(ChangeKind::FieldRemoved, "customer", true)]);
    }

    #[test]
    fn test_closing_root_object_is_tightening() {
        let old = doc(json!({ "properties": { "id": { "type": "integer" } } }));
        let new = doc(json!({
            "properties": { "id": { "type": "integer" } },
            "additionalProperties": false
        }));
        let outcome = check(&old, &new, CompatibilityMode::Backward);
        assert_eq!(kinds(&outcome), vec![(ChangeKind::ConstraintTightened, "$", true)]);
    }

    #[test]
    fn test_breaking_change_serialization() {
        let new = doc(json!({ "properties": {} }));
        let outcome = check(&orders_v1(), &new, CompatibilityMode::Backward);
        let breaking = outcome.breaking_changes();
        let value = serde_json::to_value(&breaking[0]).unwrap();
        assert_eq!(value["kind"], "field_removed");
        assert_eq!(value["field"], "id");
    }

    #[test]
    fn test_suggested_version() {
        let current = ContractVersion::parse("1.4.2").unwrap();
        let breaking = check(&orders_v1(), &doc(json!({})), CompatibilityMode::Backward);
        assert_eq!(breaking.suggested_version(&current).to_string(), "2.0.0");
        let same = check(&orders_v1(), &orders_v1(), CompatibilityMode::Backward);
        assert_eq!(same.suggested_version(&current).to_string(), "1.4.3");
    }

    #[test]
    fn test_cache_returns_same_outcome() {
        let cache = CompatibilityCache::new(2);
        let new = doc(json!({}));
        let first = cache.check(&orders_v1(), &new, CompatibilityMode::Backward, &[]);
        let second = cache.check(&orders_v1(), &new, CompatibilityMode::Backward, &[]);
        assert_eq!(first, second);
        assert_eq!(cache.len(), 1);

        cache.check(&orders_v1(), &new, CompatibilityMode::Forward, &[]);
        cache.check(&orders_v1(), &new, CompatibilityMode::Full, &[]);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("FULL".parse::<CompatibilityMode>().unwrap(), CompatibilityMode::Full);
        assert!("sideways".parse::<CompatibilityMode>().is_err());
    }
}
