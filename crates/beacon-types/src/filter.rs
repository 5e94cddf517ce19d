//! Event filters: a conjunction of independently optional constraints plus
//! dotted-path custom operators over the opaque payload.

use crate::catalogue::{EventCategory, EventPriority, EventSeverity, EventType};
use crate::errors::{BeaconError, Result};
use crate::event::Event;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Comparison operators usable in custom filters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    GreaterThan,
    LessThan,
    In,
    NotIn,
}

/// One custom constraint: an operator and the expected value, applied to a
/// dotted key path resolved into `data` and then `metadata.custom_fields`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CustomFilter {
    #[serde(rename = "operator")]
    pub op: FilterOp,
    pub value: Value,
}

/// A predicate over events. Unset constraints are "don't care"; set
/// constraints are ANDed. `tags` uses ANY-tag semantics.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EventFilter {
    pub event_types: Option<Vec<EventType>>,
    pub event_categories: Option<Vec<EventCategory>>,
    pub priorities: Option<Vec<EventPriority>>,
    pub severities: Option<Vec<EventSeverity>>,
    pub source_services: Option<Vec<String>>,
    pub source_components: Option<Vec<String>>,
    pub user_ids: Option<Vec<String>>,
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub custom_filters: BTreeMap<String, CustomFilter>,
}

impl EventFilter {
    /// Filter that matches a single event type.
    pub fn for_types(event_types: Vec<EventType>) -> Self {
        Self {
            event_types: Some(event_types),
            ..Default::default()
        }
    }

    /// Filter that matches whole categories.
    pub fn for_categories(categories: Vec<EventCategory>) -> Self {
        Self {
            event_categories: Some(categories),
            ..Default::default()
        }
    }

    pub fn with_custom(mut self, path: impl Into<String>, op: FilterOp, value: Value) -> Self {
        self.custom_filters
            .insert(path.into(), CustomFilter { op, value });
        self
    }

    /// Reject filters whose custom constraints cannot be evaluated, before
    /// they are stored in a subscription.
    pub fn validate(&self) -> Result<()> {
        for (path, custom) in &self.custom_filters {
            if path.is_empty() {
                return Err(BeaconError::validation("custom filter path must not be empty"));
            }
            match custom.op {
                FilterOp::In | FilterOp::NotIn => {
                    if !custom.value.is_array() {
                        return Err(BeaconError::validation(format!(
                            "custom filter '{path}': in/not_in require an array value"
                        )));
                    }
                }
                FilterOp::GreaterThan | FilterOp::LessThan => {
                    if custom.value.as_f64().is_none() {
                        return Err(BeaconError::validation(format!(
                            "custom filter '{path}': greater_than/less_than require a numeric value"
                        )));
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Whether this filter accepts the event. All set constraints must hold.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(types) = &self.event_types {
            if !types.contains(&event.event_type) {
                return false;
            }
        }
        if let Some(categories) = &self.event_categories {
            if !categories.contains(&event.category) {
                return false;
            }
        }
        if let Some(priorities) = &self.priorities {
            if !priorities.contains(&event.priority) {
                return false;
            }
        }
        if let Some(severities) = &self.severities {
            if !severities.contains(&event.severity) {
                return false;
            }
        }
        if let Some(services) = &self.source_services {
            match &event.metadata.source_service {
                Some(service) if services.contains(service) => {}
                _ => return false,
            }
        }
        if let Some(components) = &self.source_components {
            match &event.metadata.source_component {
                Some(component) if components.contains(component) => {}
                _ => return false,
            }
        }
        if let Some(user_ids) = &self.user_ids {
            match &event.source_user_id {
                Some(user_id) if user_ids.contains(user_id) => {}
                _ => return false,
            }
        }
        if let Some(tags) = &self.tags {
            if !tags.iter().any(|tag| event.metadata.tags.contains(tag)) {
                return false;
            }
        }
        for (path, custom) in &self.custom_filters {
            match resolve_path(event, path) {
                Some(actual) => {
                    if !custom.op.compare(actual, &custom.value) {
                        return false;
                    }
                }
                // A missing key never matches, regardless of operator.
                None => return false,
            }
        }
        true
    }
}

impl FilterOp {
    /// Evaluate `actual <op> expected`.
    pub fn compare(&self, actual: &Value, expected: &Value) -> bool {
        match self {
            FilterOp::Equals => actual == expected,
            FilterOp::NotEquals => actual != expected,
            FilterOp::Contains => contains(actual, expected),
            FilterOp::NotContains => !contains(actual, expected),
            FilterOp::GreaterThan => match (actual.as_f64(), expected.as_f64()) {
                (Some(a), Some(e)) => a > e,
                _ => false,
            },
            FilterOp::LessThan => match (actual.as_f64(), expected.as_f64()) {
                (Some(a), Some(e)) => a < e,
                _ => false,
            },
            FilterOp::In => expected
                .as_array()
                .map(|candidates| candidates.contains(actual))
                .unwrap_or(false),
            FilterOp::NotIn => expected
                .as_array()
                .map(|candidates| !candidates.contains(actual))
                .unwrap_or(false),
        }
    }
}

fn contains(actual: &Value, expected: &Value) -> bool {
    match actual {
        Value::String(s) => expected.as_str().map(|sub| s.contains(sub)).unwrap_or(false),
        Value::Array(items) => items.contains(expected),
        _ => false,
    }
}

/// Resolve a dotted key path against an event. Paths may be explicit
/// (`data.x.y`, `metadata.custom_fields.x`) or bare (`x.y`), in which case
/// `data` is consulted first and `metadata.custom_fields` second.
fn resolve_path<'a>(event: &'a Event, path: &str) -> Option<&'a Value> {
    let segments: Vec<&str> = path.split('.').collect();
    match segments.as_slice() {
        ["data", rest @ ..] if !rest.is_empty() => descend_map(&event.data, rest),
        ["metadata", "custom_fields", rest @ ..] if !rest.is_empty() => {
            descend_map(&event.metadata.custom_fields, rest)
        }
        rest => {
            descend_map(&event.data, rest).or_else(|| descend_map(&event.metadata.custom_fields, rest))
        }
    }
}

fn descend_map<'a>(map: &'a serde_json::Map<String, Value>, segments: &[&str]) -> Option<&'a Value> {
    let (first, rest) = segments.split_first()?;
    let mut current = map.get(*first)?;
    for segment in rest {
        current = current.as_object()?.get(*segment)?;
    }
    Some(current)
}
