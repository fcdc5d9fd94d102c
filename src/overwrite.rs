//! Dynamically overwritten variables, scoped to a request.
//!
//! A handler can attach a map of named overrides near the top of a request
//! and deeply nested code can look them up by name without the map being
//! threaded through every call. Overrides attached later shadow earlier ones
//! by name; lookups fall back to earlier attachments for names the nearest
//! map does not contain.

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::context::Context;

/// The container of all overwritten variables visible from one context.
///
/// Storages form a parent-linked chain: each call to
/// [`with_overwritten_variables`] pushes a new node whose parent is whatever
/// storage the context carried before.
#[derive(Debug)]
pub struct OverwritingStorage {
    parent: Option<Arc<OverwritingStorage>>,
    variables: HashMap<String, Arc<Value>>,
}

impl OverwritingStorage {
    /// Returns the value overwritten under `name`, if any.
    ///
    /// A local hit wins; otherwise the lookup recurses into the parent
    /// storage.
    pub fn get(&self, name: &str) -> Option<OverwrittenValue> {
        if let Some(value) = self.variables.get(name) {
            return Some(OverwrittenValue(Arc::clone(value)));
        }

        self.parent.as_ref()?.get(name)
    }
}

/// A single overwritten value with typed accessors.
///
/// The accessors mirror how override payloads usually arrive (JSON from a
/// config service): casts that do not match the dynamic type yield the
/// type's default rather than failing.
#[derive(Debug, Clone)]
pub struct OverwrittenValue(Arc<Value>);

impl OverwrittenValue {
    /// The raw value as-is.
    pub fn as_is(&self) -> &Value {
        &self.0
    }

    /// The value as a string, or `""` if it is not one.
    pub fn as_str(&self) -> &str {
        self.0.as_str().unwrap_or_default()
    }

    /// The value as a boolean, or `false` if it is not one.
    pub fn as_bool(&self) -> bool {
        self.0.as_bool().unwrap_or_default()
    }

    /// The value as a 64-bit float, or `0.0` if it is not numeric.
    ///
    /// Integers are widened.
    pub fn as_f64(&self) -> f64 {
        self.0.as_f64().unwrap_or_default()
    }

    /// The value as a 64-bit integer, or `0` if it is not numeric.
    ///
    /// Floats are truncated toward zero, losing their fractional part.
    pub fn as_i64(&self) -> i64 {
        if let Some(integer) = self.0.as_i64() {
            integer
        } else if let Some(float) = self.0.as_f64() {
            float as i64
        } else {
            0
        }
    }

    /// Deserializes the raw value into a fresh `T` via a JSON round trip.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value((*self.0).clone())
    }
}

/// Derives a context carrying the given variable overrides.
///
/// The map is taken by value, so later changes to whatever the caller built
/// it from cannot affect lookups. An empty map returns the context unchanged.
pub fn with_overwritten_variables(ctx: &Context, variables: HashMap<String, Value>) -> Context {
    if variables.is_empty() {
        return ctx.clone();
    }

    let storage = OverwritingStorage {
        parent: overwriting_storage(ctx),
        variables: variables
            .into_iter()
            .map(|(name, value)| (name, Arc::new(value)))
            .collect(),
    };

    ctx.with_value(storage)
}

/// Returns the storage currently associated with the context, if any.
pub fn overwriting_storage(ctx: &Context) -> Option<Arc<OverwritingStorage>> {
    ctx.value::<OverwritingStorage>()
}

/// Returns the value of the variable under `name` if it was overwritten.
pub fn overwritten_value(ctx: &Context, name: &str) -> Option<OverwrittenValue> {
    overwriting_storage(ctx)?.get(name)
}
