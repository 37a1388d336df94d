use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::ComposerError;
use crate::marker::{MarkerStyle, name_key};
use crate::registry::TypeRegistry;
use crate::substitution::{QuoteParitySubstituter, TokenSubstituter};
use crate::types::{RowValues, SqlType};

/// A value-producing capability behind a dynamic parameter.
///
/// It is invoked on every read of the parameter, so it must be free of side
/// effects; nothing caches its result.
pub type ValueProvider = Arc<dyn Fn() -> RowValues + Send + Sync>;

/// What a parameter is bound to: a fixed value or a provider evaluated per read.
#[derive(Clone)]
pub enum ParameterValue {
    Fixed(RowValues),
    Dynamic(ValueProvider),
}

impl ParameterValue {
    /// Current value; dynamic providers are invoked each time.
    #[must_use]
    pub fn current(&self) -> RowValues {
        match self {
            ParameterValue::Fixed(value) => value.clone(),
            ParameterValue::Dynamic(provider) => provider(),
        }
    }

    #[must_use]
    pub fn is_dynamic(&self) -> bool {
        matches!(self, ParameterValue::Dynamic(_))
    }
}

// Dynamic values compare by provider identity so comparison never invokes them.
impl PartialEq for ParameterValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ParameterValue::Fixed(a), ParameterValue::Fixed(b)) => a == b,
            (ParameterValue::Dynamic(a), ParameterValue::Dynamic(b)) => {
                std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
            }
            _ => false,
        }
    }
}

impl Hash for ParameterValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            ParameterValue::Fixed(value) => value.hash(state),
            ParameterValue::Dynamic(provider) => {
                Arc::as_ptr(provider).cast::<()>().hash(state);
            }
        }
    }
}

impl fmt::Debug for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::Fixed(value) => f.debug_tuple("Fixed").field(value).finish(),
            ParameterValue::Dynamic(provider) => f
                .debug_tuple("Dynamic")
                .field(&Arc::as_ptr(provider).cast::<()>())
                .finish(),
        }
    }
}

macro_rules! fixed_from {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for ParameterValue {
                fn from(value: $ty) -> Self {
                    ParameterValue::Fixed(value.into())
                }
            }
        )*
    };
}

fixed_from!(RowValues, i64, i32, f64, bool, &str, String, Vec<u8>, chrono::NaiveDateTime);

#[derive(Debug, Clone)]
struct ParameterState {
    name: String,
    value: ParameterValue,
    sql_type: Option<SqlType>,
}

/// A named, optionally typed value usable as a bound argument and as a text token.
///
/// Parameters are shared between the sets that see them (a child set reading
/// through to its parent hands out the parent's instance), so the value sits
/// behind a lock and can be rebound in place.
pub struct Parameter {
    state: RwLock<ParameterState>,
}

impl Parameter {
    /// Create an `@`-style parameter.
    ///
    /// # Errors
    /// Returns `ComposerError::ParameterError` if `name` is empty or not an identifier.
    pub fn new(name: &str, value: impl Into<ParameterValue>) -> Result<Self, ComposerError> {
        Self::with_marker(MarkerStyle::default(), name, value)
    }

    /// Create a parameter whose name is canonicalized with `style`.
    ///
    /// # Errors
    /// Returns `ComposerError::ParameterError` if `name` is empty or not an identifier.
    pub fn with_marker(
        style: MarkerStyle,
        name: &str,
        value: impl Into<ParameterValue>,
    ) -> Result<Self, ComposerError> {
        Ok(Self::from_parts(style.canonical(name)?, value.into(), None))
    }

    /// Create a parameter whose value is computed on every read.
    ///
    /// # Errors
    /// Returns `ComposerError::ParameterError` if `name` is empty or not an identifier.
    pub fn dynamic<F>(name: &str, provider: F) -> Result<Self, ComposerError>
    where
        F: Fn() -> RowValues + Send + Sync + 'static,
    {
        Self::new(name, ParameterValue::Dynamic(Arc::new(provider)))
    }

    pub(crate) fn from_parts(name: String, value: ParameterValue, sql_type: Option<SqlType>) -> Self {
        Self {
            state: RwLock::new(ParameterState {
                name,
                value,
                sql_type,
            }),
        }
    }

    /// Attach an explicit type hint.
    #[must_use]
    pub fn typed(self, sql_type: SqlType) -> Self {
        self.set_type(sql_type);
        self
    }

    fn read(&self) -> RwLockReadGuard<'_, ParameterState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, ParameterState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn name(&self) -> String {
        self.read().name.clone()
    }

    /// Current value. Dynamic parameters invoke their provider on every call.
    #[must_use]
    pub fn value(&self) -> RowValues {
        // Clone the binding first so a provider never runs under the lock.
        let binding = self.read().value.clone();
        binding.current()
    }

    /// The binding itself, without evaluating dynamic providers.
    #[must_use]
    pub fn binding(&self) -> ParameterValue {
        self.read().value.clone()
    }

    #[must_use]
    pub fn sql_type(&self) -> Option<SqlType> {
        self.read().sql_type.clone()
    }

    #[must_use]
    pub fn is_dynamic(&self) -> bool {
        self.read().value.is_dynamic()
    }

    /// Rebind the value in place; every set holding this parameter sees the change.
    pub fn set_value(&self, value: impl Into<ParameterValue>) {
        self.write().value = value.into();
    }

    pub(crate) fn overwrite(&self, name: String, value: ParameterValue) {
        let mut state = self.write();
        state.name = name;
        state.value = value;
    }

    pub(crate) fn set_type(&self, sql_type: SqlType) {
        self.write().sql_type = Some(sql_type);
    }

    pub(crate) fn has_name(&self, name: &str) -> bool {
        name_key(&self.read().name) == name_key(name)
    }

    /// Copy with dynamic providers evaluated once and frozen.
    #[must_use]
    pub fn snapshot(&self) -> Parameter {
        let state = self.read().clone();
        Self::from_parts(
            state.name,
            ParameterValue::Fixed(state.value.current()),
            state.sql_type,
        )
    }

    /// Replace every standalone occurrence of this parameter's name in `text`
    /// with the SQL literal of its current value, leaving string literals alone.
    #[must_use]
    pub fn expand(&self, text: &str, registry: &dyn TypeRegistry) -> String {
        self.expand_with(text, registry, &QuoteParitySubstituter)
    }

    #[must_use]
    pub fn expand_with(
        &self,
        text: &str,
        registry: &dyn TypeRegistry,
        substituter: &dyn TokenSubstituter,
    ) -> String {
        let name = self.name();
        let literal = registry.literal(&self.value());
        substituter.substitute(text, &name, &literal).into_owned()
    }

    /// One `DECLARE <name> <type> = <literal>;` line.
    #[must_use]
    pub fn declaration(&self, registry: &dyn TypeRegistry) -> String {
        let value = self.value();
        let state = self.read();
        format!(
            "DECLARE {} {} = {};",
            state.name,
            registry.type_name(&value, state.sql_type.as_ref()),
            registry.literal(&value)
        )
    }
}

impl Clone for Parameter {
    fn clone(&self) -> Self {
        Self {
            state: RwLock::new(self.read().clone()),
        }
    }
}

impl fmt::Debug for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.read();
        f.debug_struct("Parameter")
            .field("name", &state.name)
            .field("value", &state.value)
            .field("sql_type", &state.sql_type)
            .finish()
    }
}

impl PartialEq for Parameter {
    fn eq(&self, other: &Self) -> bool {
        if std::ptr::eq(self, other) {
            return true;
        }
        let (a, b) = (self.read(), other.read());
        name_key(&a.name) == name_key(&b.name) && a.sql_type == b.sql_type && a.value == b.value
    }
}

impl Hash for Parameter {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let inner = self.read();
        name_key(&inner.name).hash(state);
        match &inner.value {
            ParameterValue::Fixed(RowValues::Null) => DbNull.hash(state),
            other => other.hash(state),
        }
        match &inner.sql_type {
            Some(sql_type) => sql_type.hash(state),
            None => DbNull.hash(state),
        }
    }
}

/// Stand-in hashed for absent values and types.
#[derive(Hash)]
struct DbNull;
