use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::error::ComposerError;
use crate::marker::{MarkerStyle, name_key, strip_numeric_suffix};
use crate::parameter::{Parameter, ParameterValue};
use crate::registry::TypeRegistry;
use crate::substitution::rename_tokens;
use crate::types::{RowValues, SqlType};

/// Token replaced by a set's source text before any other macro.
pub const SOURCE_MACRO: &str = "##SOURCE##";

/// Hierarchical collection of parameters and text macros.
///
/// Lookups check the local storage first and then read through to the parent
/// chain. The parent is shared, never owned: several child sets can hang off
/// one connection-wide set that carries table-name macros.
///
/// ```rust
/// use std::sync::Arc;
/// use sql_composer::prelude::*;
///
/// # fn main() -> Result<(), ComposerError> {
/// let mut ambient = ParameterSet::new();
/// ambient.add_macro("##USERS##", "app_users");
/// let ambient = Arc::new(ambient);
///
/// let mut params = ParameterSet::with_parent(Arc::clone(&ambient));
/// params.add("@id", 42)?;
/// assert_eq!(
///     params.resolve_macros("SELECT * FROM ##USERS## WHERE id = @id"),
///     "SELECT * FROM app_users WHERE id = @id"
/// );
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct ParameterSet {
    parent: Option<Arc<ParameterSet>>,
    style: MarkerStyle,
    params: Vec<Arc<Parameter>>,
    index: HashMap<String, usize>,
    macros: Vec<(String, String)>,
    macro_index: HashMap<String, usize>,
    source: Option<String>,
    before: String,
    after: String,
}

impl ParameterSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_marker(style: MarkerStyle) -> Self {
        Self {
            style,
            ..Self::default()
        }
    }

    /// Empty set reading through to `parent`, using the parent's marker style.
    #[must_use]
    pub fn with_parent(parent: Arc<ParameterSet>) -> Self {
        Self {
            style: parent.style,
            parent: Some(parent),
            ..Self::default()
        }
    }

    /// Empty child of a shared set.
    #[must_use]
    pub fn child(self: &Arc<Self>) -> Self {
        Self::with_parent(Arc::clone(self))
    }

    #[must_use]
    pub fn marker(&self) -> MarkerStyle {
        self.style
    }

    #[must_use]
    pub fn parent(&self) -> Option<&Arc<ParameterSet>> {
        self.parent.as_ref()
    }

    /// Effective parameter count: local plus every ancestor.
    #[must_use]
    pub fn len(&self) -> usize {
        self.params.len() + self.parent.as_ref().map_or(0, |p| p.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn local_len(&self) -> usize {
        self.params.len()
    }

    fn key(&self, name: &str) -> Option<String> {
        self.style.canonical(name).ok().map(|n| name_key(&n))
    }

    /// Look a parameter up by name, case-insensitively, local first.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<Parameter>> {
        let key = self.key(name)?;
        self.get_by_key(&key)
    }

    fn get_by_key(&self, key: &str) -> Option<Arc<Parameter>> {
        if let Some(&idx) = self.index.get(key) {
            return self.params.get(idx).cloned();
        }
        self.parent.as_ref().and_then(|p| p.get_by_key(key))
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Positional access; ancestors' parameters come before local ones.
    #[must_use]
    pub fn get_index(&self, idx: usize) -> Option<Arc<Parameter>> {
        let inherited = self.parent.as_ref().map_or(0, |p| p.len());
        if idx < inherited {
            self.parent.as_ref().and_then(|p| p.get_index(idx))
        } else {
            self.params.get(idx - inherited).cloned()
        }
    }

    /// Effective parameters, outermost ancestor first.
    #[must_use]
    pub fn iter(&self) -> std::vec::IntoIter<Arc<Parameter>> {
        let mut all = Vec::with_capacity(self.len());
        self.collect_into(&mut all);
        all.into_iter()
    }

    fn collect_into(&self, out: &mut Vec<Arc<Parameter>>) {
        if let Some(parent) = &self.parent {
            parent.collect_into(out);
        }
        out.extend(self.params.iter().cloned());
    }

    /// Bind `value` under `name`.
    ///
    /// If the name is already bound anywhere in the chain, that parameter is
    /// rebound in place and returned.
    ///
    /// # Errors
    /// Returns `ComposerError::ParameterError` for an invalid name.
    pub fn add(
        &mut self,
        name: &str,
        value: impl Into<ParameterValue>,
    ) -> Result<Arc<Parameter>, ComposerError> {
        self.bind(name, value.into(), None)
    }

    /// Bind with an explicit type hint.
    ///
    /// # Errors
    /// Returns `ComposerError::NameConflict` if the name is already bound with a
    /// different hint, or `ComposerError::ParameterError` for an invalid name.
    pub fn add_typed(
        &mut self,
        name: &str,
        value: impl Into<ParameterValue>,
        sql_type: SqlType,
    ) -> Result<Arc<Parameter>, ComposerError> {
        self.bind(name, value.into(), Some(sql_type))
    }

    /// Bind a value provider that is evaluated on every read.
    ///
    /// # Errors
    /// Returns `ComposerError::ParameterError` for an invalid name.
    pub fn add_dynamic<F>(&mut self, name: &str, provider: F) -> Result<Arc<Parameter>, ComposerError>
    where
        F: Fn() -> RowValues + Send + Sync + 'static,
    {
        self.bind(name, ParameterValue::Dynamic(Arc::new(provider)), None)
    }

    /// Bind an identifier, treating non-positive ids as NULL.
    ///
    /// # Errors
    /// Returns `ComposerError::ParameterError` for an invalid name.
    pub fn add_id(&mut self, name: &str, id: i64) -> Result<Arc<Parameter>, ComposerError> {
        let value = if id > 0 { RowValues::Int(id) } else { RowValues::Null };
        self.bind(name, ParameterValue::Fixed(value), None)
    }

    fn bind(
        &mut self,
        name: &str,
        value: ParameterValue,
        sql_type: Option<SqlType>,
    ) -> Result<Arc<Parameter>, ComposerError> {
        let canonical = self.style.canonical(name)?;
        if let Some(existing) = self.get_by_key(&name_key(&canonical)) {
            let current = existing.sql_type();
            if let (Some(have), Some(want)) = (&current, &sql_type)
                && have != want
            {
                return Err(ComposerError::NameConflict {
                    name: canonical,
                    existing: have.to_string(),
                    requested: want.to_string(),
                });
            }
            existing.overwrite(canonical, value);
            if current.is_none()
                && let Some(sql_type) = sql_type
            {
                existing.set_type(sql_type);
            }
            return Ok(existing);
        }
        Ok(self.push(Parameter::from_parts(canonical, value, sql_type)))
    }

    fn push(&mut self, param: Parameter) -> Arc<Parameter> {
        let key = name_key(&param.name());
        let param = Arc::new(param);
        self.index.insert(key, self.params.len());
        self.params.push(Arc::clone(&param));
        param
    }

    /// Bind `value` under a name no other parameter in the chain uses.
    ///
    /// With `merge_same` set, re-binding the same name to an equal value hands
    /// back the existing parameter instead of creating a second binding.
    /// Otherwise a taken name has its numeric suffix stripped and the next free
    /// `name1`, `name2`, ... is used.
    ///
    /// # Errors
    /// Returns `ComposerError::ParameterError` for an invalid name.
    pub fn add_unique(
        &mut self,
        name: &str,
        value: impl Into<ParameterValue>,
        merge_same: bool,
    ) -> Result<Arc<Parameter>, ComposerError> {
        self.bind_unique(name, value.into(), None, merge_same)
    }

    fn bind_unique(
        &mut self,
        name: &str,
        value: ParameterValue,
        sql_type: Option<SqlType>,
        merge_same: bool,
    ) -> Result<Arc<Parameter>, ComposerError> {
        let canonical = self.style.canonical(name)?;
        let Some(existing) = self.get_by_key(&name_key(&canonical)) else {
            return Ok(self.push(Parameter::from_parts(canonical, value, sql_type)));
        };
        if merge_same && existing.binding() == value {
            return Ok(existing);
        }
        let unique = self.unique_name(&canonical);
        Ok(self.push(Parameter::from_parts(unique, value, sql_type)))
    }

    /// First `base1`, `base2`, ... not bound in the chain, where `base` is the
    /// name without its trailing digits.
    #[must_use]
    pub fn unique_name(&self, name: &str) -> String {
        let base = strip_numeric_suffix(name);
        (1usize..)
            .map(|n| format!("{base}{n}"))
            .find(|candidate| self.get_by_key(&name_key(candidate)).is_none())
            .unwrap_or_else(|| format!("{base}_"))
    }

    /// Merge `other` into this set and return `expression` with every renamed
    /// marker rewritten.
    ///
    /// Parameters of `other` that collide with a binding here are added under a
    /// fresh name (or merged when `merge_same` is set and the values match);
    /// `expression` is assumed to be written against `other`'s names.
    ///
    /// # Errors
    /// Returns `ComposerError::ParameterError` if a parameter name is invalid.
    pub fn include(
        &mut self,
        other: &ParameterSet,
        expression: &str,
        merge_same: bool,
    ) -> Result<String, ComposerError> {
        let mut renames: Vec<(String, String)> = Vec::new();

        for param in other.iter() {
            let name = param.name();
            if let Some(existing) = self.get(&name)
                && Arc::ptr_eq(&existing, &param)
            {
                continue;
            }
            let added = self.bind_unique(&name, param.binding(), param.sql_type(), merge_same)?;
            if !added.has_name(&name) {
                renames.push((name, added.name()));
            }
        }

        for (token, text) in other.macros() {
            if self.get_macro(&token).is_none() {
                self.add_macro(token, text);
            }
        }

        if self.source().is_none()
            && let Some(source) = other.source()
        {
            self.source = Some(source);
        }

        if !other.before.is_empty() && !self.before.contains(&other.before) {
            self.before = format!("{}{}", other.before, self.before);
        }
        if !other.after.is_empty() && !self.after.contains(&other.after) {
            self.after.push_str(&other.after);
        }

        if !renames.is_empty() {
            debug!(?renames, "renamed included parameters");
        }
        Ok(rename_tokens(expression, self.style, &renames).into_owned())
    }

    /// Register a literal-text macro. Re-adding a token replaces its text.
    pub fn add_macro(&mut self, token: impl Into<String>, text: impl Into<String>) {
        let token = token.into();
        let text = text.into();
        if let Some(&idx) = self.macro_index.get(&token) {
            self.macros[idx].1 = text;
        } else {
            self.macro_index.insert(token.clone(), self.macros.len());
            self.macros.push((token, text));
        }
    }

    #[must_use]
    pub fn get_macro(&self, token: &str) -> Option<String> {
        if let Some(&idx) = self.macro_index.get(token) {
            return Some(self.macros[idx].1.clone());
        }
        self.parent.as_ref().and_then(|p| p.get_macro(token))
    }

    #[must_use]
    pub fn macro_count(&self) -> usize {
        self.macros.len() + self.parent.as_ref().map_or(0, |p| p.macro_count())
    }

    /// Effective macros, outermost ancestor first.
    #[must_use]
    pub fn macros(&self) -> Vec<(String, String)> {
        let mut all = self
            .parent
            .as_ref()
            .map_or_else(Vec::new, |p| p.macros());
        all.extend(self.macros.iter().cloned());
        all
    }

    /// Text substituted for [`SOURCE_MACRO`].
    pub fn set_source(&mut self, source: impl Into<String>) {
        self.source = Some(source.into());
    }

    #[must_use]
    pub fn source(&self) -> Option<String> {
        self.source
            .clone()
            .or_else(|| self.parent.as_ref().and_then(|p| p.source()))
    }

    /// Text placed ahead of the finalized query.
    pub fn set_before(&mut self, text: impl Into<String>) {
        self.before = text.into();
    }

    /// Text placed after the finalized query.
    pub fn set_after(&mut self, text: impl Into<String>) {
        self.after = text.into();
    }

    #[must_use]
    pub fn before(&self) -> &str {
        &self.before
    }

    #[must_use]
    pub fn after(&self) -> &str {
        &self.after
    }

    /// Apply the source macro, then the ancestors' macros, then the local ones.
    ///
    /// Outer scopes go first so an outer replacement may still carry a token
    /// that a local macro resolves.
    #[must_use]
    pub fn resolve_macros(&self, text: &str) -> String {
        let mut out = match self.source() {
            Some(source) => text.replace(SOURCE_MACRO, &source),
            None => text.to_string(),
        };
        if let Some(parent) = &self.parent {
            out = parent.resolve_macros(&out);
        }
        for (token, replacement) in &self.macros {
            if out.contains(token.as_str()) {
                out = out.replace(token.as_str(), replacement);
            }
        }
        out
    }

    /// `DECLARE` lines for every effective parameter, ancestors first.
    #[must_use]
    pub fn declaration(&self, registry: &dyn TypeRegistry) -> String {
        self.iter()
            .map(|p| p.declaration(registry))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Local parameters are copied; the parent link stays shared.
impl Clone for ParameterSet {
    fn clone(&self) -> Self {
        Self {
            parent: self.parent.clone(),
            style: self.style,
            params: self
                .params
                .iter()
                .map(|p| Arc::new(Parameter::clone(p)))
                .collect(),
            index: self.index.clone(),
            macros: self.macros.clone(),
            macro_index: self.macro_index.clone(),
            source: self.source.clone(),
            before: self.before.clone(),
            after: self.after.clone(),
        }
    }
}

impl PartialEq for ParameterSet {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self.macro_count() == other.macro_count()
            && self.before == other.before
            && self.after == other.after
            && (0..self.len()).all(|i| self.get_index(i) == other.get_index(i))
            && self.macros() == other.macros()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::DefaultTypeRegistry;

    #[test]
    fn lookup_reads_through_to_parent_and_counts_sum() {
        let mut parent = ParameterSet::new();
        parent.add("@a", 1).unwrap();
        parent.add("@b", 2).unwrap();
        let parent = Arc::new(parent);
        let mut child = parent.child();
        child.add("@c", 3).unwrap();

        assert_eq!(child.len(), 3);
        assert_eq!(child.local_len(), 1);
        assert_eq!(child.get("@A").unwrap().value(), RowValues::Int(1));
        assert_eq!(child.get("c").unwrap().value(), RowValues::Int(3));
        assert_eq!(child.get_index(0).unwrap().name(), "@a");
        assert_eq!(child.get_index(1).unwrap().name(), "@b");
        assert_eq!(child.get_index(2).unwrap().name(), "@c");
        assert!(child.get_index(3).is_none());
        let names: Vec<String> = child.iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["@a", "@b", "@c"]);
    }

    #[test]
    fn add_overwrites_inherited_parameter_in_place() {
        let mut parent = ParameterSet::new();
        parent.add("@shared", 1).unwrap();
        let parent = Arc::new(parent);
        let mut child = parent.child();

        let rebound = child.add("@SHARED", 10).unwrap();
        assert_eq!(child.local_len(), 0);
        assert_eq!(parent.get("@shared").unwrap().value(), RowValues::Int(10));
        assert_eq!(rebound.name(), "@SHARED");
    }

    #[test]
    fn add_rejects_conflicting_type_hints() {
        let mut set = ParameterSet::new();
        set.add_typed("@x", 1, SqlType::Int).unwrap();
        let err = set.add_typed("@x", "one", SqlType::NVarChar).unwrap_err();
        assert!(matches!(err, ComposerError::NameConflict { .. }));
        set.add_typed("@x", 2, SqlType::Int).unwrap();
        assert_eq!(set.get("@x").unwrap().value(), RowValues::Int(2));
    }

    #[test]
    fn add_unique_allocates_fresh_names() {
        let mut parent = ParameterSet::new();
        parent.add("@p", 1).unwrap();
        parent.add("@p1", 2).unwrap();
        let parent = Arc::new(parent);
        let mut set = parent.child();

        let added = set.add_unique("@p", 1, false).unwrap();
        assert_eq!(added.name(), "@p2");
        let again = set.add_unique("@p1", 5, false).unwrap();
        assert_eq!(again.name(), "@p3");
        let fresh = set.add_unique("@q", 5, false).unwrap();
        assert_eq!(fresh.name(), "@q");
    }

    #[test]
    fn add_unique_merges_identical_values() {
        let mut set = ParameterSet::new();
        let first = set.add_unique("@v", "x", true).unwrap();
        let second = set.add_unique("@v", "x", true).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(set.len(), 1);

        let different = set.add_unique("@v", "y", true).unwrap();
        assert_eq!(different.name(), "@v1");
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn include_renames_colliding_parameters_in_expression() {
        let mut a = ParameterSet::new();
        a.add("@p", "X").unwrap();
        let mut b = ParameterSet::new();
        b.add("@p", "Y").unwrap();

        let expr = a.include(&b, "col = @p", true).unwrap();
        assert_eq!(expr, "col = @p1");
        assert_eq!(a.get("@p").unwrap().value(), RowValues::Text("X".into()));
        assert_eq!(a.get("@p1").unwrap().value(), RowValues::Text("Y".into()));
    }

    #[test]
    fn include_merges_identical_and_chains_renames_in_one_pass() {
        let mut a = ParameterSet::new();
        a.add("@p", 3).unwrap();
        a.add("@same", 9).unwrap();
        let mut b = ParameterSet::new();
        b.add("@p", 5).unwrap();
        b.add("@p1", 6).unwrap();
        b.add("@same", 9).unwrap();

        let expr = a.include(&b, "@p + @p1 + @same", true).unwrap();
        assert_eq!(expr, "@p1 + @p2 + @same");
        assert_eq!(a.len(), 4);
        assert_eq!(a.get("@p1").unwrap().value(), RowValues::Int(5));
        assert_eq!(a.get("@p2").unwrap().value(), RowValues::Int(6));
    }

    #[test]
    fn include_carries_macros_source_and_fragments() {
        let mut a = ParameterSet::new();
        a.add_macro("##T##", "a_table");
        a.set_before("SET NOCOUNT ON;\n");
        let mut b = ParameterSet::new();
        b.add_macro("##T##", "b_table");
        b.add_macro("##U##", "users");
        b.set_source("SELECT 1");
        b.set_before("PRAGMA x;\n");
        b.set_after("\n-- end");

        a.include(&b, "", true).unwrap();
        assert_eq!(a.get_macro("##T##").as_deref(), Some("a_table"));
        assert_eq!(a.get_macro("##U##").as_deref(), Some("users"));
        assert_eq!(a.source().as_deref(), Some("SELECT 1"));
        assert_eq!(a.before(), "PRAGMA x;\nSET NOCOUNT ON;\n");
        assert_eq!(a.after(), "\n-- end");

        a.include(&b, "", true).unwrap();
        assert_eq!(a.before(), "PRAGMA x;\nSET NOCOUNT ON;\n");
        assert_eq!(a.after(), "\n-- end");
    }

    #[test]
    fn macros_resolve_source_then_outer_then_local() {
        let mut outer = ParameterSet::new();
        outer.add_macro("##TABLE##", "##SCHEMA##.orders");
        let outer = Arc::new(outer);
        let mut inner = outer.child();
        inner.add_macro("##SCHEMA##", "sales");
        inner.set_source("SELECT id FROM ##TABLE##");

        assert_eq!(
            inner.resolve_macros("SELECT COUNT(*) FROM (##SOURCE##) s"),
            "SELECT COUNT(*) FROM (SELECT id FROM sales.orders) s"
        );
        assert_eq!(inner.macro_count(), 2);
        assert_eq!(inner.macros()[0].0, "##TABLE##");
    }

    #[test]
    fn add_id_nulls_non_positive_ids() {
        let mut set = ParameterSet::new();
        assert!(set.add_id("@id", 0).unwrap().value().is_null());
        assert!(set.add_id("@neg", -4).unwrap().value().is_null());
        assert_eq!(set.add_id("@ok", 7).unwrap().value(), RowValues::Int(7));
    }

    #[test]
    fn declaration_lists_ancestors_first() {
        let mut parent = ParameterSet::new();
        parent.add("@a", 1).unwrap();
        let parent = Arc::new(parent);
        let mut child = parent.child();
        child.add("@b", "x").unwrap();
        assert_eq!(
            child.declaration(&DefaultTypeRegistry),
            "DECLARE @a int = 1;\nDECLARE @b nvarchar(max) = 'x';"
        );
    }

    #[test]
    fn equality_and_clone_independence() {
        let mut a = ParameterSet::new();
        a.add("@x", 1).unwrap();
        a.add_macro("##M##", "m");
        let b = a.clone();
        assert_eq!(a, b);

        b.get("@x").unwrap().set_value(2);
        assert_ne!(a, b);
        assert_eq!(a.get("@x").unwrap().value(), RowValues::Int(1));
    }
}
