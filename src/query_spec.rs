use std::fmt;
use std::sync::Arc;

use crate::error::ComposerError;
use crate::paging::{LimitOffsetPaging, PagingRequest, PagingRewriter};
use crate::parameter_set::ParameterSet;
use crate::registry::{DefaultTypeRegistry, TypeRegistry};
use crate::substitution::{QuoteParitySubstituter, TokenSubstituter};

/// Lifecycle of a query's text. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum QueryState {
    /// Authored text, macros untouched.
    #[default]
    Template,
    /// Macro tokens replaced.
    MacrosResolved,
    /// Paging and before/after fragments applied; ready to execute.
    Finalized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryKind {
    /// Free-form SQL text.
    #[default]
    Text,
    /// `text` names a stored procedure.
    StoredProcedure,
}

/// How [`QuerySpec::full_query_text`] renders parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextMode {
    /// Every marker replaced by the literal of its current value.
    Expanded,
    /// A `DECLARE` block followed by the parameterized text.
    WithDeclarations,
    /// The parameterized text alone.
    Parameterized,
}

/// Descriptor of one logical query.
///
/// A spec is usually kept as a template; [`QuerySpec::for_execution`] hands
/// out a finalized copy.
///
/// ```rust
/// use sql_composer::prelude::*;
///
/// # fn main() -> Result<(), ComposerError> {
/// let mut params = ParameterSet::new();
/// params.add("@id", 42)?;
/// let mut spec = QuerySpec::new("SELECT * FROM T WHERE ID=@id").with_params(params);
/// assert_eq!(
///     spec.full_query_text(TextMode::Expanded)?,
///     "SELECT * FROM T WHERE ID=42"
/// );
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct QuerySpec {
    text: String,
    kind: QueryKind,
    params: ParameterSet,
    macros: Vec<(String, String)>,
    transaction_required: bool,
    connection_override: Option<String>,
    max_records: usize,
    offset: usize,
    order_by: Option<String>,
    with_total: bool,
    is_sub_query: bool,
    is_nested: bool,
    state: QueryState,
    paging: Arc<dyn PagingRewriter>,
    registry: Arc<dyn TypeRegistry>,
    substituter: Arc<dyn TokenSubstituter>,
}

impl QuerySpec {
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            kind: QueryKind::Text,
            params: ParameterSet::new(),
            macros: Vec::new(),
            transaction_required: false,
            connection_override: None,
            max_records: 0,
            offset: 0,
            order_by: None,
            with_total: false,
            is_sub_query: false,
            is_nested: false,
            state: QueryState::Template,
            paging: Arc::new(LimitOffsetPaging),
            registry: Arc::new(DefaultTypeRegistry),
            substituter: Arc::new(QuoteParitySubstituter),
        }
    }

    #[must_use]
    pub fn stored_procedure(name: impl Into<String>) -> Self {
        Self {
            kind: QueryKind::StoredProcedure,
            ..Self::new(name)
        }
    }

    #[must_use]
    pub fn with_params(mut self, params: ParameterSet) -> Self {
        self.params = params;
        self
    }

    /// Add a text macro applied after the parameter set's own macros.
    #[must_use]
    pub fn with_macro(mut self, token: impl Into<String>, text: impl Into<String>) -> Self {
        self.macros.push((token.into(), text.into()));
        self
    }

    #[must_use]
    pub fn require_transaction(mut self) -> Self {
        self.transaction_required = true;
        self
    }

    /// Run against another data source instead of the executing connection's own.
    #[must_use]
    pub fn on_connection(mut self, connection_string: impl Into<String>) -> Self {
        self.connection_override = Some(connection_string.into());
        self
    }

    /// Restrict results to `max_records` rows after skipping `offset`.
    #[must_use]
    pub fn page(mut self, offset: usize, max_records: usize) -> Self {
        self.offset = offset;
        self.max_records = max_records;
        self
    }

    #[must_use]
    pub fn order_by(mut self, order_by: impl Into<String>) -> Self {
        self.order_by = Some(order_by.into());
        self
    }

    /// Ask paged execution to report the unpaged row count as well.
    #[must_use]
    pub fn with_total(mut self) -> Self {
        self.with_total = true;
        self
    }

    #[must_use]
    pub fn as_sub_query(mut self) -> Self {
        self.is_sub_query = true;
        self
    }

    #[must_use]
    pub fn as_nested(mut self) -> Self {
        self.is_nested = true;
        self
    }

    #[must_use]
    pub fn with_paging(mut self, paging: Arc<dyn PagingRewriter>) -> Self {
        self.paging = paging;
        self
    }

    #[must_use]
    pub fn with_registry(mut self, registry: Arc<dyn TypeRegistry>) -> Self {
        self.registry = registry;
        self
    }

    #[must_use]
    pub fn with_substituter(mut self, substituter: Arc<dyn TokenSubstituter>) -> Self {
        self.substituter = substituter;
        self
    }

    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    #[must_use]
    pub fn kind(&self) -> QueryKind {
        self.kind
    }

    #[must_use]
    pub fn params(&self) -> &ParameterSet {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut ParameterSet {
        &mut self.params
    }

    #[must_use]
    pub fn transaction_required(&self) -> bool {
        self.transaction_required
    }

    #[must_use]
    pub fn connection_override(&self) -> Option<&str> {
        self.connection_override.as_deref()
    }

    #[must_use]
    pub fn max_records(&self) -> usize {
        self.max_records
    }

    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[must_use]
    pub fn total_requested(&self) -> bool {
        self.with_total
    }

    #[must_use]
    pub fn is_sub_query(&self) -> bool {
        self.is_sub_query
    }

    #[must_use]
    pub fn is_nested(&self) -> bool {
        self.is_nested
    }

    #[must_use]
    pub fn state(&self) -> QueryState {
        self.state
    }

    #[must_use]
    pub fn registry(&self) -> &dyn TypeRegistry {
        self.registry.as_ref()
    }

    fn advance(&mut self, to: QueryState) {
        self.state = self.state.max(to);
    }

    /// Resolve the parameter set's macros, then this spec's own, exactly once.
    ///
    /// Later calls return the already-resolved text untouched, even when a
    /// replacement produced another macro token.
    pub fn resolve_macros(&mut self) -> &str {
        if self.state < QueryState::MacrosResolved {
            let mut text = self.params.resolve_macros(&self.text);
            for (token, replacement) in &self.macros {
                text = text.replace(token.as_str(), replacement);
            }
            self.text = text;
            self.advance(QueryState::MacrosResolved);
        }
        &self.text
    }

    /// Resolve macros, bake paging into the text and wrap it in the parameter
    /// set's before/after fragments. A finalized spec is left untouched.
    ///
    /// # Errors
    /// Returns `ComposerError::ExecutionError` if the paging rewriter rejects the
    /// query or a stored procedure is asked to page.
    pub fn finalize_for_execution(
        &mut self,
        with_total: bool,
        sub_query: bool,
    ) -> Result<(), ComposerError> {
        if self.state == QueryState::Finalized {
            return Ok(());
        }
        self.resolve_macros();

        let inner = sub_query || self.is_sub_query || self.is_nested;
        if self.max_records > 0 {
            if self.kind == QueryKind::StoredProcedure {
                return Err(ComposerError::ExecutionError(format!(
                    "stored procedure {} cannot be paged",
                    self.text
                )));
            }
            let request = PagingRequest {
                text: &self.text,
                order_by: self.order_by.as_deref(),
                offset: self.offset,
                limit: self.max_records,
                with_total: with_total && !inner,
                inner,
            };
            self.text = self.paging.rewrite(&request)?;
            self.offset = 0;
            self.max_records = 0;
        }

        if !inner {
            let (before, after) = (self.params.before(), self.params.after());
            if !before.is_empty() || !after.is_empty() {
                self.text = format!("{before}{}{after}", self.text);
            }
        }

        self.advance(QueryState::Finalized);
        Ok(())
    }

    /// A finalized copy for execution; the template keeps its state.
    ///
    /// # Errors
    /// Returns `ComposerError::ExecutionError` if finalization fails.
    pub fn for_execution(&self, with_total: bool, sub_query: bool) -> Result<QuerySpec, ComposerError> {
        let mut finalized = self.clone();
        finalized.finalize_for_execution(with_total, sub_query)?;
        Ok(finalized)
    }

    /// Materialize the text, finalizing first if needed.
    ///
    /// Sub-queries and nested queries finalize as inner queries without a total count.
    ///
    /// # Errors
    /// Returns `ComposerError::ExecutionError` if finalization fails.
    pub fn full_query_text(&mut self, mode: TextMode) -> Result<String, ComposerError> {
        if self.state < QueryState::Finalized {
            let inner = self.is_sub_query || self.is_nested;
            self.finalize_for_execution(false, inner)?;
        }
        Ok(match mode {
            TextMode::Expanded => self.params.iter().fold(self.text.clone(), |text, param| {
                param.expand_with(&text, self.registry.as_ref(), self.substituter.as_ref())
            }),
            TextMode::WithDeclarations => {
                let declarations = self.params.declaration(self.registry.as_ref());
                if declarations.is_empty() {
                    self.text.clone()
                } else {
                    format!("{declarations}\n{}", self.text)
                }
            }
            TextMode::Parameterized => self.text.clone(),
        })
    }
}

impl fmt::Debug for QuerySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuerySpec")
            .field("text", &self.text)
            .field("kind", &self.kind)
            .field("params", &self.params)
            .field("macros", &self.macros)
            .field("transaction_required", &self.transaction_required)
            .field("connection_override", &self.connection_override)
            .field("max_records", &self.max_records)
            .field("offset", &self.offset)
            .field("order_by", &self.order_by)
            .field("with_total", &self.with_total)
            .field("is_sub_query", &self.is_sub_query)
            .field("is_nested", &self.is_nested)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl From<&str> for QuerySpec {
    fn from(text: &str) -> Self {
        QuerySpec::new(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RowValues;

    fn id_params() -> ParameterSet {
        let mut params = ParameterSet::new();
        params.add("@id", 42).unwrap();
        params
    }

    #[test]
    fn text_modes_render_expected_forms() {
        let mut spec = QuerySpec::new("SELECT * FROM T WHERE ID=@id").with_params(id_params());
        assert_eq!(
            spec.full_query_text(TextMode::Expanded).unwrap(),
            "SELECT * FROM T WHERE ID=42"
        );
        assert_eq!(
            spec.full_query_text(TextMode::WithDeclarations).unwrap(),
            "DECLARE @id int = 42;\nSELECT * FROM T WHERE ID=@id"
        );
        assert_eq!(
            spec.full_query_text(TextMode::Parameterized).unwrap(),
            "SELECT * FROM T WHERE ID=@id"
        );
        assert_eq!(spec.state(), QueryState::Finalized);
    }

    #[test]
    fn macros_resolve_exactly_once() {
        let mut params = ParameterSet::new();
        params.add_macro("##B##", "b_table");
        let mut spec = QuerySpec::new("SELECT * FROM ##A##")
            .with_params(params)
            .with_macro("##A##", "##B##");

        let first = spec.resolve_macros().to_string();
        assert_eq!(first, "SELECT * FROM ##B##");
        assert_eq!(spec.resolve_macros(), first);
        spec.finalize_for_execution(false, false).unwrap();
        assert_eq!(spec.text(), first);
    }

    #[test]
    fn finalize_twice_does_not_double_wrap_paging() {
        let template = QuerySpec::new("SELECT id FROM t").order_by("id").page(40, 20);
        let once = template.for_execution(false, false).unwrap();
        let twice = once.for_execution(false, false).unwrap();
        assert_eq!(once.text(), twice.text());
        assert_eq!(once.max_records(), 0);
        assert_eq!(once.offset(), 0);
        assert_eq!(
            once.text(),
            "SELECT * FROM (SELECT id FROM t) AS __paged ORDER BY id LIMIT 20 OFFSET 40"
        );

        let mut in_place = template.clone();
        in_place.finalize_for_execution(false, false).unwrap();
        in_place.finalize_for_execution(false, false).unwrap();
        assert_eq!(in_place.text(), once.text());
    }

    #[test]
    fn template_is_left_reusable() {
        let template = QuerySpec::new("SELECT id FROM t").page(0, 5);
        let _ = template.for_execution(true, false).unwrap();
        assert_eq!(template.state(), QueryState::Template);
        assert_eq!(template.max_records(), 5);
        assert_eq!(template.text(), "SELECT id FROM t");
    }

    #[test]
    fn sub_queries_page_as_inner_without_fragments() {
        let mut params = ParameterSet::new();
        params.set_before("PRAGMA x;\n");
        let mut spec = QuerySpec::new("SELECT id FROM t")
            .with_params(params)
            .page(0, 10)
            .as_sub_query();
        let text = spec.full_query_text(TextMode::Parameterized).unwrap();
        assert!(text.contains("ROW_NUMBER()"));
        assert!(!text.contains("__total_rows"));
        assert!(!text.starts_with("PRAGMA"));
    }

    #[test]
    fn fragments_wrap_outer_queries() {
        let mut params = ParameterSet::new();
        params.set_before("BEGIN; ");
        params.set_after("; COMMIT;");
        let spec = QuerySpec::new("UPDATE t SET a = 1")
            .with_params(params)
            .for_execution(false, false)
            .unwrap();
        assert_eq!(spec.text(), "BEGIN; UPDATE t SET a = 1; COMMIT;");
    }

    #[test]
    fn stored_procedures_refuse_paging() {
        let mut spec = QuerySpec::stored_procedure("dbo.GetOrders").page(0, 10);
        assert!(spec.finalize_for_execution(false, false).is_err());
        assert_eq!(spec.kind(), QueryKind::StoredProcedure);
    }

    #[test]
    fn expanded_text_reads_current_dynamic_values() {
        let mut params = ParameterSet::new();
        params
            .add_dynamic("@now", || RowValues::Text("2024-01-01".into()))
            .unwrap();
        let mut spec = QuerySpec::new("SELECT @now").with_params(params);
        assert_eq!(
            spec.full_query_text(TextMode::Expanded).unwrap(),
            "SELECT '2024-01-01'"
        );
    }

    #[test]
    fn overflowing_sub_query_page_fails_cleanly() {
        let mut spec = QuerySpec::new("SELECT id FROM t").page(usize::MAX, 1).as_sub_query();
        assert!(matches!(
            spec.full_query_text(TextMode::Parameterized),
            Err(ComposerError::ExecutionError(_))
        ));
    }
}
