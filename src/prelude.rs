//! Convenient imports for common functionality.

pub use crate::config::{ConnectionSettings, ConnectionSettingsBuilder, IsolationLevel};
pub use crate::connection::{BulkInsertSettings, ConnectionManager, ConnectionScope, ScopeGuard};
pub use crate::diagnostics::{DiagnosticsSink, LifecycleEvent, LifecycleKind, RecordingSink, TracingSink};
pub use crate::error::ComposerError;
pub use crate::marker::MarkerStyle;
pub use crate::paging::{LimitOffsetPaging, PagingRequest, PagingRewriter};
pub use crate::parameter::{Parameter, ParameterValue};
pub use crate::parameter_set::{ParameterSet, SOURCE_MACRO};
pub use crate::query_spec::{QueryKind, QuerySpec, QueryState, TextMode};
pub use crate::registry::{DefaultTypeRegistry, TypeRegistry};
pub use crate::results::{CustomDbRow, ResultSet};
pub use crate::substitution::{LexicalSubstituter, QuoteParitySubstituter, TokenSubstituter};
pub use crate::types::{RowValues, SqlType};

pub use tokio_util::sync::CancellationToken;
