use crate::error::ComposerError;

/// Column carrying the unpaged row count when a total is requested.
pub const TOTAL_ROWS_COLUMN: &str = "__total_rows";

/// Column carrying the window position in sub-query paging.
pub const ROW_NUMBER_COLUMN: &str = "__row_number";

/// One paging rewrite: restrict `text` to `limit` rows starting after `offset`.
#[derive(Debug, Clone, Copy)]
pub struct PagingRequest<'a> {
    pub text: &'a str,
    /// Ordering expression for the window, without the `ORDER BY` keywords.
    pub order_by: Option<&'a str>,
    pub offset: usize,
    pub limit: usize,
    /// Also report the unpaged row count in [`TOTAL_ROWS_COLUMN`].
    pub with_total: bool,
    /// The result is embedded in an outer statement: no terminal `ORDER BY`
    /// and no common table expression may appear at the top level.
    pub inner: bool,
}

/// Rewrites a query into an equivalent one restricted to a row window.
pub trait PagingRewriter: Send + Sync {
    /// # Errors
    /// Returns `ComposerError::ExecutionError` if the query cannot be paged as requested.
    fn rewrite(&self, request: &PagingRequest<'_>) -> Result<String, ComposerError>;
}

/// `LIMIT`/`OFFSET` paging for SQLite.
///
/// Sub-queries are paged through `ROW_NUMBER()` instead so the rewritten text
/// can sit inside another statement.
#[derive(Debug, Clone, Copy, Default)]
pub struct LimitOffsetPaging;

impl PagingRewriter for LimitOffsetPaging {
    fn rewrite(&self, request: &PagingRequest<'_>) -> Result<String, ComposerError> {
        if request.limit == 0 {
            return Err(ComposerError::ExecutionError(
                "paging requires a positive row limit".into(),
            ));
        }
        let body = request.text.trim().trim_end_matches(';').trim_end();
        if request.inner && starts_with_keyword(body, "WITH") {
            return Err(ComposerError::ExecutionError(
                "a common table expression cannot be paged as a sub-query".into(),
            ));
        }

        let total = if request.with_total {
            format!(", COUNT(*) OVER () AS {TOTAL_ROWS_COLUMN}")
        } else {
            String::new()
        };

        if request.inner {
            let over = request
                .order_by
                .map_or_else(String::new, |o| format!("ORDER BY {o}"));
            let upper = request.offset.checked_add(request.limit).ok_or_else(|| {
                ComposerError::ExecutionError(format!(
                    "paging window {} + {} overflows",
                    request.offset, request.limit
                ))
            })?;
            return Ok(format!(
                "SELECT * FROM (SELECT *, ROW_NUMBER() OVER ({over}) AS {ROW_NUMBER_COLUMN}{total} \
                 FROM ({body}) AS __source) AS __paged \
                 WHERE {ROW_NUMBER_COLUMN} > {} AND {ROW_NUMBER_COLUMN} <= {upper}",
                request.offset
            ));
        }

        let order = request
            .order_by
            .map_or_else(String::new, |o| format!(" ORDER BY {o}"));
        Ok(format!(
            "SELECT *{total} FROM ({body}) AS __paged{order} LIMIT {} OFFSET {}",
            request.limit, request.offset
        ))
    }
}

fn starts_with_keyword(text: &str, keyword: &str) -> bool {
    text.get(..keyword.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(keyword))
        && text[keyword.len()..]
            .chars()
            .next()
            .is_none_or(|c| !c.is_ascii_alphanumeric() && c != '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(text: &str) -> PagingRequest<'_> {
        PagingRequest {
            text,
            order_by: Some("id"),
            offset: 40,
            limit: 20,
            with_total: false,
            inner: false,
        }
    }

    #[test]
    fn outer_query_uses_limit_offset() {
        let sql = LimitOffsetPaging.rewrite(&request("SELECT id FROM t;")).unwrap();
        assert_eq!(
            sql,
            "SELECT * FROM (SELECT id FROM t) AS __paged ORDER BY id LIMIT 20 OFFSET 40"
        );
    }

    #[test]
    fn total_adds_window_count() {
        let mut req = request("SELECT id FROM t");
        req.with_total = true;
        let sql = LimitOffsetPaging.rewrite(&req).unwrap();
        assert!(sql.starts_with("SELECT *, COUNT(*) OVER () AS __total_rows FROM"));
    }

    #[test]
    fn inner_query_has_no_terminal_order_by() {
        let mut req = request("SELECT id FROM t");
        req.inner = true;
        let sql = LimitOffsetPaging.rewrite(&req).unwrap();
        assert!(sql.contains("ROW_NUMBER() OVER (ORDER BY id)"));
        assert!(sql.ends_with("__row_number > 40 AND __row_number <= 60"));
    }

    #[test]
    fn inner_window_overflow_is_an_error() {
        let mut req = request("SELECT id FROM t");
        req.inner = true;
        req.offset = usize::MAX;
        req.limit = 1;
        assert!(matches!(
            LimitOffsetPaging.rewrite(&req),
            Err(ComposerError::ExecutionError(_))
        ));
    }

    #[test]
    fn inner_cte_is_rejected() {
        let mut req = request("WITH x AS (SELECT 1) SELECT * FROM x");
        req.inner = true;
        assert!(LimitOffsetPaging.rewrite(&req).is_err());
        req.inner = false;
        assert!(LimitOffsetPaging.rewrite(&req).is_ok());
        assert!(!starts_with_keyword("WITHOUT", "WITH"));
    }
}
