//! On-demand merge-time deduplication.
//!
//! `ReplacingMergeTree` collapses duplicate rows only when parts merge,
//! which ClickHouse schedules at its own pace. `deduplicate_table` forces
//! the collapse with `OPTIMIZE TABLE ... DEDUPLICATE`, optionally narrowed
//! to an explicit column list or to everything except a column list.

use clickhouse::sql::Identifier;

use crate::error::StoreError;
use crate::store::StoreClient;

#[derive(Clone, Debug)]
pub struct DeduplicateOptions {
    /// Rewrite all parts even if already merged. Without it the statement
    /// only touches unmerged parts and usually does nothing.
    pub final_: bool,
    /// Deduplicate by exactly these columns.
    pub by: Vec<String>,
    /// Deduplicate by every column except these.
    pub except: Vec<String>,
    /// Surface a no-op as an error instead of silently succeeding.
    pub throw_if_noop: bool,
}

impl Default for DeduplicateOptions {
    fn default() -> Self {
        Self {
            final_: true,
            by: Vec::new(),
            except: Vec::new(),
            throw_if_noop: true,
        }
    }
}

/// Builds the OPTIMIZE statement with one `?` placeholder for the table and
/// one per column, to be bound as identifiers in that order.
fn build_sql(options: &DeduplicateOptions) -> Result<String, StoreError> {
    if !options.by.is_empty() && !options.except.is_empty() {
        return Err(StoreError::ConflictingColumns);
    }

    let mut sql = String::from("OPTIMIZE TABLE ?");
    if options.final_ {
        sql.push_str(" FINAL");
    }
    sql.push_str(" DEDUPLICATE");

    if !options.by.is_empty() {
        sql.push_str(" BY ");
        sql.push_str(&placeholders(options.by.len()));
    } else if !options.except.is_empty() {
        sql.push_str(" BY * EXCEPT (");
        sql.push_str(&placeholders(options.except.len()));
        sql.push(')');
    }

    Ok(sql)
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

pub async fn deduplicate_table(
    store: &StoreClient,
    table: &str,
    options: &DeduplicateOptions,
) -> Result<(), StoreError> {
    let sql = build_sql(options)?;

    let _permit = store.acquire().await;
    let mut query = store
        .client()
        .query(&sql)
        .with_option(
            "optimize_throw_if_noop",
            if options.throw_if_noop { "1" } else { "0" },
        )
        .bind(Identifier(table));
    for column in options.by.iter().chain(options.except.iter()) {
        query = query.bind(Identifier(column));
    }
    query.execute().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_statement_is_final_deduplicate() {
        let sql = build_sql(&DeduplicateOptions::default()).unwrap();
        assert_eq!(sql, "OPTIMIZE TABLE ? FINAL DEDUPLICATE");
    }

    #[test]
    fn by_columns_narrow_the_key() {
        let options = DeduplicateOptions {
            by: vec!["id".into(), "updated_at".into()],
            ..DeduplicateOptions::default()
        };
        assert_eq!(
            build_sql(&options).unwrap(),
            "OPTIMIZE TABLE ? FINAL DEDUPLICATE BY ?, ?"
        );
    }

    #[test]
    fn except_columns_invert_the_key() {
        let options = DeduplicateOptions {
            final_: false,
            except: vec!["updated_at".into()],
            ..DeduplicateOptions::default()
        };
        assert_eq!(
            build_sql(&options).unwrap(),
            "OPTIMIZE TABLE ? DEDUPLICATE BY * EXCEPT (?)"
        );
    }

    #[test]
    fn by_and_except_conflict() {
        let options = DeduplicateOptions {
            by: vec!["id".into()],
            except: vec!["updated_at".into()],
            ..DeduplicateOptions::default()
        };
        assert!(matches!(
            build_sql(&options),
            Err(StoreError::ConflictingColumns)
        ));
    }
}
