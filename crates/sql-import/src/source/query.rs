//! SQL generation for counting and projecting source rows.
//!
//! Only mapped fields are selected, the filter predicate is applied verbatim,
//! and rows come back in the source's natural order unless an ordering
//! column is requested.

use crate::mapping::SourceLocation;

/// SQL syntax of the source engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Mssql,
    Postgres,
}

/// What a query asks for, independent of its SQL text.
///
/// Drivers execute [`SourceQuery::sql`]; engines without SQL (the in-memory
/// driver) interpret the shape instead.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryShape {
    Count,
    Select {
        columns: Vec<String>,
        order_by: Option<String>,
        limit: Option<usize>,
    },
}

/// A query ready to hand to a [`ConnectionProvider`](super::ConnectionProvider).
#[derive(Debug, Clone, PartialEq)]
pub struct SourceQuery {
    pub sql: String,
    pub location: SourceLocation,
    pub shape: QueryShape,
}

/// Options for a projection query.
#[derive(Debug, Clone, Default)]
pub struct SelectOptions {
    /// Column to order by (ascending).
    pub order_by: Option<String>,
    /// Row limit.
    pub limit: Option<usize>,
}

impl Dialect {
    pub fn name(&self) -> &'static str {
        match self {
            Dialect::Mssql => "mssql",
            Dialect::Postgres => "postgres",
        }
    }

    /// Quote an identifier.
    ///
    /// - MSSQL: `[identifier]`
    /// - PostgreSQL: `"identifier"`
    pub fn quote_ident(&self, name: &str) -> String {
        match self {
            Dialect::Mssql => format!("[{}]", name.replace(']', "]]")),
            Dialect::Postgres => format!("\"{}\"", name.replace('"', "\"\"")),
        }
    }

    /// Fully qualify a table name.
    pub fn qualify(&self, schema: &str, table: &str) -> String {
        format!("{}.{}", self.quote_ident(schema), self.quote_ident(table))
    }

    fn where_clause(location: &SourceLocation) -> String {
        match location.filter.as_deref().map(str::trim) {
            Some(filter) if !filter.is_empty() => format!("\nWHERE {}", filter),
            _ => String::new(),
        }
    }

    /// Exact row count over the filtered source.
    pub fn count_query(&self, location: &SourceLocation) -> SourceQuery {
        let sql = format!(
            "SELECT COUNT(*) AS row_count\nFROM {}{}",
            self.qualify(&location.schema, &location.table),
            Self::where_clause(location)
        );

        SourceQuery {
            sql,
            location: location.clone(),
            shape: QueryShape::Count,
        }
    }

    /// Projection of exactly `columns`, in that order.
    pub fn select_query(
        &self,
        location: &SourceLocation,
        columns: &[String],
        opts: &SelectOptions,
    ) -> SourceQuery {
        let col_list = columns
            .iter()
            .map(|c| self.quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");

        let top = match (self, opts.limit) {
            (Dialect::Mssql, Some(n)) => format!("TOP {} ", n),
            _ => String::new(),
        };

        let mut sql = format!(
            "SELECT {}{}\nFROM {}{}",
            top,
            col_list,
            self.qualify(&location.schema, &location.table),
            Self::where_clause(location)
        );

        if let Some(col) = &opts.order_by {
            sql.push_str(&format!("\nORDER BY {}", self.quote_ident(col)));
        }

        if let (Dialect::Postgres, Some(n)) = (self, opts.limit) {
            sql.push_str(&format!("\nLIMIT {}", n));
        }

        SourceQuery {
            sql,
            location: location.clone(),
            shape: QueryShape::Select {
                columns: columns.to_vec(),
                order_by: opts.order_by.clone(),
                limit: opts.limit,
            },
        }
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn location(filter: Option<&str>) -> SourceLocation {
        let mut loc = SourceLocation::new("dbo", "Customers");
        loc.filter = filter.map(String::from);
        loc
    }

    fn cols() -> Vec<String> {
        vec!["Name".to_string(), "Zip Code".to_string()]
    }

    #[test]
    fn test_mssql_count_applies_filter() {
        let q = Dialect::Mssql.count_query(&location(Some("Active = 1")));
        assert_eq!(
            q.sql,
            "SELECT COUNT(*) AS row_count\nFROM [dbo].[Customers]\nWHERE Active = 1"
        );
        assert_eq!(q.shape, QueryShape::Count);
    }

    #[test]
    fn test_blank_filter_ignored() {
        let q = Dialect::Mssql.count_query(&location(Some("   ")));
        assert!(!q.sql.contains("WHERE"));
    }

    #[test]
    fn test_mssql_projection_selects_only_mapped_fields() {
        let q = Dialect::Mssql.select_query(&location(None), &cols(), &SelectOptions::default());
        assert_eq!(q.sql, "SELECT [Name], [Zip Code]\nFROM [dbo].[Customers]");
        assert!(!q.sql.contains('*'));
        assert!(!q.sql.contains("ORDER BY"));
    }

    #[test]
    fn test_mssql_top_and_order() {
        let opts = SelectOptions {
            order_by: Some("Name".to_string()),
            limit: Some(5),
        };
        let q = Dialect::Mssql.select_query(&location(Some("Id > 10")), &cols(), &opts);
        assert_eq!(
            q.sql,
            "SELECT TOP 5 [Name], [Zip Code]\nFROM [dbo].[Customers]\nWHERE Id > 10\nORDER BY [Name]"
        );
    }

    #[test]
    fn test_postgres_limit_and_quoting() {
        let opts = SelectOptions {
            order_by: None,
            limit: Some(3),
        };
        let q = Dialect::Postgres.select_query(&location(None), &cols(), &opts);
        assert_eq!(
            q.sql,
            "SELECT \"Name\", \"Zip Code\"\nFROM \"dbo\".\"Customers\"\nLIMIT 3"
        );
    }

    #[test]
    fn test_identifier_escaping() {
        assert_eq!(Dialect::Mssql.quote_ident("a]b"), "[a]]b]");
        assert_eq!(Dialect::Postgres.quote_ident("a\"b"), "\"a\"\"b\"");
    }
}
