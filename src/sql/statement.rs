use crate::core::{Row, Value};
use std::fmt;

/// A column qualified by the alias of the table it is read from.
///
/// An empty alias designates the single table of a write statement.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ColumnRef {
    pub alias: String,
    pub column: String,
}

impl ColumnRef {
    pub fn new(alias: &str, column: &str) -> Self {
        Self {
            alias: alias.to_string(),
            column: column.to_string(),
        }
    }

    pub fn bare(column: &str) -> Self {
        Self::new("", column)
    }
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.alias.is_empty() {
            write!(f, "{}", self.column)
        } else {
            write!(f, "{}.{}", self.alias, self.column)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Criteria {
    Eq(ColumnRef, Value),
    NotEq(ColumnRef, Value),
    In(ColumnRef, Vec<Value>),
    IsNull(ColumnRef),
    IsNotNull(ColumnRef),
    Lt(ColumnRef, Value),
    Le(ColumnRef, Value),
    Gt(ColumnRef, Value),
    Ge(ColumnRef, Value),
    Like(ColumnRef, String),
    And(Vec<Criteria>),
    Or(Vec<Criteria>),
    Not(Box<Criteria>),
}

impl Criteria {
    /// Conjunction of column equalities, the shape of every primary key predicate.
    pub fn key(columns: &[String], values: &[Value]) -> Self {
        let mut terms: Vec<Criteria> = columns
            .iter()
            .zip(values)
            .map(|(column, value)| Criteria::Eq(ColumnRef::bare(column), value.clone()))
            .collect();
        if terms.len() == 1 {
            terms.remove(0)
        } else {
            Criteria::And(terms)
        }
    }

    pub fn and(self, other: Criteria) -> Self {
        match self {
            Criteria::And(mut terms) => {
                terms.push(other);
                Criteria::And(terms)
            }
            first => Criteria::And(vec![first, other]),
        }
    }

    /// Rewrites the alias of every column reference.
    pub fn with_alias(self, alias: &str) -> Self {
        let relabel = |c: ColumnRef| ColumnRef::new(alias, &c.column);
        match self {
            Criteria::Eq(c, v) => Criteria::Eq(relabel(c), v),
            Criteria::NotEq(c, v) => Criteria::NotEq(relabel(c), v),
            Criteria::In(c, v) => Criteria::In(relabel(c), v),
            Criteria::IsNull(c) => Criteria::IsNull(relabel(c)),
            Criteria::IsNotNull(c) => Criteria::IsNotNull(relabel(c)),
            Criteria::Lt(c, v) => Criteria::Lt(relabel(c), v),
            Criteria::Le(c, v) => Criteria::Le(relabel(c), v),
            Criteria::Gt(c, v) => Criteria::Gt(relabel(c), v),
            Criteria::Ge(c, v) => Criteria::Ge(relabel(c), v),
            Criteria::Like(c, p) => Criteria::Like(relabel(c), p),
            Criteria::And(terms) => Criteria::And(terms.into_iter().map(|t| t.with_alias(alias)).collect()),
            Criteria::Or(terms) => Criteria::Or(terms.into_iter().map(|t| t.with_alias(alias)).collect()),
            Criteria::Not(inner) => Criteria::Not(Box::new(inner.with_alias(alias))),
        }
    }
}

fn join_terms(f: &mut fmt::Formatter<'_>, terms: &[Criteria], separator: &str) -> fmt::Result {
    write!(f, "(")?;
    for (i, term) in terms.iter().enumerate() {
        if i > 0 {
            write!(f, " {} ", separator)?;
        }
        write!(f, "{}", term)?;
    }
    write!(f, ")")
}

impl fmt::Display for Criteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Criteria::Eq(c, v) => write!(f, "{} = {}", c, v),
            Criteria::NotEq(c, v) => write!(f, "{} <> {}", c, v),
            Criteria::In(c, values) => {
                let list: Vec<String> = values.iter().map(|v| v.to_string()).collect();
                write!(f, "{} IN ({})", c, list.join(", "))
            }
            Criteria::IsNull(c) => write!(f, "{} IS NULL", c),
            Criteria::IsNotNull(c) => write!(f, "{} IS NOT NULL", c),
            Criteria::Lt(c, v) => write!(f, "{} < {}", c, v),
            Criteria::Le(c, v) => write!(f, "{} <= {}", c, v),
            Criteria::Gt(c, v) => write!(f, "{} > {}", c, v),
            Criteria::Ge(c, v) => write!(f, "{} >= {}", c, v),
            Criteria::Like(c, p) => write!(f, "{} LIKE '{}'", c, p),
            Criteria::And(terms) => join_terms(f, terms, "AND"),
            Criteria::Or(terms) => join_terms(f, terms, "OR"),
            Criteria::Not(inner) => write!(f, "NOT ({})", inner),
        }
    }
}

/// Multi-row insert.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertStatement {
    pub table: String,
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateStatement {
    pub table: String,
    pub assignments: Vec<(String, Value)>,
    pub criteria: Criteria,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteStatement {
    pub table: String,
    pub criteria: Criteria,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteStatement {
    Insert(InsertStatement),
    Update(UpdateStatement),
    Delete(DeleteStatement),
}

impl WriteStatement {
    pub fn table(&self) -> &str {
        match self {
            Self::Insert(s) => &s.table,
            Self::Update(s) => &s.table,
            Self::Delete(s) => &s.table,
        }
    }
}

impl fmt::Display for WriteStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Insert(s) => {
                let rows: Vec<String> = s
                    .rows
                    .iter()
                    .map(|row| {
                        let values: Vec<String> = row.iter().map(|v| v.to_string()).collect();
                        format!("({})", values.join(", "))
                    })
                    .collect();
                write!(
                    f,
                    "INSERT INTO {} ({}) VALUES {}",
                    s.table,
                    s.columns.join(", "),
                    rows.join(", ")
                )
            }
            Self::Update(s) => {
                let sets: Vec<String> = s
                    .assignments
                    .iter()
                    .map(|(c, v)| format!("{} = {}", c, v))
                    .collect();
                write!(f, "UPDATE {} SET {} WHERE {}", s.table, sets.join(", "), s.criteria)
            }
            Self::Delete(s) => write!(f, "DELETE FROM {} WHERE {}", s.table, s.criteria),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteOutcome {
    pub row_count: usize,
    /// One key per inserted row for tables with an auto increment column.
    pub generated_keys: Vec<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    LeftOuter,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinClause {
    pub kind: JoinKind,
    pub table: String,
    pub alias: String,
    /// Pairs of (left column, right column) compared for equality.
    pub on: Vec<(ColumnRef, ColumnRef)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectQuery {
    pub table: String,
    pub alias: String,
    pub joins: Vec<JoinClause>,
    pub columns: Vec<ColumnRef>,
    pub criteria: Option<Criteria>,
    pub order_by: Vec<ColumnRef>,
    pub distinct: bool,
}

impl SelectQuery {
    pub fn new(table: &str, alias: &str) -> Self {
        Self {
            table: table.to_string(),
            alias: alias.to_string(),
            joins: Vec::new(),
            columns: Vec::new(),
            criteria: None,
            order_by: Vec::new(),
            distinct: false,
        }
    }

    pub fn column(mut self, alias: &str, column: &str) -> Self {
        self.columns.push(ColumnRef::new(alias, column));
        self
    }

    pub fn filter(mut self, criteria: Criteria) -> Self {
        self.criteria = Some(match self.criteria.take() {
            Some(existing) => existing.and(criteria),
            None => criteria,
        });
        self
    }

    pub fn position_of(&self, column: &ColumnRef) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }
}

impl fmt::Display for SelectQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let columns: Vec<String> = self.columns.iter().map(|c| c.to_string()).collect();
        write!(
            f,
            "SELECT {}{} FROM {} {}",
            if self.distinct { "DISTINCT " } else { "" },
            columns.join(", "),
            self.table,
            self.alias
        )?;
        for join in &self.joins {
            let kind = match join.kind {
                JoinKind::Inner => "INNER JOIN",
                JoinKind::LeftOuter => "LEFT OUTER JOIN",
            };
            let on: Vec<String> = join
                .on
                .iter()
                .map(|(l, r)| format!("{} = {}", l, r))
                .collect();
            write!(f, " {} {} {} ON {}", kind, join.table, join.alias, on.join(" AND "))?;
        }
        if let Some(criteria) = &self.criteria {
            write!(f, " WHERE {}", criteria)?;
        }
        if !self.order_by.is_empty() {
            let order: Vec<String> = self.order_by.iter().map(|c| c.to_string()).collect();
            write!(f, " ORDER BY {}", order.join(", "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_rendering() {
        let mut query = SelectQuery::new("customer", "c")
            .column("c", "id")
            .column("o", "total")
            .filter(Criteria::In(ColumnRef::new("c", "id"), vec![Value::from(1), Value::from(2)]));
        query.joins.push(JoinClause {
            kind: JoinKind::LeftOuter,
            table: "orders".into(),
            alias: "o".into(),
            on: vec![(ColumnRef::new("c", "id"), ColumnRef::new("o", "customer_id"))],
        });
        assert_eq!(
            query.to_string(),
            "SELECT c.id, o.total FROM customer c LEFT OUTER JOIN orders o ON c.id = o.customer_id WHERE c.id IN (1, 2)"
        );
    }

    #[test]
    fn test_key_criteria() {
        let single = Criteria::key(&["id".to_string()], &[Value::from(3)]);
        assert_eq!(single.to_string(), "id = 3");
        let composite = Criteria::key(&["a".to_string(), "b".to_string()], &[Value::from(1), Value::from("x")]);
        assert_eq!(composite.to_string(), "(a = 1 AND b = 'x')");
    }
}
