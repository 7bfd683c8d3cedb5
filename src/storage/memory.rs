use super::pattern::eval_like;
use super::{Catalog, Table};
use crate::core::{MappingError, Result, Row, Value};
use crate::schema::{Schema, TableDefinition};
use crate::sql::{
    ColumnRef, Criteria, DeleteStatement, InsertStatement, JoinKind, SelectQuery, SqlExecutor,
    UpdateStatement, WriteOutcome, WriteStatement,
};
use log::trace;
use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKind {
    Insert,
    Update,
    Delete,
    Select,
}

/// One statement received by the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementRecord {
    pub kind: StatementKind,
    pub table: String,
    pub sql: String,
}

/// In-memory relational store executing abstract statements.
///
/// Single threaded: tables live behind `RefCell`s. Every executed statement is recorded so
/// callers can count round trips.
#[derive(Debug, Default)]
pub struct MemoryDatabase {
    catalog: RefCell<Catalog>,
    tables: RefCell<HashMap<String, Table>>,
    enforce_foreign_keys: bool,
    log: RefCell<Vec<StatementRecord>>,
}

/// Rows of the tables taking part in a select, one slot per alias.
type Tuple<'a> = Vec<Option<&'a Row>>;

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject writes breaking a foreign key of the deployed schema.
    pub fn with_foreign_keys(mut self) -> Self {
        self.enforce_foreign_keys = true;
        self
    }

    /// Creates every table of `schema` not created yet.
    pub fn deploy(&self, schema: &Schema) -> Result<()> {
        for definition in schema.creation_order() {
            if !self.catalog.borrow().table_exists(definition.name()) {
                self.create_table(definition.clone())?;
            }
        }
        Ok(())
    }

    pub fn create_table(&self, definition: TableDefinition) -> Result<()> {
        let name = definition.name().to_string();
        let catalog = self.catalog.borrow().clone().with_table(definition.clone())?;
        *self.catalog.borrow_mut() = catalog;
        self.tables.borrow_mut().insert(name.clone(), Table::new(definition));
        trace!("created table {}", name);
        Ok(())
    }

    pub fn table_exists(&self, name: &str) -> bool {
        self.catalog.borrow().table_exists(name)
    }

    pub fn list_tables(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .catalog
            .borrow()
            .list_tables()
            .into_iter()
            .map(String::from)
            .collect();
        names.sort();
        names
    }

    /// Rows of a table in insertion order, without recording a statement.
    pub fn rows(&self, table: &str) -> Result<Vec<Row>> {
        let tables = self.tables.borrow();
        let table = tables
            .get(table)
            .ok_or_else(|| MappingError::TableNotFound(table.to_string()))?;
        Ok(table.scan())
    }

    /// Values of `column` in every row of `table`, in insertion order.
    pub fn column_values(&self, table: &str, column: &str) -> Result<Vec<Value>> {
        let tables = self.tables.borrow();
        let table = tables
            .get(table)
            .ok_or_else(|| MappingError::TableNotFound(table.to_string()))?;
        let idx = table.column_index(column)?;
        Ok(table.rows().map(|row| row[idx].clone()).collect())
    }

    pub fn row_count(&self, table: &str) -> Result<usize> {
        let tables = self.tables.borrow();
        tables
            .get(table)
            .map(|t| t.row_count())
            .ok_or_else(|| MappingError::TableNotFound(table.to_string()))
    }

    pub fn statements(&self) -> Vec<StatementRecord> {
        self.log.borrow().clone()
    }

    pub fn statement_count(&self) -> usize {
        self.log.borrow().len()
    }

    pub fn count(&self, kind: StatementKind) -> usize {
        self.log.borrow().iter().filter(|r| r.kind == kind).count()
    }

    pub fn clear_log(&self) {
        self.log.borrow_mut().clear();
    }

    fn record(&self, kind: StatementKind, table: &str, sql: String) {
        trace!("{}", sql);
        self.log.borrow_mut().push(StatementRecord {
            kind,
            table: table.to_string(),
            sql,
        });
    }

    fn insert(&self, statement: &InsertStatement) -> Result<WriteOutcome> {
        let mut tables = self.tables.borrow_mut();
        let table = tables
            .get_mut(&statement.table)
            .ok_or_else(|| MappingError::TableNotFound(statement.table.clone()))?;
        let positions = statement
            .columns
            .iter()
            .map(|c| table.column_index(c))
            .collect::<Result<Vec<_>>>()?;
        let width = table.definition().columns().len();

        let mut full_rows = Vec::with_capacity(statement.rows.len());
        for values in &statement.rows {
            let mut row = vec![Value::Null; width];
            for (position, value) in positions.iter().zip(values) {
                row[*position] = value.clone();
            }
            full_rows.push(row);
        }
        drop(tables);

        let mut outcome = WriteOutcome::default();
        for row in full_rows {
            if self.enforce_foreign_keys {
                self.check_outgoing_keys(&statement.table, &row)?;
            }
            let mut tables = self.tables.borrow_mut();
            let table = tables
                .get_mut(&statement.table)
                .ok_or_else(|| MappingError::TableNotFound(statement.table.clone()))?;
            if let Some(key) = table.insert(row)? {
                outcome.generated_keys.push(key);
            }
            outcome.row_count += 1;
        }
        Ok(outcome)
    }

    fn update(&self, statement: &UpdateStatement) -> Result<WriteOutcome> {
        let (matches, assignments) = {
            let tables = self.tables.borrow();
            let table = tables
                .get(&statement.table)
                .ok_or_else(|| MappingError::TableNotFound(statement.table.clone()))?;
            let assignments = statement
                .assignments
                .iter()
                .map(|(c, v)| Ok((table.column_index(c)?, v.clone())))
                .collect::<Result<Vec<_>>>()?;
            (self.matching_rows(table, &statement.criteria)?, assignments)
        };

        let mut outcome = WriteOutcome::default();
        for (id, old_row) in matches {
            let mut new_row = old_row.clone();
            for (position, value) in &assignments {
                new_row[*position] = value.clone();
            }
            if self.enforce_foreign_keys {
                self.check_outgoing_keys(&statement.table, &new_row)?;
                self.check_incoming_keys(&statement.table, &old_row, Some(&new_row))?;
            }
            let mut tables = self.tables.borrow_mut();
            let table = tables
                .get_mut(&statement.table)
                .ok_or_else(|| MappingError::TableNotFound(statement.table.clone()))?;
            if table.update(id, new_row)? {
                outcome.row_count += 1;
            }
        }
        Ok(outcome)
    }

    fn delete(&self, statement: &DeleteStatement) -> Result<WriteOutcome> {
        let matches = {
            let tables = self.tables.borrow();
            let table = tables
                .get(&statement.table)
                .ok_or_else(|| MappingError::TableNotFound(statement.table.clone()))?;
            self.matching_rows(table, &statement.criteria)?
        };

        let mut outcome = WriteOutcome::default();
        for (id, row) in matches {
            if self.enforce_foreign_keys {
                self.check_incoming_keys(&statement.table, &row, None)?;
            }
            let mut tables = self.tables.borrow_mut();
            let table = tables
                .get_mut(&statement.table)
                .ok_or_else(|| MappingError::TableNotFound(statement.table.clone()))?;
            if table.delete(id).is_some() {
                outcome.row_count += 1;
            }
        }
        Ok(outcome)
    }

    fn matching_rows(&self, table: &Table, criteria: &Criteria) -> Result<Vec<(usize, Row)>> {
        let aliases = vec![String::new()];
        let mut matches = Vec::new();
        for (id, row) in table.scan_with_ids() {
            let tuple: Tuple<'_> = vec![Some(&row)];
            let resolver = Resolver {
                aliases: &aliases,
                tables: &[table],
                bare: true,
            };
            if resolver.eval(criteria, &tuple)? {
                matches.push((id, row.clone()));
            }
        }
        Ok(matches)
    }

    /// Foreign keys declared by `table` must point at existing rows.
    fn check_outgoing_keys(&self, table: &str, row: &Row) -> Result<()> {
        let catalog = self.catalog.borrow();
        let definition = catalog.get_table(table)?;
        let tables = self.tables.borrow();
        for fk in definition.foreign_keys() {
            let values: Vec<Value> = fk
                .columns
                .iter()
                .map(|c| {
                    definition
                        .find_column_index(c)
                        .map(|i| row[i].clone())
                        .unwrap_or(Value::Null)
                })
                .collect();
            if values.iter().any(Value::is_null) {
                continue;
            }
            let Some(target) = tables.get(&fk.target_table) else {
                continue;
            };
            let positions = fk
                .target_columns
                .iter()
                .map(|c| target.column_index(c))
                .collect::<Result<Vec<_>>>()?;
            if !target.contains(&positions, &values) {
                return Err(MappingError::ConstraintViolation(format!(
                    "{}: no row in '{}' with key {:?}",
                    fk.name, fk.target_table, values
                )));
            }
        }
        Ok(())
    }

    /// No row of another table may keep referencing a row that is deleted or rekeyed.
    fn check_incoming_keys(&self, table: &str, old_row: &Row, new_row: Option<&Row>) -> Result<()> {
        let catalog = self.catalog.borrow();
        let definition = catalog.get_table(table)?;
        let tables = self.tables.borrow();
        for (owner, fk) in catalog.referencing(table) {
            let key_of = |row: &Row| -> Vec<Value> {
                fk.target_columns
                    .iter()
                    .map(|c| {
                        definition
                            .find_column_index(c)
                            .map(|i| row[i].clone())
                            .unwrap_or(Value::Null)
                    })
                    .collect()
            };
            let old_key = key_of(old_row);
            if new_row.map(|r| key_of(r) == old_key).unwrap_or(false) {
                continue;
            }
            let Some(referencing) = tables.get(&owner) else {
                continue;
            };
            let positions = fk
                .columns
                .iter()
                .map(|c| referencing.column_index(c))
                .collect::<Result<Vec<_>>>()?;
            let still_referenced = referencing.rows().any(|row| {
                (owner != table || Some(row) != Some(old_row))
                    && positions.iter().zip(&old_key).all(|(p, v)| &row[*p] == v)
            });
            if still_referenced {
                return Err(MappingError::ConstraintViolation(format!(
                    "{}: row of '{}' with key {:?} is still referenced by '{}'",
                    fk.name, table, old_key, owner
                )));
            }
        }
        Ok(())
    }

    fn run_select(&self, query: &SelectQuery) -> Result<Vec<Row>> {
        let tables = self.tables.borrow();
        let lookup = |name: &str| {
            tables
                .get(name)
                .ok_or_else(|| MappingError::TableNotFound(name.to_string()))
        };

        let mut aliases = vec![query.alias.clone()];
        let mut sources: Vec<&Table> = vec![lookup(&query.table)?];
        for join in &query.joins {
            aliases.push(join.alias.clone());
            sources.push(lookup(&join.table)?);
        }
        let resolver = Resolver {
            aliases: &aliases,
            tables: &sources,
            bare: false,
        };

        let mut tuples: Vec<Tuple<'_>> = sources[0].rows().map(|row| vec![Some(row)]).collect();

        for (join_idx, join) in query.joins.iter().enumerate() {
            let joined = sources[join_idx + 1];
            let mut right_positions = Vec::with_capacity(join.on.len());
            for (_, right) in &join.on {
                right_positions.push(joined.column_index(&right.column)?);
            }
            let mut next = Vec::with_capacity(tuples.len());
            for tuple in tuples {
                let left_values = join
                    .on
                    .iter()
                    .map(|(left, _)| resolver.value(left, &tuple))
                    .collect::<Result<Vec<_>>>()?;
                let mut matched = false;
                if !left_values.iter().any(Value::is_null) {
                    for candidate in joined.rows() {
                        let equal = right_positions
                            .iter()
                            .zip(&left_values)
                            .all(|(p, v)| &candidate[*p] == v);
                        if equal {
                            let mut extended = tuple.clone();
                            extended.push(Some(candidate));
                            next.push(extended);
                            matched = true;
                        }
                    }
                }
                if !matched && join.kind == JoinKind::LeftOuter {
                    let mut extended = tuple;
                    extended.push(None);
                    next.push(extended);
                }
            }
            tuples = next;
        }

        if let Some(criteria) = &query.criteria {
            let mut kept = Vec::with_capacity(tuples.len());
            for tuple in tuples {
                if resolver.eval(criteria, &tuple)? {
                    kept.push(tuple);
                }
            }
            tuples = kept;
        }

        if !query.order_by.is_empty() {
            let mut keyed = Vec::with_capacity(tuples.len());
            for tuple in tuples {
                let key = query
                    .order_by
                    .iter()
                    .map(|c| resolver.value(c, &tuple))
                    .collect::<Result<Vec<_>>>()?;
                keyed.push((key, tuple));
            }
            keyed.sort_by(|(a, _), (b, _)| a.cmp(b));
            tuples = keyed.into_iter().map(|(_, t)| t).collect();
        }

        let mut rows: Vec<Row> = Vec::with_capacity(tuples.len());
        for tuple in &tuples {
            let row = query
                .columns
                .iter()
                .map(|c| resolver.value(c, tuple))
                .collect::<Result<Row>>()?;
            if query.distinct && rows.contains(&row) {
                continue;
            }
            rows.push(row);
        }
        Ok(rows)
    }
}

/// Resolves column references of one query against its joined tuples.
struct Resolver<'q> {
    aliases: &'q [String],
    tables: &'q [&'q Table],
    /// Write statements address their single table without alias.
    bare: bool,
}

impl Resolver<'_> {
    fn value(&self, column: &ColumnRef, tuple: &Tuple<'_>) -> Result<Value> {
        let slot = if self.bare {
            0
        } else {
            self.aliases
                .iter()
                .position(|a| a == &column.alias)
                .ok_or_else(|| MappingError::ExecutionError(format!("Unknown alias '{}'", column.alias)))?
        };
        let position = self.tables[slot].column_index(&column.column)?;
        Ok(tuple
            .get(slot)
            .copied()
            .flatten()
            .map(|row| row[position].clone())
            .unwrap_or(Value::Null))
    }

    fn compare(&self, column: &ColumnRef, value: &Value, tuple: &Tuple<'_>) -> Result<Option<Ordering>> {
        let actual = self.value(column, tuple)?;
        if actual.is_null() || value.is_null() {
            return Ok(None);
        }
        actual.compare(value).map(Some)
    }

    fn eval(&self, criteria: &Criteria, tuple: &Tuple<'_>) -> Result<bool> {
        Ok(match criteria {
            Criteria::Eq(c, v) => self.compare(c, v, tuple)? == Some(Ordering::Equal),
            Criteria::NotEq(c, v) => matches!(
                self.compare(c, v, tuple)?,
                Some(Ordering::Less | Ordering::Greater)
            ),
            Criteria::In(c, values) => {
                let actual = self.value(c, tuple)?;
                !actual.is_null() && values.contains(&actual)
            }
            Criteria::IsNull(c) => self.value(c, tuple)?.is_null(),
            Criteria::IsNotNull(c) => !self.value(c, tuple)?.is_null(),
            Criteria::Lt(c, v) => self.compare(c, v, tuple)? == Some(Ordering::Less),
            Criteria::Le(c, v) => matches!(
                self.compare(c, v, tuple)?,
                Some(Ordering::Less | Ordering::Equal)
            ),
            Criteria::Gt(c, v) => self.compare(c, v, tuple)? == Some(Ordering::Greater),
            Criteria::Ge(c, v) => matches!(
                self.compare(c, v, tuple)?,
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Criteria::Like(c, pattern) => match self.value(c, tuple)? {
                Value::Text(text) => eval_like(&text, pattern)?,
                _ => false,
            },
            Criteria::And(terms) => {
                for term in terms {
                    if !self.eval(term, tuple)? {
                        return Ok(false);
                    }
                }
                true
            }
            Criteria::Or(terms) => {
                for term in terms {
                    if self.eval(term, tuple)? {
                        return Ok(true);
                    }
                }
                false
            }
            Criteria::Not(inner) => !self.eval(inner, tuple)?,
        })
    }
}

impl SqlExecutor for MemoryDatabase {
    fn execute(&self, statement: &WriteStatement) -> Result<WriteOutcome> {
        let kind = match statement {
            WriteStatement::Insert(_) => StatementKind::Insert,
            WriteStatement::Update(_) => StatementKind::Update,
            WriteStatement::Delete(_) => StatementKind::Delete,
        };
        self.record(kind, statement.table(), statement.to_string());
        match statement {
            WriteStatement::Insert(s) => self.insert(s),
            WriteStatement::Update(s) => self.update(s),
            WriteStatement::Delete(s) => self.delete(s),
        }
    }

    fn select(&self, query: &SelectQuery) -> Result<Vec<Row>> {
        self.record(StatementKind::Select, &query.table, query.to_string());
        self.run_select(query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DataType;
    use crate::schema::{ColumnDefinition, ForeignKeyDefinition};
    use crate::sql::JoinClause;

    fn schema() -> Schema {
        let mut schema = Schema::new();
        let customer = schema.table_or_create("customer");
        customer
            .add_column(
                ColumnDefinition::new("id", DataType::Integer, DataType::Integer)
                    .primary_key()
                    .auto_increment(),
            )
            .unwrap();
        customer
            .add_column(ColumnDefinition::new("name", DataType::Text, DataType::Text))
            .unwrap();
        let order = schema.table_or_create("orders");
        order
            .add_column(ColumnDefinition::new("id", DataType::Integer, DataType::Integer).primary_key())
            .unwrap();
        order
            .add_column(ColumnDefinition::new("customer_id", DataType::Integer, DataType::Integer))
            .unwrap();
        order.add_foreign_key(ForeignKeyDefinition {
            name: "FK_orders_customer_id_customer_id".into(),
            columns: vec!["customer_id".into()],
            target_table: "customer".into(),
            target_columns: vec!["id".into()],
        });
        schema
    }

    fn insert(table: &str, columns: &[&str], rows: Vec<Row>) -> WriteStatement {
        WriteStatement::Insert(InsertStatement {
            table: table.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows,
        })
    }

    #[test]
    fn test_insert_returns_generated_keys() {
        let db = MemoryDatabase::new();
        db.deploy(&schema()).unwrap();
        let outcome = db
            .execute(&insert(
                "customer",
                &["name"],
                vec![vec![Value::from("a")], vec![Value::from("b")]],
            ))
            .unwrap();
        assert_eq!(outcome.row_count, 2);
        assert_eq!(outcome.generated_keys, vec![Value::Integer(1), Value::Integer(2)]);
        assert_eq!(db.count(StatementKind::Insert), 1);
    }

    #[test]
    fn test_left_outer_join_and_criteria() {
        let db = MemoryDatabase::new();
        db.deploy(&schema()).unwrap();
        db.execute(&insert("customer", &["name"], vec![vec![Value::from("a")], vec![Value::from("b")]]))
            .unwrap();
        db.execute(&insert("orders", &["id", "customer_id"], vec![vec![Value::from(10), Value::from(1)]]))
            .unwrap();

        let mut query = SelectQuery::new("customer", "c").column("c", "name").column("o", "id");
        query.joins.push(JoinClause {
            kind: JoinKind::LeftOuter,
            table: "orders".into(),
            alias: "o".into(),
            on: vec![(ColumnRef::new("c", "id"), ColumnRef::new("o", "customer_id"))],
        });
        let rows = db.select(&query).unwrap();
        assert_eq!(
            rows,
            vec![
                vec![Value::from("a"), Value::from(10)],
                vec![Value::from("b"), Value::Null]
            ]
        );

        let filtered = db
            .select(&query.filter(Criteria::Like(ColumnRef::new("c", "name"), "b%".into())))
            .unwrap();
        assert_eq!(filtered.len(), 1);
    }

    #[test]
    fn test_foreign_keys_are_enforced_when_enabled() {
        let db = MemoryDatabase::new().with_foreign_keys();
        db.deploy(&schema()).unwrap();
        let orphan = insert("orders", &["id", "customer_id"], vec![vec![Value::from(1), Value::from(99)]]);
        assert!(matches!(db.execute(&orphan), Err(MappingError::ConstraintViolation(_))));

        db.execute(&insert("customer", &["name"], vec![vec![Value::from("a")]]))
            .unwrap();
        db.execute(&insert("orders", &["id", "customer_id"], vec![vec![Value::from(1), Value::from(1)]]))
            .unwrap();
        let delete_customer = WriteStatement::Delete(DeleteStatement {
            table: "customer".into(),
            criteria: Criteria::Eq(ColumnRef::bare("id"), Value::from(1)),
        });
        assert!(db.execute(&delete_customer).is_err());
        assert_eq!(db.row_count("customer").unwrap(), 1);
    }

    #[test]
    fn test_update_by_criteria() {
        let db = MemoryDatabase::new();
        db.deploy(&schema()).unwrap();
        db.execute(&insert("customer", &["name"], vec![vec![Value::from("a")]]))
            .unwrap();
        let outcome = db
            .execute(&WriteStatement::Update(UpdateStatement {
                table: "customer".into(),
                assignments: vec![("name".into(), Value::from("z"))],
                criteria: Criteria::Eq(ColumnRef::bare("id"), Value::from(1)),
            }))
            .unwrap();
        assert_eq!(outcome.row_count, 1);
        assert_eq!(db.column_values("customer", "name").unwrap(), vec![Value::from("z")]);
    }
}
