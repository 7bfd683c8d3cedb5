use crate::core::{MappingError, Result, Row, Value};
use crate::schema::TableDefinition;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone)]
pub struct Table {
    definition: TableDefinition,
    rows: BTreeMap<usize, Row>,
    next_row_id: usize,
    primary_key: Vec<usize>,
    primary_index: HashMap<Vec<Value>, usize>,
    next_key: i64,
}

impl Table {
    pub fn new(definition: TableDefinition) -> Self {
        let primary_key = definition
            .columns()
            .iter()
            .enumerate()
            .filter(|(_, c)| c.primary_key)
            .map(|(i, _)| i)
            .collect();
        Self {
            definition,
            rows: BTreeMap::new(),
            next_row_id: 0,
            primary_key,
            primary_index: HashMap::new(),
            next_key: 1,
        }
    }

    pub fn definition(&self) -> &TableDefinition {
        &self.definition
    }

    pub fn name(&self) -> &str {
        self.definition.name()
    }

    pub fn column_index(&self, name: &str) -> Result<usize> {
        self.definition
            .find_column_index(name)
            .ok_or_else(|| MappingError::ColumnNotFound(name.to_string(), self.name().to_string()))
    }

    /// Inserts a full row, filling the auto increment column when it is `Null`.
    ///
    /// Returns the generated key, if any.
    pub fn insert(&mut self, mut row: Row) -> Result<Option<Value>> {
        let mut generated = None;
        if let Some(idx) = self.definition.auto_increment_column() {
            match &row[idx] {
                Value::Null => {
                    let key = Value::Integer(self.next_key);
                    self.next_key += 1;
                    row[idx] = key.clone();
                    generated = Some(key);
                }
                Value::Integer(explicit) => {
                    self.next_key = self.next_key.max(explicit + 1);
                }
                _ => {}
            }
        }

        self.validate_row(&row)?;
        let key = self.key_of(&row);
        if let Some(key) = &key {
            if self.primary_index.contains_key(key) {
                return Err(MappingError::ConstraintViolation(format!(
                    "Duplicate primary key {:?} in table '{}'",
                    key,
                    self.name()
                )));
            }
        }

        let id = self.next_row_id;
        self.next_row_id += 1;
        if let Some(key) = key {
            self.primary_index.insert(key, id);
        }
        self.rows.insert(id, row);
        Ok(generated)
    }

    pub fn update(&mut self, id: usize, new_row: Row) -> Result<bool> {
        self.validate_row(&new_row)?;
        let Some(old_row) = self.rows.get(&id) else {
            return Ok(false);
        };
        let old_key = self.key_of(old_row);
        let new_key = self.key_of(&new_row);
        if old_key != new_key {
            if let Some(key) = &new_key {
                if self.primary_index.contains_key(key) {
                    return Err(MappingError::ConstraintViolation(format!(
                        "Duplicate primary key {:?} in table '{}'",
                        key,
                        self.name()
                    )));
                }
            }
            if let Some(key) = old_key {
                self.primary_index.remove(&key);
            }
            if let Some(key) = new_key {
                self.primary_index.insert(key, id);
            }
        }
        self.rows.insert(id, new_row);
        Ok(true)
    }

    pub fn delete(&mut self, id: usize) -> Option<Row> {
        let row = self.rows.remove(&id)?;
        if let Some(key) = self.key_of(&row) {
            self.primary_index.remove(&key);
        }
        Some(row)
    }

    pub fn scan(&self) -> Vec<Row> {
        self.rows.values().cloned().collect()
    }

    pub fn scan_with_ids(&self) -> Vec<(usize, Row)> {
        self.rows.iter().map(|(id, row)| (*id, row.clone())).collect()
    }

    pub fn rows(&self) -> impl Iterator<Item = &Row> {
        self.rows.values()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Whether a row holds `values` in `columns`.
    pub fn contains(&self, columns: &[usize], values: &[Value]) -> bool {
        if columns == self.primary_key.as_slice() {
            return self.primary_index.contains_key(values);
        }
        self.rows
            .values()
            .any(|row| columns.iter().zip(values).all(|(c, v)| &row[*c] == v))
    }

    fn key_of(&self, row: &Row) -> Option<Vec<Value>> {
        if self.primary_key.is_empty() {
            return None;
        }
        Some(self.primary_key.iter().map(|i| row[*i].clone()).collect())
    }

    fn validate_row(&self, row: &Row) -> Result<()> {
        let columns = self.definition.columns();
        if row.len() != columns.len() {
            return Err(MappingError::ExecutionError(format!(
                "Expected {} columns, got {}",
                columns.len(),
                row.len()
            )));
        }
        for (column, value) in columns.iter().zip(row.iter()) {
            column.validate(value)?;
        }
        Ok(())
    }
}
