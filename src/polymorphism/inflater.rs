use crate::core::{ClassName, MappingError, Result, Value};
use crate::model::EntityRef;
use crate::persister::SimpleInflater;
use crate::select::{RowInflater, RowView};
use crate::sql::{ColumnRef, Criteria, ValueBinder};
use std::collections::HashMap;

/// Condition a row meets when it holds an instance of one concrete subtype.
#[derive(Debug, Clone, PartialEq)]
pub enum Selector {
    /// The discriminator column holds `value`, in mapped form.
    Equals { table: String, column: String, value: Value },
    /// The key of a subtype table is joined.
    Present { table: String, column: String },
}

impl Selector {
    pub fn reads(&self, table: &str, column: &str) -> bool {
        match self {
            Self::Equals { table: t, column: c, .. } | Self::Present { table: t, column: c } => t == table && c == column,
        }
    }

    pub fn table(&self) -> &str {
        match self {
            Self::Equals { table, .. } | Self::Present { table, .. } => table,
        }
    }

    pub fn column(&self) -> &str {
        match self {
            Self::Equals { column, .. } | Self::Present { column, .. } => column,
        }
    }
}

/// A selector bound to the aliases of one select tree.
#[derive(Debug, Clone)]
pub(crate) struct BoundSelector {
    column: ColumnRef,
    expected: Option<Value>,
}

impl BoundSelector {
    /// `binder` converts the discriminator value to its stored form.
    pub fn bind(selector: &Selector, aliases: &HashMap<String, String>, binder: Option<&ValueBinder>) -> Result<Self> {
        let alias = aliases
            .get(selector.table())
            .ok_or_else(|| MappingError::TableNotFound(format!("{} is not joined", selector.table())))?;
        let expected = match (selector, binder) {
            (Selector::Equals { value, .. }, Some(binder)) => Some(binder.to_storage(value)?),
            (Selector::Equals { value, .. }, None) => Some(value.clone()),
            (Selector::Present { .. }, _) => None,
        };
        Ok(Self {
            column: ColumnRef::new(alias, selector.column()),
            expected,
        })
    }

    pub fn column(&self) -> &ColumnRef {
        &self.column
    }

    /// The condition as a filter of a select.
    pub fn criteria(&self) -> Criteria {
        match &self.expected {
            Some(expected) => Criteria::Eq(self.column.clone(), expected.clone()),
            None => Criteria::IsNotNull(self.column.clone()),
        }
    }

    fn matches(&self, row: &RowView<'_>) -> Result<bool> {
        let stored = row.get(&self.column.alias, &self.column.column)?;
        Ok(match &self.expected {
            Some(expected) => stored == *expected,
            None => !stored.is_null(),
        })
    }
}

/// Reads rows of a single-table or joined-tables hierarchy, picking the concrete class of each.
pub struct PolymorphicInflater {
    cache_key: ClassName,
    id_column: ColumnRef,
    id_binder: ValueBinder,
    subtypes: Vec<(Vec<BoundSelector>, SimpleInflater)>,
}

impl PolymorphicInflater {
    pub(crate) fn new(
        cache_key: ClassName,
        id_column: ColumnRef,
        id_binder: ValueBinder,
        subtypes: Vec<(Vec<BoundSelector>, SimpleInflater)>,
    ) -> Self {
        Self {
            cache_key,
            id_column,
            id_binder,
            subtypes,
        }
    }

    fn subtype(&self, row: &RowView<'_>) -> Result<Option<&SimpleInflater>> {
        for (selectors, inflater) in &self.subtypes {
            let mut matched = true;
            for selector in selectors {
                if !selector.matches(row)? {
                    matched = false;
                    break;
                }
            }
            if matched {
                return Ok(Some(inflater));
            }
        }
        Ok(None)
    }
}

impl RowInflater for PolymorphicInflater {
    fn cache_key(&self) -> &ClassName {
        &self.cache_key
    }

    fn identifier(&self, row: &RowView<'_>) -> Result<Option<Value>> {
        let stored = row.get(&self.id_column.alias, &self.id_column.column)?;
        if stored.is_null() {
            return Ok(None);
        }
        self.id_binder.from_storage(&stored).map(Some)
    }

    fn inflate(&self, row: &RowView<'_>, id: &Value) -> Result<EntityRef> {
        match self.subtype(row)? {
            Some(inflater) => inflater.inflate(row, id),
            None => Err(MappingError::UnknownSubtype(format!(
                "row {} of {} matches no concrete subtype",
                id, self.cache_key
            ))),
        }
    }
}
