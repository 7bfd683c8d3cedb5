use crate::core::{ClassName, MappingError, Result, Row, Value};
use crate::model::{EntityRef, InstanceKey, PropertyAccessor};
use crate::persister::OperationContext;
use crate::sql::ColumnRef;
use std::collections::HashMap;

/// One result row, addressed by (alias, column).
pub struct RowView<'r> {
    row: &'r Row,
    positions: &'r HashMap<ColumnRef, usize>,
}

impl<'r> RowView<'r> {
    pub fn new(row: &'r Row, positions: &'r HashMap<ColumnRef, usize>) -> Self {
        Self { row, positions }
    }

    pub fn get(&self, alias: &str, column: &str) -> Result<Value> {
        self.positions
            .get(&ColumnRef::new(alias, column))
            .and_then(|position| self.row.get(*position))
            .cloned()
            .ok_or_else(|| MappingError::ColumnNotFound(column.to_string(), alias.to_string()))
    }

    /// Integer value of a position column, `None` when null.
    pub fn index(&self, alias: &str, column: &str) -> Result<Option<i64>> {
        let value = self.get(alias, column)?;
        if value.is_null() {
            return Ok(None);
        }
        value.as_i64().map(Some).ok_or_else(|| {
            MappingError::TypeMismatch(format!("index column {}.{} holds {}", alias, column, value))
        })
    }
}

/// Builds entities of one class from rows.
pub trait RowInflater {
    /// Identity map key, the root class of a polymorphic hierarchy.
    fn cache_key(&self) -> &ClassName;

    /// `None` when the row holds no entity for this node, e.g. an outer join miss.
    fn identifier(&self, row: &RowView<'_>) -> Result<Option<Value>>;

    fn inflate(&self, row: &RowView<'_>, id: &Value) -> Result<EntityRef>;
}

/// Links an entity read by a relation node to the entity of its parent node.
pub trait RelationFixer {
    /// Called on every row holding `source`, even when no target is joined.
    fn on_source(&self, _source: &EntityRef, _state: &mut InflationState) {}

    fn fix(&self, source: &EntityRef, target: &EntityRef, row: &RowView<'_>, state: &mut InflationState) -> Result<()>;
}

/// Reads values of a row on behalf of the entity of its parent node.
pub trait RowCapture {
    fn on_source(&self, _source: &EntityRef, _state: &mut InflationState) {}

    fn capture(
        &self,
        source: &EntityRef,
        row: &RowView<'_>,
        state: &mut InflationState,
        ctx: &mut OperationContext,
    ) -> Result<()>;
}

struct MemberBucket {
    source: EntityRef,
    accessor: PropertyAccessor,
    members: Vec<(Option<i64>, EntityRef)>,
}

struct ElementBucket {
    source: EntityRef,
    accessor: PropertyAccessor,
    elements: Vec<(Option<i64>, Value)>,
}

/// Collections filled while rows are read, assigned once every row is consumed.
///
/// Join fan-out repeats a member on several rows: members are kept once per position.
#[derive(Default)]
pub struct InflationState {
    members: Vec<MemberBucket>,
    member_index: HashMap<(InstanceKey, String), usize>,
    elements: Vec<ElementBucket>,
    element_index: HashMap<(InstanceKey, String), usize>,
}

impl InflationState {
    pub fn new() -> Self {
        Self::default()
    }

    fn member_bucket(&mut self, source: &EntityRef, accessor: &PropertyAccessor) -> &mut MemberBucket {
        let key = (source.key(), accessor.definition());
        let position = match self.member_index.get(&key) {
            Some(position) => *position,
            None => {
                self.members.push(MemberBucket {
                    source: source.clone(),
                    accessor: accessor.clone(),
                    members: Vec::new(),
                });
                self.member_index.insert(key, self.members.len() - 1);
                self.members.len() - 1
            }
        };
        &mut self.members[position]
    }

    fn element_bucket(&mut self, source: &EntityRef, accessor: &PropertyAccessor) -> &mut ElementBucket {
        let key = (source.key(), accessor.definition());
        let position = match self.element_index.get(&key) {
            Some(position) => *position,
            None => {
                self.elements.push(ElementBucket {
                    source: source.clone(),
                    accessor: accessor.clone(),
                    elements: Vec::new(),
                });
                self.element_index.insert(key, self.elements.len() - 1);
                self.elements.len() - 1
            }
        };
        &mut self.elements[position]
    }

    /// The collection of `source` is assigned, empty when no member is added.
    pub fn init_members(&mut self, source: &EntityRef, accessor: &PropertyAccessor) {
        self.member_bucket(source, accessor);
    }

    pub fn add_member(&mut self, source: &EntityRef, accessor: &PropertyAccessor, member: &EntityRef, index: Option<i64>) {
        let bucket = self.member_bucket(source, accessor);
        let duplicate = bucket
            .members
            .iter()
            .any(|(i, m)| m.ptr_eq(member) && (index.is_none() || *i == index));
        if !duplicate {
            bucket.members.push((index, member.clone()));
        }
    }

    pub fn init_elements(&mut self, source: &EntityRef, accessor: &PropertyAccessor) {
        self.element_bucket(source, accessor);
    }

    /// Set elements are kept once per value, list elements once per position.
    pub fn add_element(&mut self, source: &EntityRef, accessor: &PropertyAccessor, value: Value, index: Option<i64>) {
        let bucket = self.element_bucket(source, accessor);
        let duplicate = match index {
            Some(_) => bucket.elements.iter().any(|(i, _)| *i == index),
            None => bucket.elements.iter().any(|(_, v)| *v == value),
        };
        if !duplicate {
            bucket.elements.push((index, value));
        }
    }

    /// Assigns collected collections, ordered by position when one was read.
    pub fn finish(self) {
        for mut bucket in self.members {
            bucket.members.sort_by_key(|(index, _)| *index);
            let members = bucket.members.into_iter().map(|(_, m)| m).collect();
            bucket.accessor.set_collection(&bucket.source, members);
        }
        for mut bucket in self.elements {
            bucket.elements.sort_by_key(|(index, _)| *index);
            let values = bucket.elements.into_iter().map(|(_, v)| v).collect();
            bucket.accessor.set_elements(&bucket.source, values);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Instance;

    #[test]
    fn test_members_sorted_by_position_and_deduplicated() {
        let question = Instance::new("Question").into_ref();
        let accessor = PropertyAccessor::new("Question", "choices");
        let first = Instance::new("Choice").with("label", "a").into_ref();
        let second = Instance::new("Choice").with("label", "b").into_ref();

        let mut state = InflationState::new();
        state.add_member(&question, &accessor, &second, Some(1));
        state.add_member(&question, &accessor, &first, Some(0));
        state.add_member(&question, &accessor, &second, Some(1));
        state.finish();

        let choices = accessor.get_collection(&question).unwrap();
        assert_eq!(choices.len(), 2);
        assert!(choices[0].ptr_eq(&first));
    }

    #[test]
    fn test_initialized_collection_is_empty() {
        let person = Instance::new("Person").into_ref();
        let nicknames = PropertyAccessor::new("Person", "nicknames");
        let mut state = InflationState::new();
        state.init_elements(&person, &nicknames);
        state.finish();
        assert_eq!(nicknames.get_elements(&person), Some(Vec::new()));
    }

    #[test]
    fn test_row_view_reports_unselected_columns() {
        let row: Row = vec![Value::from(1), Value::Null];
        let positions: HashMap<ColumnRef, usize> = [
            (ColumnRef::new("t0", "id"), 0),
            (ColumnRef::new("t1", "idx"), 1),
        ]
        .into_iter()
        .collect();
        let view = RowView::new(&row, &positions);
        assert_eq!(view.get("t0", "id").unwrap(), Value::from(1));
        assert_eq!(view.index("t1", "idx").unwrap(), None);
        assert!(view.get("t0", "name").is_err());
    }
}
