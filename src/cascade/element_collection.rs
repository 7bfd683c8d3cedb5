//! Collections of plain values, one row per element in a table owned by the source.
//!
//! Elements have no identity: an update deletes the rows of removed elements and inserts the
//! rows of added ones, it never updates a row.

use super::association::{AssociationRecord, AssociationTable, records_of};
use super::{RelationSite, SourceInfo};
use crate::builder::BuildSession;
use crate::config::{CollectionKind, ElementCollectionRelation};
use crate::core::{ClassName, Result};
use crate::model::{EntityRef, PropertyAccessor};
use crate::persister::{GraftedEntity, JoinContribution, OperationContext, Priority, Stage};
use crate::select::{InflationState, JoinTree, NodeRole, RowCapture, RowView};
use crate::sql::{ColumnRef, JoinKind, ValueBinder};
use std::rc::Rc;

pub(crate) fn configure(session: &mut BuildSession<'_>, site: &RelationSite, relation: &ElementCollectionRelation) -> Result<()> {
    let source = SourceInfo::of(site.persister.as_ref());
    let accessor = site.accessor(&relation.property);
    let naming = site.naming.as_ref();
    let table = relation
        .table_name
        .clone()
        .unwrap_or_else(|| naming.element_table_name(&source.main_table, &accessor));
    let owner_column = relation
        .reverse_column
        .clone()
        .unwrap_or_else(|| naming.reverse_column_name(&source.main_table, &source.primary_key));
    let element_column = relation
        .element_column
        .clone()
        .unwrap_or_else(|| naming.element_column_name(&accessor));
    let index_column = (relation.kind == CollectionKind::List).then(|| {
        relation
            .index_column
            .clone()
            .unwrap_or_else(|| naming.index_column_name(&accessor))
    });
    let elements = Rc::new(AssociationTable::create(
        session,
        naming,
        source.claim(&accessor),
        &table,
        (
            &owner_column,
            &source.id.data_type,
            Some((&source.main_table, &source.primary_key)),
        ),
        (&element_column, &relation.element_type, None),
        index_column.as_deref(),
    )?);

    let kind = relation.kind;
    let listeners = site.persister.listeners();
    let (values, info, rows) = (accessor.clone(), source.clone(), Rc::clone(&elements));
    listeners.on_entities(
        Stage::AfterInsert,
        &source.listener_name(&accessor, "insert elements"),
        Priority::Cascade,
        move |entities, _| {
            let records: Vec<AssociationRecord> = entities
                .iter()
                .flat_map(|e| element_records(&values, &info, e, kind))
                .collect();
            rows.insert(&records)
        },
    );

    let (values, info, rows) = (accessor.clone(), source.clone(), Rc::clone(&elements));
    listeners.on_update(
        Stage::AfterUpdate,
        &source.listener_name(&accessor, "update elements"),
        Priority::Cascade,
        move |pairs, _, _| {
            let mut before = Vec::new();
            let mut after = Vec::new();
            for pair in pairs {
                before.extend(element_records(&values, &info, &pair.unmodified, kind));
                after.extend(element_records(&values, &info, &pair.modified, kind));
            }
            rows.apply(&before, &after)
        },
    );

    let (info, rows) = (source.clone(), Rc::clone(&elements));
    listeners.on_entities(
        Stage::BeforeDelete,
        &source.listener_name(&accessor, "delete elements"),
        Priority::Cascade,
        move |entities, _| {
            let owners: Vec<_> = entities.iter().map(|e| info.id.read(e)).collect();
            rows.delete_by_owners(&owners)
        },
    );

    site.persister.add_join(Rc::new(ElementJoin {
        elements,
        source_key: source.primary_key,
        accessor,
    }));
    Ok(())
}

fn element_records(
    accessor: &PropertyAccessor,
    source: &SourceInfo,
    entity: &EntityRef,
    kind: CollectionKind,
) -> Vec<AssociationRecord> {
    let values = accessor.get_elements(entity).unwrap_or_default();
    records_of(&source.id.read(entity), values, kind)
}

struct ElementJoin {
    elements: Rc<AssociationTable>,
    source_key: String,
    accessor: PropertyAccessor,
}

impl JoinContribution for ElementJoin {
    fn contribute(&self, tree: &mut JoinTree, source: &GraftedEntity, guard: Option<Vec<ClassName>>) -> Result<()> {
        let node = tree.add_join(
            source.node,
            &self.elements.table,
            JoinKind::LeftOuter,
            vec![(
                ColumnRef::new(&source.main_alias, &self.source_key),
                self.elements.owner.column.clone(),
            )],
            NodeRole::Link,
            guard,
        );
        let alias = tree.alias(node).to_string();
        let capture = ElementCapture {
            accessor: self.accessor.clone(),
            owner: tree.select_column(&alias, &self.elements.owner.column),
            element: tree.select_column(&alias, &self.elements.member.column),
            binder: self.elements.member.binder.clone(),
            index: self
                .elements
                .index
                .as_ref()
                .map(|column| tree.select_column(&alias, &column.column)),
        };
        tree.set_role(node, NodeRole::Capture(Rc::new(capture)));
        Ok(())
    }
}

/// Collects the elements of the source from the rows of its element table.
struct ElementCapture {
    accessor: PropertyAccessor,
    owner: ColumnRef,
    element: ColumnRef,
    binder: ValueBinder,
    index: Option<ColumnRef>,
}

impl RowCapture for ElementCapture {
    fn on_source(&self, source: &EntityRef, state: &mut InflationState) {
        state.init_elements(source, &self.accessor);
    }

    fn capture(
        &self,
        source: &EntityRef,
        row: &RowView<'_>,
        state: &mut InflationState,
        _ctx: &mut OperationContext,
    ) -> Result<()> {
        // no element row joined
        if row.get(&self.owner.alias, &self.owner.column)?.is_null() {
            return Ok(());
        }
        let stored = row.get(&self.element.alias, &self.element.column)?;
        let index = match &self.index {
            Some(column) => row.index(&column.alias, &column.column)?,
            None => None,
        };
        state.add_element(source, &self.accessor, self.binder.from_storage(&stored)?, index);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{DataType, Value};
    use crate::model::Instance;
    use std::collections::HashMap;

    fn capture(index: bool) -> ElementCapture {
        ElementCapture {
            accessor: PropertyAccessor::new("Person", "nicknames"),
            owner: ColumnRef::new("t2", "person_id"),
            element: ColumnRef::new("t2", "element"),
            binder: ValueBinder::passthrough(DataType::Text),
            index: index.then(|| ColumnRef::new("t2", "idx")),
        }
    }

    fn positions() -> HashMap<ColumnRef, usize> {
        [
            (ColumnRef::new("t2", "person_id"), 0),
            (ColumnRef::new("t2", "element"), 1),
            (ColumnRef::new("t2", "idx"), 2),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_source_without_rows_gets_an_empty_collection() {
        let capture = capture(false);
        let person = Instance::new("Person").into_ref();
        let positions = positions();
        let mut state = InflationState::new();
        let mut ctx = OperationContext::new();
        capture.on_source(&person, &mut state);
        let row = vec![Value::Null, Value::Null, Value::Null];
        capture
            .capture(&person, &RowView::new(&row, &positions), &mut state, &mut ctx)
            .unwrap();
        state.finish();
        assert_eq!(person.elements("nicknames"), Vec::<Value>::new());
    }

    #[test]
    fn test_list_elements_follow_their_index() {
        let capture = capture(true);
        let person = Instance::new("Person").into_ref();
        let positions = positions();
        let mut state = InflationState::new();
        let mut ctx = OperationContext::new();
        capture.on_source(&person, &mut state);
        for (element, index) in [("bob", 1), ("rob", 0), ("bob", 2)] {
            let row = vec![Value::from(1), Value::from(element), Value::from(index)];
            capture
                .capture(&person, &RowView::new(&row, &positions), &mut state, &mut ctx)
                .unwrap();
        }
        state.finish();
        assert_eq!(
            person.elements("nicknames"),
            vec![Value::from("rob"), Value::from("bob"), Value::from("bob")]
        );
    }
}
