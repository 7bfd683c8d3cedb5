use super::inflater::{InflationState, RelationFixer, RowCapture, RowInflater, RowView};
use crate::core::{ClassName, MappingError, Result, Row};
use crate::model::EntityRef;
use crate::persister::OperationContext;
use crate::sql::{ColumnRef, Criteria, JoinClause, JoinKind, SelectQuery};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

pub type NodeId = usize;

#[derive(Clone)]
pub enum NodeRole {
    /// Rows of the node build entities, linked to the parent entity by the fixer.
    Entity {
        inflater: Rc<dyn RowInflater>,
        fixer: Option<Rc<dyn RelationFixer>>,
    },
    /// Additional table of an entity, read by the inflater of its entity node.
    Segment,
    /// Association table between two entity nodes.
    Link,
    Capture(Rc<dyn RowCapture>),
}

#[derive(Clone)]
pub struct JoinNode {
    /// `None` for nodes reading columns of an already joined table.
    pub table: Option<String>,
    pub alias: String,
    pub parent: Option<NodeId>,
    pub kind: JoinKind,
    /// (column of an earlier node, column of this node)
    pub on: Vec<(ColumnRef, String)>,
    pub role: NodeRole,
    /// Classes of the parent entity the node applies to, all when `None`.
    pub guard: Option<Vec<ClassName>>,
}

/// Tables, columns and inflation roles of one select statement.
#[derive(Clone, Default)]
pub struct JoinTree {
    nodes: Vec<JoinNode>,
    columns: Vec<ColumnRef>,
}

impl JoinTree {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_alias(&self) -> String {
        format!("t{}", self.nodes.len())
    }

    pub fn add_root(&mut self, table: &str, role: NodeRole) -> NodeId {
        let alias = self.next_alias();
        self.nodes.push(JoinNode {
            table: Some(table.to_string()),
            alias,
            parent: None,
            kind: JoinKind::Inner,
            on: Vec::new(),
            role,
            guard: None,
        });
        self.nodes.len() - 1
    }

    pub fn add_join(
        &mut self,
        parent: NodeId,
        table: &str,
        kind: JoinKind,
        on: Vec<(ColumnRef, String)>,
        role: NodeRole,
        guard: Option<Vec<ClassName>>,
    ) -> NodeId {
        let alias = self.next_alias();
        self.nodes.push(JoinNode {
            table: Some(table.to_string()),
            alias,
            parent: Some(parent),
            kind,
            on,
            role,
            guard,
        });
        self.nodes.len() - 1
    }

    /// A node joining nothing, reading columns of earlier nodes.
    pub fn add_virtual(&mut self, parent: NodeId, role: NodeRole, guard: Option<Vec<ClassName>>) -> NodeId {
        let alias = self.nodes[parent].alias.clone();
        self.nodes.push(JoinNode {
            table: None,
            alias,
            parent: Some(parent),
            kind: JoinKind::LeftOuter,
            on: Vec::new(),
            role,
            guard,
        });
        self.nodes.len() - 1
    }

    /// Nodes are added before the inflater reading them can be built.
    pub fn set_role(&mut self, node: NodeId, role: NodeRole) {
        self.nodes[node].role = role;
    }

    /// Replaces the fixer of an entity node, once columns it reads are selected.
    pub fn set_fixer(&mut self, node: NodeId, fixer: Rc<dyn RelationFixer>) {
        if let NodeRole::Entity { fixer: current, .. } = &mut self.nodes[node].role {
            *current = Some(fixer);
        }
    }

    pub fn alias(&self, node: NodeId) -> &str {
        &self.nodes[node].alias
    }

    pub fn root_alias(&self) -> Option<&str> {
        self.nodes.first().map(|n| n.alias.as_str())
    }

    pub fn nodes(&self) -> &[JoinNode] {
        &self.nodes
    }

    pub fn select_column(&mut self, alias: &str, column: &str) -> ColumnRef {
        let column = ColumnRef::new(alias, column);
        if !self.columns.contains(&column) {
            self.columns.push(column.clone());
        }
        column
    }

    /// Joins below an outer join are outer as well, or they would drop the rows it keeps.
    pub fn to_query(&self, criteria: Option<Criteria>) -> Result<SelectQuery> {
        let root = self
            .nodes
            .first()
            .ok_or_else(|| MappingError::ExecutionError("empty join tree".into()))?;
        let table = root
            .table
            .as_deref()
            .ok_or_else(|| MappingError::ExecutionError("join tree root reads no table".into()))?;
        let mut query = SelectQuery::new(table, &root.alias);

        let mut outer = vec![false; self.nodes.len()];
        for (id, node) in self.nodes.iter().enumerate().skip(1) {
            let inherited = node.parent.map(|p| outer[p]).unwrap_or(false);
            let Some(table) = &node.table else {
                outer[id] = inherited;
                continue;
            };
            let kind = if inherited { JoinKind::LeftOuter } else { node.kind };
            outer[id] = kind == JoinKind::LeftOuter;
            query.joins.push(JoinClause {
                kind,
                table: table.clone(),
                alias: node.alias.clone(),
                on: node
                    .on
                    .iter()
                    .map(|(left, right)| (left.clone(), ColumnRef::new(&node.alias, right)))
                    .collect(),
            });
        }
        query.columns = self.columns.clone();
        if let Some(criteria) = criteria {
            query = query.filter(criteria);
        }
        Ok(query)
    }

    /// Entity of the nearest entity node above `node` on the current row.
    fn owner(&self, node: NodeId, entities: &[Option<EntityRef>]) -> Option<EntityRef> {
        let mut current = self.nodes[node].parent;
        while let Some(id) = current {
            if matches!(self.nodes[id].role, NodeRole::Entity { .. }) {
                return entities[id].clone();
            }
            current = self.nodes[id].parent;
        }
        None
    }

    fn admits(node: &JoinNode, owner: &EntityRef) -> bool {
        match &node.guard {
            Some(classes) => {
                let class = owner.class();
                classes.contains(&class)
            }
            None => true,
        }
    }

    /// Builds the graph of `rows`, returning root entities in row order.
    ///
    /// Entities already in the identity map of `ctx` are reused, so a graph read in several
    /// statements closes on itself.
    pub fn inflate(&self, query: &SelectQuery, rows: &[Row], ctx: &mut OperationContext) -> Result<Vec<EntityRef>> {
        let positions: HashMap<ColumnRef, usize> = query
            .columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.clone(), i))
            .collect();
        let mut state = InflationState::new();
        let mut roots = Vec::new();
        let mut seen = HashSet::new();

        for row in rows {
            let view = RowView::new(row, &positions);
            let mut entities: Vec<Option<EntityRef>> = vec![None; self.nodes.len()];
            for (id, node) in self.nodes.iter().enumerate() {
                let owner = self.owner(id, &entities);
                match &node.role {
                    NodeRole::Segment | NodeRole::Link => {}
                    NodeRole::Entity { inflater, fixer } => {
                        if node.parent.is_some() {
                            match &owner {
                                Some(source) if Self::admits(node, source) => {
                                    if let Some(fixer) = fixer {
                                        fixer.on_source(source, &mut state);
                                    }
                                }
                                _ => continue,
                            }
                        }
                        let Some(identifier) = inflater.identifier(&view)? else {
                            continue;
                        };
                        let entity = match ctx.cached(inflater.cache_key(), &identifier) {
                            Some(entity) => entity,
                            None => {
                                let entity = inflater.inflate(&view, &identifier)?;
                                entity.mark_persisted(true);
                                ctx.cache(inflater.cache_key(), identifier, entity.clone());
                                entity
                            }
                        };
                        if let (Some(fixer), Some(source)) = (fixer, &owner) {
                            fixer.fix(source, &entity, &view, &mut state)?;
                        }
                        entities[id] = Some(entity);
                    }
                    NodeRole::Capture(capture) => {
                        let Some(source) = owner else {
                            continue;
                        };
                        if !Self::admits(node, &source) {
                            continue;
                        }
                        capture.on_source(&source, &mut state);
                        capture.capture(&source, &view, &mut state, ctx)?;
                    }
                }
            }
            if let Some(Some(root)) = entities.first() {
                if seen.insert(root.key()) {
                    roots.push(root.clone());
                }
            }
        }
        state.finish();
        Ok(roots)
    }
}
