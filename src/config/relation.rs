use crate::core::{ClassName, DataType};

/// How far a cascade maintains the targets of a relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RelationMode {
    /// The relation is only loaded, writes never touch targets or links.
    ReadOnly,
    /// Targets are inserted and updated with the source.
    #[default]
    All,
    /// As `All`, and targets detached from the source are deleted.
    AllOrphanRemoval,
    /// Only association rows are written, target lifecycle belongs to the caller.
    AssociationOnly,
}

impl RelationMode {
    pub fn writes_targets(&self) -> bool {
        matches!(self, Self::All | Self::AllOrphanRemoval)
    }

    pub fn removes_orphans(&self) -> bool {
        matches!(self, Self::AllOrphanRemoval)
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self, Self::ReadOnly)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CollectionKind {
    #[default]
    Set,
    /// Ordered collection: positions are stored in an index column.
    List,
}

/// A reference from the source to at most one target.
///
/// Without `mapped_by`/`reverse_column` the source table holds the foreign key, otherwise
/// the target table does.
#[derive(Debug, Clone)]
pub struct OneToOneRelation {
    pub property: String,
    pub target: ClassName,
    pub mode: RelationMode,
    pub nullable: bool,
    pub column: Option<String>,
    pub reverse: Option<String>,
    pub reverse_column: Option<String>,
}

impl OneToOneRelation {
    pub fn new(property: &str, target: impl Into<ClassName>) -> Self {
        Self {
            property: property.to_string(),
            target: target.into(),
            mode: RelationMode::All,
            nullable: true,
            column: None,
            reverse: None,
            reverse_column: None,
        }
    }

    pub fn mode(mut self, mode: RelationMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn mandatory(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Foreign key column on the source table.
    pub fn column(mut self, name: &str) -> Self {
        self.column = Some(name.to_string());
        self
    }

    /// The target holds the foreign key; `property` on the target references the source back.
    pub fn mapped_by(mut self, property: &str) -> Self {
        self.reverse = Some(property.to_string());
        self
    }

    /// The target holds the foreign key in `column`, with no reverse property.
    pub fn reverse_column(mut self, column: &str) -> Self {
        self.reverse_column = Some(column.to_string());
        self
    }

    pub fn owned_by_target(&self) -> bool {
        self.reverse.is_some() || self.reverse_column.is_some()
    }
}

/// A collection of targets.
///
/// With `mapped_by`/`reverse_column` the target table holds the foreign key back to the
/// source; otherwise an association table links both sides.
#[derive(Debug, Clone)]
pub struct OneToManyRelation {
    pub property: String,
    pub target: ClassName,
    pub kind: CollectionKind,
    pub mode: RelationMode,
    pub mandatory: bool,
    pub reverse: Option<String>,
    pub reverse_column: Option<String>,
    pub association_table: Option<String>,
    pub index_column: Option<String>,
}

impl OneToManyRelation {
    pub fn new(property: &str, target: impl Into<ClassName>) -> Self {
        Self {
            property: property.to_string(),
            target: target.into(),
            kind: CollectionKind::Set,
            mode: RelationMode::All,
            mandatory: false,
            reverse: None,
            reverse_column: None,
            association_table: None,
            index_column: None,
        }
    }

    pub fn list(mut self) -> Self {
        self.kind = CollectionKind::List;
        self
    }

    pub fn mode(mut self, mode: RelationMode) -> Self {
        self.mode = mode;
        self
    }

    /// The collection property must be set (it may be empty).
    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    pub fn mapped_by(mut self, property: &str) -> Self {
        self.reverse = Some(property.to_string());
        self
    }

    pub fn reverse_column(mut self, column: &str) -> Self {
        self.reverse_column = Some(column.to_string());
        self
    }

    pub fn association_table(mut self, name: &str) -> Self {
        self.association_table = Some(name.to_string());
        self
    }

    /// Position column of a list, implies [`CollectionKind::List`].
    pub fn index_column(mut self, column: &str) -> Self {
        self.kind = CollectionKind::List;
        self.index_column = Some(column.to_string());
        self
    }

    pub fn uses_association_table(&self) -> bool {
        self.association_table.is_some() || (self.reverse.is_none() && self.reverse_column.is_none())
    }
}

/// A collection of plain values stored in its own table.
#[derive(Debug, Clone)]
pub struct ElementCollectionRelation {
    pub property: String,
    pub element_type: DataType,
    pub kind: CollectionKind,
    pub table_name: Option<String>,
    pub element_column: Option<String>,
    pub reverse_column: Option<String>,
    pub index_column: Option<String>,
}

impl ElementCollectionRelation {
    pub fn new(property: &str, element_type: DataType) -> Self {
        Self {
            property: property.to_string(),
            element_type,
            kind: CollectionKind::Set,
            table_name: None,
            element_column: None,
            reverse_column: None,
            index_column: None,
        }
    }

    pub fn list(mut self) -> Self {
        self.kind = CollectionKind::List;
        self
    }

    pub fn table(mut self, name: &str) -> Self {
        self.table_name = Some(name.to_string());
        self
    }

    pub fn element_column(mut self, column: &str) -> Self {
        self.element_column = Some(column.to_string());
        self
    }

    pub fn reverse_column(mut self, column: &str) -> Self {
        self.reverse_column = Some(column.to_string());
        self
    }

    pub fn index_column(mut self, column: &str) -> Self {
        self.kind = CollectionKind::List;
        self.index_column = Some(column.to_string());
        self
    }
}
