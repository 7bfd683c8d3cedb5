use crate::core::{Result, Value};
use crate::sql::{ColumnRef, Criteria, ValueBinder};

/// A filter on entity properties, named by dotted accessor path (`address.city`).
#[derive(Debug, Clone, PartialEq)]
pub enum EntityCriteria {
    All,
    Eq(String, Value),
    NotEq(String, Value),
    In(String, Vec<Value>),
    IsNull(String),
    IsNotNull(String),
    Lt(String, Value),
    Le(String, Value),
    Gt(String, Value),
    Ge(String, Value),
    Like(String, String),
    And(Vec<EntityCriteria>),
    Or(Vec<EntityCriteria>),
    Not(Box<EntityCriteria>),
}

impl EntityCriteria {
    pub fn eq(path: &str, value: impl Into<Value>) -> Self {
        Self::Eq(path.to_string(), value.into())
    }

    pub fn like(path: &str, pattern: &str) -> Self {
        Self::Like(path.to_string(), pattern.to_string())
    }

    pub fn is_null(path: &str) -> Self {
        Self::IsNull(path.to_string())
    }

    pub fn and(self, other: EntityCriteria) -> Self {
        match self {
            Self::All => other,
            Self::And(mut terms) => {
                terms.push(other);
                Self::And(terms)
            }
            first => Self::And(vec![first, other]),
        }
    }

    pub fn or(self, other: EntityCriteria) -> Self {
        match self {
            Self::Or(mut terms) => {
                terms.push(other);
                Self::Or(terms)
            }
            first => Self::Or(vec![first, other]),
        }
    }

    /// Translates property paths into columns; `None` selects everything.
    pub fn to_sql<F>(&self, resolve: &F) -> Result<Option<Criteria>>
    where
        F: Fn(&str) -> Result<(ColumnRef, ValueBinder)>,
    {
        let bound = |path: &str, value: &Value| -> Result<(ColumnRef, Value)> {
            let (column, binder) = resolve(path)?;
            Ok((column, binder.to_storage(value)?))
        };
        let criteria = match self {
            Self::All => return Ok(None),
            Self::Eq(path, value) => {
                let (c, v) = bound(path, value)?;
                Criteria::Eq(c, v)
            }
            Self::NotEq(path, value) => {
                let (c, v) = bound(path, value)?;
                Criteria::NotEq(c, v)
            }
            Self::In(path, values) => {
                let (column, binder) = resolve(path)?;
                let values = values
                    .iter()
                    .map(|v| binder.to_storage(v))
                    .collect::<Result<Vec<_>>>()?;
                Criteria::In(column, values)
            }
            Self::IsNull(path) => Criteria::IsNull(resolve(path)?.0),
            Self::IsNotNull(path) => Criteria::IsNotNull(resolve(path)?.0),
            Self::Lt(path, value) => {
                let (c, v) = bound(path, value)?;
                Criteria::Lt(c, v)
            }
            Self::Le(path, value) => {
                let (c, v) = bound(path, value)?;
                Criteria::Le(c, v)
            }
            Self::Gt(path, value) => {
                let (c, v) = bound(path, value)?;
                Criteria::Gt(c, v)
            }
            Self::Ge(path, value) => {
                let (c, v) = bound(path, value)?;
                Criteria::Ge(c, v)
            }
            Self::Like(path, pattern) => Criteria::Like(resolve(path)?.0, pattern.clone()),
            Self::And(terms) => Criteria::And(Self::translate_all(terms, resolve)?),
            Self::Or(terms) => Criteria::Or(Self::translate_all(terms, resolve)?),
            Self::Not(inner) => match inner.to_sql(resolve)? {
                Some(criteria) => Criteria::Not(Box::new(criteria)),
                // negation of everything: an empty disjunction
                None => Criteria::Or(Vec::new()),
            },
        };
        Ok(Some(criteria))
    }

    fn translate_all<F>(terms: &[EntityCriteria], resolve: &F) -> Result<Vec<Criteria>>
    where
        F: Fn(&str) -> Result<(ColumnRef, ValueBinder)>,
    {
        let mut translated = Vec::new();
        for term in terms {
            if let Some(criteria) = term.to_sql(resolve)? {
                translated.push(criteria);
            }
        }
        Ok(translated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{DataType, MappingError};

    fn resolve(path: &str) -> Result<(ColumnRef, ValueBinder)> {
        match path {
            "name" => Ok((ColumnRef::new("t0", "name"), ValueBinder::passthrough(DataType::Text))),
            "address.city" => Ok((ColumnRef::new("t0", "city"), ValueBinder::passthrough(DataType::Text))),
            other => Err(MappingError::UnmappedProperty(other.to_string())),
        }
    }

    #[test]
    fn test_paths_translate_to_columns() {
        let criteria = EntityCriteria::eq("name", "Ada").and(EntityCriteria::like("address.city", "Par%"));
        let sql = criteria.to_sql(&resolve).unwrap().unwrap();
        assert_eq!(sql.to_string(), "(t0.name = 'Ada' AND t0.city LIKE 'Par%')");
    }

    #[test]
    fn test_all_selects_everything() {
        assert!(EntityCriteria::All.to_sql(&resolve).unwrap().is_none());
        let only = EntityCriteria::All.and(EntityCriteria::is_null("name"));
        assert_eq!(only, EntityCriteria::is_null("name"));
    }

    #[test]
    fn test_unknown_path_is_rejected() {
        let err = EntityCriteria::eq("age", 3).to_sql(&resolve).unwrap_err();
        assert!(matches!(err, MappingError::UnmappedProperty(_)));
    }
}
