use super::settings::PersistenceSettings;
use crate::core::{Result, Row};
use crate::sql::{BinderRegistry, SelectQuery, SqlExecutor, WriteOutcome, WriteStatement};
use std::fmt;
use std::rc::Rc;
use tracing::{Level, event};

/// Database flavour the persisters are built for.
#[derive(Debug, Clone, Default)]
pub struct Dialect {
    pub binders: BinderRegistry,
}

impl Dialect {
    pub fn new(binders: BinderRegistry) -> Self {
        Self { binders }
    }
}

/// Where persisters send their statements, and how.
#[derive(Clone)]
pub struct ConnectionConfiguration {
    pub executor: Rc<dyn SqlExecutor>,
    pub settings: PersistenceSettings,
}

impl ConnectionConfiguration {
    pub fn new(executor: Rc<dyn SqlExecutor>) -> Self {
        Self {
            executor,
            settings: PersistenceSettings::default(),
        }
    }

    /// Set the persistence settings
    pub fn settings(mut self, settings: PersistenceSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn execute(&self, statement: &WriteStatement) -> Result<WriteOutcome> {
        if self.settings.log_statements {
            event!(Level::DEBUG, statement = %statement, "execute");
        }
        self.executor.execute(statement)
    }

    pub fn select(&self, query: &SelectQuery) -> Result<Vec<Row>> {
        if self.settings.log_statements {
            event!(Level::DEBUG, query = %query, "select");
        }
        self.executor.select(query)
    }
}

impl fmt::Debug for ConnectionConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfiguration")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
