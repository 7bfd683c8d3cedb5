use super::context::OperationContext;
use super::Duo;
use crate::core::{Result, Value};
use crate::model::EntityRef;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Points of a persister operation where listeners run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    BeforeInsert,
    AfterInsert,
    BeforeUpdate,
    AfterUpdate,
    BeforeUpdateById,
    AfterUpdateById,
    BeforeDelete,
    AfterDelete,
    BeforeSelect,
    AfterSelect,
}

/// Within one stage, checks run before cascades so a rejected operation issues no statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Check,
    Cascade,
}

pub type EntitiesHandler = Rc<dyn Fn(&[EntityRef], &mut OperationContext) -> Result<()>>;
pub type UpdateHandler = Rc<dyn Fn(&[Duo], bool, &mut OperationContext) -> Result<()>>;
pub type IdsHandler = Rc<dyn Fn(&[Value], &mut OperationContext) -> Result<()>>;

#[derive(Clone)]
enum Handler {
    Entities(EntitiesHandler),
    Update(UpdateHandler),
    Ids(IdsHandler),
}

#[derive(Clone)]
struct Registration {
    name: String,
    stage: Stage,
    priority: Priority,
    handler: Handler,
}

/// Listeners of a pipeline at one point of a build, see [`ListenerPipeline::rollback`].
#[derive(Clone)]
pub struct ListenerCheckpoint(Vec<Registration>);

/// Ordered listeners of one persister.
#[derive(Default)]
pub struct ListenerPipeline {
    registrations: RefCell<Vec<Registration>>,
}

impl ListenerPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, registration: Registration) {
        let mut registrations = self.registrations.borrow_mut();
        // stable: registration order is kept within one priority
        let position = registrations
            .iter()
            .position(|r| r.stage == registration.stage && r.priority > registration.priority)
            .unwrap_or(registrations.len());
        registrations.insert(position, registration);
    }

    /// Listener of insert, update-by-id, delete and after-select stages.
    pub fn on_entities(
        &self,
        stage: Stage,
        name: &str,
        priority: Priority,
        handler: impl Fn(&[EntityRef], &mut OperationContext) -> Result<()> + 'static,
    ) {
        self.register(Registration {
            name: name.to_string(),
            stage,
            priority,
            handler: Handler::Entities(Rc::new(handler)),
        });
    }

    /// Listener of update stages, called with (modified, unmodified) pairs and the all-columns flag.
    pub fn on_update(
        &self,
        stage: Stage,
        name: &str,
        priority: Priority,
        handler: impl Fn(&[Duo], bool, &mut OperationContext) -> Result<()> + 'static,
    ) {
        self.register(Registration {
            name: name.to_string(),
            stage,
            priority,
            handler: Handler::Update(Rc::new(handler)),
        });
    }

    /// Listener of the before-select stage, called with the requested identifiers.
    pub fn on_ids(
        &self,
        stage: Stage,
        name: &str,
        priority: Priority,
        handler: impl Fn(&[Value], &mut OperationContext) -> Result<()> + 'static,
    ) {
        self.register(Registration {
            name: name.to_string(),
            stage,
            priority,
            handler: Handler::Ids(Rc::new(handler)),
        });
    }

    /// Snapshot of the handlers of `stage`; listeners may register others while running.
    fn handlers(&self, stage: Stage) -> Vec<Handler> {
        self.handlers_at(stage, None)
    }

    fn handlers_at(&self, stage: Stage, priority: Option<Priority>) -> Vec<Handler> {
        self.registrations
            .borrow()
            .iter()
            .filter(|r| r.stage == stage && priority.is_none_or(|p| r.priority == p))
            .map(|r| r.handler.clone())
            .collect()
    }

    pub fn fire_entities(&self, stage: Stage, entities: &[EntityRef], ctx: &mut OperationContext) -> Result<()> {
        if entities.is_empty() {
            return Ok(());
        }
        for handler in self.handlers(stage) {
            if let Handler::Entities(handler) = handler {
                handler(entities, ctx)?;
            }
        }
        Ok(())
    }

    pub fn fire_update(&self, stage: Stage, pairs: &[Duo], all_columns: bool, ctx: &mut OperationContext) -> Result<()> {
        if pairs.is_empty() {
            return Ok(());
        }
        for handler in self.handlers(stage) {
            if let Handler::Update(handler) = handler {
                handler(pairs, all_columns, ctx)?;
            }
        }
        Ok(())
    }

    /// Runs only the [`Priority::Check`] listeners of `stage`.
    pub fn fire_checks(&self, stage: Stage, entities: &[EntityRef], ctx: &mut OperationContext) -> Result<()> {
        for handler in self.handlers_at(stage, Some(Priority::Check)) {
            if let Handler::Entities(handler) = handler {
                handler(entities, ctx)?;
            }
        }
        Ok(())
    }

    pub fn fire_update_checks(
        &self,
        stage: Stage,
        pairs: &[Duo],
        all_columns: bool,
        ctx: &mut OperationContext,
    ) -> Result<()> {
        for handler in self.handlers_at(stage, Some(Priority::Check)) {
            if let Handler::Update(handler) = handler {
                handler(pairs, all_columns, ctx)?;
            }
        }
        Ok(())
    }

    pub fn fire_ids(&self, stage: Stage, ids: &[Value], ctx: &mut OperationContext) -> Result<()> {
        for handler in self.handlers(stage) {
            if let Handler::Ids(handler) = handler {
                handler(ids, ctx)?;
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.registrations.borrow().len()
    }

    pub fn checkpoint(&self) -> ListenerCheckpoint {
        ListenerCheckpoint(self.registrations.borrow().clone())
    }

    /// Drops every listener registered since `checkpoint` was taken.
    pub fn rollback(&self, checkpoint: ListenerCheckpoint) {
        *self.registrations.borrow_mut() = checkpoint.0;
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.borrow().is_empty()
    }

    /// One line per listener in firing order, e.g. `BeforeInsert [Check] Order.customer mandatory`.
    pub fn describe(&self) -> Vec<String> {
        let mut registrations = self.registrations.borrow().clone();
        registrations.sort_by_key(|r| r.stage);
        registrations
            .iter()
            .map(|r| format!("{:?} [{:?}] {}", r.stage, r.priority, r.name))
            .collect()
    }
}

impl fmt::Debug for ListenerPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.describe()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Instance;

    #[test]
    fn test_checks_fire_before_cascades() {
        let pipeline = ListenerPipeline::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        let log = Rc::clone(&order);
        pipeline.on_entities(Stage::BeforeInsert, "cascade", Priority::Cascade, move |_, _| {
            log.borrow_mut().push("cascade");
            Ok(())
        });
        let log = Rc::clone(&order);
        pipeline.on_entities(Stage::BeforeInsert, "check", Priority::Check, move |_, _| {
            log.borrow_mut().push("check");
            Ok(())
        });
        let log = Rc::clone(&order);
        pipeline.on_entities(Stage::AfterInsert, "after", Priority::Cascade, move |_, _| {
            log.borrow_mut().push("after");
            Ok(())
        });

        let entity = Instance::new("Order").into_ref();
        let mut ctx = OperationContext::new();
        pipeline.fire_entities(Stage::BeforeInsert, &[entity], &mut ctx).unwrap();
        assert_eq!(*order.borrow(), vec!["check", "cascade"]);
        assert_eq!(pipeline.describe()[0], "BeforeInsert [Check] check");
    }

    #[test]
    fn test_rollback_drops_later_listeners() {
        let pipeline = ListenerPipeline::new();
        pipeline.on_entities(Stage::BeforeInsert, "kept", Priority::Cascade, |_, _| Ok(()));
        let checkpoint = pipeline.checkpoint();
        pipeline.on_entities(Stage::BeforeInsert, "dropped check", Priority::Check, |_, _| Ok(()));
        pipeline.on_update(Stage::AfterUpdate, "dropped cascade", Priority::Cascade, |_, _, _| Ok(()));
        assert_eq!(pipeline.len(), 3);

        pipeline.rollback(checkpoint);
        assert_eq!(pipeline.describe(), vec!["BeforeInsert [Cascade] kept".to_string()]);
    }

    #[test]
    fn test_failing_listener_stops_the_stage() {
        let pipeline = ListenerPipeline::new();
        let reached = Rc::new(RefCell::new(false));
        pipeline.on_entities(Stage::BeforeDelete, "reject", Priority::Check, |_, _| {
            Err(crate::core::MappingError::ExecutionError("rejected".into()))
        });
        let flag = Rc::clone(&reached);
        pipeline.on_entities(Stage::BeforeDelete, "never", Priority::Cascade, move |_, _| {
            *flag.borrow_mut() = true;
            Ok(())
        });
        let entity = Instance::new("Order").into_ref();
        let mut ctx = OperationContext::new();
        assert!(pipeline.fire_entities(Stage::BeforeDelete, &[entity], &mut ctx).is_err());
        assert!(!*reached.borrow());
    }
}
