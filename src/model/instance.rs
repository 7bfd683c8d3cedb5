use crate::core::{ClassName, Value};
use std::cell::{Cell, Ref, RefCell, RefMut};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

/// One named slot of an [`Instance`].
#[derive(Debug, Clone)]
pub enum Property {
    Value(Value),
    Embedded(Option<Box<Instance>>),
    Reference(Option<EntityRef>),
    Collection(Vec<EntityRef>),
    Elements(Vec<Value>),
}

/// A dynamically typed object: a class tag plus named properties.
#[derive(Debug, Clone)]
pub struct Instance {
    class: ClassName,
    properties: BTreeMap<String, Property>,
}

impl Instance {
    pub fn new(class: impl Into<ClassName>) -> Self {
        Self {
            class: class.into(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.set_property(name, Property::Value(value.into()));
        self
    }

    pub fn with_embedded(mut self, name: &str, embedded: Instance) -> Self {
        self.set_property(name, Property::Embedded(Some(Box::new(embedded))));
        self
    }

    pub fn with_reference(mut self, name: &str, target: Option<EntityRef>) -> Self {
        self.set_property(name, Property::Reference(target));
        self
    }

    pub fn with_collection(mut self, name: &str, members: Vec<EntityRef>) -> Self {
        self.set_property(name, Property::Collection(members));
        self
    }

    pub fn with_elements(mut self, name: &str, elements: Vec<Value>) -> Self {
        self.set_property(name, Property::Elements(elements));
        self
    }

    pub fn class(&self) -> &ClassName {
        &self.class
    }

    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.get(name)
    }

    pub fn property_mut(&mut self, name: &str) -> Option<&mut Property> {
        self.properties.get_mut(name)
    }

    pub fn set_property(&mut self, name: &str, property: Property) {
        self.properties.insert(name.to_string(), property);
    }

    pub(crate) fn slot_or_insert(&mut self, name: &str, default: Property) -> &mut Property {
        self.properties.entry(name.to_string()).or_insert(default)
    }

    /// Plain value of a top-level property, `Null` when absent or not a value.
    pub fn value(&self, name: &str) -> Value {
        match self.properties.get(name) {
            Some(Property::Value(v)) => v.clone(),
            _ => Value::Null,
        }
    }

    pub fn embedded(&self, name: &str) -> Option<&Instance> {
        match self.properties.get(name) {
            Some(Property::Embedded(Some(inner))) => Some(inner),
            _ => None,
        }
    }

    pub fn into_ref(self) -> EntityRef {
        EntityRef::new(self)
    }
}

struct EntityCell {
    instance: RefCell<Instance>,
    persisted: Cell<bool>,
}

/// Pointer identity of an [`EntityRef`], stable for the lifetime of the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceKey(usize);

/// Shared handle to an entity object of a graph.
///
/// Two handles are the same entity when they point to the same object; identifiers are
/// compared separately by the persisters.
#[derive(Clone)]
pub struct EntityRef(Rc<EntityCell>);

impl EntityRef {
    pub fn new(instance: Instance) -> Self {
        Self(Rc::new(EntityCell {
            instance: RefCell::new(instance),
            persisted: Cell::new(false),
        }))
    }

    pub fn class(&self) -> ClassName {
        self.0.instance.borrow().class.clone()
    }

    pub fn borrow(&self) -> Ref<'_, Instance> {
        self.0.instance.borrow()
    }

    pub fn borrow_mut(&self) -> RefMut<'_, Instance> {
        self.0.instance.borrow_mut()
    }

    pub fn key(&self) -> InstanceKey {
        InstanceKey(Rc::as_ptr(&self.0) as usize)
    }

    pub fn ptr_eq(&self, other: &EntityRef) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Whether the object is known to have a stored row.
    pub fn is_persisted(&self) -> bool {
        self.0.persisted.get()
    }

    pub fn mark_persisted(&self, persisted: bool) {
        self.0.persisted.set(persisted);
    }

    pub fn get(&self, name: &str) -> Value {
        self.borrow().value(name)
    }

    pub fn set(&self, name: &str, value: impl Into<Value>) {
        self.borrow_mut()
            .set_property(name, Property::Value(value.into()));
    }

    pub fn reference(&self, name: &str) -> Option<EntityRef> {
        match self.borrow().property(name) {
            Some(Property::Reference(target)) => target.clone(),
            _ => None,
        }
    }

    pub fn set_reference(&self, name: &str, target: Option<EntityRef>) {
        self.borrow_mut()
            .set_property(name, Property::Reference(target));
    }

    pub fn collection(&self, name: &str) -> Vec<EntityRef> {
        match self.borrow().property(name) {
            Some(Property::Collection(members)) => members.clone(),
            _ => Vec::new(),
        }
    }

    pub fn set_collection(&self, name: &str, members: Vec<EntityRef>) {
        self.borrow_mut()
            .set_property(name, Property::Collection(members));
    }

    pub fn elements(&self, name: &str) -> Vec<Value> {
        match self.borrow().property(name) {
            Some(Property::Elements(values)) => values.clone(),
            _ => Vec::new(),
        }
    }

    pub fn set_elements(&self, name: &str, elements: Vec<Value>) {
        self.borrow_mut()
            .set_property(name, Property::Elements(elements));
    }
}

impl PartialEq for EntityRef {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for EntityRef {}

// Graphs may be cyclic: only the class and the pointer are printed.
impl fmt::Debug for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.instance.try_borrow() {
            Ok(instance) => write!(f, "EntityRef({}@{:#x})", instance.class, self.key().0),
            Err(_) => write!(f, "EntityRef(<borrowed>@{:#x})", self.key().0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_ref_identity() {
        let a = Instance::new("Customer").with("id", 1).into_ref();
        let b = a.clone();
        let c = Instance::new("Customer").with("id", 1).into_ref();
        assert!(a.ptr_eq(&b));
        assert_eq!(a.key(), b.key());
        assert_ne!(a, c);
    }

    #[test]
    fn test_cyclic_graph_debug_does_not_recurse() {
        let a = Instance::new("Node").into_ref();
        a.set_reference("next", Some(a.clone()));
        let printed = format!("{:?}", a.reference("next"));
        assert!(printed.contains("Node"));
        a.set_reference("next", None);
    }

    #[test]
    fn test_missing_value_reads_as_null() {
        let a = Instance::new("Customer").into_ref();
        assert_eq!(a.get("name"), Value::Null);
        assert!(a.collection("orders").is_empty());
    }
}
