use super::instance::{EntityRef, Instance, Property};
use crate::core::{ClassName, Value};
use std::fmt;
use std::hash::{Hash, Hasher};

/// One step of an accessor path. Every step but the last one traverses an embedded
/// object of class `embedded`.
#[derive(Debug, Clone)]
pub struct PathLink {
    pub property: String,
    pub embedded: Option<ClassName>,
}

/// Get/set capability over one property of an entity class, resolved at configuration time.
///
/// Accessors compare by definition (declaring class and property path), so two accessors
/// built separately for the same logical property are equal.
#[derive(Debug, Clone)]
pub struct PropertyAccessor {
    owner: ClassName,
    path: Vec<PathLink>,
}

impl PropertyAccessor {
    pub fn new(owner: impl Into<ClassName>, property: &str) -> Self {
        Self {
            owner: owner.into(),
            path: vec![PathLink {
                property: property.to_string(),
                embedded: None,
            }],
        }
    }

    /// Accessor reaching `property` inside the embedded object this accessor points at.
    pub fn chain(&self, embedded: &ClassName, property: &str) -> Self {
        let mut path = self.path.clone();
        if let Some(last) = path.last_mut() {
            last.embedded = Some(embedded.clone());
        }
        path.push(PathLink {
            property: property.to_string(),
            embedded: None,
        });
        Self {
            owner: self.owner.clone(),
            path,
        }
    }

    pub fn owner(&self) -> &ClassName {
        &self.owner
    }

    pub fn property_names(&self) -> impl Iterator<Item = &str> {
        self.path.iter().map(|link| link.property.as_str())
    }

    /// Name of the last property of the path.
    pub fn name(&self) -> &str {
        self.path
            .last()
            .map(|link| link.property.as_str())
            .unwrap_or_default()
    }

    /// Dotted property path, e.g. `address.city`.
    pub fn definition(&self) -> String {
        self.property_names().collect::<Vec<_>>().join(".")
    }

    fn slot<'a>(&self, instance: &'a Instance) -> Option<&'a Property> {
        let (last, parents) = self.path.split_last()?;
        let mut current = instance;
        for link in parents {
            match current.property(&link.property)? {
                Property::Embedded(Some(inner)) => current = &**inner,
                _ => return None,
            }
        }
        current.property(&last.property)
    }

    /// Walks to the object holding the last property, creating missing embedded objects
    /// when `create` is set.
    fn container_mut<'a>(&self, instance: &'a mut Instance, create: bool) -> Option<&'a mut Instance> {
        let (_, parents) = self.path.split_last()?;
        let mut current = instance;
        for link in parents {
            let class = link
                .embedded
                .clone()
                .unwrap_or_else(|| ClassName::new(link.property.as_str()));
            let exists = matches!(current.property(&link.property), Some(Property::Embedded(Some(_))));
            if !exists {
                if !create {
                    return None;
                }
                current.set_property(
                    &link.property,
                    Property::Embedded(Some(Box::new(Instance::new(class)))),
                );
            }
            let Some(Property::Embedded(Some(inner))) = current.property_mut(&link.property) else {
                return None;
            };
            current = &mut **inner;
        }
        Some(current)
    }

    pub fn is_present(&self, instance: &Instance) -> bool {
        self.slot(instance).is_some()
    }

    pub fn get(&self, instance: &Instance) -> Value {
        match self.slot(instance) {
            Some(Property::Value(v)) => v.clone(),
            _ => Value::Null,
        }
    }

    /// A `Null` written through a missing embedded object leaves the object absent.
    pub fn set(&self, instance: &mut Instance, value: Value) {
        let create = !value.is_null();
        if let Some(container) = self.container_mut(instance, create) {
            container.set_property(self.name(), Property::Value(value));
        }
    }

    pub fn read(&self, entity: &EntityRef) -> Value {
        self.get(&entity.borrow())
    }

    pub fn write(&self, entity: &EntityRef, value: Value) {
        self.set(&mut entity.borrow_mut(), value);
    }

    pub fn get_reference(&self, entity: &EntityRef) -> Option<EntityRef> {
        match self.slot(&entity.borrow()) {
            Some(Property::Reference(target)) => target.clone(),
            _ => None,
        }
    }

    pub fn set_reference(&self, entity: &EntityRef, target: Option<EntityRef>) {
        let mut instance = entity.borrow_mut();
        if let Some(container) = self.container_mut(&mut instance, true) {
            container.set_property(self.name(), Property::Reference(target));
        }
    }

    /// `None` when the collection property was never set.
    pub fn get_collection(&self, entity: &EntityRef) -> Option<Vec<EntityRef>> {
        match self.slot(&entity.borrow()) {
            Some(Property::Collection(members)) => Some(members.clone()),
            _ => None,
        }
    }

    pub fn set_collection(&self, entity: &EntityRef, members: Vec<EntityRef>) {
        let mut instance = entity.borrow_mut();
        if let Some(container) = self.container_mut(&mut instance, true) {
            container.set_property(self.name(), Property::Collection(members));
        }
    }

    /// Appends to the collection, creating it when absent. Already present members are skipped.
    pub fn add_to_collection(&self, entity: &EntityRef, member: EntityRef) {
        let mut instance = entity.borrow_mut();
        let Some(container) = self.container_mut(&mut instance, true) else {
            return;
        };
        let slot = container.slot_or_insert(self.name(), Property::Collection(Vec::new()));
        match slot {
            Property::Collection(members) => {
                if !members.iter().any(|m| m.ptr_eq(&member)) {
                    members.push(member);
                }
            }
            other => *other = Property::Collection(vec![member]),
        }
    }

    pub fn get_elements(&self, entity: &EntityRef) -> Option<Vec<Value>> {
        match self.slot(&entity.borrow()) {
            Some(Property::Elements(values)) => Some(values.clone()),
            _ => None,
        }
    }

    pub fn set_elements(&self, entity: &EntityRef, values: Vec<Value>) {
        let mut instance = entity.borrow_mut();
        if let Some(container) = self.container_mut(&mut instance, true) {
            container.set_property(self.name(), Property::Elements(values));
        }
    }
}

impl PartialEq for PropertyAccessor {
    fn eq(&self, other: &Self) -> bool {
        self.owner == other.owner && self.property_names().eq(other.property_names())
    }
}

impl Eq for PropertyAccessor {}

impl Hash for PropertyAccessor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.owner.hash(state);
        for name in self.property_names() {
            name.hash(state);
        }
    }
}

impl fmt::Display for PropertyAccessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.owner, self.definition())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accessors_compare_by_definition() {
        let a = PropertyAccessor::new("Person", "name");
        let b = PropertyAccessor::new("Person", "name");
        assert_eq!(a, b);
        assert_ne!(a, PropertyAccessor::new("Person", "email"));
    }

    #[test]
    fn test_embedded_path_get_and_set() {
        let address = PropertyAccessor::new("Person", "address");
        let city = address.chain(&ClassName::new("Address"), "city");
        assert_eq!(city.definition(), "address.city");

        let person = Instance::new("Person").into_ref();
        assert_eq!(city.read(&person), Value::Null);
        city.write(&person, Value::from("Lyon"));
        assert_eq!(city.read(&person), Value::from("Lyon"));
        assert_eq!(
            person.borrow().embedded("address").map(|a| a.class().clone()),
            Some(ClassName::new("Address"))
        );
    }

    #[test]
    fn test_null_does_not_create_embedded_object() {
        let city = PropertyAccessor::new("Person", "address").chain(&ClassName::new("Address"), "city");
        let person = Instance::new("Person").into_ref();
        city.write(&person, Value::Null);
        assert!(person.borrow().embedded("address").is_none());
    }

    #[test]
    fn test_add_to_collection_skips_duplicates() {
        let children = PropertyAccessor::new("Node", "children");
        let parent = Instance::new("Node").into_ref();
        let child = Instance::new("Node").into_ref();
        assert!(children.get_collection(&parent).is_none());
        children.add_to_collection(&parent, child.clone());
        children.add_to_collection(&parent, child);
        assert_eq!(children.get_collection(&parent).map(|c| c.len()), Some(1));
    }
}
