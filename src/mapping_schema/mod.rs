//! Mapping schema: metadata about the object model queries are written against.
//!
//! The schema answers every type/member question the builder has:
//!
//! - which table and columns back an entity type, including the explicit
//!   member alias map,
//! - associations between entities (used by correlated subqueries),
//! - the type hierarchy (base types and implemented interfaces), which drives
//!   member matching of interface members against concrete implementers,
//! - default values for members synthesized during projection resolution.
//!
//! Schemas are usually declared in YAML:
//!
//! ```yaml
//! types:
//!   - name: INamed
//!     kind: interface
//!     members:
//!       - { name: Name, type: String }
//!   - name: Customer
//!     kind: entity
//!     interfaces: [INamed]
//!     entity:
//!       table: customers
//!       columns:
//!         - { member: Id, column: id, type: Int32 }
//!         - { member: Name, column: name, type: String }
//! ```

pub mod errors;

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::expression::{Literal, Member, MemberKind, ScalarType, ShapeType};
use errors::SchemaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeKind {
    Entity,
    Interface,
    Class,
    Anonymous,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub member_type: ShapeType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub member: String,
    pub column: String,
    #[serde(rename = "type")]
    pub column_type: ScalarType,
    #[serde(default)]
    pub nullable: bool,
}

impl ColumnDescriptor {
    pub fn shape_type(&self) -> ShapeType {
        if self.nullable {
            ShapeType::Nullable(self.column_type)
        } else {
            ShapeType::Scalar(self.column_type)
        }
    }
}

/// Foreign-key style link: `this.this_key == target.other_key`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssociationDescriptor {
    pub member: String,
    pub target: String,
    pub this_key: String,
    pub other_key: String,
    #[serde(default)]
    pub many: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDescriptor {
    pub table: String,
    pub columns: Vec<ColumnDescriptor>,
    /// Member name → member name it stands for.
    #[serde(default)]
    pub aliases: HashMap<String, String>,
    #[serde(default)]
    pub associations: Vec<AssociationDescriptor>,
}

impl EntityDescriptor {
    pub fn column(&self, member: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.member == member)
    }

    pub fn association(&self, member: &str) -> Option<&AssociationDescriptor> {
        self.associations.iter().find(|a| a.member == member)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeDescriptor {
    pub name: String,
    pub kind: TypeKind,
    #[serde(default)]
    pub base: Option<String>,
    #[serde(default)]
    pub interfaces: Vec<String>,
    #[serde(default)]
    pub members: Vec<MemberDescriptor>,
    #[serde(default)]
    pub entity: Option<EntityDescriptor>,
}

impl TypeDescriptor {
    pub fn entity(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: TypeKind::Entity,
            base: None,
            interfaces: Vec::new(),
            members: Vec::new(),
            entity: Some(EntityDescriptor {
                table: table.into(),
                columns: Vec::new(),
                aliases: HashMap::new(),
                associations: Vec::new(),
            }),
        }
    }

    pub fn interface(name: impl Into<String>) -> Self {
        Self::plain(name, TypeKind::Interface)
    }

    pub fn class(name: impl Into<String>) -> Self {
        Self::plain(name, TypeKind::Class)
    }

    pub fn anonymous(name: impl Into<String>) -> Self {
        Self::plain(name, TypeKind::Anonymous)
    }

    fn plain(name: impl Into<String>, kind: TypeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            base: None,
            interfaces: Vec::new(),
            members: Vec::new(),
            entity: None,
        }
    }

    /// Map `member` to `column`. Only meaningful on entity descriptors.
    pub fn column(mut self, member: &str, column_type: ScalarType, column: &str) -> Self {
        if let Some(entity) = self.entity.as_mut() {
            entity.columns.push(ColumnDescriptor {
                member: member.to_string(),
                column: column.to_string(),
                column_type,
                nullable: false,
            });
        }
        self
    }

    pub fn association(
        mut self,
        member: &str,
        target: &str,
        this_key: &str,
        other_key: &str,
        many: bool,
    ) -> Self {
        if let Some(entity) = self.entity.as_mut() {
            entity.associations.push(AssociationDescriptor {
                member: member.to_string(),
                target: target.to_string(),
                this_key: this_key.to_string(),
                other_key: other_key.to_string(),
                many,
            });
        }
        self
    }

    pub fn alias(mut self, alias: &str, member: &str) -> Self {
        if let Some(entity) = self.entity.as_mut() {
            entity
                .aliases
                .insert(alias.to_string(), member.to_string());
        }
        self
    }

    pub fn member(mut self, name: &str, member_type: ShapeType) -> Self {
        self.members.push(MemberDescriptor {
            name: name.to_string(),
            member_type,
        });
        self
    }

    pub fn implements(mut self, interface: &str) -> Self {
        self.interfaces.push(interface.to_string());
        self
    }

    pub fn extends(mut self, base: &str) -> Self {
        self.base = Some(base.to_string());
        self
    }

    /// Type of a member declared directly on this type, if any.
    fn declared_member_type(&self, name: &str) -> Option<ShapeType> {
        if let Some(m) = self.members.iter().find(|m| m.name == name) {
            return Some(m.member_type.clone());
        }
        let entity = self.entity.as_ref()?;
        if let Some(c) = entity.column(name) {
            return Some(c.shape_type());
        }
        entity.association(name).map(|a| {
            let target = ShapeType::named(a.target.clone());
            if a.many {
                ShapeType::sequence_of(target)
            } else {
                target
            }
        })
    }
}

#[derive(Debug, Deserialize)]
struct SchemaDocument {
    types: Vec<TypeDescriptor>,
}

#[derive(Debug, Clone, Default)]
pub struct MappingSchema {
    types: HashMap<String, TypeDescriptor>,
}

impl MappingSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: TypeDescriptor) -> Result<(), SchemaError> {
        if self.types.contains_key(&descriptor.name) {
            return Err(SchemaError::DuplicateType(descriptor.name));
        }
        log::debug!(
            "MappingSchema::register: {} ({:?})",
            descriptor.name,
            descriptor.kind
        );
        self.types.insert(descriptor.name.clone(), descriptor);
        Ok(())
    }

    /// Register every descriptor, then check cross references.
    pub fn from_descriptors(
        descriptors: impl IntoIterator<Item = TypeDescriptor>,
    ) -> Result<Self, SchemaError> {
        let mut schema = Self::new();
        for descriptor in descriptors {
            schema.register(descriptor)?;
        }
        schema.validate()?;
        Ok(schema)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, SchemaError> {
        let document: SchemaDocument =
            serde_yaml::from_str(content).map_err(|e| SchemaError::Yaml(e.to_string()))?;
        Self::from_descriptors(document.types)
    }

    pub fn from_yaml_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self, SchemaError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| SchemaError::Io(e.to_string()))?;
        Self::from_yaml_str(&content)
    }

    /// Every base, interface and association target must be registered, and
    /// association keys must name mapped columns.
    pub fn validate(&self) -> Result<(), SchemaError> {
        for descriptor in self.types.values() {
            let referenced = descriptor
                .base
                .iter()
                .chain(descriptor.interfaces.iter())
                .chain(
                    descriptor
                        .entity
                        .iter()
                        .flat_map(|e| e.associations.iter().map(|a| &a.target)),
                );
            for name in referenced {
                if !self.types.contains_key(name) {
                    return Err(SchemaError::UnknownType {
                        type_name: descriptor.name.clone(),
                        referenced: name.clone(),
                    });
                }
            }

            if let Some(entity) = &descriptor.entity {
                for association in &entity.associations {
                    if entity.column(&association.this_key).is_none() {
                        return Err(SchemaError::UnknownColumn {
                            entity: descriptor.name.clone(),
                            member: association.this_key.clone(),
                        });
                    }
                    let target = self
                        .entity(&association.target)
                        .ok_or_else(|| SchemaError::NotAnEntity(association.target.clone()))?;
                    if target.column(&association.other_key).is_none() {
                        return Err(SchemaError::UnknownColumn {
                            entity: association.target.clone(),
                            member: association.other_key.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    pub fn descriptor(&self, name: &str) -> Option<&TypeDescriptor> {
        self.types.get(name)
    }

    pub fn entity(&self, name: &str) -> Option<&EntityDescriptor> {
        self.types.get(name).and_then(|d| d.entity.as_ref())
    }

    pub fn is_interface(&self, name: &str) -> bool {
        self.types
            .get(name)
            .is_some_and(|d| d.kind == TypeKind::Interface)
    }

    /// `name` followed by all its base types and interfaces, transitively,
    /// without duplicates.
    pub fn hierarchy(&self, name: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut ordered = Vec::new();
        let mut pending = vec![name.to_string()];
        while let Some(current) = pending.pop() {
            if !seen.insert(current.clone()) {
                continue;
            }
            if let Some(descriptor) = self.types.get(&current) {
                for interface in descriptor.interfaces.iter().rev() {
                    pending.push(interface.clone());
                }
                if let Some(base) = &descriptor.base {
                    pending.push(base.clone());
                }
            }
            ordered.push(current);
        }
        ordered
    }

    /// True when `parent` is `child` itself, one of its bases or one of its
    /// (transitively) implemented interfaces.
    pub fn is_same_or_parent_of(&self, parent: &str, child: &str) -> bool {
        parent == child || self.hierarchy(child).iter().any(|t| t == parent)
    }

    /// Types in the hierarchy of `type_name` that declare a member `member`.
    pub fn defining_types(&self, type_name: &str, member: &str) -> Vec<String> {
        self.hierarchy(type_name)
            .into_iter()
            .filter(|t| {
                self.types
                    .get(t)
                    .is_some_and(|d| d.declared_member_type(member).is_some())
            })
            .collect()
    }

    /// Resolve a member by name, searching the type hierarchy. The returned
    /// member is declared on the nearest type that declares it.
    pub fn member(&self, type_name: &str, member: &str) -> Option<Member> {
        self.hierarchy(type_name).into_iter().find_map(|t| {
            let member_type = self.types.get(&t)?.declared_member_type(member)?;
            Some(Member {
                name: member.to_string(),
                declaring_type: t,
                member_type,
                kind: MemberKind::Property,
            })
        })
    }

    /// Mapped columns of an entity as (member, column) pairs, in declaration order.
    pub fn entity_columns(&self, type_name: &str) -> Vec<(Member, String)> {
        let Some(entity) = self.entity(type_name) else {
            return Vec::new();
        };
        entity
            .columns
            .iter()
            .map(|c| {
                (
                    Member::property(type_name, c.member.clone(), c.shape_type()),
                    c.column.clone(),
                )
            })
            .collect()
    }

    /// Association declared for `member` on `type_name` or one of its bases.
    pub fn association(&self, type_name: &str, member: &str) -> Option<&AssociationDescriptor> {
        self.hierarchy(type_name)
            .iter()
            .find_map(|t| self.entity(t).and_then(|e| e.association(member)))
    }

    pub fn default_value(&self, ty: &ShapeType) -> Literal {
        match ty {
            ShapeType::Scalar(ScalarType::Boolean) => Literal::Boolean(false),
            ShapeType::Scalar(ScalarType::Int32) | ShapeType::Scalar(ScalarType::Int64) => {
                Literal::Integer(0)
            }
            ShapeType::Scalar(ScalarType::Float64) | ShapeType::Scalar(ScalarType::Decimal) => {
                Literal::Float(0.0)
            }
            ShapeType::Scalar(ScalarType::String)
            | ShapeType::Scalar(ScalarType::DateTime)
            | ShapeType::Nullable(_)
            | ShapeType::Named(_)
            | ShapeType::Sequence(_) => Literal::Null,
        }
    }
}
