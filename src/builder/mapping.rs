//! Value-construction form of a resolved query: how one result row becomes the
//! projected value. Consumed by the row materializer.

use std::rc::Rc;

use serde::Serialize;

use crate::expression::{Literal, ShapeType};

pub type MappingRef = Rc<Mapping>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldMapping {
    pub member: String,
    pub index: usize,
    pub value_type: ShapeType,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemberMapping {
    pub member: String,
    pub value: MappingRef,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Mapping {
    /// Read the statement column at `index`.
    Column { index: usize, value_type: ShapeType },

    /// A value known at compile time.
    Constant { value: Literal, value_type: ShapeType },

    /// A whole entity row.
    Entity {
        entity_type: String,
        fields: Vec<FieldMapping>,
    },

    /// Constructor call. `members` is empty for positional construction.
    New {
        object_type: ShapeType,
        members: Vec<String>,
        args: Vec<MappingRef>,
    },

    MemberInit {
        object_type: ShapeType,
        bindings: Vec<MemberMapping>,
    },
}

impl Mapping {
    pub fn column(index: usize, value_type: ShapeType) -> MappingRef {
        Rc::new(Mapping::Column { index, value_type })
    }

    pub fn constant(value: Literal, value_type: ShapeType) -> MappingRef {
        Rc::new(Mapping::Constant { value, value_type })
    }

    /// Every column index read by this mapping, in reading order.
    pub fn column_indices(&self) -> Vec<usize> {
        let mut out = Vec::new();
        self.collect_indices(&mut out);
        out
    }

    fn collect_indices(&self, out: &mut Vec<usize>) {
        match self {
            Mapping::Column { index, .. } => out.push(*index),
            Mapping::Constant { .. } => {}
            Mapping::Entity { fields, .. } => out.extend(fields.iter().map(|f| f.index)),
            Mapping::New { args, .. } => args.iter().for_each(|a| a.collect_indices(out)),
            Mapping::MemberInit { bindings, .. } => bindings
                .iter()
                .for_each(|b| b.value.collect_indices(out)),
        }
    }

    /// Mapping of a named member of a constructed value.
    pub fn member(&self, name: &str) -> Option<MappingRef> {
        match self {
            Mapping::New { members, args, .. } => members
                .iter()
                .position(|m| m == name)
                .and_then(|i| args.get(i).cloned()),
            Mapping::MemberInit { bindings, .. } => bindings
                .iter()
                .find(|b| b.member == name)
                .map(|b| b.value.clone()),
            Mapping::Entity { fields, .. } => fields.iter().find(|f| f.member == name).map(|f| {
                Rc::new(Mapping::Column {
                    index: f.index,
                    value_type: f.value_type.clone(),
                })
            }),
            _ => None,
        }
    }
}
