pub mod base_enum;
pub mod bitmask;
pub mod constants;
pub mod dirty;
pub mod entity;
pub mod entity_set_object;
pub mod list_object;
pub mod map_object;
pub mod relationship;
pub mod set_object;
pub mod state_machine;
pub mod type_info;
pub mod value_object;

pub use base_enum::{BaseEnum, EnumType, EnumVariant};
pub use bitmask::BitMask;
pub use constants::CoreDataType;
pub use dirty::DirtyTrackable;
pub use entity::{
    Aggregate, Attr, Entity, EntityCheck, EntitySchema, EntitySchemaBuilder, JournalEntry,
    RelatedEntity,
};
pub use entity_set_object::{EntitySetObject, EntryState};
pub use list_object::ListObject;
pub use map_object::{MapEntryState, MapObject};
pub use relationship::{
    RelationshipAction, RelationshipStatus, make_relationship, relationship_schema,
};
pub use set_object::SetObject;
pub use state_machine::{StateMachine, StateMachineDefinition, StateTransition};
pub use type_info::{DefaultValue, ElementType, FieldInfo, FieldKind, OneOf, ValueParser};
pub use value_object::{ValueObject, ValueObjectCheck, ValueObjectSchema};
