pub mod dateutils;
pub mod id_generator;
pub mod money;
pub mod value_objects;

pub use id_generator::{extract_id_salt, generate_id_with_prefix, simple_id_generator};
pub use money::Money;
pub use value_objects::{ActionLog, ActionRequest};
