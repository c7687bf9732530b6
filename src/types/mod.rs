//! Core data types: errors, URNs, field values, the entity model.

pub mod entity;
pub mod error;
pub mod urn;
pub mod value;

pub use entity::{fields, Entity};
pub use error::{Result, ThemisError};
pub use urn::{DataModel, Urn};
pub use value::FieldValue;
