pub mod envelope;
pub mod gp_type;
pub mod protocol;
pub mod type_registry;
pub mod value;
