//! Wire protocol spoken between the controller and the worker plugin.

pub mod message;
pub mod schema;
pub mod types;

pub use message::*;
pub use schema::{JsonSchemaValidator, MessageValidator, ProtocolSchemas, SchemaCheck, SchemaIssue};
pub use types::*;
