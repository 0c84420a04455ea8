//! Domain model module declarations.

pub mod audit;
pub mod definition;
pub mod event;
pub mod message;
pub mod task;
