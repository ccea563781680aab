//! Domain types read from the external persistence layer

pub mod group;

pub use group::GroupRole;
