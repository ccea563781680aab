//! Read-only repositories over the external persistence layer
//!
//! The surrounding CRUD service owns the schema and all writes; this
//! server only resolves watch sessions to their owning group and users to
//! their role within that group.

pub mod group_member;
pub mod watch_session;

pub use group_member::GroupMemberRepository;
pub use watch_session::WatchSessionRepository;
