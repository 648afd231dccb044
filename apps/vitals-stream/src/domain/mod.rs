//! Domain Layer
//!
//! Pure business logic with no I/O: topic patterns, the subscription
//! registry, vitals state and alert correlation.

pub mod alert;
pub mod subscription;
pub mod topic;
pub mod vitals;
