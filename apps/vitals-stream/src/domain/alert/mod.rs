//! Alert Domain
//!
//! Threshold-alert events from the backend, the bounded display log that
//! retains them, and the correlator that overlays `Warning` onto the
//! roster while a student is in the live alert set.

mod correlator;
mod event;
mod log;

pub use correlator::{AlertCorrelator, CorrelationChange};
pub use event::{AlertError, AlertEvent};
pub use log::AlertLog;
