pub mod sched;

pub use sched::*;
