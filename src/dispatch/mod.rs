pub mod queue;
pub mod sticky;
pub mod worker;
