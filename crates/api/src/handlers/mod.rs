pub mod dead_letters;
pub mod executions;
pub mod workflows;
