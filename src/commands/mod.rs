pub mod report;
pub mod validate;
