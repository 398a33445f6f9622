pub mod core;
pub mod directory;
pub mod grading;
pub mod marks;
pub mod notifications;
pub mod reports;
pub mod setup;
pub mod store_house;
