pub mod badges;
pub mod core;
pub mod grades;
pub mod reports;
pub mod setup;
