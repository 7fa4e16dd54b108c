pub mod analytics;
pub mod classes;
pub mod core;
pub mod council;
pub mod curriculum;
pub mod dashboard;
pub mod grades;
pub mod reports;
pub mod settings;
pub mod students;
pub mod subjects;
pub mod teachers;
