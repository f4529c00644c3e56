pub mod backup;
pub mod certificates;
pub mod core;
pub mod exams;
pub mod fees;
pub mod grades;
pub mod reports;
pub mod setup;
pub mod staff;
pub mod students;
