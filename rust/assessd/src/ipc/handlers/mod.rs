pub mod assessments;
pub mod core;
pub mod exchange;
pub mod quizzes;
pub mod settings;
pub mod students;
pub mod users;
