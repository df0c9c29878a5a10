pub mod download;
pub mod health;
pub mod jobs;
pub mod separate;
