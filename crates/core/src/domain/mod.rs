pub mod catalog;
pub mod conversation;
pub mod job;
pub mod tool;
