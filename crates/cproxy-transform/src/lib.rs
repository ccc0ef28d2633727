pub mod chat;
pub mod conversation;
pub mod responses;
pub mod tool_choice;
