pub mod action_handlers;
pub mod blog_handlers;
pub mod extract;
pub mod health_handlers;
pub mod public_handlers;
pub mod upload_handlers;
