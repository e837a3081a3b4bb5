pub mod chat;
pub mod document;
pub mod entity;
pub mod events;

pub use chat::*;
pub use document::*;
pub use entity::*;
pub use events::*;
