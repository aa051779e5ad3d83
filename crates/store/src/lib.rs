pub mod connection;
pub mod memory;
pub mod migrations;
pub mod sql;
pub mod store;

pub use connection::{connect, connect_with_settings, DbPool};
pub use memory::MemoryConversationStore;
pub use sql::SqlConversationStore;
pub use store::{ConversationStore, StoreError};
