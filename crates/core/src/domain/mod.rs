pub mod conversation;
pub mod envelope;
pub mod request;
pub mod tenant;
