pub mod connection;
pub mod presence;
pub mod relay;
pub mod typing;
