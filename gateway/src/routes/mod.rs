pub mod admin;
pub mod health;
pub mod nodes;
pub mod proxy;
