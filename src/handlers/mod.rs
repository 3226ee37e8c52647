// src/handlers/mod.rs
pub mod projects;
