//! Request middleware for the command surface

pub mod auth;
