//! Request-independent business logic shared by the HTTP handlers.

pub mod files_service;
