// Shared infrastructure

pub mod listeners;

pub use listeners::ListenerRegistry;
