//! Credential types and signed-URL handling for the storage back ends

pub mod credentials;
