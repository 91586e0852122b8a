pub mod audit_mapper;
pub mod child_mapper;
pub mod credential_mapper;
pub mod session_mapper;
