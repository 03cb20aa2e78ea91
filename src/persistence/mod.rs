//! Persistence layer modules.

pub mod agent_repo;
pub mod db;
pub mod output_repo;
pub mod schema;
