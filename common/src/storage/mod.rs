pub mod db;
pub mod index;
pub mod types;
