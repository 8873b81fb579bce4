pub mod db_utils;
pub mod error;
pub mod sql;
pub mod tenant;
