pub mod audit;
pub mod inventory;
pub mod migration;
pub mod ownership;
pub mod tenancy;
