pub mod audit_service;
pub use audit_service::AuditService;
pub mod inventory_service;
pub use inventory_service::InventoryService;
pub mod migration_service;
pub use migration_service::MigrationService;
pub mod ownership_service;
pub use ownership_service::OwnershipService;
