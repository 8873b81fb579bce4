pub mod audit_repo;
pub use audit_repo::AuditRepository;
pub mod inventory_repo;
pub use inventory_repo::InventoryRepository;
pub mod migration_repo;
pub use migration_repo::MigrationRepository;
pub mod ownership_repo;
pub use ownership_repo::OwnershipRepository;
pub mod tenancy_repo;
pub use tenancy_repo::TenantRepository;
