pub mod apps;
pub mod domains;

pub use apps::AppCatalog;
pub use domains::DomainCatalog;
