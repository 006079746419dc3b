pub mod backend;
pub mod init;
pub mod nbd;
pub mod paths;
pub mod sia_access;

pub use backend::Backend;
pub use backend::BackendSettings;
pub use nbd::NbdServer;
pub use sia_access::RemoteStorage;
pub use sia_access::SiaAccess;
