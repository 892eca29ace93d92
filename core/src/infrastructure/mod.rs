pub mod external_provider;
pub mod internal_provider;
pub mod server_manager;
pub mod stdio_transport;

pub use external_provider::{ExternalProvider, ExternalServerConfig};
pub use internal_provider::{HandlerFn, InternalProvider};
pub use server_manager::ServerManager;
pub use stdio_transport::StdioTransport;
