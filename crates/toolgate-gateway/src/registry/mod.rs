//! Tool server discovery: declarative configuration, credential injection and
//! synthesized baseline servers.

mod config;
mod credentials;
mod error;
mod manager;

pub use config::{
    RemoteServerConfig, ServersFile, SkippedEntry, StdioServerConfig, ToolServerConfig,
    load_servers_file, parse_servers_document,
};
pub use credentials::{
    Credential, CredentialError, CredentialProvider, EnvTokenProvider, StaticTokenProvider,
};
pub use error::RegistryError;
pub use manager::{
    EffectiveServerRegistry, FILESYSTEM_SERVER, RegisteredServer, RegistryOptions,
    SOURCE_CONTROL_SERVER, ServerOrigin, ServerRegistry,
};
