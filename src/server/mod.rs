pub mod config;
pub mod links;
pub mod membership;
pub mod middleware;
pub mod role;
pub mod server;

pub use config::ServerConfig;
pub use middleware::ServerMiddleware;
pub use role::{PrimaryInfo, Role, RoleState};
pub use server::ServerCore;
