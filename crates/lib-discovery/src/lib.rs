pub mod proto;

mod endpoint;
mod error;
mod family;
mod iface;
mod netlink;
mod registry;
mod resolver;
mod service;
mod supervisor;

pub use endpoint::*;
pub use error::*;
pub use family::*;
pub use iface::*;
pub use netlink::*;
pub use registry::*;
pub use resolver::*;
pub use service::*;
pub use supervisor::*;
