pub mod auth;
pub mod http;
pub mod intercept;
pub mod jsonrpc;
pub mod normalize;
pub mod outbound;
pub mod proxy;
pub mod scan;
pub mod strng;
pub mod tls;
pub mod types;

// Crate-wide prelude. Modules bring this in with `use crate::*`.
pub use std::fmt::{Debug, Display};
pub use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
pub use std::sync::Arc;
pub use std::time::{Duration, Instant};

pub use bytes::Bytes;
pub use tracing::{debug, error, info, trace, warn};

pub use crate::strng::Strng;
