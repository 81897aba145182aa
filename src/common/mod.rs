pub mod context;
pub mod error;
pub mod tls;

pub use context::QueryContext;
pub use error::{DnsError, DnsErrorKind};
