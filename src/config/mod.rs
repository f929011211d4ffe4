//! Configuration types and loading

mod loader;
mod types;

pub use loader::{load_options, load_options_str};
pub use types::{
    DomainStrategy, InboundOptions, LogOptions, NetworkList, Options, OutboundOptions,
    RouteOptions, RouteRule,
};
