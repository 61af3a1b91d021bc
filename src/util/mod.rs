mod hostname;
mod net;
mod ttl_cache;

pub use hostname::*;
pub use net::*;
pub use ttl_cache::*;
