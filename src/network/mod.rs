// Protocol surfaces: the RESP and HTTP adapters over the cache API, and
// the HTTP client side of inter-node traffic.

pub mod http;
pub mod resp;
pub mod transport;

pub use transport::NodeTransport;
