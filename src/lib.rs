pub mod codec;
pub mod crypto;
pub mod invocation_cache;
pub mod peer;
pub mod rudp;
pub mod transport;
pub mod util;
