//! Runtime-independent core: key material types, the persistence contract,
//! the socket wire model and the pure connection/correlation state machines.

pub mod builders;
pub mod curve;
pub mod frame;
pub mod prekeys;
pub mod request;
pub mod socket;
pub mod store;
