pub mod codec;
pub mod error;
pub mod packet;
pub mod qos;
pub mod topic;

pub use codec::{decode, encode};
pub use error::{ProtocolError, ProtocolResult};
pub use packet::*;
pub use qos::QoS;
