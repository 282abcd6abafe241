//! Line-oriented text protocol spoken over cachefs credential channels.
//!
//! Three conversations share the grammar: the transfer scheduler talking
//! to the privilege broker, the scheduler opening a link to the filesystem
//! adapter, and the adapter asking the scheduler for cached files. See
//! [`messages`] for the exact lines.

pub mod constants;
pub mod layout;
pub mod messages;
pub mod names;
pub mod parts;

mod error;

pub use error::ProtocolError;
pub use layout::CacheLayout;
pub use messages::{
    AdapterReply, AdapterRequest, BrokerReply, BrokerRequest, ConnectReply, ConnectRequest,
};
pub use names::{CacheName, CachePath, CacheTarget};
pub use parts::{last_part_len, number_of_multiparts, part_range};
