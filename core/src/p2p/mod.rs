pub mod envelope;
pub mod peer;
/// P2P networking modules
pub mod protocol;

pub use envelope::{
    Envelope, EnvelopeHash, EnvelopeMeta, EnvelopeSource, EnvelopeStore, EnvelopeTracer, Topic,
};
pub use peer::{ConnectionState, PeerInfo, PeerManager};
pub use protocol::{Frame, Message, PROTOCOL_VERSION};
