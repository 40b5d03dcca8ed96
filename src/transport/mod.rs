pub mod bt_adapter;
pub mod loopback;
pub mod rfcomm;
pub mod tcp;
pub mod traits;

pub use bt_adapter::BtAdapter;
pub use loopback::{LoopbackNetwork, LoopbackStream, LoopbackTransport};
pub use rfcomm::{RfcommListener, RfcommTransport, RfcommTransportStream};
pub use tcp::{TcpTransport, TcpTransportListener, TcpTransportStream};
pub use traits::{PeerIdentity, RadioState, Transport, TransportListener, TransportStream};
