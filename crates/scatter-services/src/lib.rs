//! scatter-services — the networked half of Scatter: datagram transport,
//! reliable messaging, the object store, and work dispatch on top of them.

pub mod distributor;
pub mod messenger;
pub mod ordered;
pub mod peer;
pub mod peer_lists;
pub mod remote;
pub mod ring;
pub mod store;
pub mod transport;

pub use distributor::{DispatchError, WorkDistributor, WorkItem, WorkResponse, WorkerContext};
pub use messenger::{Messenger, MessengerError, MessengerStats};
pub use ordered::OrderedDistributor;
pub use peer::{Peer, PeerTable};
pub use peer_lists::{
    parse_peer_list, peer_string_lists, publish_peer_list, PeerListKind, PeerListWatcher, PeerStrings,
};
pub use remote::{RemoteBackend, RemoteStat};
pub use ring::PeerRing;
pub use store::{ObjectStore, ReadStream, StoreError, WriteStream};
pub use transport::DatagramSocket;
