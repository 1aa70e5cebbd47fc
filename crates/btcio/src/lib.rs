//! Chain I/O of the bridge operator: collaborator traits, a `bitcoind` provider, a local fee
//! signer, staged UTXO bookkeeping and ordered batch broadcast.

pub mod broadcaster;
pub mod rpc;
pub mod signer;
pub mod staging;
pub mod traits;

pub use broadcaster::{BatchBroadcaster, BroadcastFailure};
pub use rpc::{
    error::{ClientError, ClientResult},
    BitcoinClient,
};
pub use signer::LocalSigner;
pub use staging::StagedUtxoView;
pub use traits::{ChainProvider, SignRequest, Signer, UtxoProvider, UtxoQuery};
