//! Collection of generic data types and helpers shared by every bridge crate: fixed-size buffers,
//! the script-safe amount encoding, hashing helpers and the UTXO wrappers that bind chain outputs
//! to covenant state.

pub mod amount;
pub mod buf;
pub mod constants;
pub mod errors;
pub mod hash;
pub mod utxo;

pub mod prelude;
